use crate::error::{ConnectError, TransportError};
use crate::transport::{connect_within, socket_timeout, CancelHandle, Transport};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Raw-socket link: SCPI text straight over TCP, usually on port 5025.
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn connect_stream(&self, timeout: Duration) -> Result<TcpStream, ConnectError> {
        let target = self.target();
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Unresolved {
                target: target.clone(),
                source,
            })?
            .collect();

        connect_within(&addrs, timeout, |addr, budget| TcpStream::connect_timeout(&addr, budget)).map_err(
            |err| match err {
                Some(e) => ConnectError::from_io(target, timeout, e),
                None => ConnectError::Unresolved {
                    target,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
                },
            },
        )
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        self.close();

        let stream = self.connect_stream(timeout)?;
        let configure = |stream: &TcpStream| -> std::io::Result<()> {
            stream.set_nodelay(true)?;
            stream.set_write_timeout(Some(socket_timeout(timeout)))?;
            Ok(())
        };
        configure(&stream).map_err(|source| ConnectError::Io {
            target: self.target(),
            source,
        })?;

        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream.write_all(buf)?;
        stream.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream.set_read_timeout(Some(socket_timeout(timeout)))?;

        let bytes_read = loop {
            match stream.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if bytes_read == 0 && !buf.is_empty() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(bytes_read)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        self.stream.as_ref().and_then(CancelHandle::from_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectError, TransportError};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn setup_test_server<F>(server_logic: F) -> (std::net::SocketAddr, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                server_logic(stream);
            }
        });

        (local_addr, handle)
    }

    fn transport_for(addr: std::net::SocketAddr) -> TcpTransport {
        TcpTransport::new(addr.ip().to_string(), addr.port())
    }

    #[test]
    fn construction_does_not_connect() {
        let transport = TcpTransport::new("127.0.0.1", 5025);
        assert!(transport.stream.is_none());
        assert!(!transport.is_open());
        assert_eq!(transport.target(), "127.0.0.1:5025");
    }

    #[test]
    fn open_succeeds() {
        let (addr, server_handle) = setup_test_server(|_stream| {});

        let mut transport = transport_for(addr);
        assert!(transport.open(TIMEOUT).is_ok());
        assert!(transport.is_open());

        server_handle.join().unwrap();
    }

    #[test]
    fn write_sends_exact_bytes() {
        let (tx, rx) = std::sync::mpsc::channel();
        let message = "VOLT:AC 100\n";

        let (addr, server_handle) = setup_test_server(move |mut stream| {
            let mut buffer = String::new();
            stream.read_to_string(&mut buffer).unwrap();
            tx.send(buffer).unwrap();
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();
        transport.write(message.as_bytes()).unwrap();
        transport.close();

        assert_eq!(rx.recv().unwrap(), message);
        server_handle.join().unwrap();
    }

    #[test]
    fn write_pushes_large_payloads_through() {
        let (tx, rx) = std::sync::mpsc::channel();
        let payload = vec![b'A'; 1 << 20];
        let expected_len = payload.len();

        let (addr, server_handle) = setup_test_server(move |mut stream| {
            let mut buffer = Vec::new();
            stream.read_to_end(&mut buffer).unwrap();
            tx.send(buffer.len()).unwrap();
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();
        transport.write(&payload).unwrap();
        transport.close();

        assert_eq!(rx.recv().unwrap(), expected_len);
        server_handle.join().unwrap();
    }

    #[test]
    fn read_returns_available_bytes() {
        let reply = "100.000000\n";
        let (addr, server_handle) = setup_test_server(move |mut stream| {
            stream.write_all(reply.as_bytes()).unwrap();
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();

        let mut buf = [0u8; 1024];
        let n = transport.read(&mut buf, TIMEOUT).unwrap();
        assert_eq!(&buf[..n], reply.as_bytes());

        server_handle.join().unwrap();
    }

    #[test]
    fn read_is_bounded_by_buffer() {
        let (addr, server_handle) = setup_test_server(|mut stream| {
            stream.write_all(b"0123456789").unwrap();
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();

        let mut buf = [0u8; 4];
        let n = transport.read(&mut buf, TIMEOUT).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");

        server_handle.join().unwrap();
    }

    #[test]
    fn read_times_out_on_silent_peer() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (addr, server_handle) = setup_test_server(move |_stream| {
            let _ = release_rx.recv();
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();

        let mut buf = [0u8; 16];
        let result = transport.read(&mut buf, Duration::from_millis(100));
        assert!(matches!(result, Err(TransportError::TimedOut)));

        release_tx.send(()).unwrap();
        server_handle.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let (addr, server_handle) = setup_test_server(|_stream| {});

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();

        transport.close();
        transport.close();
        assert!(!transport.is_open());

        server_handle.join().unwrap();
    }

    #[test]
    fn io_before_open_fails() {
        let mut transport = TcpTransport::new("127.0.0.1", 5025);
        assert!(matches!(transport.write(b"*IDN?\n"), Err(TransportError::NotOpen)));

        let mut buf = [0u8; 8];
        assert!(matches!(transport.read(&mut buf, TIMEOUT), Err(TransportError::NotOpen)));
    }

    #[test]
    fn open_fails_on_refused_port() {
        // Bind then drop to get a port that nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = TcpTransport::new("127.0.0.1", port);
        let result = transport.open(TIMEOUT);

        assert!(matches!(result, Err(ConnectError::Refused { .. })));
        assert!(!transport.is_open());
    }

    #[test]
    fn open_fails_on_dns_failure() {
        let mut transport = TcpTransport::new("this-is-not-a-real-domain.invalid", 5025);
        let result = transport.open(TIMEOUT);

        assert!(matches!(result, Err(ConnectError::Unresolved { .. })));
    }

    #[test]
    fn write_fails_on_reset_connection() {
        let (addr, server_handle) = setup_test_server(|stream| {
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            let fd = stream.as_raw_fd();
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &linger as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as u32,
                );
            }
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();

        server_handle.join().unwrap();
        thread::sleep(Duration::from_millis(50));

        let result = transport.write(b"OUTP 1\n");
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn read_fails_on_peer_shutdown() {
        let (addr, server_handle) = setup_test_server(|_stream| {
            // Dropping the stream closes the connection.
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();

        server_handle.join().unwrap();

        let mut buf = [0u8; 64];
        let result = transport.read(&mut buf, TIMEOUT);
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn cancel_unblocks_pending_read() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (addr, server_handle) = setup_test_server(move |_stream| {
            let _ = release_rx.recv();
        });

        let mut transport = transport_for(addr);
        transport.open(TIMEOUT).unwrap();
        let handle = transport.cancel_handle().unwrap();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.cancel();
        });

        let mut buf = [0u8; 16];
        let result = transport.read(&mut buf, Duration::from_secs(10));
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        canceller.join().unwrap();
        release_tx.send(()).unwrap();
        server_handle.join().unwrap();
    }
}

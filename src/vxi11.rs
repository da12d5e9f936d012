//! Minimal VXI-11 core channel client.
//!
//! VXI-11 runs ONC-RPC (RFC 5531) over TCP with record marking. A link is
//! created with `create_link`, data moves with `device_write`/`device_read`
//! and the link is released with `destroy_link`. The core channel port is
//! looked up through the portmapper on port 111.
//!
//! Abort and interrupt channels, locking and SRQ are not implemented.

use crate::error::{ConnectError, TransportError};
use crate::transport::{connect_within, socket_timeout, CancelHandle};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

pub const PORTMAPPER_PORT: u16 = 111;

const PORTMAPPER_PROG: u32 = 100_000;
const PORTMAPPER_VERS: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

const DEVICE_CORE_PROG: u32 = 0x0607_AF;
const DEVICE_CORE_VERS: u32 = 1;
const CREATE_LINK: u32 = 10;
const DEVICE_WRITE: u32 = 11;
const DEVICE_READ: u32 = 12;
const DESTROY_LINK: u32 = 23;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const RPC_VERSION: u32 = 2;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NONE: u32 = 0;

const FLAG_END: u32 = 0x08;
const LAST_FRAGMENT: u32 = 0x8000_0000;
const MAX_RECORD_LEN: usize = 16 << 20;

const ERR_IO_TIMEOUT: u32 = 15;

/// Extra time the RPC socket waits beyond the device I/O timeout.
const REPLY_GRACE: Duration = Duration::from_secs(1);
/// Upper bound on a write chunk when the server advertises no limit.
const DEFAULT_MAX_RECV: usize = 1024;

/// XDR encoder for call arguments.
#[derive(Default)]
pub(crate) struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub(crate) fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub(crate) fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u32(v as u32)
    }

    pub(crate) fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        let pad = (4 - data.len() % 4) % 4;
        self.buf.extend_from_slice(&[0u8; 3][..pad]);
        self
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// XDR decoder over a reply body.
pub(crate) struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, TransportError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| TransportError::Protocol("truncated XDR value".into()))?;
        self.pos += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn get_opaque(&mut self) -> Result<&'a [u8], TransportError> {
        let len = self.get_u32()? as usize;
        let padded = len + (4 - len % 4) % 4;
        let data = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| TransportError::Protocol("truncated XDR opaque".into()))?;
        if self.pos + padded > self.buf.len() {
            return Err(TransportError::Protocol("truncated XDR padding".into()));
        }
        self.pos += padded;
        Ok(data)
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Writes one record-marked message.
pub(crate) fn write_record(stream: &mut impl Write, body: &[u8]) -> std::io::Result<()> {
    let header = LAST_FRAGMENT | body.len() as u32;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&header.to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame)?;
    stream.flush()
}

/// Reads one record-marked message, joining fragments.
pub(crate) fn read_record(stream: &mut impl Read) -> Result<Vec<u8>, TransportError> {
    let mut record = Vec::new();
    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let header = u32::from_be_bytes(header);
        let len = (header & !LAST_FRAGMENT) as usize;

        if record.len() + len > MAX_RECORD_LEN {
            return Err(TransportError::Protocol(format!(
                "RPC record exceeds {MAX_RECORD_LEN} bytes"
            )));
        }

        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..])?;

        if header & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// Blocking ONC-RPC client bound to one program/version over one TCP stream.
struct RpcClient {
    stream: TcpStream,
    prog: u32,
    vers: u32,
    next_xid: u32,
}

impl RpcClient {
    fn connect(addr: SocketAddr, prog: u32, vers: u32, timeout: Duration) -> std::io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, socket_timeout(timeout))?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(socket_timeout(timeout)))?;
        Ok(Self {
            stream,
            prog,
            vers,
            next_xid: seed_xid(),
        })
    }

    /// Sends one call and returns the procedure's result bytes.
    fn call(&mut self, procedure: u32, args: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);

        let mut msg = XdrWriter::default();
        msg.put_u32(xid)
            .put_u32(MSG_CALL)
            .put_u32(RPC_VERSION)
            .put_u32(self.prog)
            .put_u32(self.vers)
            .put_u32(procedure)
            .put_u32(AUTH_NONE)
            .put_u32(0)
            .put_u32(AUTH_NONE)
            .put_u32(0);
        let mut body = msg.into_bytes();
        body.extend_from_slice(args);

        write_record(&mut self.stream, &body)?;
        self.stream.set_read_timeout(Some(socket_timeout(timeout)))?;

        loop {
            let reply = read_record(&mut self.stream)?;
            let mut r = XdrReader::new(&reply);

            let reply_xid = r.get_u32()?;
            if reply_xid != xid {
                debug!(expected = xid, got = reply_xid, "discarding stale RPC reply");
                continue;
            }
            if r.get_u32()? != MSG_REPLY {
                return Err(TransportError::Protocol("expected an RPC reply".into()));
            }
            if r.get_u32()? != REPLY_ACCEPTED {
                return Err(TransportError::Protocol("RPC call denied".into()));
            }
            let _verifier_flavor = r.get_u32()?;
            let _verifier = r.get_opaque()?;
            let accept_stat = r.get_u32()?;
            if accept_stat != ACCEPT_SUCCESS {
                return Err(TransportError::Protocol(format!(
                    "RPC call not accepted (status {accept_stat})"
                )));
            }
            return Ok(r.rest().to_vec());
        }
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn seed_xid() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(1)
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn device_error(code: u32) -> TransportError {
    if code == ERR_IO_TIMEOUT {
        return TransportError::TimedOut;
    }
    let meaning = match code {
        1 => "syntax error",
        3 => "device not accessible",
        4 => "invalid link identifier",
        5 => "parameter error",
        6 => "channel not established",
        8 => "operation not supported",
        9 => "out of resources",
        11 => "device locked by another link",
        12 => "no lock held by this link",
        17 => "I/O error",
        21 => "invalid address",
        23 => "abort",
        29 => "channel already established",
        _ => "unknown error",
    };
    TransportError::Protocol(format!("VXI-11 device error {code}: {meaning}"))
}

/// Asks the portmapper for the TCP port of the core channel.
fn lookup_core_port(portmapper: SocketAddr, timeout: Duration) -> Result<u16, TransportError> {
    let mut rpc = RpcClient::connect(portmapper, PORTMAPPER_PROG, PORTMAPPER_VERS, timeout)?;

    let mut args = XdrWriter::default();
    args.put_u32(DEVICE_CORE_PROG)
        .put_u32(DEVICE_CORE_VERS)
        .put_u32(IPPROTO_TCP)
        .put_u32(0);

    let reply = rpc.call(PMAPPROC_GETPORT, &args.into_bytes(), timeout);
    rpc.shutdown();

    let port = XdrReader::new(&reply?).get_u32()?;
    u16::try_from(port)
        .ok()
        .filter(|&p| p != 0)
        .ok_or_else(|| TransportError::Protocol("VXI-11 core channel is not registered".into()))
}

/// An open VXI-11 link to one device on one host.
pub struct Vxi11Link {
    rpc: RpcClient,
    link_id: u32,
    max_recv_size: usize,
    io_timeout: Duration,
}

impl Vxi11Link {
    /// Opens a link to `device` on `host`, locating the core channel through
    /// the portmapper listening on `portmapper_port`.
    pub fn open(host: &str, portmapper_port: u16, device: &str, timeout: Duration) -> Result<Self, ConnectError> {
        let target = format!("{host}::{device}");
        let portmappers: Vec<_> = (host, portmapper_port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Unresolved {
                target: target.clone(),
                source,
            })?
            .collect();

        connect_within(&portmappers, timeout, |portmapper, budget| {
            Self::establish(portmapper, device, budget, timeout)
        })
        .map_err(|err| {
            err.unwrap_or_else(|| ConnectError::Unresolved {
                target,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
            })
        })
    }

    /// Opens a link using an explicit portmapper address.
    pub fn open_via(portmapper: SocketAddr, device: &str, timeout: Duration) -> Result<Self, ConnectError> {
        Self::establish(portmapper, device, timeout, timeout)
    }

    /// `timeout` bounds the handshake, `io_timeout` the link's later writes.
    fn establish(
        portmapper: SocketAddr,
        device: &str,
        timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let target = format!("{portmapper}::{device}");
        let protocol = |err: TransportError| match err {
            TransportError::Io(source) => ConnectError::from_io(target.clone(), timeout, source),
            TransportError::TimedOut => ConnectError::TimedOut {
                target: target.clone(),
                timeout,
            },
            other => ConnectError::Protocol {
                target: target.clone(),
                reason: other.to_string(),
            },
        };

        let core_port = match lookup_core_port(portmapper, timeout) {
            Ok(port) => port,
            Err(TransportError::ConnectionClosed) => {
                return Err(ConnectError::Protocol {
                    target: target.clone(),
                    reason: "portmapper closed the connection".into(),
                });
            }
            Err(e) => return Err(protocol(e)),
        };
        let core_addr = SocketAddr::new(portmapper.ip(), core_port);
        debug!(%core_addr, "VXI-11 core channel located");

        let mut rpc = RpcClient::connect(core_addr, DEVICE_CORE_PROG, DEVICE_CORE_VERS, timeout)
            .map_err(|e| ConnectError::from_io(target.clone(), timeout, e))?;

        let mut args = XdrWriter::default();
        args.put_u32(std::process::id())
            .put_bool(false)
            .put_u32(0)
            .put_opaque(device.as_bytes());

        let reply = rpc
            .call(CREATE_LINK, &args.into_bytes(), timeout + REPLY_GRACE)
            .map_err(protocol)?;
        let mut r = XdrReader::new(&reply);
        let error = r.get_u32().map_err(protocol)?;
        if error != 0 {
            rpc.shutdown();
            return Err(protocol(device_error(error)));
        }
        let link_id = r.get_u32().map_err(protocol)?;
        let _abort_port = r.get_u32().map_err(protocol)?;
        let max_recv_size = match r.get_u32().map_err(protocol)? as usize {
            0 => DEFAULT_MAX_RECV,
            n => n,
        };

        debug!(link_id, max_recv_size, "VXI-11 link created");
        Ok(Self {
            rpc,
            link_id,
            max_recv_size,
            io_timeout,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let chunk = &remaining[..remaining.len().min(self.max_recv_size)];
            let last = chunk.len() == remaining.len();

            let mut args = XdrWriter::default();
            args.put_u32(self.link_id)
                .put_u32(millis(self.io_timeout))
                .put_u32(0)
                .put_u32(if last { FLAG_END } else { 0 })
                .put_opaque(chunk);

            let reply = self
                .rpc
                .call(DEVICE_WRITE, &args.into_bytes(), self.io_timeout + REPLY_GRACE)?;
            let mut r = XdrReader::new(&reply);
            let error = r.get_u32()?;
            if error != 0 {
                return Err(device_error(error));
            }
            let accepted = (r.get_u32()? as usize).min(chunk.len());
            if accepted == 0 {
                return Err(TransportError::Protocol("device accepted no data".into()));
            }
            remaining = &remaining[accepted..];
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut args = XdrWriter::default();
        args.put_u32(self.link_id)
            .put_u32(buf.len().min(u32::MAX as usize) as u32)
            .put_u32(millis(timeout))
            .put_u32(0)
            .put_u32(0)
            .put_u32(0);

        let reply = self
            .rpc
            .call(DEVICE_READ, &args.into_bytes(), timeout + REPLY_GRACE)?;
        let mut r = XdrReader::new(&reply);
        let error = r.get_u32()?;
        if error != 0 {
            return Err(device_error(error));
        }
        let _reason = r.get_u32()?;
        let data = r.get_opaque()?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Destroys the link and drops the connection. Failures are only logged.
    pub fn close(self) {
        let mut args = XdrWriter::default();
        args.put_u32(self.link_id);

        let mut rpc = self.rpc;
        if let Err(e) = rpc.call(DESTROY_LINK, &args.into_bytes(), REPLY_GRACE) {
            warn!(link_id = self.link_id, error = %e, "could not destroy VXI-11 link");
        }
        rpc.shutdown();
    }

    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        CancelHandle::from_stream(&self.rpc.stream)
    }
}

use crate::error::{ConnectError, TransportError};
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::debug;

/// Byte-level link to an instrument.
///
/// Implementations hold their target from construction; `open` only performs
/// the handshake. None of the operations know anything about SCPI.
pub trait Transport {
    /// Establishes the link, bounded by `timeout`. The same timeout bounds later writes.
    fn open(&mut self, timeout: Duration) -> Result<(), ConnectError>;

    /// Sends every byte of `buf` or fails.
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Waits up to `timeout` for data and returns whatever arrived, at most `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Releases the link. Safe to call any number of times.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable target, used in logs and error messages.
    fn target(&self) -> String;

    /// Handle that can tear the link down from another thread.
    fn cancel_handle(&self) -> Option<CancelHandle> {
        None
    }
}

/// Aborts a blocked read or write by shutting the shared socket down.
#[derive(Debug)]
pub struct CancelHandle {
    stream: TcpStream,
}

impl CancelHandle {
    pub(crate) fn from_stream(stream: &TcpStream) -> Option<Self> {
        stream.try_clone().ok().map(|stream| Self { stream })
    }

    pub fn cancel(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Socket timeouts reject a zero duration.
pub(crate) fn socket_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

/// Tries each address in turn until one connects, sharing one `timeout`
/// across all attempts. `Err(None)` means `addrs` was empty.
pub(crate) fn connect_within<T, E: fmt::Display>(
    addrs: &[SocketAddr],
    timeout: Duration,
    mut connect: impl FnMut(SocketAddr, Duration) -> Result<T, E>,
) -> Result<T, Option<E>> {
    let deadline = Instant::now() + timeout;
    let mut last_err = None;

    for (i, &addr) in addrs.iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if i > 0 && remaining.is_zero() {
            debug!(skipped = addrs.len() - i, "connect deadline reached");
            break;
        }
        match connect(addr, socket_timeout(remaining)) {
            Ok(link) => return Ok(link),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err)
}

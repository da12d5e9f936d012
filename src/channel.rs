use crate::error::{ConnectError, QueryError, SendError, TransportError};
use crate::framing::{decode_response, frame_command, is_query};
use crate::tcp_transport::TcpTransport;
use crate::transport::{CancelHandle, Transport};
use crate::visa_transport::VisaTransport;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 5025;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest response a single query returns; longer responses are truncated.
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 65_535;

/// Where an instrument lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: u16 },
    /// VISA resource identifier such as `TCPIP0::10.0.0.5::inst0::INSTR`.
    Resource(String),
}

impl FromStr for Target {
    type Err = ConnectError;

    /// `host`, `host:port`, `[v6]:port`, or any string containing `::` as a resource.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| ConnectError::InvalidResource {
            resource: s.to_string(),
            reason: reason.to_string(),
        };

        if s.contains("::") && !s.starts_with('[') {
            return Ok(Target::Resource(s.to_string()));
        }
        if s.is_empty() {
            return Err(invalid("empty target"));
        }

        let (host, port) = match s.strip_prefix('[') {
            Some(rest) => {
                let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
                match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None if tail.is_empty() => (host, None),
                    None => return Err(invalid("unexpected text after ']'")),
                }
            }
            None => match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            },
        };

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("port must be 0-65535"))?,
            None => DEFAULT_PORT,
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Target::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Target::Tcp { host, port } => write!(f, "{host}:{port}"),
            Target::Resource(resource) => f.write_str(resource),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    /// Falls back to `connect_timeout` when unset.
    pub read_timeout: Option<Duration>,
    pub max_response_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: None,
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
        }
    }
}

impl ChannelConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len.max(1);
        self
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout.unwrap_or(self.connect_timeout)
    }
}

/// The transport variant chosen from a [`Target`].
pub enum InstrumentTransport {
    Tcp(TcpTransport),
    Visa(VisaTransport),
}

impl From<&Target> for InstrumentTransport {
    fn from(target: &Target) -> Self {
        match target {
            Target::Tcp { host, port } => InstrumentTransport::Tcp(TcpTransport::new(host.clone(), *port)),
            Target::Resource(resource) => InstrumentTransport::Visa(VisaTransport::new(resource.clone())),
        }
    }
}

impl Transport for InstrumentTransport {
    fn open(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        match self {
            InstrumentTransport::Tcp(t) => t.open(timeout),
            InstrumentTransport::Visa(t) => t.open(timeout),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match self {
            InstrumentTransport::Tcp(t) => t.write(buf),
            InstrumentTransport::Visa(t) => t.write(buf),
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self {
            InstrumentTransport::Tcp(t) => t.read(buf, timeout),
            InstrumentTransport::Visa(t) => t.read(buf, timeout),
        }
    }

    fn close(&mut self) {
        match self {
            InstrumentTransport::Tcp(t) => t.close(),
            InstrumentTransport::Visa(t) => t.close(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            InstrumentTransport::Tcp(t) => t.is_open(),
            InstrumentTransport::Visa(t) => t.is_open(),
        }
    }

    fn target(&self) -> String {
        match self {
            InstrumentTransport::Tcp(t) => t.target(),
            InstrumentTransport::Visa(t) => t.target(),
        }
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        match self {
            InstrumentTransport::Tcp(t) => t.cancel_handle(),
            InstrumentTransport::Visa(t) => t.cancel_handle(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connected,
    Closed,
}

/// SCPI command/query channel over one exclusively owned transport.
///
/// SCPI responses carry no correlation identifier, so a channel serves one
/// caller at a time: every query is one write followed by one read, and a
/// second query must not start until the first has returned. Share a channel
/// between threads only behind external mutual exclusion.
///
/// I/O errors are returned, never retried, and never change the state: a
/// channel stays `Connected` after a failed send or query, and only
/// [`Channel::disconnect`] moves it to `Closed`.
pub struct Channel<T: Transport = InstrumentTransport> {
    transport: T,
    config: ChannelConfig,
    state: ChannelState,
    buffer: Vec<u8>,
    last_connect_error: Option<ConnectError>,
}

impl Channel<InstrumentTransport> {
    pub fn for_target(target: &Target, config: ChannelConfig) -> Self {
        Self::new(InstrumentTransport::from(target), config)
    }
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            state: ChannelState::Disconnected,
            buffer: Vec::new(),
            last_connect_error: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn target(&self) -> String {
        self.transport.target()
    }

    /// The error recorded by the last failed [`Channel::connect`], cleared on success.
    pub fn last_connect_error(&self) -> Option<&ConnectError> {
        self.last_connect_error.as_ref()
    }

    /// Opens the transport; on failure the error is kept for [`Channel::last_connect_error`].
    pub fn connect(&mut self) -> bool {
        match self.try_connect() {
            Ok(()) => true,
            Err(e) => {
                self.last_connect_error = Some(e);
                false
            }
        }
    }

    pub fn try_connect(&mut self) -> Result<(), ConnectError> {
        if self.state == ChannelState::Connected {
            self.transport.close();
            self.state = ChannelState::Disconnected;
        }

        let target = self.transport.target();
        match self.transport.open(self.config.connect_timeout) {
            Ok(()) => {
                info!(peer = %target, "connected");
                self.state = ChannelState::Connected;
                self.last_connect_error = None;
                Ok(())
            }
            Err(e) => {
                info!(peer = %target, error = %e, "connection failed");
                self.transport.close();
                if self.state == ChannelState::Closed {
                    self.state = ChannelState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Closes the transport. Safe from any state, any number of times.
    pub fn disconnect(&mut self) {
        if self.state == ChannelState::Connected {
            info!(peer = %self.transport.target(), "disconnected");
        }
        self.transport.close();
        self.state = ChannelState::Closed;
    }

    pub fn send(&mut self, command: &str) -> Result<(), SendError> {
        self.write_command(command)?;
        debug!(command = command.trim(), "sent");
        Ok(())
    }

    /// Sends `command` and returns the single line the instrument answers with.
    ///
    /// Exactly one read is issued; a response longer than
    /// `max_response_len` comes back truncated.
    pub fn query(&mut self, command: &str) -> Result<String, QueryError> {
        self.write_command(command)?;
        debug!(command = command.trim(), "query");

        let timeout = self.config.read_timeout();
        let limit = self.config.max_response_len;
        self.buffer.clear();
        self.buffer.resize(limit, 0);

        let bytes_read = match self.transport.read(&mut self.buffer, timeout) {
            Ok(n) => n,
            Err(TransportError::TimedOut) => return Err(QueryError::ReadTimeout(timeout)),
            Err(e) => return Err(QueryError::ReadFailed(e)),
        };
        let mut received = &self.buffer[..bytes_read];
        if bytes_read == limit {
            warn!(limit, "response filled the buffer and may be truncated");
            // The bound may split a multi-byte character; keep the complete prefix.
            if let Err(e) = std::str::from_utf8(received) {
                if e.error_len().is_none() {
                    received = &received[..e.valid_up_to()];
                }
            }
        }

        let response = decode_response(received).map_err(QueryError::DecodeFailed)?;
        debug!(response, "response");
        Ok(response.to_string())
    }

    /// Queries when the command ends in `?`, sends otherwise.
    pub fn execute(&mut self, command: &str) -> Result<Option<String>, QueryError> {
        if is_query(command) {
            self.query(command).map(Some)
        } else {
            self.send(command)?;
            Ok(None)
        }
    }

    /// Handle that aborts an in-flight operation from another thread.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        if self.is_connected() {
            self.transport.cancel_handle()
        } else {
            None
        }
    }

    fn write_command(&mut self, command: &str) -> Result<(), SendError> {
        if self.state != ChannelState::Connected {
            return Err(SendError::NotConnected);
        }
        frame_command(command, &mut self.buffer)?;
        self.transport.write(&self.buffer).map_err(SendError::WriteFailed)
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}

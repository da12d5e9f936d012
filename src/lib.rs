pub mod error;
pub mod transport;
pub mod tcp_transport;
pub mod resource;
pub mod vxi11;
pub mod visa_transport;
pub mod framing;
pub mod channel;

pub use error::{CommandError, ConnectError, Error, QueryError, Result, SendError, TransportError};
pub use transport::{CancelHandle, Transport};
pub use tcp_transport::TcpTransport;
pub use resource::ResourceName;
pub use visa_transport::{ResourceManager, VisaTransport};
pub use channel::{Channel, ChannelConfig, ChannelState, InstrumentTransport, Target};

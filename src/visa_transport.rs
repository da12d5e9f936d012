use crate::error::{ConnectError, TransportError};
use crate::resource::ResourceName;
use crate::tcp_transport::TcpTransport;
use crate::transport::{CancelHandle, Transport};
use crate::vxi11::{Vxi11Link, PORTMAPPER_PORT};
use std::time::Duration;
use tracing::debug;

/// An open instrument resource.
pub enum Session {
    Socket(TcpTransport),
    Vxi11(Vxi11Link),
}

impl Session {
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match self {
            Session::Socket(t) => t.write(buf),
            Session::Vxi11(link) => link.write(buf),
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self {
            Session::Socket(t) => t.read(buf, timeout),
            Session::Vxi11(link) => link.read(buf, timeout),
        }
    }

    fn close(self) {
        match self {
            Session::Socket(mut t) => t.close(),
            Session::Vxi11(link) => link.close(),
        }
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        match self {
            Session::Socket(t) => t.cancel_handle(),
            Session::Vxi11(link) => link.cancel_handle(),
        }
    }
}

/// Opens named resources, the way a VISA resource manager does.
#[derive(Debug, Clone, Copy)]
pub struct ResourceManager {
    portmapper_port: u16,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self {
            portmapper_port: PORTMAPPER_PORT,
        }
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks the VXI-11 core channel up through a portmapper on another port.
    pub fn with_portmapper_port(mut self, port: u16) -> Self {
        self.portmapper_port = port;
        self
    }

    pub fn open_resource(&self, name: &ResourceName, timeout: Duration) -> Result<Session, ConnectError> {
        debug!(resource = %name, "opening resource");
        match name {
            ResourceName::Socket { host, port, .. } => {
                let mut transport = TcpTransport::new(host.clone(), *port);
                transport.open(timeout)?;
                Ok(Session::Socket(transport))
            }
            ResourceName::Instr { host, device, .. } => {
                Vxi11Link::open(host, self.portmapper_port, device, timeout).map(Session::Vxi11)
            }
        }
    }
}

/// Resource-manager link, addressed by a VISA resource string.
pub struct VisaTransport {
    resource: String,
    manager: ResourceManager,
    session: Option<Session>,
}

impl VisaTransport {
    pub fn new(resource: impl Into<String>) -> Self {
        Self::with_manager(resource, ResourceManager::new())
    }

    pub fn with_manager(resource: impl Into<String>, manager: ResourceManager) -> Self {
        Self {
            resource: resource.into(),
            manager,
            session: None,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Transport for VisaTransport {
    fn open(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        self.close();
        let name = ResourceName::parse(&self.resource)?;
        self.session = Some(self.manager.open_resource(&name, timeout)?);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.session.as_mut().ok_or(TransportError::NotOpen)?.write(buf)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.session
            .as_mut()
            .ok_or(TransportError::NotOpen)?
            .read(buf, timeout)
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn target(&self) -> String {
        self.resource.clone()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        self.session.as_ref().and_then(Session::cancel_handle)
    }
}

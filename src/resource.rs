//! VISA resource identifiers.
//!
//! Only the TCP/IP interface is understood:
//!
//! ```text
//! TCPIP[board]::host::port::SOCKET
//! TCPIP[board]::host[::device]::INSTR
//! ```
//!
//! Interface and class keywords are case-insensitive. Other interface types
//! are recognised so that they can be reported as unsupported rather than
//! malformed.

use crate::error::ConnectError;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DEVICE: &str = "inst0";

const KNOWN_INTERFACES: &[&str] = &["GPIB", "ASRL", "USB", "VXI", "GPIB-VXI", "PXI", "FIREWIRE"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceName {
    /// Raw socket resource.
    Socket { board: u16, host: String, port: u16 },
    /// VXI-11 instrument resource.
    Instr { board: u16, host: String, device: String },
}

impl ResourceName {
    pub fn parse(resource: &str) -> Result<Self, ConnectError> {
        let invalid = |reason: &str| ConnectError::InvalidResource {
            resource: resource.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = resource.trim().split("::").collect();
        let interface = parts[0];
        let upper = interface.to_ascii_uppercase();

        let board = match upper.strip_prefix("TCPIP") {
            Some("") => 0,
            Some(digits) => digits
                .parse::<u16>()
                .map_err(|_| invalid("board number must be an integer"))?,
            None => {
                let family = upper.trim_end_matches(|c: char| c.is_ascii_digit());
                return Err(if KNOWN_INTERFACES.contains(&family) {
                    ConnectError::UnsupportedResource {
                        resource: resource.to_string(),
                        interface: family.to_string(),
                    }
                } else {
                    invalid("unknown interface type")
                });
            }
        };

        let host = match parts.get(1) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(invalid("missing host")),
        };

        let rest = &parts[2..];
        let class = rest.last().map(|c| c.to_ascii_uppercase());

        match (class.as_deref(), rest.len()) {
            (Some("SOCKET"), 2) => {
                let port = rest[0]
                    .parse::<u16>()
                    .map_err(|_| invalid("socket port must be an integer"))?;
                Ok(ResourceName::Socket { board, host, port })
            }
            (Some("SOCKET"), _) => Err(invalid("SOCKET resources need exactly host and port")),
            (Some("INSTR"), 1) | (None, 0) => Ok(ResourceName::Instr {
                board,
                host,
                device: DEFAULT_DEVICE.to_string(),
            }),
            (Some("INSTR"), 2) => Ok(ResourceName::Instr {
                board,
                host,
                device: non_empty(rest[0]).ok_or_else(|| invalid("empty device name"))?,
            }),
            (Some(_), 1) => Ok(ResourceName::Instr {
                board,
                host,
                device: rest[0].to_string(),
            }),
            _ => Err(invalid("unrecognised resource class")),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ResourceName::Socket { host, .. } | ResourceName::Instr { host, .. } => host,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl FromStr for ResourceName {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceName::Socket { board, host, port } => {
                write!(f, "TCPIP{board}::{host}::{port}::SOCKET")
            }
            ResourceName::Instr { board, host, device } => {
                write!(f, "TCPIP{board}::{host}::{device}::INSTR")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instr_with_default_device() {
        let name = ResourceName::parse("TCPIP0::192.168.123.1::INSTR").unwrap();
        assert_eq!(
            name,
            ResourceName::Instr {
                board: 0,
                host: "192.168.123.1".into(),
                device: "inst0".into()
            }
        );
    }

    #[test]
    fn parses_instr_with_explicit_device() {
        let name = ResourceName::parse("TCPIP0::192.168.123.1::inst0::INSTR").unwrap();
        assert_eq!(name.to_string(), "TCPIP0::192.168.123.1::inst0::INSTR");

        let name = ResourceName::parse("tcpip1::scope.lab::gpib0,5::instr").unwrap();
        assert_eq!(
            name,
            ResourceName::Instr {
                board: 1,
                host: "scope.lab".into(),
                device: "gpib0,5".into()
            }
        );
    }

    #[test]
    fn class_may_be_omitted() {
        let name = ResourceName::parse("TCPIP::10.0.0.5").unwrap();
        assert!(matches!(name, ResourceName::Instr { board: 0, ref device, .. } if device == "inst0"));

        let name = ResourceName::parse("TCPIP::10.0.0.5::hislip0").unwrap();
        assert!(matches!(name, ResourceName::Instr { ref device, .. } if device == "hislip0"));
    }

    #[test]
    fn parses_socket() {
        let name = ResourceName::parse("TCPIP0::10.0.0.5::5025::SOCKET").unwrap();
        assert_eq!(
            name,
            ResourceName::Socket {
                board: 0,
                host: "10.0.0.5".into(),
                port: 5025
            }
        );
        assert_eq!(name.host(), "10.0.0.5");
    }

    #[test]
    fn rejects_socket_without_port() {
        let err = ResourceName::parse("TCPIP0::10.0.0.5::SOCKET").unwrap_err();
        assert!(matches!(err, ConnectError::InvalidResource { .. }));

        let err = ResourceName::parse("TCPIP0::10.0.0.5::http::SOCKET").unwrap_err();
        assert!(matches!(err, ConnectError::InvalidResource { .. }));
    }

    #[test]
    fn reports_other_interfaces_as_unsupported() {
        let err = ResourceName::parse("GPIB0::12::INSTR").unwrap_err();
        assert!(matches!(err, ConnectError::UnsupportedResource { ref interface, .. } if interface == "GPIB"));

        let err = ResourceName::parse("ASRL/dev/ttyUSB0::INSTR").unwrap_err();
        assert!(matches!(err, ConnectError::InvalidResource { .. }));

        let err = ResourceName::parse("USB0::0x0957::0x1796::MY123::INSTR").unwrap_err();
        assert!(matches!(err, ConnectError::UnsupportedResource { .. }));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "TCPIP0", "TCPIP0::", "TCPIPx::host::INSTR", "bogus::host::INSTR"] {
            let err = ResourceName::parse(bad).unwrap_err();
            assert!(matches!(err, ConnectError::InvalidResource { .. }), "{bad:?}");
        }
    }
}

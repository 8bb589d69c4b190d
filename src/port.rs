use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::VerifyError;

/// Transport protocol of a target port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Upper-case name used in narration
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// Lower-case name as printed by `ss`, `netstat` and `lsof`
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port number paired with the protocol it is expected to serve.
///
/// Resolved once before launch and never rebound afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub number: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    /// Creates a port spec, rejecting port 0.
    pub fn new(number: u16, protocol: Protocol) -> Result<Self, VerifyError> {
        if number == 0 {
            return Err(VerifyError::InvalidPort(format!(
                "{} port must be between 1 and 65535",
                protocol.label()
            )));
        }
        Ok(Self { number, protocol })
    }

    pub fn tcp(number: u16) -> Result<Self, VerifyError> {
        Self::new(number, Protocol::Tcp)
    }

    pub fn udp(number: u16) -> Result<Self, VerifyError> {
        Self::new(number, Protocol::Udp)
    }

    /// Loopback address probes and fallback checks talk to
    pub fn loopback(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.number))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port {}", self.protocol.label(), self.number)
    }
}

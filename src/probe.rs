//! Minimal functional pokes at ports that are already listening.
//!
//! Both probes are informative only; readiness is decided by the waiter.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::port::PortSpec;

/// Connect timeout for the TCP probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Datagram sent by the UDP probe
pub const UDP_PAYLOAD: &[u8] = b"test";

/// Outcome of a probe, with the failure reason for narration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Ok,
    Failed(String),
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeResult::Ok)
    }
}

/// Connects to the port on loopback and closes the connection straight away
pub async fn probe_tcp(port: PortSpec) -> ProbeResult {
    match timeout(PROBE_TIMEOUT, TcpStream::connect(port.loopback())).await {
        Ok(Ok(stream)) => {
            debug!("TCP probe connected to {:?}", stream.peer_addr().ok());
            ProbeResult::Ok
        }
        Ok(Err(e)) => ProbeResult::Failed(e.to_string()),
        Err(_) => ProbeResult::Failed(format!("connect timed out after {:?}", PROBE_TIMEOUT)),
    }
}

/// Sends one datagram to the port on loopback.
///
/// Succeeds whenever the send call completes; UDP gives no acceptance signal.
pub async fn probe_udp(port: PortSpec) -> ProbeResult {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await {
        Ok(socket) => socket,
        Err(e) => return ProbeResult::Failed(e.to_string()),
    };

    match timeout(PROBE_TIMEOUT, socket.send_to(UDP_PAYLOAD, port.loopback())).await {
        Ok(Ok(sent)) => {
            debug!("UDP probe sent {} bytes to {}", sent, port.number);
            ProbeResult::Ok
        }
        Ok(Err(e)) => ProbeResult::Failed(e.to_string()),
        Err(_) => ProbeResult::Failed(format!("send timed out after {:?}", PROBE_TIMEOUT)),
    }
}

use anyhow::{Context, Result};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::time::Duration;
use tokio::net::TcpStream;

/// Socket helpers for picking ports and checking them from the outside
pub struct SocketTestUtils;

impl SocketTestUtils {
    /// A TCP port nothing is listening on right now
    pub fn free_tcp_port() -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind ephemeral TCP port")?;
        Ok(listener.local_addr()?.port())
    }

    /// A UDP port nothing is bound to right now
    pub fn free_udp_port() -> Result<u16> {
        let socket = UdpSocket::bind("127.0.0.1:0").context("Failed to bind ephemeral UDP port")?;
        Ok(socket.local_addr()?.port())
    }

    /// Whether a TCP connect to the loopback port succeeds
    pub async fn tcp_accepts(port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        matches!(
            tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Whether the UDP port can be bound on loopback, i.e. nobody holds it
    pub fn udp_bindable(port: u16) -> bool {
        UdpSocket::bind(("127.0.0.1", port)).is_ok()
    }
}

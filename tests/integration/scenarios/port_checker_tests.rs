use anyhow::Result;
use portverify::port_checker::{DetectionStrategy, SocketStrategy, ToolStrategy};
use portverify::{Detection, PortChecker, PortSpec, PortWaiter};
use std::net::{TcpListener, UdpSocket};
use std::time::{Duration, Instant};

use crate::infrastructure::SocketTestUtils;

fn strategies() -> Vec<Box<dyn DetectionStrategy>> {
    vec![
        Box::new(ToolStrategy::socket_statistics()),
        Box::new(ToolStrategy::network_status()),
        Box::new(SocketStrategy::new()),
    ]
}

/// An unbound port is never reported listening by any strategy
#[tokio::test]
async fn test_unbound_ports_are_not_listening() -> Result<()> {
    let tcp = PortSpec::tcp(SocketTestUtils::free_tcp_port()?)?;
    let udp = PortSpec::udp(SocketTestUtils::free_udp_port()?)?;

    for strategy in strategies() {
        for port in [tcp, udp] {
            let detection = strategy.check(port).await;
            assert_ne!(
                detection,
                Detection::Listening,
                "{:?} claims {} is listening",
                strategy.source(),
                port
            );
        }
    }

    let checker = PortChecker::system();
    assert!(!checker.is_listening(tcp).await);
    assert!(!checker.is_listening(udp).await);
    Ok(())
}

/// A bound TCP listener is seen by the socket probe and by the full chain
#[tokio::test]
async fn test_bound_tcp_listener_is_detected() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = PortSpec::tcp(listener.local_addr()?.port())?;

    assert_eq!(SocketStrategy::new().check(port).await, Detection::Listening);

    let mut any = false;
    for strategy in strategies() {
        any |= strategy.check(port).await == Detection::Listening;
    }
    assert!(any);
    assert!(PortChecker::system().is_listening(port).await);
    Ok(())
}

/// A bound UDP socket is seen by the full chain
#[tokio::test]
async fn test_bound_udp_socket_is_detected() -> Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let port = PortSpec::udp(socket.local_addr()?.port())?;

    assert!(PortChecker::system().is_listening(port).await);
    Ok(())
}

/// Repeated checks of a stable port agree
#[tokio::test]
async fn test_checks_are_stable() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = PortSpec::tcp(listener.local_addr()?.port())?;
    let checker = PortChecker::system();

    let first = checker.check(port).await;
    for _ in 0..3 {
        assert_eq!(checker.check(port).await.listening, first.listening);
    }
    Ok(())
}

/// Never-bound port: the waiter gives up after roughly its timeout
#[tokio::test]
async fn test_waiter_times_out_on_time() -> Result<()> {
    let port = PortSpec::tcp(SocketTestUtils::free_tcp_port()?)?;
    let checker = PortChecker::system();

    let start = Instant::now();
    let opened = PortWaiter::new(&checker)
        .wait_until_listening(port, Duration::from_secs(1))
        .await;
    let elapsed = start.elapsed();

    assert!(!opened);
    assert!(elapsed >= Duration::from_millis(500) && elapsed <= Duration::from_millis(1500), "{:?}", elapsed);
    Ok(())
}

//! Stand-in ConnectServer for local smoke runs and the integration tests.
//!
//! Reads `config/ConnectServer.ini` from the working directory, binds the TCP
//! and UDP ports on all interfaces, accepts and drops connections, discards
//! datagrams and exits cleanly on SIGTERM or Ctrl-C.
//!
//! Fault injection through the environment:
//! - `STUB_SERVER_EXIT_CODE=<n>`: exit immediately with status `n`
//! - `STUB_SERVER_SKIP_UDP=1`: never bind the UDP port
//! - `STUB_SERVER_BIND_DELAY_MS=<ms>`: wait before binding
//! - `STUB_SERVER_IGNORE_TERM=1`: ignore SIGTERM

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

use portverify::config_source::{
    ConfigSource, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, TCP_PORT_KEY, UDP_PORT_KEY,
};
use portverify::Result;

/// Pause after a failed accept (e.g. out of descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Some(code) = env_parse::<i32>("STUB_SERVER_EXIT_CODE") {
        println!("stub-server: exiting immediately with status {}", code);
        std::process::exit(code);
    }

    // Installed before binding so a stop request never hits the default action
    let mut shutdown = ShutdownSignals::install()?;

    let config = ConfigSource::load(Path::new("config/ConnectServer.ini")).unwrap_or_default();
    let tcp_port = config.port_or(TCP_PORT_KEY, DEFAULT_TCP_PORT);
    let udp_port = config.port_or(UDP_PORT_KEY, DEFAULT_UDP_PORT);

    if let Some(delay) = env_parse::<u64>("STUB_SERVER_BIND_DELAY_MS") {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let listener = TcpListener::bind(("0.0.0.0", tcp_port)).await?;
    info!("TCP listening on {}", listener.local_addr()?);
    println!("stub-server: TCP port {} bound", tcp_port);
    tokio::spawn(accept_loop(listener));

    if std::env::var_os("STUB_SERVER_SKIP_UDP").is_some() {
        warn!("Skipping UDP bind");
    } else {
        let socket = UdpSocket::bind(("0.0.0.0", udp_port)).await?;
        info!("UDP bound on {}", socket.local_addr()?);
        println!("stub-server: UDP port {} bound", udp_port);
        tokio::spawn(receive_loop(socket));
    }

    shutdown.wait().await?;
    println!("stub-server: shutting down");
    Ok(())
}

async fn accept_loop(listener: TcpListener) {
    let listener = &listener;
    serve_connections(move || listener.accept()).await
}

/// Accepts and drops connections forever, pausing after each failure
async fn serve_connections<F, Fut, S>(mut accept: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(S, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                drop(stream);
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn receive_loop(socket: UdpSocket) {
    let mut buf = [0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => debug!("Received {} bytes from {}", n, peer),
            Err(e) => debug!("recv failed: {}", e),
        }
    }
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    ignore_term: bool,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            ignore_term: std::env::var_os("STUB_SERVER_IGNORE_TERM").is_some(),
        })
    }

    async fn wait(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.interrupt.recv() => return Ok(()),
                _ = self.terminate.recv() => {
                    if !self.ignore_term {
                        return Ok(());
                    }
                    warn!("Ignoring SIGTERM");
                }
            }
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn wait(&mut self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

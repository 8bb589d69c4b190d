//! "Is anything listening on this port" across heterogeneous OS tooling.
//!
//! The check walks an ordered chain of strategies: the socket-statistics
//! tool (`ss`), the legacy network-status tool (`netstat`), and finally a
//! direct socket probe. The first strategy that produces a conclusive answer
//! wins. A missing or hung tool is never an error, it just defers to the next
//! strategy.

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Socket, Type};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::port::{PortSpec, Protocol};

/// Upper bound for a single external tool invocation
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout used by the socket fallback for TCP
pub const FALLBACK_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Answer of a single detection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Listening,
    NotListening,
    /// The strategy could not decide (tool missing, timed out, failed)
    Inconclusive,
}

/// Which strategy produced a [`ListenState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    /// `ss`
    SocketStatistics,
    /// `netstat`
    NetworkStatus,
    /// Direct connect/bind probe
    SocketFallback,
}

/// Result of one listening check. Never cached: every call re-inspects the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenState {
    pub listening: bool,
    pub source: DetectionSource,
}

/// One link of the fallback chain
#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    /// Identifies the strategy in a [`ListenState`]
    fn source(&self) -> DetectionSource;

    /// Inspects the system for a listener on `port`
    async fn check(&self, port: PortSpec) -> Detection;
}

/// Runs an introspection tool and matches its listing against the target port.
pub struct ToolStrategy {
    program: &'static str,
    args: &'static [&'static str],
    source: DetectionSource,
    timeout: Duration,
}

impl ToolStrategy {
    /// `ss -lntu`: listening TCP and UDP sockets, numeric
    pub fn socket_statistics() -> Self {
        Self {
            program: "ss",
            args: &["-lntu"],
            source: DetectionSource::SocketStatistics,
            timeout: TOOL_TIMEOUT,
        }
    }

    /// `netstat -an`: all sockets, numeric
    pub fn network_status() -> Self {
        Self {
            program: "netstat",
            args: &["-an"],
            source: DetectionSource::NetworkStatus,
            timeout: TOOL_TIMEOUT,
        }
    }
}

#[async_trait]
impl DetectionStrategy for ToolStrategy {
    fn source(&self) -> DetectionSource {
        self.source
    }

    async fn check(&self, port: PortSpec) -> Detection {
        match run_tool(self.program, self.args, self.timeout).await {
            Some(output) if listing_shows_listener(&output, port) => Detection::Listening,
            Some(_) => Detection::NotListening,
            None => Detection::Inconclusive,
        }
    }
}

/// Connect (TCP) or bind (UDP) probe against the loopback address.
///
/// The UDP answer is approximate: a successful bind only proves no socket
/// holds an exclusive bind on the address. A peer receiving through an
/// already-connected socket goes unnoticed.
pub struct SocketStrategy {
    connect_timeout: Duration,
}

impl SocketStrategy {
    pub fn new() -> Self {
        Self {
            connect_timeout: FALLBACK_CONNECT_TIMEOUT,
        }
    }
}

impl Default for SocketStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectionStrategy for SocketStrategy {
    fn source(&self) -> DetectionSource {
        DetectionSource::SocketFallback
    }

    async fn check(&self, port: PortSpec) -> Detection {
        match port.protocol {
            Protocol::Tcp => {
                match timeout(self.connect_timeout, TcpStream::connect(port.loopback())).await {
                    Ok(Ok(_)) => Detection::Listening,
                    _ => Detection::NotListening,
                }
            }
            Protocol::Udp => {
                let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP)) {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("Error checking {}: {}", port, e);
                        return Detection::Inconclusive;
                    }
                };
                // SO_REUSEADDR would let the probe share a live port
                if let Err(e) = socket.set_reuse_address(false) {
                    debug!("Could not clear SO_REUSEADDR: {}", e);
                }

                match socket.bind(&port.loopback().into()) {
                    Ok(()) => Detection::NotListening,
                    Err(e) => {
                        debug!("UDP bind on {} failed: {}", port.number, e);
                        Detection::Listening
                    }
                }
            }
        }
    }
}

/// Ordered fallback chain deciding whether a port is listening
pub struct PortChecker {
    strategies: Vec<Box<dyn DetectionStrategy>>,
}

impl PortChecker {
    /// The default chain: `ss`, then `netstat`, then the socket probe
    pub fn system() -> Self {
        Self::with_strategies(vec![
            Box::new(ToolStrategy::socket_statistics()),
            Box::new(ToolStrategy::network_status()),
            Box::new(SocketStrategy::new()),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn DetectionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Walks the chain until a strategy answers conclusively.
    ///
    /// When every strategy is inconclusive the port counts as not listening.
    pub async fn check(&self, port: PortSpec) -> ListenState {
        for strategy in &self.strategies {
            match strategy.check(port).await {
                Detection::Listening => {
                    return ListenState {
                        listening: true,
                        source: strategy.source(),
                    }
                }
                Detection::NotListening => {
                    return ListenState {
                        listening: false,
                        source: strategy.source(),
                    }
                }
                Detection::Inconclusive => {
                    debug!("{:?} inconclusive for {}, trying next", strategy.source(), port);
                }
            }
        }

        ListenState {
            listening: false,
            source: DetectionSource::SocketFallback,
        }
    }

    pub async fn is_listening(&self, port: PortSpec) -> bool {
        self.check(port).await.listening
    }
}

impl Default for PortChecker {
    fn default() -> Self {
        Self::system()
    }
}

/// Describes what currently owns `port`, for diagnostics.
///
/// Tries `lsof -i <proto>:<port>` and then `ss -lnp sport = :<port>`.
pub async fn port_owner(port: PortSpec) -> Option<String> {
    let lsof_filter = format!("{}:{}", port.protocol, port.number);
    if let Some(output) = run_tool("lsof", &["-i", lsof_filter.as_str()], TOOL_TIMEOUT).await {
        let output = output.trim();
        if !output.is_empty() {
            return Some(output.to_string());
        }
    }

    let ss_filter = format!("sport = :{}", port.number);
    let protocol_flag = match port.protocol {
        Protocol::Tcp => "-t",
        Protocol::Udp => "-u",
    };
    if let Some(output) = run_tool("ss", &["-lnp", protocol_flag, ss_filter.as_str()], TOOL_TIMEOUT).await {
        // The header line is always printed
        if output.trim().lines().count() > 1 {
            return Some(output.trim().to_string());
        }
    }

    None
}

/// Runs `program` and returns its stdout, or `None` if it is missing,
/// exceeds `limit` or exits unsuccessfully.
async fn run_tool(program: &str, args: &[&str], limit: Duration) -> Option<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match timeout(limit, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("{} unavailable: {}", program, e);
            return None;
        }
        Err(_) => {
            debug!("{} timed out after {:?}", program, limit);
            return None;
        }
    };

    if !output.status.success() {
        debug!("{} exited with {}", program, output.status);
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether a `ss`/`netstat` listing contains a listener for `port`.
///
/// A row qualifies when its first column names the protocol (`tcp`, `tcp6`,
/// `UDP`...), some address column ends in `:<port>` or `.<port>` (BSD
/// style), and for TCP the row is in a listen state. Established UDP rows are
/// skipped because the port may belong to the peer.
pub fn listing_shows_listener(listing: &str, port: PortSpec) -> bool {
    let row = match Regex::new(&format!(
        r"(?i)^\s*{}\S*\s.*[.:]{}(\s|$)",
        port.protocol, port.number
    )) {
        Ok(re) => re,
        Err(e) => {
            warn!("Invalid listing pattern for {}: {}", port, e);
            return false;
        }
    };

    listing.lines().filter(|line| row.is_match(line)).any(|line| {
        let upper = line.to_ascii_uppercase();
        match port.protocol {
            Protocol::Tcp => upper.contains("LISTEN"),
            Protocol::Udp => !upper.contains("ESTABLISHED"),
        }
    })
}

//! The verification run as a forward-only sequence of stages.
//!
//! ```text
//! Preflight → AvailabilityCheck → Launch → AwaitTcp → ProbeTcp → AwaitUdp
//!   → ProbeUdp → Snapshot → LogTail → Teardown → VerifyClosed → Verdict
//! ```
//!
//! Preflight, AvailabilityCheck and Launch abort the run. Anything after a
//! successful launch only records failures in the [`TestOutcome`], so the log
//! tail, teardown and closure checks always happen.

use std::path::PathBuf;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cli::Config;
use crate::config_source::{
    ConfigSource, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, TCP_PORT_KEY, UDP_PORT_KEY,
};
use crate::error::VerifyError;
use crate::port::{PortSpec, Protocol};
use crate::port_checker::{port_owner, PortChecker};
use crate::port_waiter::PortWaiter;
use crate::probe::{probe_tcp, probe_udp, ProbeResult};
use crate::process_manager::{tail_log, ProcessConfig, ProcessHandle, ProcessLifecycle};
use crate::reporter::Reporter;

/// Exit status for a run cut short by the user
pub const EXIT_INTERRUPTED: i32 = 130;

/// Stages of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Preflight,
    AvailabilityCheck,
    Launch,
    AwaitTcp,
    ProbeTcp,
    AwaitUdp,
    ProbeUdp,
    Snapshot,
    LogTail,
    Teardown,
    VerifyClosed,
    Verdict,
}

/// What the run observed about the two ports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestOutcome {
    pub tcp_opened: bool,
    pub udp_opened: bool,
    pub tcp_closed: bool,
    pub udp_closed: bool,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.tcp_opened && self.udp_opened && self.tcp_closed && self.udp_closed
    }

    /// Human-readable list of the facets that failed
    pub fn failures(&self) -> Vec<&'static str> {
        let mut failures = Vec::new();
        if !self.tcp_opened {
            failures.push("TCP port did not open correctly");
        }
        if !self.udp_opened {
            failures.push("UDP port did not open correctly");
        }
        if !self.tcp_closed {
            failures.push("TCP port did not close correctly");
        }
        if !self.udp_closed {
            failures.push("UDP port did not close correctly");
        }
        failures
    }
}

/// Final result of a run
#[derive(Debug)]
pub enum Verdict {
    Passed(TestOutcome),
    Failed(TestOutcome),
    /// Stopped before the ports could be judged
    Aborted(VerifyError),
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Passed(_) => 0,
            Verdict::Failed(_) | Verdict::Aborted(_) => 1,
        }
    }

    pub fn outcome(&self) -> Option<TestOutcome> {
        match self {
            Verdict::Passed(outcome) | Verdict::Failed(outcome) => Some(*outcome),
            Verdict::Aborted(_) => None,
        }
    }
}

/// Everything one run needs, passed explicitly instead of living in globals.
///
/// At most one server process is alive per session.
pub struct TestSession<'r> {
    id: Uuid,
    config: Config,
    checker: PortChecker,
    reporter: &'r dyn Reporter,
    stage: Stage,
    lifecycle: Option<ProcessLifecycle>,
    process: Option<ProcessHandle>,
    termination_requested: bool,
    outcome: TestOutcome,
}

impl<'r> TestSession<'r> {
    pub fn new(config: Config, checker: PortChecker, reporter: &'r dyn Reporter) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            checker,
            reporter,
            stage: Stage::Preflight,
            lifecycle: None,
            process: None,
            termination_requested: false,
            outcome: TestOutcome::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn outcome(&self) -> TestOutcome {
        self.outcome
    }

    /// Whether a server process is currently held
    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Runs every stage once and returns the verdict
    pub async fn run(&mut self) -> Verdict {
        let span = info_span!("session", run_id = %self.id);
        self.run_stages().instrument(span).await
    }

    /// Best-effort teardown after the run future was dropped (user interrupt)
    pub async fn abort(&mut self) {
        if self.process.is_some() {
            warn!("Run interrupted during {:?}, tearing down", self.stage);
            self.teardown().await;
        }
    }

    async fn run_stages(&mut self) -> Verdict {
        self.reporter.section("ConnectServer Port Test");
        self.reporter.blank();

        let (binary, tcp, udp) = match self.preflight() {
            Ok(resolved) => resolved,
            Err(e) => return self.aborted(e),
        };
        self.reporter.blank();

        if let Err(e) = self.check_availability(tcp, udp).await {
            return self.aborted(e);
        }
        self.reporter.blank();

        if let Err(e) = self.launch(binary).await {
            return self.aborted(e);
        }
        self.reporter.blank();

        self.reporter.info(&format!("Step 4: Testing TCP port {}...", tcp.number));
        self.outcome.tcp_opened = self.await_port(Stage::AwaitTcp, tcp).await;
        if self.outcome.tcp_opened {
            self.enter(Stage::ProbeTcp);
            self.reporter.info("Testing TCP connection...");
            match probe_tcp(tcp).await {
                ProbeResult::Ok => self.reporter.success("TCP connection test successful"),
                ProbeResult::Failed(reason) => {
                    self.reporter.warning(&format!("TCP connection failed: {}", reason))
                }
            }
        }
        self.reporter.blank();

        self.reporter.info(&format!("Step 5: Testing UDP port {}...", udp.number));
        self.outcome.udp_opened = self.await_port(Stage::AwaitUdp, udp).await;
        if self.outcome.udp_opened {
            self.enter(Stage::ProbeUdp);
            self.reporter.info("Testing UDP communication...");
            match probe_udp(udp).await {
                ProbeResult::Ok => {
                    self.reporter.info("UDP packet sent (server may reject invalid protocol)")
                }
                ProbeResult::Failed(reason) => {
                    self.reporter.warning(&format!("UDP send test error: {}", reason))
                }
            }
        }
        self.reporter.blank();

        self.snapshot(tcp, udp).await;
        self.show_log_tail();

        self.reporter.info("Step 8: Cleanup...");
        self.teardown().await;
        self.verify_closed(tcp, udp).await;
        self.reporter.blank();

        self.verdict()
    }

    fn aborted(&self, e: VerifyError) -> Verdict {
        if e.is_precondition() {
            self.reporter.info("Nothing was started, no cleanup needed");
        }
        warn!("Run aborted during {:?}: {}", self.stage, e);
        Verdict::Aborted(e)
    }

    fn enter(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage {:?} after {:?}", next, self.stage);
        debug!("Entering stage {:?}", next);
        self.stage = next;
    }

    /// Finds the server binary and resolves both ports.
    fn preflight(&mut self) -> Result<(PathBuf, PortSpec, PortSpec), VerifyError> {
        self.reporter.info("Step 1: Checking prerequisites...");

        let Some(binary) = self.config.resolve_binary() else {
            let searched = self.config.binary_candidates.clone();
            self.reporter.error("ConnectServer binary not found");
            self.reporter.info("Please build the project first. Searched locations:");
            for path in &searched {
                self.reporter.info(&format!("  - {}", path.display()));
            }
            return Err(VerifyError::BinaryNotFound { searched });
        };
        self.reporter.success(&format!("Binary found: {}", binary.display()));

        let (tcp_port, udp_port) = match ConfigSource::load(&self.config.config_path) {
            Ok(source) => {
                self.reporter.success("Config file found");
                if source.is_empty() {
                    self.reporter.warning("Config file has no entries, using default ports");
                }
                (
                    source.port_or(TCP_PORT_KEY, DEFAULT_TCP_PORT),
                    source.port_or(UDP_PORT_KEY, DEFAULT_UDP_PORT),
                )
            }
            Err(e) => {
                warn!("Config {} unreadable: {}", self.config.config_path.display(), e);
                self.reporter.warning(&format!(
                    "Config file not found at: {}",
                    self.config.config_path.display()
                ));
                (DEFAULT_TCP_PORT, DEFAULT_UDP_PORT)
            }
        };
        self.reporter.info(&format!("TCP Port: {}", tcp_port));
        self.reporter.info(&format!("UDP Port: {}", udp_port));

        Ok((binary, PortSpec::tcp(tcp_port)?, PortSpec::udp(udp_port)?))
    }

    /// Refuses to start if either port is already taken.
    async fn check_availability(&mut self, tcp: PortSpec, udp: PortSpec) -> Result<(), VerifyError> {
        self.enter(Stage::AvailabilityCheck);
        self.reporter.info("Step 2: Checking if ports are available...");

        for port in [tcp, udp] {
            let state = self.checker.check(port).await;
            if state.listening {
                info!("{} already listening ({:?})", port, state.source);
                self.reporter.error(&format!("{} is already in use", port));
                if let Some(owner) = port_owner(port).await {
                    self.reporter.raw(&owner);
                }
                return Err(VerifyError::PortInUse { port });
            }
            self.reporter.success(&format!("{} is available", port));
        }

        Ok(())
    }

    /// Starts the server and makes sure it survives the settle window.
    async fn launch(&mut self, binary: PathBuf) -> Result<(), VerifyError> {
        self.enter(Stage::Launch);
        self.reporter.info("Step 3: Starting ConnectServer...");

        let lifecycle = ProcessLifecycle::new(ProcessConfig {
            executable: binary,
            working_directory: self.config.project_root.clone(),
            log_path: self.config.log_path.clone(),
            graceful_shutdown_timeout: self.config.graceful_timeout,
            settle_window: self.config.settle_window,
        });

        let handle = match lifecycle.start() {
            Ok(handle) => handle,
            Err(e) => {
                self.reporter.error(&format!("Failed to start ConnectServer: {}", e));
                return Err(e);
            }
        };
        self.reporter.info(&format!("ConnectServer started with PID: {}", handle.pid));
        self.reporter.info(&format!("Log file: {}", handle.log_path.display()));

        // Held by the session from here on, so an interrupt mid-settle still
        // goes through the graceful teardown in `abort`
        let lifecycle = self.lifecycle.insert(lifecycle);
        let handle = self.process.insert(handle);

        if let Some(code) = lifecycle.settle(handle).await {
            let log_path = handle.log_path.clone();
            self.process = None;
            self.reporter.error("ConnectServer process died immediately");
            self.reporter.info(&format!("Check log file for details: {}", log_path.display()));
            match std::fs::read(&log_path) {
                Ok(bytes) => self.reporter.raw(String::from_utf8_lossy(&bytes).trim_end()),
                Err(e) => self.reporter.warning(&format!("Could not read log file: {}", e)),
            }
            return Err(VerifyError::LaunchFailure {
                status: format!("exit code {}", code),
            });
        }
        self.reporter.success("ConnectServer process is running");
        Ok(())
    }

    /// Waits for `port` to listen; a timeout is recorded, not fatal.
    async fn await_port(&mut self, stage: Stage, port: PortSpec) -> bool {
        self.enter(stage);

        let alive = match (self.lifecycle.as_ref(), self.process.as_mut()) {
            (Some(lifecycle), Some(handle)) => lifecycle.poll(handle).is_none(),
            _ => false,
        };
        if !alive {
            warn!("Not waiting for {}: server process is gone", port);
            self.reporter.error(&format!("ConnectServer exited before {} was checked", port));
            return false;
        }

        let timeout = self.config.wait_timeout;
        self.reporter.info(&format!(
            "Waiting for {} to open (timeout: {}s)...",
            port,
            timeout.as_secs()
        ));

        let opened = PortWaiter::new(&self.checker).wait_until_listening(port, timeout).await;
        if opened {
            let state = match port.protocol {
                Protocol::Tcp => "LISTENING",
                Protocol::Udp => "OPEN",
            };
            self.reporter.success(&format!("{} is {}", port, state));
        } else {
            warn!("{} not listening within {:?}", port, timeout);
            self.reporter.error(&format!(
                "{} is NOT open after {} seconds",
                port,
                timeout.as_secs()
            ));
            self.reporter.info(&format!("Check log file: {}", self.config.log_path.display()));
        }
        opened
    }

    /// Shows what owns each port right now.
    async fn snapshot(&mut self, tcp: PortSpec, udp: PortSpec) {
        self.enter(Stage::Snapshot);
        self.reporter.info("Step 6: Current port status...");
        self.reporter.blank();

        for port in [tcp, udp] {
            match port_owner(port).await {
                Some(owner) => {
                    self.reporter.raw(&format!("{} port info:", port.protocol.label()));
                    self.reporter.raw(&owner);
                }
                None => self
                    .reporter
                    .raw(&format!("{} port info: Not available", port.protocol.label())),
            }
            self.reporter.blank();
        }
    }

    fn show_log_tail(&mut self) {
        self.enter(Stage::LogTail);
        self.reporter.info("Step 7: Recent log entries...");
        self.reporter.blank();

        match tail_log(&self.config.log_path, self.config.log_tail_lines) {
            Ok(lines) => {
                for line in lines {
                    self.reporter.raw(&line);
                }
            }
            Err(e) => self.reporter.warning(&format!("Could not read log file: {}", e)),
        }
        self.reporter.blank();
    }

    /// Stops the server if one is held. Safe to call more than once.
    async fn teardown(&mut self) {
        if self.stage < Stage::Teardown {
            self.enter(Stage::Teardown);
        }

        let (Some(lifecycle), Some(handle)) = (self.lifecycle.as_ref(), self.process.as_mut()) else {
            return;
        };

        self.termination_requested = true;
        self.reporter
            .warning(&format!("Stopping ConnectServer (PID: {})...", handle.pid));

        match lifecycle.terminate(handle, self.config.graceful_timeout).await {
            Ok(report) if report.escalated => self
                .reporter
                .warning("Process did not terminate gracefully, force killed"),
            Ok(report) => debug!("Server stopped with {:?}", report.exit_code),
            Err(e) => {
                error!("Teardown failed: {}", e);
                self.reporter.error(&format!("Failed to stop ConnectServer: {}", e));
            }
        }

        // Confirmed gone (or beyond our reach): release the handle
        self.process = None;
    }

    /// Checks both ports were released.
    async fn verify_closed(&mut self, tcp: PortSpec, udp: PortSpec) {
        self.enter(Stage::VerifyClosed);
        debug_assert!(self.termination_requested);

        sleep(self.config.close_delay).await;

        self.outcome.tcp_closed = !self.checker.is_listening(tcp).await;
        self.outcome.udp_closed = !self.checker.is_listening(udp).await;

        for (port, closed) in [(tcp, self.outcome.tcp_closed), (udp, self.outcome.udp_closed)] {
            if closed {
                self.reporter.success(&format!("{} is now closed", port));
            } else {
                self.reporter.warning(&format!("{} is still in use", port));
            }
        }
    }

    fn verdict(&mut self) -> Verdict {
        self.enter(Stage::Verdict);
        self.reporter.section("Test Summary");

        let outcome = self.outcome;
        if outcome.passed() {
            self.reporter
                .success("All tests passed! TCP and UDP ports opened and closed correctly.");
            Verdict::Passed(outcome)
        } else {
            self.reporter
                .error("Some tests failed. Check the output above for details.");
            for failure in outcome.failures() {
                self.reporter.error(&format!("  - {}", failure));
            }
            Verdict::Failed(outcome)
        }
    }
}

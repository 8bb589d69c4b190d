use chrono::{DateTime, Local};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::VerifyError;

/// Configuration for launching and stopping the server under test
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Server executable, started without arguments
    pub executable: PathBuf,
    /// Working directory for the process
    pub working_directory: PathBuf,
    /// File receiving the merged stdout and stderr
    pub log_path: PathBuf,
    /// Timeout for graceful shutdown
    pub graceful_shutdown_timeout: Duration,
    /// Pause after spawn before the first liveness check
    pub settle_window: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            working_directory: PathBuf::from("."),
            log_path: std::env::temp_dir().join("connectserver_test.log"),
            graceful_shutdown_timeout: Duration::from_secs(5),
            settle_window: Duration::from_secs(1),
        }
    }
}

/// State of the managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Termination requested, not yet confirmed
    Stopping,
    Stopped,
}

/// Owns the one running server process.
///
/// The child is spawned with `kill_on_drop`, and dropping a handle whose
/// process is still alive kills its whole process group.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Local>,
    pub log_path: PathBuf,
    pub exited: bool,
    pub exit_code: Option<i32>,
    state: ProcessState,
    child: Child,
}

impl ProcessHandle {
    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exited = true;
        self.exit_code = Some(exit_code_of(status));
        self.state = ProcessState::Stopped;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exited {
            return;
        }

        // Emergency cleanup: no graceful shutdown in Drop
        eprintln!(
            "ProcessHandle dropped with running child (PID: {}), emergency cleanup",
            self.pid
        );
        if let Err(e) = send_kill(self.pid) {
            debug!("Emergency kill of {} failed: {}", self.pid, e);
        }
        let _ = self.child.start_kill();
    }
}

/// How a termination went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationReport {
    /// The graceful request timed out and a forced kill was needed
    pub escalated: bool,
    pub exit_code: Option<i32>,
}

/// Starts, polls and stops the server process
pub struct ProcessLifecycle {
    config: ProcessConfig,
}

impl ProcessLifecycle {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// Spawns the server with stdout and stderr redirected into the log file.
    ///
    /// Fails with [`VerifyError::Launch`] when the executable is missing or the
    /// OS refuses to spawn it. The log is only truncated once the executable
    /// passed those checks; a spawn refused after that leaves it empty.
    pub fn start(&self) -> Result<ProcessHandle, VerifyError> {
        let executable = &self.config.executable;
        check_executable(executable).map_err(|source| VerifyError::Launch {
            path: executable.clone(),
            source,
        })?;

        let log = File::create(&self.config.log_path)?;
        let log_err = log.try_clone()?;

        info!("Spawning process: {}", executable.display());

        let mut command = Command::new(executable);
        command
            .current_dir(&self.config.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        // Own process group so termination reaches helpers the server forks
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| VerifyError::Launch {
            path: executable.clone(),
            source,
        })?;

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(VerifyError::LaunchFailure {
                    status: "exited before its PID could be read".to_string(),
                })
            }
        };

        info!("Process spawned with PID: {}", pid);
        Ok(ProcessHandle {
            pid,
            started_at: Local::now(),
            log_path: self.config.log_path.clone(),
            exited: false,
            exit_code: None,
            state: ProcessState::Running,
            child,
        })
    }

    /// Non-blocking liveness check: `Some(code)` once the process has exited.
    ///
    /// Deaths by signal report the negated signal number.
    pub fn poll(&self, handle: &mut ProcessHandle) -> Option<i32> {
        if handle.exited {
            return handle.exit_code;
        }

        match handle.child.try_wait() {
            Ok(Some(status)) => {
                info!("Process {} exited with status: {}", handle.pid, status);
                handle.record_exit(status);
                handle.exit_code
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Error polling process {}: {}", handle.pid, e);
                None
            }
        }
    }

    /// Waits out the settle window, then polls once
    pub async fn settle(&self, handle: &mut ProcessHandle) -> Option<i32> {
        sleep(self.config.settle_window).await;
        self.poll(handle)
    }

    /// Stops the process: a graceful termination request first, then a
    /// forced kill if it is still alive after `grace`.
    ///
    /// On Windows there is no catchable request, so the first phase already
    /// kills the process.
    pub async fn terminate(
        &self,
        handle: &mut ProcessHandle,
        grace: Duration,
    ) -> Result<TerminationReport, VerifyError> {
        if let Some(code) = self.poll(handle) {
            debug!("Process {} already exited", handle.pid);
            return Ok(TerminationReport {
                escalated: false,
                exit_code: Some(code),
            });
        }

        handle.state = ProcessState::Stopping;
        info!("Initiating graceful shutdown of process {}", handle.pid);

        if let Err(e) = request_stop(handle) {
            warn!("Failed to send termination request: {}", e);
        }

        match timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process exited gracefully: {}", status);
                handle.record_exit(status);
                return Ok(TerminationReport {
                    escalated: false,
                    exit_code: handle.exit_code,
                });
            }
            Ok(Err(e)) => warn!("Error during graceful shutdown: {}", e),
            Err(_) => warn!("Graceful shutdown timeout after {:?}, forcing kill", grace),
        }

        self.force_kill(handle).await
    }

    /// Kills the process and waits for it unconditionally
    async fn force_kill(&self, handle: &mut ProcessHandle) -> Result<TerminationReport, VerifyError> {
        info!("Force killing process {}", handle.pid);

        if let Err(e) = send_kill(handle.pid) {
            warn!("Failed to kill process group {}: {}", handle.pid, e);
        }
        if let Err(e) = handle.child.start_kill() {
            debug!("start_kill on {}: {}", handle.pid, e);
        }

        match handle.child.wait().await {
            Ok(status) => {
                info!("Process killed, exit status: {}", status);
                handle.record_exit(status);
                Ok(TerminationReport {
                    escalated: true,
                    exit_code: handle.exit_code,
                })
            }
            Err(e) => {
                error!("Error waiting for killed process {}: {}", handle.pid, e);
                Err(e.into())
            }
        }
    }
}

/// Regular file the OS will let us execute
fn check_executable(path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            std::io::Error::new(std::io::ErrorKind::NotFound, "executable does not exist")
        }
        _ => e,
    })?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "executable bit not set",
            ));
        }
    }

    Ok(())
}

/// Last `count` lines of the log file, decoded lossily
pub fn tail_log(path: &Path, count: usize) -> std::io::Result<Vec<String>> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(count);
    Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Sends SIGTERM to the server's process group
#[cfg(unix)]
fn request_stop(handle: &mut ProcessHandle) -> std::io::Result<()> {
    signal_group(handle.pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn request_stop(handle: &mut ProcessHandle) -> std::io::Result<()> {
    handle.child.start_kill()
}

#[cfg(unix)]
fn send_kill(pid: u32) -> std::io::Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn send_kill(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::{getpgid, Pid};

    let pid = Pid::from_raw(pid as i32);
    let pgid = getpgid(Some(pid)).map_err(std::io::Error::from)?;
    debug!("Sending signal {:?} to process group {}", signal, pgid);
    kill(Pid::from_raw(-pgid.as_raw()), signal).map_err(std::io::Error::from)
}

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use super::SocketTestUtils;

/// Upper bound for one verifier run in tests
const RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Throwaway project root with a config file, driven by the real binaries
pub struct VerifierHarness {
    temp_dir: TempDir,
    environment: HashMap<String, String>,
    extra_args: Vec<String>,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl VerifierHarness {
    /// Create a project root configured with two currently free ports
    pub fn new() -> Result<Self> {
        let tcp_port = SocketTestUtils::free_tcp_port()?;
        let udp_port = SocketTestUtils::free_udp_port()?;
        Self::with_ports(tcp_port, udp_port)
    }

    pub fn with_ports(tcp_port: u16, udp_port: u16) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;

        let config_dir = temp_dir.path().join("config");
        std::fs::create_dir_all(&config_dir)?;
        std::fs::write(
            config_dir.join("ConnectServer.ini"),
            format!(
                "; generated by the integration tests\n\
                 [ConnectServerInfo]\n\
                 ConnectServerPortTCP = {}\n\
                 ConnectServerPortUDP = {}\n",
                tcp_port, udp_port
            ),
        )?;

        Ok(Self {
            temp_dir,
            environment: HashMap::new(),
            extra_args: Vec::new(),
            tcp_port,
            udp_port,
        })
    }

    /// Set an environment variable for the verifier (and so for the server it launches)
    pub fn set_environment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(key.into(), value.into());
    }

    /// Append a command line argument for the verifier
    pub fn arg(&mut self, arg: impl Into<String>) {
        self.extra_args.push(arg.into());
    }

    pub fn project_root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn log_path(&self) -> PathBuf {
        self.temp_dir.path().join("connectserver_test.log")
    }

    /// Copy the stub server to where the build would put ConnectServer
    pub fn install_stub(&self) -> Result<PathBuf> {
        let build = self.temp_dir.path().join("build");
        let target = if cfg!(windows) {
            build.join("Release").join("ConnectServer.exe")
        } else {
            build.join("ConnectServer")
        };
        std::fs::create_dir_all(target.parent().context("binary path has no parent")?)?;
        std::fs::copy(env!("CARGO_BIN_EXE_stub-server"), &target)
            .context("Failed to install stub server")?;
        Ok(target)
    }

    /// Spawn the verifier with stdout/stderr piped
    pub fn spawn_verifier(&self) -> Result<Child> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_portverify"));
        cmd.arg("--project-root")
            .arg(self.temp_dir.path())
            .arg("--log-file")
            .arg(self.log_path())
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.environment {
            cmd.env(key, value);
        }

        cmd.spawn().context("Failed to spawn portverify")
    }

    /// Run the verifier to completion
    pub async fn run_verifier(&self) -> Result<VerifierRun> {
        let start = Instant::now();
        let child = self.spawn_verifier()?;
        let output = timeout(RUN_TIMEOUT, child.wait_with_output())
            .await
            .context("portverify did not finish in time")?
            .context("Failed to collect portverify output")?;

        Ok(VerifierRun {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
        })
    }

    /// Both configured ports are free again
    pub async fn ports_released(&self) -> bool {
        !SocketTestUtils::tcp_accepts(self.tcp_port).await && SocketTestUtils::udp_bindable(self.udp_port)
    }
}

/// Captured result of one verifier invocation
#[derive(Debug)]
pub struct VerifierRun {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl VerifierRun {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

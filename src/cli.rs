use clap::Parser;
use eyre::eyre;
use std::path::{Path, PathBuf};
use std::time::Duration;

type Result<T> = color_eyre::eyre::Result<T>;

/// Server binary name inside the build directory
pub const SERVER_BINARY: &str = "ConnectServer";

/// Log file name inside the temp directory
pub const LOG_FILE_NAME: &str = "connectserver_test.log";

/// Verify that ConnectServer opens and releases its TCP and UDP ports
#[derive(Parser, Debug)]
#[command(name = "portverify")]
#[command(about = "Verify that ConnectServer opens and releases its TCP and UDP ports")]
#[command(version)]
pub struct Cli {
    /// Project root holding build/ and config/ (default: current directory)
    #[arg(long)]
    pub project_root: Option<PathBuf>,

    /// Server binary to launch instead of the build output
    #[arg(long)]
    pub binary: Option<PathBuf>,

    /// Config file (default: <project root>/config/ConnectServer.ini)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// File receiving the server's output (default: temp dir)
    #[arg(hide = true, long)]
    pub log_file: Option<PathBuf>,

    /// How long to wait for each port to open (seconds)
    #[arg(long, default_value = "10")]
    pub wait_timeout_secs: u64,

    /// Graceful shutdown timeout before a forced kill (seconds)
    #[arg(hide = true, long, default_value = "5")]
    pub grace_secs: u64,

    /// Diagnostic logging on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Resolved settings for one verification run
#[derive(Debug, Clone)]
pub struct Config {
    /// Working directory of the server
    pub project_root: PathBuf,
    /// Server binaries tried in order
    pub binary_candidates: Vec<PathBuf>,
    /// INI file holding the port numbers
    pub config_path: PathBuf,
    /// Server log file
    pub log_path: PathBuf,
    /// Timeout for each port to start listening
    pub wait_timeout: Duration,
    /// Graceful shutdown timeout
    pub graceful_timeout: Duration,
    /// Pause after launch before checking the process is alive
    pub settle_window: Duration,
    /// Pause between teardown and the closure checks
    pub close_delay: Duration,
    /// Log lines shown at the end of a run
    pub log_tail_lines: usize,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| eyre!("Cannot determine current directory: {}", e))?;
        let project_root = match cli.project_root {
            Some(root) if root.is_absolute() => root,
            Some(root) => cwd.join(root),
            None => cwd,
        };

        let binary_candidates = match cli.binary {
            Some(binary) => vec![binary],
            None => default_binary_candidates(&project_root),
        };

        let config_path = cli
            .config
            .unwrap_or_else(|| project_root.join("config").join("ConnectServer.ini"));

        let log_path = cli
            .log_file
            .unwrap_or_else(|| std::env::temp_dir().join(LOG_FILE_NAME));

        Ok(Config {
            project_root,
            binary_candidates,
            config_path,
            log_path,
            wait_timeout: Duration::from_secs(cli.wait_timeout_secs),
            graceful_timeout: Duration::from_secs(cli.grace_secs),
            ..Config::defaults()
        })
    }

    /// Settings for a project rooted at the current directory
    pub fn defaults() -> Self {
        let project_root = PathBuf::from(".");
        Config {
            binary_candidates: default_binary_candidates(&project_root),
            config_path: project_root.join("config").join("ConnectServer.ini"),
            log_path: std::env::temp_dir().join(LOG_FILE_NAME),
            project_root,
            wait_timeout: Duration::from_secs(10),
            graceful_timeout: Duration::from_secs(5),
            settle_window: Duration::from_secs(1),
            close_delay: Duration::from_secs(1),
            log_tail_lines: 20,
        }
    }

    /// First candidate binary that exists
    pub fn resolve_binary(&self) -> Option<PathBuf> {
        self.binary_candidates.iter().find(|path| path.is_file()).cloned()
    }
}

/// Where the build puts the server: `Release`, then `Debug`, then the build
/// root on Windows; the build root elsewhere.
pub fn default_binary_candidates(project_root: &Path) -> Vec<PathBuf> {
    let build_dir = project_root.join("build");
    if cfg!(windows) {
        let exe = format!("{}.exe", SERVER_BINARY);
        vec![
            build_dir.join("Release").join(&exe),
            build_dir.join("Debug").join(&exe),
            build_dir.join(&exe),
        ]
    } else {
        vec![build_dir.join(SERVER_BINARY)]
    }
}

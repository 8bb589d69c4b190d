use clap::Parser;
use eyre::WrapErr;
use tokio::select;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portverify::cli::{Cli, Config};
use portverify::orchestrator::EXIT_INTERRUPTED;
use portverify::signals::Signals;
use portverify::{ConsoleReporter, PortChecker, Reporter, Result, TestSession};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    info!("portverify starting");

    let reporter = ConsoleReporter;
    let code = match run(cli, &reporter).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:?}", e);
            reporter.error(&format!("Unexpected error: {}", e));
            1
        }
    };

    info!("portverify exiting with status {}", code);
    std::process::exit(code);
}

/// Runs one verification, racing it against a user interrupt
async fn run(cli: Cli, reporter: &dyn Reporter) -> Result<i32> {
    let config = Config::from_cli(cli)?;
    let mut signals = Signals::new().wrap_err("Failed to install interrupt handlers")?;

    let mut session = TestSession::new(config, PortChecker::system(), reporter);

    let verdict = select! {
        verdict = session.run() => Some(verdict),
        interrupt = signals.recv() => {
            warn!("received {:?}", interrupt);
            None
        }
    };

    match verdict {
        Some(verdict) => Ok(verdict.exit_code()),
        None => {
            reporter.blank();
            reporter.raw("Test interrupted by user");
            session.abort().await;
            Ok(EXIT_INTERRUPTED)
        }
    }
}

/// Logs go to stderr so they never interleave with the narration on stdout.
///
/// Without `-v`, `RUST_LOG` decides and the default is warnings only.
fn init_tracing(verbose: u8) -> Result<()> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .wrap_err("Failed to initialize tracing subscriber")?;

    Ok(())
}

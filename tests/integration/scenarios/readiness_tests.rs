use crate::infrastructure::VerifierHarness;
use anyhow::Result;
use std::net::TcpListener;
use std::time::Duration;

/// Server binds both ports and stops on SIGTERM: the run passes
#[tokio::test]
async fn test_well_behaved_server_passes() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = VerifierHarness::new()?;
    harness.install_stub()?;

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(0), "stdout:\n{}\nstderr:\n{}", run.stdout, run.stderr);
    assert!(run.stdout.contains(&format!("TCP port {} is LISTENING", harness.tcp_port)));
    assert!(run.stdout.contains(&format!("UDP port {} is OPEN", harness.udp_port)));
    assert!(run.stdout.contains("TCP connection test successful"));
    assert!(run.stdout.contains("All tests passed!"));

    // Log tail shows the server's own output
    assert!(harness.log_path().exists());
    assert!(run.stdout.contains("stub-server: TCP port"));

    assert!(harness.ports_released().await, "ports still held after the run");
    Ok(())
}

/// Port already taken before launch: abort without starting the server
#[tokio::test]
async fn test_occupied_port_aborts_without_launch() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let squatter = TcpListener::bind("127.0.0.1:0")?;
    let tcp_port = squatter.local_addr()?.port();
    let udp_port = crate::infrastructure::SocketTestUtils::free_udp_port()?;

    let harness = VerifierHarness::with_ports(tcp_port, udp_port)?;
    harness.install_stub()?;

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(1), "stdout:\n{}", run.stdout);
    assert!(run.stdout.contains(&format!("TCP port {} is already in use", tcp_port)));
    assert!(!run.stdout.contains("Starting ConnectServer"));
    assert!(!harness.log_path().exists(), "server log must not be created");
    Ok(())
}

/// UDP never binds: the run fails but still tears down and checks closure
#[tokio::test]
async fn test_missing_udp_fails_after_full_teardown() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = VerifierHarness::new()?;
    harness.install_stub()?;
    harness.set_environment("STUB_SERVER_SKIP_UDP", "1");
    harness.arg("--wait-timeout-secs");
    harness.arg("3");

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(1), "stdout:\n{}", run.stdout);
    assert!(run.stdout.contains(&format!("TCP port {} is LISTENING", harness.tcp_port)));
    assert!(run.stdout.contains(&format!("UDP port {} is NOT open after 3 seconds", harness.udp_port)));
    assert!(run.stdout.contains("UDP port did not open correctly"));
    assert!(!run.stdout.contains("TCP port did not open correctly"));
    assert!(run.stdout.contains("Stopping ConnectServer"));
    assert!(run.stdout.contains(&format!("TCP port {} is now closed", harness.tcp_port)));
    assert!(run.stdout.contains(&format!("UDP port {} is now closed", harness.udp_port)));
    assert!(run.elapsed >= Duration::from_secs(3));

    assert!(harness.ports_released().await);
    Ok(())
}

/// Server dies inside the settle window: launch failure, log dumped, no waits
#[tokio::test]
async fn test_immediate_exit_is_launch_failure() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = VerifierHarness::new()?;
    harness.install_stub()?;
    harness.set_environment("STUB_SERVER_EXIT_CODE", "3");

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(1), "stdout:\n{}", run.stdout);
    assert!(run.stdout.contains("ConnectServer process died immediately"));
    assert!(run.stdout.contains("stub-server: exiting immediately with status 3"));
    assert!(!run.stdout.contains("Waiting for"));
    Ok(())
}

/// Missing config: defaults are used and a warning is printed
#[tokio::test]
async fn test_missing_config_falls_back_to_defaults() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = VerifierHarness::new()?;
    harness.install_stub()?;
    // Stop right after launch so the default ports are never bound
    harness.set_environment("STUB_SERVER_EXIT_CODE", "2");
    harness.arg("--config");
    harness.arg(harness.project_root().join("nowhere.ini").display().to_string());

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(1));
    assert!(run.stdout.contains("Config file not found"), "stdout:\n{}", run.stdout);
    assert!(run.stdout.contains("TCP Port: 44405"));
    assert!(run.stdout.contains("UDP Port: 55601"));
    Ok(())
}

/// SIGTERM ignored: teardown escalates to a forced kill and the ports still close
#[cfg(unix)]
#[tokio::test]
async fn test_unresponsive_server_is_force_killed() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = VerifierHarness::new()?;
    harness.install_stub()?;
    harness.set_environment("STUB_SERVER_IGNORE_TERM", "1");
    harness.arg("--grace-secs");
    harness.arg("1");

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(0), "stdout:\n{}", run.stdout);
    assert!(run.stdout.contains("Process did not terminate gracefully, force killed"));
    assert!(harness.ports_released().await);
    Ok(())
}

/// A slow-binding server is still detected inside the wait window
#[tokio::test]
async fn test_delayed_bind_within_timeout_passes() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = VerifierHarness::new()?;
    harness.install_stub()?;
    harness.set_environment("STUB_SERVER_BIND_DELAY_MS", "2000");
    harness.arg("--wait-timeout-secs");
    harness.arg("5");

    let run = harness.run_verifier().await?;

    assert_eq!(run.exit_code(), Some(0), "stdout:\n{}", run.stdout);
    Ok(())
}

//! Integration tests for the real-server side: process handle, idle watcher
//! and the full lifecycle, with `sh` scripts standing in for the server.

#![cfg(unix)]

use clap::Parser;
use client::{ping_server_with, PingOptions};
use server::gateway::{Gateway, GatewayExit};
use server::install::{Installation, Paths};
use server::process::{LaunchSpec, ServerProcess, StartupFailure};
use server::session::{GatewayContext, LoginPolicy};
use server::watcher::{watch_server, WatcherConfig};
use server::{Lifecycle, Orchestrator, Settings};
use shared::StatusSnapshot;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Prints the readiness line, then answers `list` with `$ONLINE` players and
/// exits on `stop`
const FAKE_SERVER: &str = r#"
echo '[00:00:00 INFO]: Starting minecraft server'
echo '[00:00:01 INFO]: Done (0.123s)! For help, type "help"'
while read line; do
  case "$line" in
    list) echo "[00:00:02 INFO]: There are ${ONLINE:-0} of a max of 20 players online: ";;
    stop) echo '[00:00:03 INFO]: Stopping the server'; exit 0;;
    *) echo "[00:00:02 INFO]: Console: $line";;
  esac
done
"#;

fn fake_server(online: u32) -> LaunchSpec {
    LaunchSpec {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            format!("ONLINE={}\n{}", online, FAKE_SERVER),
        ],
        working_dir: std::env::temp_dir(),
        binary: None,
    }
}

async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_ping() -> PingOptions {
    PingOptions {
        connect_timeout: Duration::from_millis(500),
        settle: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        ..PingOptions::default()
    }
}

fn watcher_config(port: u16, hide_online_players: bool, grace: Duration) -> WatcherConfig {
    let mut config = WatcherConfig::new("127.0.0.1", port, hide_online_players, grace);
    config.poll_interval = Duration::from_millis(100);
    config.ping = fast_ping();
    config
}

/// STARTUP TESTS
mod startup_tests {
    use super::*;

    /// Readiness is reported once the marker line is printed
    #[tokio::test]
    async fn ready_after_marker() {
        let mut process = ServerProcess::spawn(&fake_server(0)).unwrap();
        let ready = timeout(TEST_TIMEOUT, process.wait_ready()).await.unwrap();
        assert!(ready.is_ok());

        process.handle().stop();
        timeout(TEST_TIMEOUT, process.closed()).await.unwrap();
    }

    /// Closing without the marker is a plain startup failure
    #[tokio::test]
    async fn close_without_marker_is_other() {
        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 'Failed to bind to port'; exit 1".to_string()],
            working_dir: std::env::temp_dir(),
            binary: None,
        };
        let mut process = ServerProcess::spawn(&spec).unwrap();

        let result = timeout(TEST_TIMEOUT, process.wait_ready()).await.unwrap();
        assert_eq!(result, Err(StartupFailure::Other));
    }

    /// An empty server archive counts as a corrupted installation
    #[tokio::test]
    async fn empty_binary_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("server.jar");
        std::fs::write(&binary, b"").unwrap();

        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 1".to_string()],
            working_dir: dir.path().to_path_buf(),
            binary: Some(binary),
        };
        let mut process = ServerProcess::spawn(&spec).unwrap();

        let result = timeout(TEST_TIMEOUT, process.wait_ready()).await.unwrap();
        assert_eq!(result, Err(StartupFailure::Corrupted));
    }
}

/// WATCHER TESTS
mod watcher_tests {
    use super::*;

    /// With players hidden, the console count drives the idle stop
    #[tokio::test]
    async fn idle_stop_through_console() {
        let mut process = ServerProcess::spawn(&fake_server(0)).unwrap();
        process.wait_ready().await.unwrap();
        let (_console_tx, mut console) = mpsc::channel(4);
        let config = watcher_config(unused_port().await, true, Duration::ZERO);

        let snapshot = timeout(TEST_TIMEOUT, watch_server(&process, &config, &mut console))
            .await
            .unwrap();
        assert!(snapshot.is_none());
        assert!(process.handle().has_exited());
    }

    /// A failed ping falls back to the console for that poll
    #[tokio::test]
    async fn ping_failure_falls_back_to_console() {
        let mut process = ServerProcess::spawn(&fake_server(0)).unwrap();
        process.wait_ready().await.unwrap();
        let (_console_tx, mut console) = mpsc::channel(4);
        // Nothing listens on this port
        let config = watcher_config(unused_port().await, false, Duration::ZERO);

        let snapshot = timeout(TEST_TIMEOUT, watch_server(&process, &config, &mut console))
            .await
            .unwrap();
        assert!(snapshot.is_none());
        assert!(process.handle().has_exited());
    }

    /// A successful ping is cached and returned when the server closes
    #[tokio::test]
    async fn ping_status_is_cached() {
        let status = StatusSnapshot::placeholder("1.21.4", 769, "Answering pings", 12);
        let gateway = Gateway::bind(
            "127.0.0.1:0",
            GatewayContext::new(status, LoginPolicy::default()),
            8,
        )
        .await
        .unwrap();
        let port = gateway.local_addr().unwrap().port();
        let gateway_handle = gateway.handle();
        let (_gateway_console_tx, mut gateway_console) = mpsc::channel(1);
        let gateway_task = tokio::spawn(async move { gateway.run(&mut gateway_console).await });

        let mut process = ServerProcess::spawn(&fake_server(0)).unwrap();
        process.wait_ready().await.unwrap();
        let (_console_tx, mut console) = mpsc::channel(4);
        let config = watcher_config(port, false, Duration::ZERO);

        let snapshot = timeout(TEST_TIMEOUT, watch_server(&process, &config, &mut console))
            .await
            .unwrap()
            .expect("ping response should be cached");
        assert_eq!(snapshot.description.text(), "Answering pings");
        assert_eq!(snapshot.players.max, 12);
        assert!(!snapshot.raw.is_empty());

        gateway_handle.close();
        assert_eq!(gateway_task.await.unwrap(), GatewayExit::Shutdown);
    }

    /// Online players keep the server running past the grace period
    #[tokio::test]
    async fn players_online_prevent_stop() {
        let mut process = ServerProcess::spawn(&fake_server(2)).unwrap();
        process.wait_ready().await.unwrap();
        let handle = process.handle();
        let (_console_tx, mut console) = mpsc::channel(4);
        let config = watcher_config(unused_port().await, true, Duration::from_millis(300));

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(1200)).await;
            let still_running = !handle.has_exited();
            handle.stop();
            still_running
        });

        timeout(TEST_TIMEOUT, watch_server(&process, &config, &mut console))
            .await
            .unwrap();
        assert!(stopper.await.unwrap());
    }

    /// Operator input is passed through to the server console
    #[tokio::test]
    async fn console_lines_are_forwarded() {
        let mut process = ServerProcess::spawn(&fake_server(1)).unwrap();
        process.wait_ready().await.unwrap();
        let mut output = process.subscribe();
        let handle = process.handle();
        let (console_tx, mut console) = mpsc::channel(4);
        let config = watcher_config(unused_port().await, true, Duration::from_secs(600));

        let checker = tokio::spawn(async move {
            console_tx.send("say hello".to_string()).await.unwrap();
            let deadline = Instant::now() + TEST_TIMEOUT;
            let mut seen = false;
            while Instant::now() < deadline {
                match timeout(Duration::from_secs(1), output.recv()).await {
                    Ok(Ok(line)) if line.contains("Console: say hello") => {
                        seen = true;
                        break;
                    }
                    Ok(Ok(_)) | Err(_) => continue,
                    Ok(Err(_)) => break,
                }
            }
            handle.stop();
            seen
        });

        timeout(TEST_TIMEOUT, watch_server(&process, &config, &mut console))
            .await
            .unwrap();
        assert!(checker.await.unwrap());
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Writes an executable stand-in for `java` that logs every start and
    /// refuses a jar containing `corrupt`
    async fn install_fake_java(root: &Path) -> std::path::PathBuf {
        let starts = root.join("starts.log");
        let java = root.join("fake-java");
        let script = format!(
            "echo started >> '{}'\n\
             if grep -q corrupt server.jar; then echo 'Error: Invalid or corrupt jarfile server.jar'; exit 1; fi\n{}",
            starts.display(),
            FAKE_SERVER
        );
        write_script(&java, &script);
        // Let concurrently forked children drop the inherited write handle
        sleep(Duration::from_millis(200)).await;
        java
    }

    fn install_count(root: &Path) -> usize {
        std::fs::read_to_string(root.join("installs.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    fn start_count(root: &Path) -> usize {
        std::fs::read_to_string(root.join("starts.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    async fn wait_for_placeholder(port: u16) -> StatusSnapshot {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            if let Ok(status) = ping_server_with("127.0.0.1", port, &fast_ping()).await {
                return status;
            }
            assert!(Instant::now() < deadline, "placeholder never came up");
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Start, idle stop, placeholder, manual start, shutdown
    #[tokio::test]
    async fn sleeps_and_wakes_again() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = Paths::new(root);
        paths.create_directories().unwrap();

        let java = install_fake_java(root).await;
        std::fs::write(paths.minecraft.join("server.jar"), b"PK\x03\x04").unwrap();
        Installation::new(paths.clone())
            .record("1.21.4", 100, "server.jar")
            .unwrap();

        let port = unused_port().await;
        std::fs::write(
            paths.server_properties(),
            format!(
                "server-ip=127.0.0.1\nserver-port={}\nmotd=Sleeping test server\nmax-players=5\nonline-mode=false\n",
                port
            ),
        )
        .unwrap();

        let settings = Settings::parse_from([
            "server",
            "--root",
            root.to_str().unwrap(),
            "--java",
            java.to_str().unwrap(),
            "--grace",
            "0",
        ]);
        let orchestrator = Orchestrator::new();
        let mut lifecycle = Lifecycle::new(settings, orchestrator.clone());
        lifecycle.poll_interval = Duration::from_millis(100);

        let (console_tx, mut console) = mpsc::channel(8);
        let run = tokio::spawn(async move { lifecycle.run(&mut console).await });

        // Nothing answered a ping, so the configured motd is served
        let status = wait_for_placeholder(port).await;
        assert_eq!(status.description.text(), "Sleeping test server");
        assert_eq!(status.players.max, 5);
        assert_eq!(status.players.online, 0);
        assert_eq!(status.version.name, "1.21.4");
        assert_eq!(start_count(root), 1);

        console_tx.send("start".to_string()).await.unwrap();
        let deadline = Instant::now() + TEST_TIMEOUT;
        while start_count(root) < 2 {
            assert!(Instant::now() < deadline, "server was not started again");
            sleep(Duration::from_millis(50)).await;
        }

        orchestrator.request_shutdown();
        let result = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    /// A corrupt jar is cleared, reinstalled and started again
    #[tokio::test]
    async fn corrupted_installation_is_reinstalled() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = Paths::new(root);
        paths.create_directories().unwrap();

        std::fs::write(paths.minecraft.join("server.jar"), b"corrupt").unwrap();
        Installation::new(paths.clone())
            .record("1.21.4", 100, "server.jar")
            .unwrap();

        let installer = root.join("install.sh");
        write_script(
            &installer,
            r#"echo installed >> installs.log
printf PK > "$SERVER_DIR/server.jar"
printf "$VERSION" > "$DATA_DIR/.version"
printf 101 > "$DATA_DIR/.build"
printf server.jar > "$DATA_DIR/.binaries"
"#,
        );
        let java = install_fake_java(root).await;

        let port = unused_port().await;
        std::fs::write(
            paths.server_properties(),
            format!("server-ip=127.0.0.1\nserver-port={}\nonline-mode=false\n", port),
        )
        .unwrap();

        let settings = Settings::parse_from([
            "server",
            "--root",
            root.to_str().unwrap(),
            "--java",
            java.to_str().unwrap(),
            "--installer",
            installer.to_str().unwrap(),
            "--version",
            "1.21.4",
            "--grace",
            "0",
        ]);
        let orchestrator = Orchestrator::new();
        let mut lifecycle = Lifecycle::new(settings, orchestrator.clone());
        lifecycle.poll_interval = Duration::from_millis(100);

        let (_console_tx, mut console) = mpsc::channel(8);
        let run = tokio::spawn(async move { lifecycle.run(&mut console).await });

        // The reinstalled server went idle and handed over to the placeholder
        wait_for_placeholder(port).await;
        assert_eq!(start_count(root), 2);
        assert_eq!(install_count(root), 1);
        assert_eq!(
            Installation::new(paths.clone()).get_installed_build(),
            Some(101)
        );

        orchestrator.request_shutdown();
        let result = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    /// Without an installation the lifecycle fails instead of looping
    #[tokio::test]
    async fn missing_installation_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        Paths::new(dir.path()).create_directories().unwrap();

        let settings = Settings::parse_from(["server", "--root", dir.path().to_str().unwrap()]);
        let lifecycle = Lifecycle::new(settings, Orchestrator::new());
        let (_console_tx, mut console) = mpsc::channel(1);

        let result = timeout(TEST_TIMEOUT, lifecycle.run(&mut console))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(server::OrchestratorError::Install(_))
        ));
    }
}

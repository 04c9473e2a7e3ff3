//! Lifecycle loop tying the pieces together.
//!
//! ```text
//! ensure installed -> spawn server -> wait for "Done" -> watch until idle stop
//!        ^                                                        |
//!        +------ player joins / "start" <- placeholder gateway <--+
//! ```
//!
//! The current phase lives in an [`Orchestrator`] shared with the signal
//! task, so a termination signal can stop whichever server is active.

use crate::config::{AccessLists, ConfigError, ServerProperties, Settings};
use crate::gateway::{Gateway, GatewayExit, GatewayHandle, DEFAULT_MAX_SESSIONS};
use crate::install::{InstallCommand, InstallError, InstalledServer, Installation, Paths};
use crate::process::{LaunchSpec, ServerHandle, ServerProcess, StartupFailure};
use crate::session::{GatewayContext, LoginPolicy};
use crate::watcher::{watch_server, WatcherConfig, POLL_INTERVAL};
use log::{error, info, warn};
use shared::{StatusSnapshot, PROTOCOL_VERSION};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors that end the program
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start the server process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to clear installation markers: {0}")]
    ClearMarkers(#[source] io::Error),

    #[error("{0}")]
    Startup(#[from] StartupFailure),

    #[error("failed to bind the placeholder on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// What is currently occupying the game port
#[derive(Debug)]
pub enum Mode {
    Idle,
    RunningServer(ServerHandle),
    RunningGateway(GatewayHandle),
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::RunningServer(_) => "server",
            Mode::RunningGateway(_) => "gateway",
        }
    }
}

struct Inner {
    mode: Mutex<Mode>,
    shutting_down: AtomicBool,
}

/// Shared view of the current mode, cloned into the signal task
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                mode: Mutex::new(Mode::Idle),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    fn mode(&self) -> MutexGuard<'_, Mode> {
        self.inner
            .mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switches mode. A shutdown requested earlier applies to the new mode
    /// right away.
    pub fn set_mode(&self, mode: Mode) {
        let mut current = self.mode();
        *current = mode;
        if self.is_shutting_down() {
            apply_shutdown(&current);
        }
    }

    pub fn mode_name(&self) -> &'static str {
        self.mode().name()
    }

    /// Stops the active server or closes the active gateway.
    pub fn request_shutdown(&self) {
        let current = self.mode();
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        apply_shutdown(&current);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

fn apply_shutdown(mode: &Mode) {
    match mode {
        Mode::Idle => {}
        Mode::RunningServer(handle) => {
            info!("Stopping the server");
            if !handle.stop() {
                warn!("Server console already closed");
            }
        }
        Mode::RunningGateway(handle) => {
            info!("Closing the placeholder");
            handle.close();
        }
    }
}

/// Waits for Ctrl+C or SIGTERM and requests a graceful shutdown. A second
/// signal exits immediately.
pub async fn listen_for_signals(orchestrator: Orchestrator) {
    if wait_for_signal().await.is_err() {
        return;
    }
    info!("Shutdown requested ({} active)", orchestrator.mode_name());
    orchestrator.request_shutdown();

    if wait_for_signal().await.is_ok() {
        warn!("Second signal received, exiting now");
        std::process::exit(1);
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Forwards operator input lines from stdin.
pub fn spawn_console_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    });

    rx
}

/// The install / run / watch / sleep loop
pub struct Lifecycle {
    settings: Settings,
    paths: Paths,
    installation: Installation,
    installer: Option<InstallCommand>,
    orchestrator: Orchestrator,
    pub poll_interval: Duration,
    pub max_sessions: usize,
}

impl Lifecycle {
    pub fn new(settings: Settings, orchestrator: Orchestrator) -> Self {
        let paths = Paths::new(&settings.root);
        Self {
            installation: Installation::new(paths.clone()),
            installer: settings.installer.clone().map(InstallCommand::new),
            paths,
            settings,
            orchestrator,
            poll_interval: POLL_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Runs until shutdown. Returns an error only for failures nothing can
    /// recover from.
    pub async fn run(&self, console: &mut mpsc::Receiver<String>) -> Result<(), OrchestratorError> {
        loop {
            if self.orchestrator.is_shutting_down() {
                return Ok(());
            }

            let installed = self
                .installation
                .install_if_missing(
                    self.installer.as_ref(),
                    &self.settings.version,
                    &self.settings.channel,
                )
                .await?;
            let properties = ServerProperties::load(&self.paths.server_properties())?;

            let launch = LaunchSpec::java(
                &self.settings.java,
                &self.settings.xms,
                &self.settings.xmx,
                &installed.binary,
                &self.paths.minecraft,
            );
            let mut process = ServerProcess::spawn(&launch).map_err(OrchestratorError::Spawn)?;
            self.orchestrator
                .set_mode(Mode::RunningServer(process.handle()));

            match wait_until_ready(&mut process, console).await {
                Ok(()) => {}
                Err(_) if self.orchestrator.is_shutting_down() => {
                    self.orchestrator.set_mode(Mode::Idle);
                    return Ok(());
                }
                Err(StartupFailure::Corrupted) => {
                    self.orchestrator.set_mode(Mode::Idle);
                    warn!("Server installation looks corrupted, clearing it and retrying");
                    self.installation
                        .clear_installation_markers()
                        .map_err(OrchestratorError::ClearMarkers)?;
                    continue;
                }
                Err(failure) => {
                    self.orchestrator.set_mode(Mode::Idle);
                    error!("Server failed to start");
                    return Err(failure.into());
                }
            }

            let mut watcher = WatcherConfig::new(
                properties.ping_host(),
                properties.server_port,
                properties.hide_online_players,
                self.settings.grace_period(),
            );
            watcher.poll_interval = self.poll_interval;

            let snapshot = watch_server(&process, &watcher, console).await;
            self.orchestrator.set_mode(Mode::Idle);
            drop(process);

            if self.orchestrator.is_shutting_down() {
                return Ok(());
            }

            let exit = self.sleep(&installed, snapshot, console).await?;
            if !exit.wakes_server() {
                return Ok(());
            }
        }
    }

    /// Runs the placeholder until something wakes the server.
    async fn sleep(
        &self,
        installed: &InstalledServer,
        snapshot: Option<StatusSnapshot>,
        console: &mut mpsc::Receiver<String>,
    ) -> Result<GatewayExit, OrchestratorError> {
        // The server may have rewritten these while it ran
        let properties = ServerProperties::load(&self.paths.server_properties())?;
        let access = AccessLists::load(&self.paths.minecraft)?;

        let status = snapshot.unwrap_or_else(|| {
            info!("No status captured, answering with the configured motd");
            StatusSnapshot::placeholder(
                &installed.version,
                PROTOCOL_VERSION,
                &properties.motd,
                properties.max_players,
            )
        });

        let context = GatewayContext {
            status,
            status_enabled: properties.enable_status,
            policy: LoginPolicy {
                online_mode: properties.online_mode,
                whitelist_enforced: properties.white_list,
                access,
            },
        };

        let gateway = bind_gateway(&properties.bind_address(), context, self.max_sessions).await?;
        self.orchestrator
            .set_mode(Mode::RunningGateway(gateway.handle()));

        let exit = gateway.run(console).await;
        self.orchestrator.set_mode(Mode::Idle);
        Ok(exit)
    }
}

/// Waits for readiness while passing operator input through to the server.
async fn wait_until_ready(
    process: &mut ServerProcess,
    console: &mut mpsc::Receiver<String>,
) -> Result<(), StartupFailure> {
    let handle = process.handle();
    let mut console_open = true;

    loop {
        tokio::select! {
            result = process.wait_ready() => return result,
            line = console.recv(), if console_open => match line {
                Some(line) => {
                    handle.send_command(&line);
                }
                None => console_open = false,
            },
        }
    }
}

/// The real server can hold the port for a moment after exiting.
async fn bind_gateway(
    addr: &str,
    context: GatewayContext,
    max_sessions: usize,
) -> Result<Gateway, OrchestratorError> {
    let mut attempt = 1;
    loop {
        match Gateway::bind(addr, context.clone(), max_sessions).await {
            Ok(gateway) => return Ok(gateway),
            Err(e) if attempt < BIND_ATTEMPTS => {
                warn!(
                    "Failed to bind {} (attempt {}/{}): {}",
                    addr, attempt, BIND_ATTEMPTS, e
                );
                tokio::time::sleep(BIND_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(OrchestratorError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
}

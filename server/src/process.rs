//! Handle to the spawned real-server process.
//!
//! Output lines from stdout and stderr are echoed to the operator and
//! published on a broadcast channel; console commands go through a channel
//! to a writer task that owns the child's stdin. Process exit is published
//! on a watch channel only after both output readers hit EOF, so every line
//! the server printed is visible before the exit is.

use log::{error, info, warn};
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

/// Line the server prints once it accepts players
const READY_PATTERN: &str = r#"\]: Done \([^)]+\)! For help, type "help""#;

/// Output that means the server binary itself is unusable
const CORRUPTION_MARKERS: [&str; 4] = [
    "Invalid or corrupt jarfile",
    "Unable to access jarfile",
    "java.util.zip.ZipException",
    "Error opening zip file",
];

const OUTPUT_BUFFER: usize = 1024;

/// Why the server closed before printing its readiness line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartupFailure {
    /// The installation is damaged; reinstalling may fix it
    #[error("server installation is corrupted")]
    Corrupted,
    #[error("server closed before it finished starting")]
    Other,
}

fn ready_regex() -> &'static Regex {
    static READY: OnceLock<Regex> = OnceLock::new();
    READY.get_or_init(|| Regex::new(READY_PATTERN).expect("readiness pattern is valid"))
}

pub fn is_ready_line(line: &str) -> bool {
    ready_regex().is_match(line)
}

pub fn is_corruption_line(line: &str) -> bool {
    CORRUPTION_MARKERS.iter().any(|marker| line.contains(marker))
}

/// How to start the server
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Server archive checked for corruption when startup fails
    pub binary: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn java(java: &str, xms: &str, xmx: &str, binary: &Path, working_dir: &Path) -> Self {
        Self {
            program: java.to_string(),
            args: vec![
                format!("-Xmx{}", xmx),
                format!("-Xms{}", xms),
                "-jar".to_string(),
                binary.display().to_string(),
                "nogui".to_string(),
            ],
            working_dir: working_dir.to_path_buf(),
            binary: Some(binary.to_path_buf()),
        }
    }
}

/// Clonable control surface of a running server: send console commands,
/// observe exit.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<String>,
    exited: watch::Receiver<bool>,
}

impl ServerHandle {
    /// Queues a console command. Returns false once the process has exited.
    pub fn send_command(&self, command: &str) -> bool {
        if self.has_exited() {
            return false;
        }
        self.commands.send(command.to_string()).is_ok()
    }

    /// Asks the server to shut down gracefully.
    pub fn stop(&self) -> bool {
        self.send_command("stop")
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the process has exited.
    pub async fn closed(&self) {
        wait_for_exit(&mut self.exited.clone()).await;
    }
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>) {
    while !*exited.borrow_and_update() {
        if exited.changed().await.is_err() {
            return;
        }
    }
}

/// A spawned server process, owned by whichever phase is driving it.
pub struct ServerProcess {
    handle: ServerHandle,
    lines: broadcast::Sender<String>,
    startup_output: broadcast::Receiver<String>,
    binary: Option<PathBuf>,
    ready: bool,
    corruption_seen: bool,
}

impl ServerProcess {
    pub fn spawn(spec: &LaunchSpec) -> io::Result<Self> {
        info!("Starting server: {} {}", spec.program, spec.args.join(" "));

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let (lines, startup_output) = broadcast::channel(OUTPUT_BUFFER);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = watch::channel(false);

        let stdout_task = tokio::spawn(forward_output(stdout, lines.clone(), false));
        let stderr_task = tokio::spawn(forward_output(stderr, lines.clone(), true));
        tokio::spawn(write_commands(stdin, command_rx));

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Server process exited ({})", status),
                Err(e) => error!("Failed to wait for server process: {}", e),
            }
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = exit_tx.send(true);
        });

        Ok(Self {
            handle: ServerHandle { commands, exited },
            lines,
            startup_output,
            binary: spec.binary.clone(),
            ready: false,
            corruption_seen: false,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Receives output lines printed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    /// Waits for the readiness line. Sees every line since spawn and is
    /// cancel-safe, so it can sit in a `select!` next to other work.
    pub async fn wait_ready(&mut self) -> Result<(), StartupFailure> {
        if self.ready {
            return Ok(());
        }
        let mut exited = self.handle.exited.clone();

        loop {
            tokio::select! {
                biased;

                line = self.startup_output.recv() => match line {
                    Ok(line) => {
                        if is_corruption_line(&line) {
                            self.corruption_seen = true;
                        }
                        if is_ready_line(&line) {
                            self.ready = true;
                            info!("Server is ready");
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} server output lines while starting", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = wait_for_exit(&mut exited) => break,
            }
        }

        if self.corruption_seen || binary_looks_corrupted(self.binary.as_deref()) {
            Err(StartupFailure::Corrupted)
        } else {
            Err(StartupFailure::Other)
        }
    }

    pub async fn closed(&self) {
        self.handle.closed().await;
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("server {} was not captured", name))
}

fn binary_looks_corrupted(binary: Option<&Path>) -> bool {
    match binary {
        Some(path) => match std::fs::metadata(path) {
            Ok(metadata) => metadata.len() == 0,
            Err(_) => true,
        },
        None => false,
    }
}

/// Echoes each line to the operator and publishes it.
async fn forward_output<R>(reader: R, lines: broadcast::Sender<String>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if is_stderr {
                    eprintln!("{}", line);
                } else {
                    println!("{}", line);
                }
                // No subscribers is fine
                let _ = lines.send(line);
            }
            Err(e) => {
                warn!("Failed to read server output: {}", e);
                break;
            }
        }
    }
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<String>) {
    while let Some(command) = commands.recv().await {
        let line = format!("{}\n", command.trim_end());
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!("Failed to write server command: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!("Failed to flush server command: {}", e);
            break;
        }
    }
}

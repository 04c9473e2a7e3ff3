//! Placeholder gateway: answers status probes and login attempts on the real
//! server's port while the real server is stopped.
//!
//! Each accepted connection runs in its own task owning a [`Session`]. The
//! gateway keeps those tasks in a `JoinSet` and hands them a `watch` signal;
//! once any login wakes the server (or the operator types `start`, or a
//! shutdown is requested) the signal fires, every session is joined, and only
//! then is the listening socket released.

use crate::registry::SessionRegistry;
use crate::session::{GatewayContext, Session};
use log::{debug, error, info, warn};
use shared::ProtocolError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;

pub const DEFAULT_MAX_SESSIONS: usize = 256;

/// How long closing sessions get to finish before they are aborted
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closed connection is drained for the peer's FIN
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a connection may stay silent before it is dropped
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Why one connection ended early
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("nothing received for {0:?}")]
    TimedOut(Duration),
}

/// Why the gateway closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayExit {
    /// A login passed every check
    PlayerJoined { name: String, peer: SocketAddr },
    /// The operator typed `start`
    ManualStart,
    /// Closed through a [`GatewayHandle`]
    Shutdown,
}

impl GatewayExit {
    /// Whether the real server should be started next
    pub fn wakes_server(&self) -> bool {
        !matches!(self, GatewayExit::Shutdown)
    }
}

#[derive(Debug)]
enum GatewayCommand {
    Close,
}

/// Closes a running gateway from elsewhere
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewayHandle {
    pub fn close(&self) {
        // Already gone if the send fails
        let _ = self.commands.send(GatewayCommand::Close);
    }
}

#[derive(Debug)]
enum SessionEvent {
    Woke { name: String, peer: SocketAddr },
    Ended { id: u64 },
}

pub struct Gateway {
    listener: TcpListener,
    context: Arc<GatewayContext>,
    registry: SessionRegistry,
    read_timeout: Duration,
    commands_tx: mpsc::UnboundedSender<GatewayCommand>,
    commands_rx: mpsc::UnboundedReceiver<GatewayCommand>,
}

impl Gateway {
    pub async fn bind(
        addr: &str,
        context: GatewayContext,
        max_sessions: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Placeholder listening on {}", listener.local_addr()?);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            context: Arc::new(context),
            registry: SessionRegistry::new(max_sessions),
            read_timeout: READ_TIMEOUT,
            commands_tx,
            commands_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Overrides how long a silent connection keeps its slot.
    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Serves connections until a wake or shutdown, then closes every
    /// session and releases the port.
    pub async fn run(mut self, console: &mut mpsc::Receiver<String>) -> GatewayExit {
        let mut sessions = JoinSet::new();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let mut console_open = true;

        let exit = loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Some(id) = self.registry.add(peer) else {
                            warn!("Rejecting {}: too many open connections", peer);
                            continue;
                        };
                        sessions.spawn(run_connection(
                            id,
                            stream,
                            peer,
                            Arc::clone(&self.context),
                            self.read_timeout,
                            event_tx.clone(),
                            close_rx.clone(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },

                Some(event) = event_rx.recv() => match event {
                    SessionEvent::Woke { name, peer } => {
                        info!("{} woke the server from {}", name, peer);
                        break GatewayExit::PlayerJoined { name, peer };
                    }
                    SessionEvent::Ended { id } => {
                        self.registry.remove(id);
                    }
                },

                line = console.recv(), if console_open => match line {
                    Some(line) if line.trim() == "start" => {
                        info!("Manual start requested");
                        break GatewayExit::ManualStart;
                    }
                    Some(line) => debug!("Ignoring console input while asleep: {:?}", line),
                    None => console_open = false,
                },

                command = self.commands_rx.recv() => match command {
                    Some(GatewayCommand::Close) | None => break GatewayExit::Shutdown,
                },

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        };

        // Every session ends before the port is released
        let _ = close_tx.send(true);
        if timeout(CLOSE_TIMEOUT, drain(&mut sessions)).await.is_err() {
            warn!("Sessions did not close in time, aborting them");
            sessions.abort_all();
            drain(&mut sessions).await;
        }
        self.registry.clear();
        drop(self.listener);

        info!("Placeholder closed ({:?})", exit);
        exit
    }
}

async fn drain(sessions: &mut JoinSet<()>) {
    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!("Connection task failed: {}", e);
            }
        }
    }
}

async fn run_connection(
    id: u64,
    mut stream: TcpStream,
    peer: SocketAddr,
    context: Arc<GatewayContext>,
    read_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut closing: watch::Receiver<bool>,
) {
    let mut session = Session::new(peer);

    let served = serve(
        &mut session,
        &mut stream,
        &context,
        read_timeout,
        &mut closing,
    )
    .await;

    // Reported before lingering so the gateway closes at once
    if session.woke() {
        let name = session.player().unwrap_or_default().to_string();
        let _ = events.send(SessionEvent::Woke { name, peer });
    }
    if let Err(e) = served {
        debug!("{}: dropping connection: {}", peer, e);
    }
    close_gracefully(&mut stream).await;

    let _ = events.send(SessionEvent::Ended { id });
}

/// Reads and answers packets strictly one at a time.
async fn serve(
    session: &mut Session,
    stream: &mut TcpStream,
    context: &GatewayContext,
    read_timeout: Duration,
    closing: &mut watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let mut buffer = [0u8; 4096];

    loop {
        while let Some(packet) = session.next_packet() {
            let response = session.create_response(&packet, context)?;
            if let Some(reply) = response.reply {
                stream.write_all(&reply).await?;
                stream.flush().await?;
            }
            if response.close {
                return Ok(());
            }
        }

        if *closing.borrow() {
            return Ok(());
        }

        tokio::select! {
            read = timeout(read_timeout, stream.read(&mut buffer)) => {
                let n = read.map_err(|_| ConnectionError::TimedOut(read_timeout))??;
                if n == 0 {
                    return Ok(());
                }
                session.receive(&buffer[..n])?;
            }
            _ = closing.changed() => return Ok(()),
        }
    }
}

/// Sends FIN and waits briefly for the peer to close its side.
async fn close_gracefully(stream: &mut TcpStream) {
    if stream.shutdown().await.is_err() {
        return;
    }
    let mut buffer = [0u8; 512];
    let _ = timeout(LINGER_TIMEOUT, async {
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
}

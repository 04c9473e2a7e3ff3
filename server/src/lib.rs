//! # Dormant Server Library
//!
//! Keeps a game server asleep while nobody is playing. While the real server
//! runs, an idle watcher polls its player count and stops it once it has been
//! empty for the grace period. While it is stopped, a lightweight placeholder
//! occupies the same port, answers status probes with the last status the
//! real server reported, and starts the real server again the moment an
//! allowed player tries to join.
//!
//! ## Core Responsibilities
//!
//! ### Lifecycle
//! An endless loop: make sure a server build is installed, spawn it, wait for
//! its readiness line, watch it until it goes idle, then run the placeholder
//! until someone wakes it. A corrupted installation is cleared and retried;
//! any other startup failure is fatal.
//!
//! ### Placeholder Gateway
//! Accepts connections on the real server's address, answers status and
//! ping requests, and judges login attempts against the whitelist, the
//! operator list and the player and IP ban lists. A login that passes closes
//! every open connection and the listening socket so the real server can
//! bind the port again.
//!
//! ### Idle Watching
//! Every poll interval the watcher pings the running server, or asks its
//! console with `list` when online players are hidden or the ping fails.
//! Zero-player status responses are cached for the placeholder to replay.
//!
//! ## Architecture Design
//!
//! ### Task per Connection
//! Each placeholder connection is served by its own task owning its session
//! state. Packets of one connection are answered strictly in arrival order;
//! different connections never share mutable state.
//!
//! ### Explicit Mode
//! The [`orchestrator::Orchestrator`] records whether the real server, the
//! placeholder or nothing is active. Termination signals consult it to stop
//! the real server gracefully or close the placeholder.
//!
//! ## Module Organization
//!
//! ### Configuration Module (`config`)
//! Command-line and environment settings, `server.properties`, and the JSON
//! access lists.
//!
//! ### Install Module (`install`)
//! Directory layout, installation markers, and the EULA file.
//!
//! ### Process Module (`process`)
//! Spawning the real server, streaming its output, console commands, and
//! readiness and corruption detection.
//!
//! ### Watcher Module (`watcher`)
//! Player-count polling, status caching, and the idle stop.
//!
//! ### Session and Registry Modules (`session`, `registry`)
//! The per-connection protocol state machine with its login policy, and the
//! bookkeeping of open connections.
//!
//! ### Gateway Module (`gateway`)
//! The placeholder listener and its connection tasks.
//!
//! ### Orchestrator Module (`orchestrator`)
//! Mode tracking, signal handling, console input, and the lifecycle loop.

pub mod config;
pub mod gateway;
pub mod install;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod session;
pub mod watcher;

pub use config::{ConfigError, ServerProperties, Settings};
pub use gateway::{Gateway, GatewayExit, GatewayHandle};
pub use orchestrator::{Lifecycle, Mode, Orchestrator, OrchestratorError};
pub use process::{LaunchSpec, ServerHandle, ServerProcess, StartupFailure};
pub use session::{GatewayContext, LoginPolicy, Session};

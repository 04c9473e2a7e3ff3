//! # Status Client Library
//!
//! A minimal protocol client that asks a listening server (real or
//! placeholder) for its status. The idle watcher uses it to poll the real
//! server's player count and to capture the status snapshot the placeholder
//! replays later.
//!
//! ## How a Ping Works
//!
//! 1. Connect to `host:port`.
//! 2. Send a handshake selecting the status state, then an empty status
//!    request, in one write.
//! 3. Read until the server goes quiet for the settle period. Some servers
//!    flush the response over several TCP segments, so the declared length
//!    alone is not trusted to mark the end of the burst.
//! 4. Decode the status response frame and attach its raw bytes.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let status = client::ping_server("127.0.0.1", 25565).await?;
//!     println!(
//!         "{} / {} players online",
//!         status.players.online, status.players.max
//!     );
//!     Ok(())
//! }
//! ```

pub mod ping;

pub use ping::{ping_server, ping_server_with, PingError, PingOptions};

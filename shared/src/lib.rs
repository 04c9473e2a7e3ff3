//! # Protocol Library
//!
//! Shared wire protocol for the sleeping-server gateway: the pieces both the
//! placeholder server and the status ping client need.
//!
//! ## Module Organization
//!
//! ### Codec (`codec`)
//! Varints, length-prefixed strings, packet framing, and the handshake,
//! status, ping and login packet bodies.
//!
//! ### Frame Reassembler (`frame`)
//! Turns an arbitrarily chunked TCP byte stream into whole packets.
//!
//! ### Status (`status`)
//! The JSON status document and the cached snapshot replayed while the real
//! server sleeps.
//!
//! ### Identity (`identity`)
//! Offline-mode player UUID derivation.

pub mod codec;
pub mod error;
pub mod frame;
pub mod identity;
pub mod status;

pub use codec::{Handshake, LoginStart, Packet, PacketHeader, ProtocolState, PROTOCOL_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::FrameReassembler;
pub use identity::offline_uuid;
pub use status::{Description, PlayerSample, StatusPlayers, StatusSnapshot, StatusVersion};

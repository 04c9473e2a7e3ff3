//! Per-connection protocol state machine for the placeholder.
//!
//! A [`Session`] owns everything one connection needs: its protocol state,
//! the reassembler holding a partial frame, and the queue of complete
//! packets that have not been answered yet. The connection task feeds it
//! bytes with [`Session::receive`] and answers packets one at a time, so a
//! second packet is never handled before the reply to the first is written.
//!
//! Login attempts are judged by a [`LoginPolicy`]: whitelist first, then
//! player bans, then IP bans. A login that passes every check marks the
//! session as having woken the server.

use crate::config::AccessLists;
use chrono::{DateTime, Utc};
use log::{debug, info};
use shared::codec::{
    parse_handshake, parse_login_start, serialize_login_disconnect, serialize_pong_response,
    HANDSHAKE_ID, LOGIN_START_ID, PING_ID, STATUS_REQUEST_ID,
};
use shared::{
    offline_uuid, FrameReassembler, LoginStart, Packet, ProtocolError, ProtocolResult,
    ProtocolState, StatusSnapshot,
};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

pub const NOT_WHITELISTED_MESSAGE: &str = "You are not whitelisted on this server!";
pub const WAKE_MESSAGE: &str =
    "The server will start shortly. Please join again in a few seconds.";

/// Outcome of a login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginVerdict {
    NotWhitelisted,
    Banned { reason: String },
    IpBanned { reason: String },
    /// Allowed in; the real server should start
    Wake,
}

impl LoginVerdict {
    /// Text of the disconnect sent back to the player
    pub fn message(&self) -> String {
        match self {
            LoginVerdict::NotWhitelisted => NOT_WHITELISTED_MESSAGE.to_string(),
            LoginVerdict::Banned { reason } => {
                format!("You are banned from this server.\nReason: {}", reason)
            }
            LoginVerdict::IpBanned { reason } => {
                format!("Your IP address is banned from this server.\nReason: {}", reason)
            }
            LoginVerdict::Wake => WAKE_MESSAGE.to_string(),
        }
    }
}

/// Who may wake the server
#[derive(Debug, Clone, Default)]
pub struct LoginPolicy {
    pub online_mode: bool,
    pub whitelist_enforced: bool,
    pub access: AccessLists,
}

impl LoginPolicy {
    /// The identity the real server will give this player: the client's own
    /// UUID in online mode, otherwise the name-derived offline UUID.
    pub fn effective_uuid(&self, login: &LoginStart) -> Uuid {
        match (self.online_mode, login.uuid) {
            (true, Some(uuid)) => uuid,
            _ => offline_uuid(&login.name),
        }
    }

    pub fn evaluate(&self, uuid: &Uuid, peer_ip: IpAddr, now: DateTime<Utc>) -> LoginVerdict {
        if self.whitelist_enforced && !self.access.is_whitelisted(uuid) {
            return LoginVerdict::NotWhitelisted;
        }
        if let Some(ban) = self.access.active_player_ban(uuid, now) {
            return LoginVerdict::Banned {
                reason: ban.reason.clone(),
            };
        }
        if let Some(ban) = self.access.active_ip_ban(peer_ip, now) {
            return LoginVerdict::IpBanned {
                reason: ban.reason.clone(),
            };
        }
        LoginVerdict::Wake
    }
}

/// Read-only state shared by every session of one gateway run
#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub status: StatusSnapshot,
    pub status_enabled: bool,
    pub policy: LoginPolicy,
}

impl GatewayContext {
    pub fn new(status: StatusSnapshot, policy: LoginPolicy) -> Self {
        Self {
            status,
            status_enabled: true,
            policy,
        }
    }
}

/// What to do after handling one packet
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// Bytes to write before anything else happens
    pub reply: Option<Vec<u8>>,
    /// Close the connection once the reply is flushed
    pub close: bool,
}

impl Response {
    fn none() -> Self {
        Self::default()
    }

    fn reply(bytes: Vec<u8>) -> Self {
        Self {
            reply: Some(bytes),
            close: false,
        }
    }

    fn reply_and_close(bytes: Vec<u8>) -> Self {
        Self {
            reply: Some(bytes),
            close: true,
        }
    }

    fn close() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    state: ProtocolState,
    reassembler: FrameReassembler,
    queue: VecDeque<Packet>,
    woke: bool,
    peer: SocketAddr,
    player: Option<String>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            state: ProtocolState::Handshake,
            reassembler: FrameReassembler::new(),
            queue: VecDeque::new(),
            woke: false,
            peer,
            player: None,
        }
    }

    /// Buffers a chunk of bytes, queueing every packet it completes.
    pub fn receive(&mut self, chunk: &[u8]) -> ProtocolResult<usize> {
        let packets = self.reassembler.push(chunk)?;
        let count = packets.len();
        self.queue.extend(packets);
        Ok(count)
    }

    /// Next packet waiting to be answered, in arrival order
    pub fn next_packet(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Whether a login on this session asked for the real server
    pub fn woke(&self) -> bool {
        self.woke
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Name from the login that woke the server
    pub fn player(&self) -> Option<&str> {
        self.player.as_deref()
    }

    /// Handles one packet in the current state.
    pub fn create_response(
        &mut self,
        packet: &Packet,
        context: &GatewayContext,
    ) -> ProtocolResult<Response> {
        match self.state {
            ProtocolState::Handshake => self.handle_handshake(packet),
            ProtocolState::Status => Ok(self.handle_status(packet, context)),
            ProtocolState::Login => self.handle_login(packet, context),
            ProtocolState::Transfer => {
                debug!(
                    "{}: ignoring packet 0x{:02X} in transfer state",
                    self.peer, packet.id
                );
                Ok(Response::none())
            }
        }
    }

    fn handle_handshake(&mut self, packet: &Packet) -> ProtocolResult<Response> {
        if packet.id != HANDSHAKE_ID {
            return Err(ProtocolError::UnexpectedPacket {
                id: packet.id,
                state: self.state.name(),
            });
        }
        let handshake = parse_handshake(&packet.payload)?;
        debug!(
            "{}: handshake for {}:{} (protocol {}, next state {})",
            self.peer,
            handshake.server_address,
            handshake.server_port,
            handshake.protocol_version,
            handshake.next_state.name()
        );
        if handshake.next_state == ProtocolState::Transfer {
            info!("{}: transfer is not supported, ignoring", self.peer);
        }
        self.state = handshake.next_state;
        Ok(Response::none())
    }

    fn handle_status(&mut self, packet: &Packet, context: &GatewayContext) -> Response {
        match packet.id {
            STATUS_REQUEST_ID if !context.status_enabled => Response::close(),
            STATUS_REQUEST_ID => Response::reply(context.status.response_frame()),
            PING_ID => Response::reply(serialize_pong_response(&packet.payload)),
            other => {
                debug!("{}: ignoring status packet 0x{:02X}", self.peer, other);
                Response::none()
            }
        }
    }

    fn handle_login(
        &mut self,
        packet: &Packet,
        context: &GatewayContext,
    ) -> ProtocolResult<Response> {
        if packet.id != LOGIN_START_ID {
            debug!("{}: ignoring login packet 0x{:02X}", self.peer, packet.id);
            return Ok(Response::none());
        }

        let login = parse_login_start(&packet.payload)?;
        let uuid = context.policy.effective_uuid(&login);
        let verdict = context
            .policy
            .evaluate(&uuid, self.peer.ip(), Utc::now());

        match &verdict {
            LoginVerdict::Wake => {
                info!("{} ({}) wants to join from {}", login.name, uuid, self.peer);
                self.woke = true;
                self.player = Some(login.name);
            }
            rejected => info!(
                "Rejected {} ({}) from {}: {:?}",
                login.name, uuid, self.peer, rejected
            ),
        }

        Ok(Response::reply_and_close(serialize_login_disconnect(
            &verdict.message(),
        )))
    }
}

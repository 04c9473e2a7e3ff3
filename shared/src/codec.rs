//! Wire codec for the handshake, status and login phases.
//!
//! Every packet on the wire is `varint(len) || varint(id) || body`, where
//! `len` counts the serialized id plus the body. Strings are a varint byte
//! count followed by UTF-8 bytes. The handshake port is the only fixed-width
//! integer and is big-endian.

use crate::error::{ProtocolError, ProtocolResult};
use crate::status::StatusSnapshot;
use serde_json::json;
use uuid::Uuid;

/// Longest encoding of a 32-bit varint.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest frame body a peer may declare (the 3-byte varint ceiling).
pub const MAX_PACKET_LEN: usize = 2_097_151;

/// Protocol number sent by our own outgoing handshakes.
pub const PROTOCOL_VERSION: i32 = 769;

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const PONG_ID: i32 = 0x01;
pub const LOGIN_START_ID: i32 = 0x00;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;

/// Per-connection protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Handshake = 0,
    Status = 1,
    Login = 2,
    Transfer = 3,
}

impl ProtocolState {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolState::Handshake => "handshake",
            ProtocolState::Status => "status",
            ProtocolState::Login => "login",
            ProtocolState::Transfer => "transfer",
        }
    }

    /// Maps a handshake `nextState` field onto the state it selects.
    /// Only 1..=3 are legal; the handshake state can never be re-entered.
    pub fn from_next_state(value: i32) -> ProtocolResult<Self> {
        match value {
            1 => Ok(ProtocolState::Status),
            2 => Ok(ProtocolState::Login),
            3 => Ok(ProtocolState::Transfer),
            other => Err(ProtocolError::InvalidNextState(other)),
        }
    }
}

/// A logical message: id plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Serializes the packet with its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let id = encode_varint(self.id);
        let mut frame = Vec::with_capacity(MAX_VARINT_LEN + id.len() + self.payload.len());
        write_varint((id.len() + self.payload.len()) as i32, &mut frame);
        frame.extend_from_slice(&id);
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Decodes a single complete frame. Trailing bytes past the declared
    /// length are ignored.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        let header = parse_packet_header(frame)?;
        Ok(Packet::new(header.id, header.payload.to_vec()))
    }
}

/// Result of [`parse_packet_header`]: the declared length and the slices it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader<'a> {
    /// Bytes the length prefix says follow it (id + payload)
    pub declared_length: usize,
    /// Size of the length prefix itself
    pub prefix_length: usize,
    pub id: i32,
    pub payload: &'a [u8],
}

impl PacketHeader<'_> {
    /// Total bytes the frame occupies on the wire.
    pub fn frame_length(&self) -> usize {
        self.prefix_length + self.declared_length
    }
}

pub fn varint_len(value: i32) -> usize {
    let mut value = value as u32;
    let mut len = 1;
    while value & !0x7F != 0 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn write_varint(value: i32, out: &mut Vec<u8>) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            out.push(value as u8);
            return;
        }
        out.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn encode_varint(value: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_len(value));
    write_varint(value, &mut out);
    out
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes it occupied.
///
/// Running out of input yields `TruncatedPacket` so stream readers can wait
/// for more data; a sixth continuation byte is `MalformedVarint`.
pub fn decode_varint(buf: &[u8]) -> ProtocolResult<(i32, usize)> {
    let mut result: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(ProtocolError::MalformedVarint(MAX_VARINT_LEN));
        }
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result as i32, i + 1));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::MalformedVarint(MAX_VARINT_LEN));
    }
    Err(ProtocolError::TruncatedPacket {
        needed: buf.len() + 1,
        available: buf.len(),
    })
}

pub fn write_length_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    write_varint(bytes.len() as i32, out);
    out.extend_from_slice(bytes);
}

/// Reads `varint(len) || bytes`, returning the bytes and the total consumed.
pub fn read_length_prefixed(buf: &[u8]) -> ProtocolResult<(&[u8], usize)> {
    let (len, offset) = decode_varint(buf)?;
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let end = offset + len as usize;
    if buf.len() < end {
        return Err(ProtocolError::TruncatedPacket {
            needed: end,
            available: buf.len(),
        });
    }
    Ok((&buf[offset..end], end))
}

pub fn write_string(value: &str, out: &mut Vec<u8>) {
    write_length_prefixed(value.as_bytes(), out);
}

pub fn read_string(buf: &[u8]) -> ProtocolResult<(String, usize)> {
    let (bytes, consumed) = read_length_prefixed(buf)?;
    Ok((String::from_utf8(bytes.to_vec())?, consumed))
}

/// Splits a frame into its declared length, id and payload. The payload is
/// bounded to `declared_length - size(id)`; anything after the frame is
/// left alone.
pub fn parse_packet_header(bytes: &[u8]) -> ProtocolResult<PacketHeader<'_>> {
    let (length, prefix_length) = decode_varint(bytes)?;
    if length <= 0 {
        return Err(ProtocolError::InvalidLength(length));
    }
    let declared_length = length as usize;
    if declared_length > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge(declared_length));
    }

    let end = prefix_length + declared_length;
    if bytes.len() < end {
        return Err(ProtocolError::TruncatedPacket {
            needed: end,
            available: bytes.len(),
        });
    }

    let body = &bytes[prefix_length..end];
    let (id, id_length) = match decode_varint(body) {
        Ok(decoded) => decoded,
        Err(ProtocolError::TruncatedPacket { .. }) => {
            return Err(ProtocolError::InvalidLength(length))
        }
        Err(e) => return Err(e),
    };

    Ok(PacketHeader {
        declared_length,
        prefix_length,
        id,
        payload: &body[id_length..],
    })
}

/// Decoded handshake packet body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: ProtocolState,
}

pub fn serialize_handshake(
    protocol_version: i32,
    address: &str,
    port: u16,
    next_state: ProtocolState,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(address.len() + 12);
    write_varint(protocol_version, &mut body);
    write_string(address, &mut body);
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(next_state as i32, &mut body);
    Packet::new(HANDSHAKE_ID, body).encode()
}

pub fn parse_handshake(payload: &[u8]) -> ProtocolResult<Handshake> {
    let (protocol_version, mut offset) = decode_varint(payload)?;
    let (server_address, consumed) = read_string(&payload[offset..])?;
    offset += consumed;

    if payload.len() < offset + 2 {
        return Err(ProtocolError::TruncatedPacket {
            needed: offset + 2,
            available: payload.len(),
        });
    }
    let server_port = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
    offset += 2;

    let (next_state, _) = decode_varint(&payload[offset..])?;

    Ok(Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state: ProtocolState::from_next_state(next_state)?,
    })
}

pub fn serialize_status_request() -> Vec<u8> {
    Packet::new(STATUS_REQUEST_ID, Vec::new()).encode()
}

/// Frames an already serialized status JSON document.
pub fn serialize_status_response(json: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(json.len() + MAX_VARINT_LEN);
    write_string(json, &mut body);
    Packet::new(STATUS_RESPONSE_ID, body).encode()
}

/// Parses a status response payload. `raw` is left empty; callers that
/// want to replay the response attach the frame themselves.
pub fn parse_status_response(payload: &[u8]) -> ProtocolResult<StatusSnapshot> {
    let (document, _) = read_string(payload)?;
    Ok(serde_json::from_str(&document)?)
}

pub fn serialize_ping_request(payload: &[u8]) -> Vec<u8> {
    Packet::new(PING_ID, payload.to_vec()).encode()
}

/// Echoes the ping payload verbatim under the pong id.
pub fn serialize_pong_response(ping_payload: &[u8]) -> Vec<u8> {
    Packet::new(PONG_ID, ping_payload.to_vec()).encode()
}

/// Decoded login-start packet body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
    /// Absent for clients older than the uuid-carrying login start
    pub uuid: Option<Uuid>,
}

pub fn serialize_login_start(name: &str, uuid: Uuid) -> Vec<u8> {
    let mut body = Vec::with_capacity(name.len() + 17);
    write_string(name, &mut body);
    body.extend_from_slice(uuid.as_bytes());
    Packet::new(LOGIN_START_ID, body).encode()
}

pub fn parse_login_start(payload: &[u8]) -> ProtocolResult<LoginStart> {
    let (name, offset) = read_string(payload)?;
    let uuid = payload
        .get(offset..offset + 16)
        .and_then(|bytes| Uuid::from_slice(bytes).ok());
    Ok(LoginStart { name, uuid })
}

pub fn serialize_login_disconnect(reason: &str) -> Vec<u8> {
    let document = json!({ "text": reason }).to_string();
    let mut body = Vec::with_capacity(document.len() + MAX_VARINT_LEN);
    write_string(&document, &mut body);
    Packet::new(LOGIN_DISCONNECT_ID, body).encode()
}

/// Extracts the `text` of a login disconnect payload.
pub fn parse_login_disconnect(payload: &[u8]) -> ProtocolResult<String> {
    let (document, _) = read_string(payload)?;
    let value: serde_json::Value = serde_json::from_str(&document)?;
    Ok(value
        .get("text")
        .and_then(|text| text.as_str())
        .unwrap_or_default()
        .to_string())
}

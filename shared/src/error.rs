use thiserror::Error;

/// Errors produced while decoding or encoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint did not terminate within {0} bytes")]
    MalformedVarint(usize),

    #[error("packet truncated: needed {needed} bytes, had {available}")]
    TruncatedPacket { needed: usize, available: usize },

    #[error("invalid length field: {0}")]
    InvalidLength(i32),

    #[error("packet of {0} bytes exceeds the maximum frame size")]
    PacketTooLarge(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("unknown next state {0} in handshake")]
    InvalidNextState(i32),

    #[error("unexpected packet 0x{id:02X} in {state} state")]
    UnexpectedPacket { id: i32, state: &'static str },

    #[error("malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

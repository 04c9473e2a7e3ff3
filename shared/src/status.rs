use crate::codec::serialize_status_response;
use serde::{Deserialize, Serialize};

/// Last known server status, as answered to a status request.
///
/// `raw` holds the exact frame the status was decoded from so the
/// placeholder can replay it byte-for-byte. A snapshot built locally has an
/// empty `raw` and is serialized from its fields instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    #[serde(default)]
    pub description: Description,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: u32,
    pub online: u32,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

/// Servers send the description either as a bare string or as a text
/// component object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Plain(String),
    Component {
        #[serde(default)]
        text: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
}

impl Default for Description {
    fn default() -> Self {
        Description::Plain(String::new())
    }
}

impl Description {
    pub fn text(&self) -> &str {
        match self {
            Description::Plain(text) => text,
            Description::Component { text, .. } => text,
        }
    }
}

impl StatusSnapshot {
    /// Builds a zero-player snapshot for a server that has never answered a ping.
    pub fn placeholder(version_name: &str, protocol: i32, motd: &str, max_players: u32) -> Self {
        Self {
            version: StatusVersion {
                name: version_name.to_string(),
                protocol,
            },
            players: StatusPlayers {
                max: max_players,
                online: 0,
                sample: Vec::new(),
            },
            description: Description::Component {
                text: motd.to_string(),
                extra: serde_json::Map::new(),
            },
            favicon: None,
            raw: Vec::new(),
        }
    }

    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = raw;
        self
    }

    /// The status response frame to send to a client.
    pub fn response_frame(&self) -> Vec<u8> {
        if !self.raw.is_empty() {
            return self.raw.clone();
        }
        // Serializing plain data structures cannot fail
        let document = serde_json::to_string(self).unwrap_or_default();
        serialize_status_response(&document)
    }
}

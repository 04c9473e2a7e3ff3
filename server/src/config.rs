//! Process settings, `server.properties`, and the whitelist/operator/ban lists.

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Format the real server writes ban timestamps in
const BAN_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings supplied on the command line or through the environment
#[derive(Parser, Debug, Clone)]
#[command(author, about = "Keeps a game server asleep until a player joins")]
pub struct Settings {
    /// Accept the server EULA on the operator's behalf
    #[arg(long, env = "EULA")]
    pub eula: bool,

    /// Server version the installation should provide
    #[arg(long, env = "VERSION", default_value = "latest")]
    pub version: String,

    /// Build channel ("default" or "experimental")
    #[arg(long, env = "CHANNEL", default_value = "default")]
    pub channel: String,

    /// Initial heap size passed to the server JVM
    #[arg(long, env = "XMS", default_value = "4G")]
    pub xms: String,

    /// Maximum heap size passed to the server JVM
    #[arg(long, env = "XMX", default_value = "4G")]
    pub xmx: String,

    /// Seconds without players before the server is stopped
    #[arg(long = "grace", env = "GRACE", default_value = "180")]
    pub grace_seconds: u64,

    /// Directory holding the `minecraft` and `data` folders
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Java launcher used to start the server
    #[arg(long, default_value = "java")]
    pub java: String,

    /// Command that installs a server build and records its markers,
    /// run whenever no usable installation is found
    #[arg(long, env = "INSTALLER")]
    pub installer: Option<PathBuf>,
}

impl Settings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

/// The subset of `server.properties` the gateway and watcher act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProperties {
    pub enable_status: bool,
    pub hide_online_players: bool,
    pub max_players: u32,
    pub motd: String,
    pub online_mode: bool,
    pub server_ip: String,
    pub server_port: u16,
    pub white_list: bool,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            enable_status: true,
            hide_online_players: false,
            max_players: 20,
            motd: "A Minecraft Server".to_string(),
            online_mode: true,
            server_ip: String::new(),
            server_port: 25565,
            white_list: false,
        }
    }
}

impl ServerProperties {
    /// Reads the properties file, falling back to defaults when it does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parses Java-properties text. Unknown keys and unparsable values are
    /// ignored in favour of the defaults.
    pub fn parse(contents: &str) -> Self {
        let mut properties = Self::default();

        for line in contents.lines() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = split_property(line) else {
                continue;
            };
            let value = unescape_property(value);

            match key.trim() {
                "enable-status" => set_parsed(&mut properties.enable_status, &value),
                "hide-online-players" => set_parsed(&mut properties.hide_online_players, &value),
                "max-players" => set_parsed(&mut properties.max_players, &value),
                "motd" => properties.motd = value,
                "online-mode" => set_parsed(&mut properties.online_mode, &value),
                "server-ip" => properties.server_ip = value.trim().to_string(),
                "server-port" => set_parsed(&mut properties.server_port, &value),
                "white-list" => set_parsed(&mut properties.white_list, &value),
                _ => {}
            }
        }

        properties
    }

    /// Address the placeholder binds: the configured IP or every interface.
    pub fn bind_address(&self) -> String {
        let host = if self.server_ip.is_empty() {
            "0.0.0.0"
        } else {
            &self.server_ip
        };
        format!("{}:{}", host, self.server_port)
    }

    /// Host the watcher pings to reach the running server locally.
    pub fn ping_host(&self) -> &str {
        if self.server_ip.is_empty() || self.server_ip == "0.0.0.0" {
            "127.0.0.1"
        } else {
            &self.server_ip
        }
    }
}

fn set_parsed<T: std::str::FromStr>(field: &mut T, value: &str) {
    if let Ok(parsed) = value.trim().parse() {
        *field = parsed;
    }
}

/// Splits at the first unescaped `=` or `:`.
fn split_property(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' | ':' if !escaped => return Some((&line[..i], line[i + 1..].trim_start())),
            _ => escaped = false,
        }
    }
    None
}

fn unescape_property(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&code);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

/// Whitelist and operator entries share this shape
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerEntry {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
}

/// A player or IP ban
#[derive(Debug, Clone, Deserialize)]
pub struct BanEntry {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub source: String,
    #[serde(default = "forever")]
    pub expires: String,
    #[serde(default)]
    pub reason: String,
}

fn forever() -> String {
    "forever".to_string()
}

impl BanEntry {
    /// A ban is in force while `expires` is "forever" or still in the future.
    /// An expiry we cannot parse keeps the ban in force.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.expires.trim().eq_ignore_ascii_case("forever") {
            return true;
        }
        match DateTime::parse_from_str(self.expires.trim(), BAN_DATE_FORMAT) {
            Ok(expires) => now < expires.with_timezone(&Utc),
            Err(_) => true,
        }
    }
}

/// Identity lists consulted when a player tries to wake the server.
/// Loaded once per gateway lifetime and never mutated.
#[derive(Debug, Clone, Default)]
pub struct AccessLists {
    pub whitelist: HashSet<Uuid>,
    pub operators: HashSet<Uuid>,
    pub player_bans: HashMap<Uuid, BanEntry>,
    pub ip_bans: HashMap<String, BanEntry>,
}

impl AccessLists {
    /// Loads `whitelist.json`, `ops.json`, `banned-players.json` and
    /// `banned-ips.json` from the server directory. Missing files are empty lists.
    pub fn load(server_dir: &Path) -> Result<Self, ConfigError> {
        let whitelist: Vec<PlayerEntry> = read_json_list(&server_dir.join("whitelist.json"))?;
        let operators: Vec<PlayerEntry> = read_json_list(&server_dir.join("ops.json"))?;
        let player_bans: Vec<BanEntry> = read_json_list(&server_dir.join("banned-players.json"))?;
        let ip_bans: Vec<BanEntry> = read_json_list(&server_dir.join("banned-ips.json"))?;

        Ok(Self {
            whitelist: whitelist.into_iter().map(|entry| entry.uuid).collect(),
            operators: operators.into_iter().map(|entry| entry.uuid).collect(),
            player_bans: player_bans
                .into_iter()
                .filter_map(|ban| ban.uuid.map(|uuid| (uuid, ban)))
                .collect(),
            ip_bans: ip_bans
                .into_iter()
                .filter_map(|ban| ban.ip.clone().map(|ip| (ip, ban)))
                .collect(),
        })
    }

    /// Whitelisted players and operators may both join a whitelisted server.
    pub fn is_whitelisted(&self, uuid: &Uuid) -> bool {
        self.whitelist.contains(uuid) || self.operators.contains(uuid)
    }

    pub fn active_player_ban(&self, uuid: &Uuid, now: DateTime<Utc>) -> Option<&BanEntry> {
        self.player_bans.get(uuid).filter(|ban| ban.is_active(now))
    }

    pub fn active_ip_ban(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<&BanEntry> {
        self.ip_bans
            .get(&ip.to_string())
            .filter(|ban| ban.is_active(now))
    }
}

fn read_json_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

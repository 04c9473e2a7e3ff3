//! Idle watcher: polls the running server's player count and stops it once
//! nobody has been online for the grace period.

use crate::process::{ServerHandle, ServerProcess};
use client::{ping_server_with, PingOptions};
use log::{debug, info, warn};
use regex::Regex;
use shared::StatusSnapshot;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long to wait for the `list` command's answer
const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Parses `There are N of a max of M players online` into `(N, M)`.
pub fn parse_player_count(line: &str) -> Option<(u32, u32)> {
    static LIST: OnceLock<Regex> = OnceLock::new();
    let regex = LIST.get_or_init(|| {
        Regex::new(r"There are (\d+) of a max of (\d+) players online")
            .expect("player count pattern is valid")
    });
    let captures = regex.captures(line)?;
    let online = captures[1].parse().ok()?;
    let max = captures[2].parse().ok()?;
    Some((online, max))
}

/// The snapshot the placeholder will replay.
///
/// Only responses with nobody online replace an existing snapshot, so the
/// replayed status never carries stale player samples.
#[derive(Debug, Default)]
pub struct StatusCache {
    snapshot: Option<StatusSnapshot>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a fresh response. Returns true if it was cached.
    pub fn offer(&mut self, status: StatusSnapshot) -> bool {
        if self.snapshot.is_none() || status.players.online == 0 {
            self.snapshot = Some(status);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Option<&StatusSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn into_snapshot(self) -> Option<StatusSnapshot> {
        self.snapshot
    }
}

/// Tracks when someone was last online and fires once after the grace period.
#[derive(Debug)]
pub struct IdleTracker {
    grace: Duration,
    last_online: Instant,
    stop_sent: bool,
}

impl IdleTracker {
    pub fn new(grace: Duration, now: Instant) -> Self {
        Self {
            grace,
            last_online: now,
            stop_sent: false,
        }
    }

    /// Records a player count. Returns true exactly once, when the server
    /// has been empty for at least the grace period.
    pub fn observe(&mut self, online: u32, now: Instant) -> bool {
        if online > 0 {
            self.last_online = now;
            return false;
        }
        if self.stop_sent {
            return false;
        }
        if now.saturating_duration_since(self.last_online) >= self.grace {
            self.stop_sent = true;
            return true;
        }
        false
    }

    pub fn stop_sent(&self) -> bool {
        self.stop_sent
    }
}

/// Where and how often the watcher polls
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub host: String,
    pub port: u16,
    /// Count players with `list` instead of pinging
    pub hide_online_players: bool,
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub ping: PingOptions,
}

impl WatcherConfig {
    pub fn new(host: &str, port: u16, hide_online_players: bool, grace_period: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            hide_online_players,
            grace_period,
            poll_interval: POLL_INTERVAL,
            ping: PingOptions::default(),
        }
    }
}

/// Watches a ready server until its process closes, forwarding operator
/// console lines to it. Returns the last cached status snapshot.
pub async fn watch_server(
    process: &ServerProcess,
    config: &WatcherConfig,
    console: &mut mpsc::Receiver<String>,
) -> Option<StatusSnapshot> {
    let handle = process.handle();
    let mut output = process.subscribe();
    let mut cache = StatusCache::new();
    let mut tracker = IdleTracker::new(config.grace_period, Instant::now());
    let mut ticker = interval_at(Instant::now() + config.poll_interval, config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut console_open = true;

    info!(
        "Watching server on {}:{} (grace period {}s)",
        config.host,
        config.port,
        config.grace_period.as_secs()
    );

    loop {
        tokio::select! {
            _ = process.closed() => break,
            line = console.recv(), if console_open => match line {
                Some(line) => {
                    if !handle.send_command(&line) {
                        debug!("Server console closed, dropping {:?}", line);
                    }
                }
                None => console_open = false,
            },
            _ = ticker.tick() => {
                let Some(online) = poll_player_count(&handle, &mut output, config, &mut cache).await else {
                    continue;
                };
                debug!("{} player(s) online", online);
                if tracker.observe(online, Instant::now()) {
                    info!(
                        "No players for {}s, stopping the server",
                        config.grace_period.as_secs()
                    );
                    handle.stop();
                }
            }
        }
    }

    info!("Server closed, watcher finished");
    cache.into_snapshot()
}

/// One poll: ping when players are visible, otherwise or on failure ask the
/// console.
async fn poll_player_count(
    handle: &ServerHandle,
    output: &mut broadcast::Receiver<String>,
    config: &WatcherConfig,
    cache: &mut StatusCache,
) -> Option<u32> {
    if !config.hide_online_players {
        match ping_server_with(&config.host, config.port, &config.ping).await {
            Ok(status) => {
                let online = status.players.online;
                if cache.offer(status) {
                    debug!("Cached status snapshot");
                }
                return Some(online);
            }
            Err(e) => warn!("Ping failed, asking the console instead: {}", e),
        }
    }
    query_console(handle, output).await
}

/// Sends `list` and waits for the player count line.
async fn query_console(
    handle: &ServerHandle,
    output: &mut broadcast::Receiver<String>,
) -> Option<u32> {
    // Only answers to this command count
    loop {
        match output.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Closed) => return None,
        }
    }

    if !handle.send_command("list") {
        return None;
    }

    let answer = timeout(LIST_TIMEOUT, async {
        loop {
            match output.recv().await {
                Ok(line) => {
                    if let Some((online, _)) = parse_player_count(&line) {
                        return Some(online);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match answer {
        Ok(online) => online,
        Err(_) => {
            warn!("No answer to the list command");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::StatusSnapshot;

    fn status(online: u32, motd: &str) -> StatusSnapshot {
        let mut status = StatusSnapshot::placeholder("1.21.4", 769, motd, 20);
        status.players.online = online;
        status
    }

    #[test]
    fn test_parse_player_count() {
        assert_eq!(
            parse_player_count("[12:00:00 INFO]: There are 0 of a max of 20 players online: "),
            Some((0, 20))
        );
        assert_eq!(
            parse_player_count("There are 3 of a max of 100 players online: a, b, c"),
            Some((3, 100))
        );
        assert_eq!(parse_player_count("[12:00:00 INFO]: Saving chunks"), None);
    }

    #[test]
    fn test_cache_keeps_first_response() {
        let mut cache = StatusCache::new();
        assert!(cache.offer(status(4, "first")));
        assert_eq!(cache.snapshot().unwrap().description.text(), "first");
    }

    #[test]
    fn test_cache_only_overwritten_by_empty_server() {
        let mut cache = StatusCache::new();
        assert!(cache.offer(status(0, "empty")));
        assert!(!cache.offer(status(2, "busy")));
        assert_eq!(cache.snapshot().unwrap().description.text(), "empty");

        assert!(cache.offer(status(0, "empty again")));
        assert_eq!(
            cache.into_snapshot().unwrap().description.text(),
            "empty again"
        );
    }

    #[test]
    fn test_idle_tracker_fires_once_after_grace() {
        let start = Instant::now();
        let grace = Duration::from_secs(180);
        let mut tracker = IdleTracker::new(grace, start);

        let mut stops = 0;
        let counts = [2, 1, 0, 0, 0];
        for (tick, online) in counts.iter().enumerate() {
            let now = start + POLL_INTERVAL * tick as u32;
            if tracker.observe(*online, now) {
                stops += 1;
            }
        }
        assert_eq!(stops, 0);

        // Last player seen at tick 1; keep polling an empty server
        for tick in 5..60 {
            let now = start + POLL_INTERVAL * tick;
            if tracker.observe(0, now) {
                stops += 1;
                assert!(now - (start + POLL_INTERVAL) >= grace);
            }
        }
        assert_eq!(stops, 1);
        assert!(tracker.stop_sent());
    }

    #[test]
    fn test_idle_tracker_resets_when_player_returns() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(Duration::from_secs(180), start);

        for tick in 1..=17 {
            assert!(!tracker.observe(0, start + POLL_INTERVAL * tick));
        }
        // Someone joins just before the deadline
        assert!(!tracker.observe(1, start + Duration::from_secs(175)));
        for tick in 18..=35 {
            assert!(!tracker.observe(0, start + POLL_INTERVAL * tick));
        }
        assert!(tracker.observe(0, start + Duration::from_secs(355)));
    }

    #[test]
    fn test_watcher_config_defaults() {
        let config = WatcherConfig::new("127.0.0.1", 25565, true, Duration::from_secs(60));
        assert_eq!(config.poll_interval, POLL_INTERVAL);
        assert!(config.hide_online_players);
        assert_eq!(config.grace_period, Duration::from_secs(60));
    }
}

//! Bookkeeping for the placeholder's open connections
//!
//! The gateway records every accepted connection here so it can enforce its
//! connection cap and report which sessions it closes on shutdown.

use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One open connection
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

impl SessionEntry {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Live sessions of one gateway run, capped at `max_sessions`
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<u64, SessionEntry>,
    next_session_id: u64,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Session IDs start from 1.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
        }
    }

    /// Registers a connection. Returns None when the gateway is full.
    pub fn add(&mut self, peer: SocketAddr) -> Option<u64> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let id = self.next_session_id;
        self.next_session_id += 1;

        debug!("Session {} opened from {}", id, peer);
        self.sessions.insert(id, SessionEntry::new(id, peer));
        Some(id)
    }

    /// Returns true if the session was still registered.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.sessions.remove(&id) {
            Some(entry) => {
                debug!(
                    "Session {} from {} closed after {:?}",
                    id,
                    entry.peer,
                    entry.age()
                );
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn get(&self, id: u64) -> Option<&SessionEntry> {
        self.sessions.get(&id)
    }

    /// Forgets every session, logging how many were still open.
    pub fn clear(&mut self) -> usize {
        let open = self.sessions.len();
        if open > 0 {
            info!("Closing {} open session(s)", open);
        }
        self.sessions.clear();
        open
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

//! Session identity, state machine and counters.
//!
//! # Responsibilities
//! - Generate unique session IDs for tracing
//! - Track session state (Connecting → Relaying → Closing → Closed | Failed)
//! - Count bytes and frames per direction

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Global atomic counter for session IDs.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "websocket",
        }
    }
}

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Relaying = 1,
    Closing = 2,
    Closed = 3,
    Failed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Relaying,
            2 => SessionState::Closing,
            3 => SessionState::Closed,
            _ => SessionState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Atomic cell holding a `SessionState`.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Connecting as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` unless already terminal or past it.
    /// Returns whether the transition happened.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = SessionState::from_u8(current);
            if state.is_terminal() || state >= next {
                return false;
            }
            match self
                .0
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-direction traffic counters.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub frames_up: AtomicU64,
    pub frames_down: AtomicU64,
}

impl SessionCounters {
    pub fn add_up(&self, bytes: usize) {
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_up.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_down(&self, bytes: usize) {
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_down.fetch_add(1, Ordering::Relaxed);
    }
}

/// Who a session belongs to and where it goes.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub protocol: Protocol,
    pub key_id: String,
    pub client_addr: Option<SocketAddr>,
    pub path: String,
}

/// A live session as stored in the registry.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: SessionId,
    pub info: SessionInfo,
    pub state: StateCell,
    pub counters: SessionCounters,
    upstream: std::sync::OnceLock<String>,
    started: Instant,
    started_unix: u64,
}

impl SessionEntry {
    pub(crate) fn new(info: SessionInfo) -> Self {
        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: SessionId::new(),
            info,
            state: StateCell::new(),
            counters: SessionCounters::default(),
            upstream: std::sync::OnceLock::new(),
            started: Instant::now(),
            started_unix,
        }
    }

    /// Record which upstream this session was bound to. First call wins.
    pub fn bind_upstream(&self, name: &str) {
        let _ = self.upstream.set(name.to_string());
    }

    pub fn upstream(&self) -> Option<&str> {
        self.upstream.get().map(String::as_str)
    }

    pub fn snapshot(&self) -> ProxySession {
        ProxySession {
            id: self.id.to_string(),
            protocol: self.info.protocol,
            key_id: self.info.key_id.clone(),
            client_addr: self.info.client_addr.map(|a| a.to_string()),
            path: self.info.path.clone(),
            upstream: self.upstream().map(str::to_string),
            state: self.state.get(),
            started_at: self.started_unix,
            age_secs: self.started.elapsed().as_secs(),
            bytes_up: self.counters.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.counters.bytes_down.load(Ordering::Relaxed),
            frames_up: self.counters.frames_up.load(Ordering::Relaxed),
            frames_down: self.counters.frames_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a session, as listed by `/admin/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySession {
    pub id: String,
    pub protocol: Protocol,
    pub key_id: String,
    pub client_addr: Option<String>,
    pub path: String,
    pub upstream: Option<String>,
    pub state: SessionState,
    pub started_at: u64,
    pub age_secs: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub frames_up: u64,
    pub frames_down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("sess-"));
    }

    #[test]
    fn state_only_moves_forward() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Relaying));
        assert!(!cell.advance(SessionState::Connecting));
        assert!(cell.advance(SessionState::Closing));
        assert!(cell.advance(SessionState::Closed));
        assert!(!cell.advance(SessionState::Failed));
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn failed_is_reachable_from_any_live_state() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Failed));
        assert_eq!(cell.get(), SessionState::Failed);
    }
}

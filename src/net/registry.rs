//! Registry of live sessions.
//!
//! # Responsibilities
//! - Admit new sessions up to a configured ceiling
//! - Hand each session a cancellation token tied to the proxy's root token
//! - List live sessions for the admin surface
//! - Drain on shutdown: refuse new sessions, wait, then cancel stragglers
//!
//! # Design Decisions
//! - Deregistration happens in `SessionGuard::drop`, so no exit path can
//!   leak an entry

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::net::session::{ProxySession, SessionEntry, SessionId, SessionInfo, SessionState};
use crate::observability::metrics::record_active_sessions;
use crate::observability::{MetricEvent, MetricsCollector};

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    active: AtomicUsize,
    max_sessions: usize,
    draining: AtomicBool,
    root: CancellationToken,
    emptied: Notify,
    metrics: Arc<MetricsCollector>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            max_sessions,
            draining: AtomicBool::new(false),
            root: CancellationToken::new(),
            emptied: Notify::new(),
            metrics,
        }
    }

    /// Admit a new session.
    pub fn register(self: &Arc<Self>, info: SessionInfo) -> Result<SessionGuard, ProxyError> {
        if self.is_draining() {
            return Err(ProxyError::ShuttingDown);
        }

        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            });
        let count = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => {
                tracing::warn!(max = self.max_sessions, "Session limit reached");
                return Err(ProxyError::SessionLimit);
            }
        };

        let protocol = info.protocol;
        let entry = Arc::new(SessionEntry::new(info));
        let id = entry.id;
        self.sessions.insert(id, Arc::clone(&entry));
        self.metrics.record(MetricEvent::SessionOpened { protocol });
        record_active_sessions(count);

        tracing::debug!(session_id = %id, protocol = protocol.as_str(), "Session registered");

        Ok(SessionGuard {
            entry,
            cancel: self.root.child_token(),
            registry: Arc::clone(self),
        })
    }

    /// Remove a session. Idempotent.
    pub fn deregister(&self, id: SessionId) {
        let Some((_, entry)) = self.sessions.remove(&id) else {
            return;
        };
        // Anything that never reached a terminal state ended cleanly from our side.
        entry.state.advance(SessionState::Closed);

        let remaining = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.metrics.record(MetricEvent::SessionClosed {
            protocol: entry.info.protocol,
        });
        record_active_sessions(remaining);

        let snap = entry.snapshot();
        tracing::debug!(
            session_id = %id,
            state = ?snap.state,
            bytes_up = snap.bytes_up,
            bytes_down = snap.bytes_down,
            "Session deregistered"
        );

        if remaining == 0 {
            self.emptied.notify_waiters();
        }
    }

    /// Snapshot of live sessions, oldest first.
    pub fn list_active(&self) -> Vec<ProxySession> {
        let mut entries: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        entries.sort_by_key(|e| e.id);
        entries.iter().map(|e| e.snapshot()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Stop admitting new sessions.
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            tracing::info!(active = self.active_count(), "Session registry draining");
        }
    }

    /// Wait up to `grace` for live sessions to finish, then cancel the rest.
    /// Returns how many sessions were force-cancelled.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.begin_drain();
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();

            if self.active_count() == 0 {
                tracing::info!("All sessions drained");
                return 0;
            }
            if tokio::time::timeout_at(deadline, emptied).await.is_err() {
                break;
            }
        }

        let remaining = self.active_count();
        tracing::warn!(remaining, "Drain grace expired, cancelling sessions");
        self.root.cancel();
        remaining
    }

    /// Cancelled once drain gives up.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }
}

/// Keeps a session registered for as long as it lives.
#[derive(Debug)]
pub struct SessionGuard {
    entry: Arc<SessionEntry>,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    /// Fires when the registry force-closes this session.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn entry(&self) -> &Arc<SessionEntry> {
        &self.entry
    }
}

impl Deref for SessionGuard {
    type Target = SessionEntry;

    fn deref(&self) -> &SessionEntry {
        &self.entry
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.entry.id);
    }
}

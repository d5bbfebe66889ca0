//! Session registry -- bounded slot table of connected sessions.
//!
//! Each slot holds metadata plus the sending half of the session's outbox.
//! The worker task owns the socket; everyone else reaches a session only
//! through its outbox. A slot is released when its [`SessionHandle`] drops.

use hamchat_protocol::Response;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;

/// Sending half of a session's outbound queue.
pub type Outbox = mpsc::Sender<Response>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticating,
    Authenticated,
    Relaying,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Relaying)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("all {capacity} session slots are in use")]
    Full { capacity: usize },
}

/// An occupied slot.
#[derive(Debug)]
pub struct ActiveSession {
    pub slot: usize,
    pub peer: SocketAddr,
    pub username: Option<String>,
    pub state: SessionState,
    pub connected_at: Instant,
    pub outbox: Outbox,
}

/// Point-in-time view of a session, without its outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot: usize,
    pub peer: SocketAddr,
    pub username: Option<String>,
    pub state: SessionState,
}

impl From<&ActiveSession> for SessionInfo {
    fn from(s: &ActiveSession) -> Self {
        Self {
            slot: s.slot,
            peer: s.peer,
            username: s.username.clone(),
            state: s.state,
        }
    }
}

struct Table {
    slots: Vec<Option<ActiveSession>>,
    /// Unoccupied slot indices, lowest first.
    free: BinaryHeap<Reverse<usize>>,
    occupied: usize,
}

/// Thread-safe table of connected sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Table>>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        let table = Table {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).map(Reverse).collect(),
            occupied: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(table)),
            capacity,
        }
    }

    // Every table update is a handful of plain assignments, so a table
    // behind a poisoned lock is still consistent.
    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the lowest free slot for a new connection.
    pub fn acquire(
        &self,
        peer: SocketAddr,
        outbox: Outbox,
    ) -> Result<SessionHandle, RegistryError> {
        let mut table = self.table();
        let Some(Reverse(slot)) = table.free.pop() else {
            tracing::warn!(%peer, capacity = self.capacity, "registry: full, rejecting");
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        };

        table.slots[slot] = Some(ActiveSession {
            slot,
            peer,
            username: None,
            state: SessionState::Connected,
            connected_at: Instant::now(),
            outbox,
        });
        table.occupied += 1;
        tracing::info!(slot, %peer, sessions = table.occupied, "registry: session added");

        Ok(SessionHandle {
            slot,
            registry: self.clone(),
        })
    }

    fn release(&self, slot: usize) {
        let mut table = self.table();
        if let Some(session) = table.slots.get_mut(slot).and_then(Option::take) {
            table.free.push(Reverse(slot));
            table.occupied -= 1;
            tracing::info!(
                slot,
                peer = %session.peer,
                username = session.username.as_deref().unwrap_or("-"),
                sessions = table.occupied,
                "registry: session removed"
            );
        }
    }

    fn with_slot<T>(&self, slot: usize, f: impl FnOnce(&mut ActiveSession) -> T) -> Option<T> {
        let mut table = self.table();
        table.slots.get_mut(slot).and_then(Option::as_mut).map(f)
    }

    /// Visit every occupied slot while holding the lock, in slot order.
    pub fn for_each_active(&self, mut f: impl FnMut(&ActiveSession)) {
        let table = self.table();
        for session in table.slots.iter().flatten() {
            f(session);
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut out = Vec::new();
        self.for_each_active(|s| out.push(SessionInfo::from(s)));
        out
    }

    /// Usernames of authenticated sessions, one entry per session.
    pub fn usernames(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.for_each_active(|s| {
            if let Some(name) = &s.username {
                out.push(name.clone());
            }
        });
        out
    }

    /// Queue `response` for every session bound to `username`. Returns how
    /// many outboxes accepted it. A full or closed outbox is skipped.
    pub fn deliver_to(&self, username: &str, response: &Response) -> u32 {
        let mut delivered = 0;
        self.for_each_active(|s| {
            if s.username.as_deref() != Some(username) {
                return;
            }
            match s.outbox.try_send(response.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(slot = s.slot, %username, "registry: delivery dropped: {e}");
                }
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.table().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Ownership of one registry slot. Dropping it frees the slot.
pub struct SessionHandle {
    slot: usize,
    registry: SessionRegistry,
}

impl SessionHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Bind the authenticated username. Returns false if one is already bound.
    pub fn bind_username(&self, username: &str) -> bool {
        self.registry
            .with_slot(self.slot, |s| {
                if s.username.is_some() {
                    return false;
                }
                s.username = Some(username.to_string());
                true
            })
            .unwrap_or(false)
    }

    pub fn set_state(&self, state: SessionState) {
        self.registry.with_slot(self.slot, |s| {
            if s.state != state {
                tracing::debug!(slot = s.slot, from = %s.state, to = %state, "registry: state");
                s.state = state;
            }
        });
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.registry.with_slot(self.slot, |s| SessionInfo::from(&*s))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.release(self.slot);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("slot", &self.slot).finish()
    }
}

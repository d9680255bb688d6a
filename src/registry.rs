//! Session bookkeeping.
//!
//! Every accepted connection is registered with its protocol kind and a
//! session id that shows up in the logs; the record lives exactly as
//! long as the guard, so a session that ends for any reason deregisters
//! itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SessionKind {
    Smtp,
    Pop3,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Smtp => write!(f, "smtp"),
            SessionKind::Pop3 => write!(f, "pop3"),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionKind>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    pub fn register(self: &Arc<Registry>, kind: SessionKind) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions().insert(id, kind);

        SessionGuard {
            id,
            kind,
            registry: self.clone(),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SessionKind>> {
        match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Keeps one session's record alive; dropping it deregisters.
pub struct SessionGuard {
    id: u64,
    kind: SessionKind,
    registry: Arc<Registry>,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions().remove(&self.id);
    }
}

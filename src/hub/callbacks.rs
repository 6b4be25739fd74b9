use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

/// How a pending callback ended
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// The validator replied; raw `data` payload of the frame
    Reply(Value),
    /// The session that owed the reply closed
    PeerDisconnected,
    /// No reply within the TTL
    Expired,
}

/// One-shot continuation run when the reply for a callback id arrives
pub type CallbackHandler =
    Box<dyn FnOnce(CallbackOutcome) -> BoxFuture<'static, ()> + Send + Sync>;

struct PendingCallback {
    session_id: Uuid,
    deadline: Instant,
    handler: CallbackHandler,
}

/// Correlates outstanding callback ids with their handlers.
///
/// A handler is removed from the table before it runs, so it executes at
/// most once however many replies arrive. Handlers always run outside the
/// lock.
pub struct CallbackTable {
    pending: RwLock<HashMap<String, PendingCallback>>,
    ttl: Duration,
}

impl CallbackTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Store a handler owed by `session_id`. Returns false, dropping the
    /// handler, if the id is already outstanding.
    pub fn register(&self, callback_id: &str, session_id: Uuid, handler: CallbackHandler) -> bool {
        let mut pending = self.pending.write();
        if pending.contains_key(callback_id) {
            return false;
        }
        pending.insert(
            callback_id.to_string(),
            PendingCallback {
                session_id,
                deadline: Instant::now() + self.ttl,
                handler,
            },
        );
        true
    }

    /// Run and forget the handler for `callback_id` if it is owed by
    /// `session_id`. Unknown, already resolved, or foreign ids are a no-op
    /// returning false.
    pub async fn resolve(&self, callback_id: &str, session_id: Uuid, payload: Value) -> bool {
        let entry = {
            let mut pending = self.pending.write();
            match pending.get(callback_id) {
                Some(entry) if entry.session_id == session_id => pending.remove(callback_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                (entry.handler)(CallbackOutcome::Reply(payload)).await;
                true
            }
            None => false,
        }
    }

    /// Drop a handler without running it (e.g. its frame never left)
    pub fn cancel(&self, callback_id: &str) -> bool {
        self.pending.write().remove(callback_id).is_some()
    }

    /// Fail every callback owed by a closed session
    pub async fn fail_session(&self, session_id: Uuid) -> usize {
        let owed: Vec<PendingCallback> = {
            let mut pending = self.pending.write();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = owed.len();
        for entry in owed {
            (entry.handler)(CallbackOutcome::PeerDisconnected).await;
        }
        count
    }

    /// Expire every callback whose deadline is at or before `now`
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingCallback> = {
            let mut pending = self.pending.write();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = expired.len();
        for entry in expired {
            (entry.handler)(CallbackOutcome::Expired).await;
        }
        count
    }

    pub fn contains(&self, callback_id: &str) -> bool {
        self.pending.read().contains_key(callback_id)
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }
}

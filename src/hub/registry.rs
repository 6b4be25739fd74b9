use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Outbound text frames for one socket; drained by its writer task
pub type Outbound = mpsc::UnboundedSender<String>;

/// A live, authenticated validator session
#[derive(Debug, Clone)]
pub struct ValidatorConnection {
    pub validator_id: Uuid,
    pub public_key: String,
    pub session_id: Uuid,
    outbound: Outbound,
}

impl ValidatorConnection {
    pub fn new(validator_id: Uuid, public_key: String, session_id: Uuid, outbound: Outbound) -> Self {
        Self {
            validator_id,
            public_key,
            session_id,
            outbound,
        }
    }

    /// Queue a frame for the socket writer. Fails once the socket is gone.
    pub fn send(&self, frame: String) -> Result<(), ProtocolError> {
        self.outbound
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Live validator connections, at most one per validator.
///
/// Reads (dispatch snapshots) run concurrently with each other; the lock is
/// never held across an await.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ValidatorConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any older session of the same validator.
    /// The replaced session is returned so its owner can be told.
    pub fn register(&self, connection: ValidatorConnection) -> Option<ValidatorConnection> {
        self.connections
            .write()
            .insert(connection.validator_id, connection)
    }

    /// Remove a validator only if `session_id` is still its current session
    pub fn remove_session(&self, validator_id: Uuid, session_id: Uuid) -> bool {
        let mut connections = self.connections.write();
        match connections.get(&validator_id) {
            Some(current) if current.session_id == session_id => {
                connections.remove(&validator_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, validator_id: Uuid) -> Option<ValidatorConnection> {
        self.connections.read().get(&validator_id).cloned()
    }

    /// Point-in-time copy used by one dispatch cycle
    pub fn snapshot(&self) -> Vec<ValidatorConnection> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(validator_id: Uuid) -> (ValidatorConnection, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ValidatorConnection::new(validator_id, "PK".to_string(), Uuid::new_v4(), tx),
            rx,
        )
    }

    #[test]
    fn test_newest_session_wins() {
        let registry = ConnectionRegistry::new();
        let validator_id = Uuid::new_v4();
        let (old, _old_rx) = connection(validator_id);
        let (new, _new_rx) = connection(validator_id);

        assert!(registry.register(old.clone()).is_none());
        let replaced = registry.register(new.clone()).unwrap();
        assert_eq!(replaced.session_id, old.session_id);
        assert_eq!(registry.len(), 1);

        // Late disconnect of the old session must not evict the new one
        assert!(!registry.remove_session(validator_id, old.session_id));
        assert_eq!(registry.get(validator_id).unwrap().session_id, new.session_id);

        assert!(registry.remove_session(validator_id, new.session_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_after_socket_gone_fails() {
        let (conn, rx) = connection(Uuid::new_v4());
        assert!(conn.send("hello".to_string()).is_ok());
        drop(rx);
        assert!(matches!(
            conn.send("again".to_string()),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection(Uuid::new_v4());
        let (b, _rx_b) = connection(Uuid::new_v4());
        registry.register(a.clone());
        registry.register(b);

        let snapshot = registry.snapshot();
        registry.remove_session(a.validator_id, a.session_id);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}

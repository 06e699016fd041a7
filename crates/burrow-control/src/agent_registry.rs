//! Agent registry for tracking connected agents
//!
//! Maps an agent id to the agent's live control connection. The last
//! registration wins: registering a new connection under an id that is
//! already taken closes the previous connection, which simply loses its
//! session.

use burrow_transport::PeerHandle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A registered agent and its control connection
#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// Agent identifier claimed in `AGENT_REGISTER`
    pub agent_id: String,
    /// Control connection that owns this id
    pub connection: PeerHandle,
    /// When the registration happened
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat or control message
    pub last_seen_at: DateTime<Utc>,
}

/// Registry for managing connected agents
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` as the owner of `agent_id`
    ///
    /// Returns true if another connection was displaced.
    pub fn register(&self, agent_id: &str, connection: PeerHandle) -> bool {
        let now = Utc::now();
        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            connection: connection.clone(),
            registered_at: now,
            last_seen_at: now,
        };

        match self.agents.insert(agent_id.to_string(), record) {
            Some(previous) if !previous.connection.same_connection(&connection) => {
                tracing::info!(
                    agent_id = %agent_id,
                    old_conn = %previous.connection.id(),
                    new_conn = %connection.id(),
                    old_connected_at = %previous.registered_at,
                    "Re-registered agent, closing previous control connection"
                );
                previous.connection.close();
                true
            }
            _ => {
                tracing::info!(
                    agent_id = %agent_id,
                    remote_addr = %connection.remote_addr(),
                    "Registered agent"
                );
                false
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|r| r.value().clone())
    }

    /// Remove the mapping only if `connection` still owns `agent_id`
    pub fn unregister(&self, agent_id: &str, connection: &PeerHandle) -> bool {
        let removed = self
            .agents
            .remove_if(agent_id, |_, record| {
                record.connection.same_connection(connection)
            })
            .is_some();

        if removed {
            tracing::info!(agent_id = %agent_id, "Unregistered agent");
        } else {
            tracing::debug!(
                agent_id = %agent_id,
                conn = %connection.id(),
                "Control connection no longer owns agent id"
            );
        }
        removed
    }

    /// Refresh `last_seen_at` if `connection` still owns `agent_id`
    pub fn touch(&self, agent_id: &str, connection: &PeerHandle) {
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            if record.connection.same_connection(connection) {
                record.last_seen_at = Utc::now();
            }
        }
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn connection() -> (PeerHandle, mpsc::Receiver<Message>) {
        PeerHandle::channel("127.0.0.1:40000".parse().unwrap())
    }

    #[test]
    fn test_register_agent() {
        let registry = AgentRegistry::new();
        let (conn, _rx) = connection();

        assert!(!registry.register("agent1", conn.clone()));

        let record = registry.get("agent1").unwrap();
        assert_eq!(record.agent_id, "agent1");
        assert!(record.connection.same_connection(&conn));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_reregister_closes_previous_connection() {
        let registry = AgentRegistry::new();
        let (first, _rx1) = connection();
        let (second, _rx2) = connection();

        registry.register("agent1", first.clone());
        assert!(registry.register("agent1", second.clone()));

        assert!(!first.is_active());
        assert!(second.is_active());
        assert!(registry
            .get("agent1")
            .unwrap()
            .connection
            .same_connection(&second));
    }

    #[test]
    fn test_reregister_same_connection_keeps_it_open() {
        let registry = AgentRegistry::new();
        let (conn, _rx) = connection();

        registry.register("agent1", conn.clone());
        assert!(!registry.register("agent1", conn.clone()));
        assert!(conn.is_active());
    }

    #[test]
    fn test_unregister_by_superseded_connection_is_noop() {
        let registry = AgentRegistry::new();
        let (first, _rx1) = connection();
        let (second, _rx2) = connection();

        registry.register("agent1", first.clone());
        registry.register("agent1", second.clone());

        assert!(!registry.unregister("agent1", &first));
        assert_eq!(registry.count(), 1);

        assert!(registry.unregister("agent1", &second));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_unregister_nonexistent_agent() {
        let registry = AgentRegistry::new();
        let (conn, _rx) = connection();
        assert!(!registry.unregister("nonexistent", &conn));
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let registry = AgentRegistry::new();
        let (conn, _rx) = connection();
        let (stranger, _rx2) = connection();

        registry.register("agent1", conn.clone());
        let before = registry.get("agent1").unwrap().last_seen_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch("agent1", &stranger);
        assert_eq!(registry.get("agent1").unwrap().last_seen_at, before);

        registry.touch("agent1", &conn);
        assert!(registry.get("agent1").unwrap().last_seen_at > before);
    }

    #[test]
    fn test_agent_ids() {
        let registry = AgentRegistry::new();
        let (a, _rx1) = connection();
        let (b, _rx2) = connection();
        registry.register("agent1", a);
        registry.register("agent2", b);

        let mut ids = registry.agent_ids();
        ids.sort();
        assert_eq!(ids, vec!["agent1".to_string(), "agent2".to_string()]);
    }
}

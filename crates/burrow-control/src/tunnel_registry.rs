//! Tunnel broker: pending and active tunnel state machine
//!
//! A tunnel id moves absent -> pending -> active -> absent, or is rejected
//! straight back to absent. Every transition is a single atomic map
//! operation (`entry` for insert-if-absent, `remove`, `remove_if`), so the
//! first writer for an id wins and concurrent triggers (timeout vs bind,
//! both sides disconnecting) collapse into one outcome.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use burrow_proto::{ControlMessage, RejectCode};
use burrow_transport::PeerHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::agent_registry::AgentRegistry;

/// A client `CLIENT_TUNNEL_OPEN` request
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub tunnel_id: String,
    pub agent_id: String,
    pub target_host: String,
    pub target_port: u16,
    pub token: String,
}

/// An agent `AGENT_DATA_BIND` request
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub tunnel_id: String,
    pub agent_id: String,
    pub token: String,
}

/// Client handshake accepted, agent not yet bound
#[derive(Debug)]
pub struct PendingTunnel {
    pub tunnel_id: String,
    pub agent_id: String,
    pub target_host: String,
    pub target_port: u16,
    pub client: PeerHandle,
    timeout: AbortHandle,
    pub created_at: Instant,
}

/// Both data connections known; binary relay authorized
#[derive(Debug, Clone)]
pub struct ActiveTunnel {
    pub tunnel_id: String,
    pub agent_id: String,
    pub client: PeerHandle,
    pub agent_data: PeerHandle,
}

/// The broker shared by every server connection
#[derive(Debug)]
pub struct TunnelRegistry {
    token: String,
    agents: Arc<AgentRegistry>,
    pending: DashMap<String, PendingTunnel>,
    active: DashMap<String, ActiveTunnel>,
    pending_timeout: Duration,
}

impl TunnelRegistry {
    pub fn new(token: String, agents: Arc<AgentRegistry>, pending_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            token,
            agents,
            pending: DashMap::new(),
            active: DashMap::new(),
            pending_timeout,
        })
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn token_matches(&self, token: &str) -> bool {
        self.token == token
    }

    pub fn is_pending(&self, tunnel_id: &str) -> bool {
        self.pending.contains_key(tunnel_id)
    }

    pub fn is_active(&self, tunnel_id: &str) -> bool {
        self.active.contains_key(tunnel_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The agent data connection of an active tunnel owned by `client`
    pub fn agent_peer_for(&self, tunnel_id: &str, client: &PeerHandle) -> Option<PeerHandle> {
        self.active
            .get(tunnel_id)
            .filter(|t| t.client.same_connection(client))
            .map(|t| t.agent_data.clone())
    }

    /// The client connection of an active tunnel bound by `agent_data`
    pub fn client_peer_for(&self, tunnel_id: &str, agent_data: &PeerHandle) -> Option<PeerHandle> {
        self.active
            .get(tunnel_id)
            .filter(|t| t.agent_data.same_connection(agent_data))
            .map(|t| t.client.clone())
    }

    /// Validate a client open and register a pending tunnel
    ///
    /// On any failure the client has already been sent `CLIENT_TUNNEL_ERR`
    /// and closed.
    pub async fn handle_client_open(
        self: &Arc<Self>,
        open: OpenRequest,
        client: &PeerHandle,
    ) -> Result<(), RejectCode> {
        let tunnel_id = open.tunnel_id.as_str();

        if !self.token_matches(&open.token) {
            return Err(reject(client, tunnel_id, RejectCode::BadToken).await);
        }
        if open.agent_id.trim().is_empty() {
            return Err(reject(client, tunnel_id, RejectCode::AgentOffline).await);
        }

        let agent = match self.agents.get(&open.agent_id) {
            Some(agent) if agent.connection.is_active() => agent,
            _ => {
                debug!(tunnel_id = %tunnel_id, agent_id = %open.agent_id, "Agent not connected");
                return Err(reject(client, tunnel_id, RejectCode::AgentOffline).await);
            }
        };

        // The timer is spawned under the shard lock so it can never observe
        // the id before the entry exists. The active check runs under the
        // same lock, which bind also holds while moving pending -> active.
        let inserted = match self.pending.entry(open.tunnel_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(_) if self.active.contains_key(tunnel_id) => false,
            Entry::Vacant(slot) => {
                let timeout = self.schedule_timeout(open.tunnel_id.clone());
                slot.insert(PendingTunnel {
                    tunnel_id: open.tunnel_id.clone(),
                    agent_id: open.agent_id.clone(),
                    target_host: open.target_host.clone(),
                    target_port: open.target_port,
                    client: client.clone(),
                    timeout,
                    created_at: Instant::now(),
                });
                true
            }
        };
        if !inserted {
            return Err(reject(client, tunnel_id, RejectCode::DuplicateTunnelId).await);
        }

        let create = ControlMessage::TunnelCreate {
            tunnel_id: open.tunnel_id.clone(),
            target_host: open.target_host.clone(),
            target_port: open.target_port,
        };
        if let Err(e) = agent.connection.send_control(&create).await {
            debug!(tunnel_id = %tunnel_id, error = %e, "TUNNEL_CREATE not delivered");
            if let Some((_, pending)) = self.pending.remove(tunnel_id) {
                pending.timeout.abort();
            }
            return Err(reject(client, tunnel_id, RejectCode::AgentOffline).await);
        }

        info!(
            tunnel_id = %tunnel_id,
            agent_id = %open.agent_id,
            target = %format!("{}:{}", open.target_host, open.target_port),
            "Tunnel pending"
        );
        Ok(())
    }

    /// The agent could not set the tunnel up; tell the waiting client
    pub async fn handle_agent_create_err(
        &self,
        agent_id: &str,
        tunnel_id: &str,
        code: u16,
        message: &str,
    ) {
        let Some((_, pending)) = self
            .pending
            .remove_if(tunnel_id, |_, p| p.agent_id == agent_id)
        else {
            debug!(tunnel_id = %tunnel_id, agent_id = %agent_id, "TUNNEL_CREATE_ERR for unknown tunnel");
            return;
        };
        pending.timeout.abort();

        warn!(
            tunnel_id = %tunnel_id,
            agent_id = %agent_id,
            code = code,
            reason = %message,
            "Agent failed to create tunnel"
        );

        let err = ControlMessage::ClientTunnelErr {
            tunnel_id: tunnel_id.to_string(),
            code,
            message: message.to_string(),
        };
        pending.client.send_and_close(&err).await;
    }

    /// Match an agent bind against its pending tunnel and activate it
    ///
    /// On failure the involved connections have already been sent their
    /// `*_ERR` messages and closed.
    pub async fn handle_agent_data_bind(
        &self,
        bind: BindRequest,
        agent_data: &PeerHandle,
    ) -> Result<(), RejectCode> {
        let tunnel_id = bind.tunnel_id.as_str();

        if !self.token_matches(&bind.token) {
            return Err(reject_bind(agent_data, tunnel_id, RejectCode::BadToken).await);
        }

        // Lock order is pending then active, same as in handle_client_open.
        // A concurrent open sees the id in exactly one of the two maps.
        let outcome = match self.pending.entry(bind.tunnel_id.clone()) {
            Entry::Vacant(_) => BindOutcome::NoSuchTunnel,
            Entry::Occupied(slot) if slot.get().agent_id != bind.agent_id => {
                BindOutcome::AgentMismatch(slot.remove())
            }
            Entry::Occupied(slot) => match self.active.entry(bind.tunnel_id.clone()) {
                Entry::Occupied(_) => BindOutcome::Duplicate(slot.remove()),
                Entry::Vacant(active) => {
                    let pending = slot.remove();
                    let tunnel = ActiveTunnel {
                        tunnel_id: bind.tunnel_id.clone(),
                        agent_id: bind.agent_id.clone(),
                        client: pending.client.clone(),
                        agent_data: agent_data.clone(),
                    };
                    active.insert(tunnel.clone());
                    BindOutcome::Activated(pending, tunnel)
                }
            },
        };

        let (pending, tunnel) = match outcome {
            BindOutcome::NoSuchTunnel => {
                return Err(reject_bind(agent_data, tunnel_id, RejectCode::NoSuchTunnel).await);
            }
            BindOutcome::AgentMismatch(pending) => {
                pending.timeout.abort();
                warn!(
                    tunnel_id = %tunnel_id,
                    expected = %pending.agent_id,
                    got = %bind.agent_id,
                    "Bind from unexpected agent"
                );
                reject_bind(agent_data, tunnel_id, RejectCode::AgentMismatch).await;
                reject(&pending.client, tunnel_id, RejectCode::AgentMismatch).await;
                return Err(RejectCode::AgentMismatch);
            }
            BindOutcome::Duplicate(pending) => {
                pending.timeout.abort();
                reject_bind(agent_data, tunnel_id, RejectCode::DuplicateTunnelId).await;
                reject(&pending.client, tunnel_id, RejectCode::DuplicateTunnelId).await;
                return Err(RejectCode::DuplicateTunnelId);
            }
            BindOutcome::Activated(pending, tunnel) => {
                pending.timeout.abort();
                (pending, tunnel)
            }
        };

        let client_ok = ControlMessage::ClientTunnelOk {
            tunnel_id: bind.tunnel_id.clone(),
        };
        let bind_ok = ControlMessage::AgentDataBindOk {
            tunnel_id: bind.tunnel_id.clone(),
        };
        let delivered = tunnel.client.send_control(&client_ok).await.is_ok()
            && tunnel.agent_data.send_control(&bind_ok).await.is_ok();

        // The client's own cleanup may have checked active before the insert
        // and pending after the removal, in which case nobody else will.
        if !delivered || !tunnel.client.is_active() {
            if let Some((_, t)) = self
                .active
                .remove_if(tunnel_id, |_, t| t.agent_data.same_connection(agent_data))
            {
                info!(tunnel_id = %tunnel_id, "Client left during bind, tearing down");
                t.client.close();
                t.agent_data.close();
            }
            return Ok(());
        }

        info!(
            tunnel_id = %tunnel_id,
            agent_id = %bind.agent_id,
            handshake_ms = pending.created_at.elapsed().as_millis() as u64,
            "Tunnel active"
        );
        Ok(())
    }

    /// The client connection of `tunnel_id` went away
    pub fn handle_client_inactive(&self, tunnel_id: &str, client: &PeerHandle) {
        if let Some((_, tunnel)) = self
            .active
            .remove_if(tunnel_id, |_, t| t.client.same_connection(client))
        {
            info!(tunnel_id = %tunnel_id, side = "client", "Tunnel closed");
            tunnel.agent_data.close();
            return;
        }

        if let Some((_, pending)) = self
            .pending
            .remove_if(tunnel_id, |_, p| p.client.same_connection(client))
        {
            pending.timeout.abort();
            info!(tunnel_id = %tunnel_id, "Client left before agent bound");
        }
    }

    /// The agent data connection of `tunnel_id` went away
    pub fn handle_agent_data_inactive(&self, tunnel_id: &str, agent_data: &PeerHandle) {
        if let Some((_, tunnel)) = self
            .active
            .remove_if(tunnel_id, |_, t| t.agent_data.same_connection(agent_data))
        {
            info!(tunnel_id = %tunnel_id, side = "agent", "Tunnel closed");
            tunnel.client.close();
        }
    }

    fn schedule_timeout(self: &Arc<Self>, tunnel_id: String) -> AbortHandle {
        let registry: Weak<Self> = Arc::downgrade(self);
        let timeout = self.pending_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.on_pending_timeout(&tunnel_id).await;
            }
        })
        .abort_handle()
    }

    async fn on_pending_timeout(&self, tunnel_id: &str) {
        let Some((_, pending)) = self.pending.remove(tunnel_id) else {
            return;
        };
        warn!(
            tunnel_id = %tunnel_id,
            agent_id = %pending.agent_id,
            timeout_ms = self.pending_timeout.as_millis() as u64,
            "Agent never bound"
        );
        reject(&pending.client, tunnel_id, RejectCode::HandshakeTimeout).await;
    }
}

/// Result of matching a bind against the pending map
enum BindOutcome {
    NoSuchTunnel,
    AgentMismatch(PendingTunnel),
    Duplicate(PendingTunnel),
    Activated(PendingTunnel, ActiveTunnel),
}

/// Send `CLIENT_TUNNEL_ERR` and close
async fn reject(conn: &PeerHandle, tunnel_id: &str, code: RejectCode) -> RejectCode {
    warn!(
        tunnel_id = %tunnel_id,
        side = "client",
        code = code.code(),
        reason = %code,
        "Rejecting tunnel"
    );
    conn.send_and_close(&ControlMessage::client_err(tunnel_id, code))
        .await;
    code
}

/// Send `AGENT_DATA_BIND_ERR` and close
async fn reject_bind(conn: &PeerHandle, tunnel_id: &str, code: RejectCode) -> RejectCode {
    warn!(
        tunnel_id = %tunnel_id,
        side = "agent",
        code = code.code(),
        reason = %code,
        "Rejecting bind"
    );
    conn.send_and_close(&ControlMessage::bind_err(tunnel_id, code))
        .await;
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    const TOKEN: &str = "s3cret";
    const TUNNEL_ID: &str = "3f0e6b9a-21c4-4d7e-8a5b-9c2d1e0f7a36";

    struct Peer {
        handle: PeerHandle,
        rx: mpsc::Receiver<Message>,
    }

    impl Peer {
        fn new() -> Self {
            let (handle, rx) = PeerHandle::channel("127.0.0.1:50000".parse().unwrap());
            Self { handle, rx }
        }

        async fn next_control(&mut self) -> ControlMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("no frame within timeout")
                .expect("channel closed");
            match frame {
                Message::Text(text) => burrow_proto::decode(&text).unwrap(),
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    fn broker(timeout: Duration) -> (Arc<TunnelRegistry>, Peer) {
        let agents = Arc::new(AgentRegistry::new());
        let control = Peer::new();
        agents.register("agent-1", control.handle.clone());
        (TunnelRegistry::new(TOKEN.to_string(), agents, timeout), control)
    }

    fn open(agent_id: &str, token: &str) -> OpenRequest {
        OpenRequest {
            tunnel_id: TUNNEL_ID.to_string(),
            agent_id: agent_id.to_string(),
            target_host: "127.0.0.1".to_string(),
            target_port: 5432,
            token: token.to_string(),
        }
    }

    fn bind(agent_id: &str) -> BindRequest {
        BindRequest {
            tunnel_id: TUNNEL_ID.to_string(),
            agent_id: agent_id.to_string(),
            token: TOKEN.to_string(),
        }
    }

    fn assert_err(msg: ControlMessage, expected: u16) {
        match msg {
            ControlMessage::ClientTunnelErr { code, .. }
            | ControlMessage::AgentDataBindErr { code, .. } => assert_eq!(code, expected),
            other => panic!("expected error with code {}, got {:?}", expected, other),
        }
    }

    #[tokio::test]
    async fn test_open_sends_create_to_agent() {
        let (registry, mut control) = broker(Duration::from_secs(10));
        let client = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();

        assert!(registry.is_pending(TUNNEL_ID));
        match control.next_control().await {
            ControlMessage::TunnelCreate {
                tunnel_id,
                target_port,
                ..
            } => {
                assert_eq!(tunnel_id, TUNNEL_ID);
                assert_eq!(target_port, 5432);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_with_bad_token() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let mut client = Peer::new();

        let result = registry
            .handle_client_open(open("agent-1", "wrong"), &client.handle)
            .await;

        assert_eq!(result, Err(RejectCode::BadToken));
        assert_err(client.next_control().await, 401);
        assert!(!client.handle.is_active());
        assert!(!registry.is_pending(TUNNEL_ID));
    }

    #[tokio::test]
    async fn test_open_for_offline_agent() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let mut client = Peer::new();

        let result = registry
            .handle_client_open(open("agent-2", TOKEN), &client.handle)
            .await;

        assert_eq!(result, Err(RejectCode::AgentOffline));
        match client.next_control().await {
            ControlMessage::ClientTunnelErr { code, message, .. } => {
                assert_eq!(code, 404);
                assert_eq!(message, "AGENT_OFFLINE");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_for_closed_agent_connection() {
        let (registry, control) = broker(Duration::from_secs(10));
        control.handle.close();
        let mut client = Peer::new();

        let result = registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await;

        assert_eq!(result, Err(RejectCode::AgentOffline));
        assert_err(client.next_control().await, 404);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_pending_open_rejected() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let first = Peer::new();
        let mut second = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &first.handle)
            .await
            .unwrap();
        let result = registry
            .handle_client_open(open("agent-1", TOKEN), &second.handle)
            .await;

        assert_eq!(result, Err(RejectCode::DuplicateTunnelId));
        assert_err(second.next_control().await, 409);
        assert!(first.handle.is_active());
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_opens_exactly_one_wins() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let peers: Vec<Peer> = (0..8).map(|_| Peer::new()).collect();

        let mut tasks = Vec::new();
        for peer in &peers {
            let registry = registry.clone();
            let handle = peer.handle.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .handle_client_open(open("agent-1", TOKEN), &handle)
                    .await
            }));
        }

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => wins += 1,
                Err(code) => assert_eq!(code, RejectCode::DuplicateTunnelId),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_activates_and_notifies_both() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let mut client = Peer::new();
        let mut data = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry
            .handle_agent_data_bind(bind("agent-1"), &data.handle)
            .await
            .unwrap();

        assert!(!registry.is_pending(TUNNEL_ID));
        assert!(registry.is_active(TUNNEL_ID));
        assert!(matches!(
            client.next_control().await,
            ControlMessage::ClientTunnelOk { .. }
        ));
        assert!(matches!(
            data.next_control().await,
            ControlMessage::AgentDataBindOk { .. }
        ));
        assert!(registry
            .agent_peer_for(TUNNEL_ID, &client.handle)
            .unwrap()
            .same_connection(&data.handle));
    }

    #[tokio::test]
    async fn test_bind_with_bad_token() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let client = Peer::new();
        let mut data = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        let mut request = bind("agent-1");
        request.token = "nope".to_string();

        let result = registry.handle_agent_data_bind(request, &data.handle).await;
        assert_eq!(result, Err(RejectCode::BadToken));
        assert_err(data.next_control().await, 401);
        assert!(registry.is_pending(TUNNEL_ID));
    }

    #[tokio::test]
    async fn test_bind_without_pending_tunnel() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let mut data = Peer::new();

        let result = registry
            .handle_agent_data_bind(bind("agent-1"), &data.handle)
            .await;

        assert_eq!(result, Err(RejectCode::NoSuchTunnel));
        match data.next_control().await {
            ControlMessage::AgentDataBindErr { code, message, .. } => {
                assert_eq!(code, 404);
                assert_eq!(message, "NO_SUCH_TUNNEL");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(!data.handle.is_active());
    }

    #[tokio::test]
    async fn test_bind_from_wrong_agent_rejects_both() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let mut client = Peer::new();
        let mut data = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        let result = registry
            .handle_agent_data_bind(bind("agent-9"), &data.handle)
            .await;

        assert_eq!(result, Err(RejectCode::AgentMismatch));
        assert_err(data.next_control().await, 403);
        assert_err(client.next_control().await, 403);
        assert!(!client.handle.is_active());
        assert!(!data.handle.is_active());
        assert!(!registry.is_pending(TUNNEL_ID));
        assert!(!registry.is_active(TUNNEL_ID));
    }

    #[tokio::test]
    async fn test_pending_timeout_rejects_client() {
        let (registry, _control) = broker(Duration::from_millis(50));
        let mut client = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();

        match client.next_control().await {
            ControlMessage::ClientTunnelErr { code, message, .. } => {
                assert_eq!(code, 504);
                assert_eq!(message, "HANDSHAKE_TIMEOUT");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(!registry.is_pending(TUNNEL_ID));
    }

    #[tokio::test]
    async fn test_late_bind_is_no_such_tunnel() {
        let (registry, _control) = broker(Duration::from_millis(20));
        let mut client = Peer::new();
        let mut data = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        assert_err(client.next_control().await, 504);

        let result = registry
            .handle_agent_data_bind(bind("agent-1"), &data.handle)
            .await;
        assert_eq!(result, Err(RejectCode::NoSuchTunnel));
        assert_err(data.next_control().await, 404);
        assert!(!registry.is_active(TUNNEL_ID));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_racing_bind_resolves_once() {
        for _ in 0..50 {
            let (registry, _control) = broker(Duration::ZERO);
            let mut client = Peer::new();
            let mut data = Peer::new();

            registry
                .handle_client_open(open("agent-1", TOKEN), &client.handle)
                .await
                .unwrap();
            let bound = registry
                .handle_agent_data_bind(bind("agent-1"), &data.handle)
                .await;

            match client.next_control().await {
                ControlMessage::ClientTunnelOk { .. } => {
                    assert!(bound.is_ok());
                    assert!(registry.is_active(TUNNEL_ID));
                    assert!(matches!(
                        data.next_control().await,
                        ControlMessage::AgentDataBindOk { .. }
                    ));
                }
                ControlMessage::ClientTunnelErr { code, .. } => {
                    assert_eq!(code, 504);
                    assert_eq!(bound, Err(RejectCode::NoSuchTunnel));
                    assert!(!registry.is_active(TUNNEL_ID));
                    assert_err(data.next_control().await, 404);
                }
                other => panic!("unexpected message: {:?}", other),
            }
            assert!(!registry.is_pending(TUNNEL_ID));
            // Exactly one outcome reached the client
            assert!(client.rx.try_recv().is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reopen_racing_bind_never_in_both_maps() {
        for _ in 0..2_000 {
            let (registry, _control) = broker(Duration::from_secs(10));
            let client = Peer::new();
            let data = Peer::new();
            let late = Peer::new();

            registry
                .handle_client_open(open("agent-1", TOKEN), &client.handle)
                .await
                .unwrap();

            let binding = tokio::spawn({
                let registry = registry.clone();
                let handle = data.handle.clone();
                async move { registry.handle_agent_data_bind(bind("agent-1"), &handle).await }
            });
            let reopening = tokio::spawn({
                let registry = registry.clone();
                let handle = late.handle.clone();
                async move {
                    registry
                        .handle_client_open(open("agent-1", TOKEN), &handle)
                        .await
                }
            });

            assert!(binding.await.unwrap().is_ok());
            assert_eq!(
                reopening.await.unwrap(),
                Err(RejectCode::DuplicateTunnelId)
            );
            assert!(
                !(registry.is_pending(TUNNEL_ID) && registry.is_active(TUNNEL_ID)),
                "tunnel id both pending and active"
            );
            assert!(registry.is_active(TUNNEL_ID));
            assert_eq!(registry.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_create_err_forwarded_to_client() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let mut client = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry
            .handle_agent_create_err("agent-1", TUNNEL_ID, 502, "DIAL_FAILED")
            .await;

        match client.next_control().await {
            ControlMessage::ClientTunnelErr { code, message, .. } => {
                assert_eq!(code, 502);
                assert_eq!(message, "DIAL_FAILED");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(!client.handle.is_active());
        assert!(!registry.is_pending(TUNNEL_ID));
    }

    #[tokio::test]
    async fn test_create_err_from_other_agent_ignored() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let client = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry
            .handle_agent_create_err("agent-7", TUNNEL_ID, 502, "DIAL_FAILED")
            .await;

        assert!(registry.is_pending(TUNNEL_ID));
        assert!(client.handle.is_active());
    }

    #[tokio::test]
    async fn test_client_leaving_pending_cancels_tunnel() {
        let (registry, _control) = broker(Duration::from_millis(50));
        let mut client = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry.handle_client_inactive(TUNNEL_ID, &client.handle);
        assert!(!registry.is_pending(TUNNEL_ID));

        // The cancelled timer never fires
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(client.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_either_side_leaving_closes_the_other() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let client = Peer::new();
        let data = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry
            .handle_agent_data_bind(bind("agent-1"), &data.handle)
            .await
            .unwrap();

        registry.handle_agent_data_inactive(TUNNEL_ID, &data.handle);
        assert!(!registry.is_active(TUNNEL_ID));
        assert!(!client.handle.is_active());

        // Second trigger from the other side is a no-op
        registry.handle_client_inactive(TUNNEL_ID, &client.handle);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stranger_cannot_tear_down_tunnel() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let client = Peer::new();
        let data = Peer::new();
        let stranger = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry
            .handle_agent_data_bind(bind("agent-1"), &data.handle)
            .await
            .unwrap();

        registry.handle_client_inactive(TUNNEL_ID, &stranger.handle);
        registry.handle_agent_data_inactive(TUNNEL_ID, &stranger.handle);
        assert!(registry.is_active(TUNNEL_ID));
        assert!(client.handle.is_active());
        assert!(data.handle.is_active());
    }

    #[tokio::test]
    async fn test_open_for_active_id_rejected() {
        let (registry, _control) = broker(Duration::from_secs(10));
        let client = Peer::new();
        let data = Peer::new();
        let mut late = Peer::new();

        registry
            .handle_client_open(open("agent-1", TOKEN), &client.handle)
            .await
            .unwrap();
        registry
            .handle_agent_data_bind(bind("agent-1"), &data.handle)
            .await
            .unwrap();

        let result = registry
            .handle_client_open(open("agent-1", TOKEN), &late.handle)
            .await;
        assert_eq!(result, Err(RejectCode::DuplicateTunnelId));
        assert_err(late.next_control().await, 409);
        assert!(!registry.is_pending(TUNNEL_ID));
    }
}

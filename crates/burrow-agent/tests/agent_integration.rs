//! Agent against a real broker and a local echo target

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_agent::{Agent, AgentConfig, AgentError};
use burrow_control::{ServerConfig, TunnelRegistry, TunnelServer};
use burrow_proto::{decode, ControlMessage};
use burrow_transport::{ClientStream, ClientTlsConfig, Dialer, Inbound, WsConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "agent-secret";
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow=debug")
        .with_test_writer()
        .try_init();
}

struct Harness {
    addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Harness {
    async fn start() -> Self {
        init_tracing();
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), TOKEN);
        let server = TunnelServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry().clone();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        Self {
            addr,
            registry,
            shutdown,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn spawn_agent(&self, agent_id: &str) -> tokio::task::JoinHandle<Result<(), AgentError>> {
        let agent = Agent::new(AgentConfig::new(agent_id, self.url(), TOKEN)).unwrap();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move { agent.run(shutdown).await })
    }

    async fn wait_registered(&self, agent_id: &str) {
        timeout(WAIT, async {
            while self.registry.agents().get(agent_id).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn open(&self, agent_id: &str, port: u16) -> WsConnection<ClientStream> {
        let dialer = Dialer::new(&self.url(), &ClientTlsConfig::default()).unwrap();
        let client = dialer
            .connect(burrow_proto::CLIENT_TUNNEL_PATH)
            .await
            .unwrap();
        client
            .handle
            .send_control(&ControlMessage::ClientTunnelOpen {
                tunnel_id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                target_host: "127.0.0.1".to_string(),
                target_port: port,
                token: TOKEN.to_string(),
            })
            .await
            .unwrap();
        client
    }
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn recv_control(conn: &mut WsConnection<ClientStream>) -> ControlMessage {
    match timeout(WAIT, conn.reader.recv()).await.unwrap() {
        Some(Inbound::Text(text)) => decode(&text).unwrap(),
        other => panic!("expected control message, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_relays_to_target() {
    let harness = Harness::start().await;
    let port = echo_server().await;
    let _agent = harness.spawn_agent("agent-echo");
    harness.wait_registered("agent-echo").await;

    let mut client = harness.open("agent-echo", port).await;
    assert!(matches!(
        recv_control(&mut client).await,
        ControlMessage::ClientTunnelOk { .. }
    ));

    client.handle.send_binary(b"hello burrow".to_vec()).await.unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 12 {
        match timeout(WAIT, client.reader.recv()).await.unwrap() {
            Some(Inbound::Binary(data)) => echoed.extend_from_slice(&data),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    assert_eq!(echoed, b"hello burrow");

    client.handle.close();
    timeout(WAIT, async {
        while harness.registry.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refused_target_reports_dial_failed() {
    let harness = Harness::start().await;
    let _agent = harness.spawn_agent("agent-refused");
    harness.wait_registered("agent-refused").await;

    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut client = harness.open("agent-refused", closed_port).await;
    match recv_control(&mut client).await {
        ControlMessage::ClientTunnelErr { code, message, .. } => {
            assert_eq!(code, 502);
            assert_eq!(message, "DIAL_FAILED");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_token_is_rejected() {
    let harness = Harness::start().await;
    let agent = Agent::new(AgentConfig::new("agent-bad", harness.url(), "wrong")).unwrap();

    let result = timeout(WAIT, agent.run(CancellationToken::new()))
        .await
        .unwrap();
    match result {
        Err(AgentError::RegistrationRejected { code, message }) => {
            assert_eq!(code, 401);
            assert_eq!(message, "BAD_TOKEN");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_agent() {
    let harness = Harness::start().await;
    let agent = Agent::new(AgentConfig::new("agent-stop", harness.url(), TOKEN)).unwrap();
    let stop = CancellationToken::new();
    let task = tokio::spawn({
        let stop = stop.clone();
        async move { agent.run(stop).await }
    });
    harness.wait_registered("agent-stop").await;

    stop.cancel();
    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());

    // The broker drops the registration once the control connection closes
    timeout(WAIT, async {
        while harness.registry.agents().get("agent-stop").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

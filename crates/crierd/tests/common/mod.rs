use crierd::config::ServerConfig;
use crierd::engine::Engine;
use crierd::server::ServerState;
use crierd::store::{EventStore, SqliteStore, WhitelistStore};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        store: ":memory:".to_string(),
        admin_secret: None,
        log_level: "info".to_string(),
        seed: false,
        max_conns: 1000,
        max_conns_ip: 100,
        max_user_conns: 5,
        rate_capacity: 100,
        rate_window: 60,
        auth_timeout: 30,
        heartbeat_interval: 15,
        max_frame: 100_000,
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl TestClient {
    /// Connect and consume the greeting envelope.
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        let mut client = Self { ws_tx, ws_rx };

        let greeting = client.recv_json().await;
        assert_eq!(greeting["type"], "info");
        client
    }

    pub async fn send_line(&mut self, line: &str) {
        self.ws_tx
            .send(Message::Text(line.to_string()))
            .await
            .unwrap();
    }

    /// Receive the next JSON envelope, skipping control frames.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for envelope")
                .expect("stream ended")
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json()).await.ok()
    }

    /// Wait for the server to close the transport; returns the close code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        let deadline = Duration::from_secs(5);
        let result = tokio::time::timeout(deadline, async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(Some(frame))) => return Some(u16::from(frame.code)),
                    Ok(Message::Close(None)) => return None,
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        })
        .await;
        result.unwrap_or(None)
    }

    /// Log in and return the server's reply envelope.
    pub async fn login(&mut self, line: &str) -> Value {
        self.send_line(line).await;
        self.recv_json().await
    }
}

/// Start a relay over an in-memory store seeded with `alice` (receiver),
/// `bella` (broadcaster), and the default `admin` entry.
pub async fn start_server() -> (SocketAddr, Arc<SqliteStore>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<SqliteStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);

    let store = SqliteStore::open(":memory:").unwrap();
    store.add_user("alice").await.unwrap();
    store.add_broadcaster("bella").await.unwrap();
    store.seed_default_admin().await.unwrap();
    let store = Arc::new(store);

    let whitelist: Arc<dyn WhitelistStore> = store.clone();
    let events: Arc<dyn EventStore> = store.clone();
    let (engine, engine_tx) = Engine::new(config.clone(), whitelist, events);
    tokio::spawn(engine.run());

    let state = Arc::new(ServerState::new(config, engine_tx));
    tokio::spawn(async move {
        if let Err(e) = crierd::run(listener, state).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, store)
}

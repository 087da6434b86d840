use crate::engine::EngineCommand;
use crate::error::CrierdError;
use crate::server::ServerState;
use crate::session::{ConnHandle, Outbound, SessionId, OUTBOUND_QUEUE};
use crier_common::protocol::{ErrorKind, ServerMsg};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Resolve the client address: the first hop of `x-forwarded-for` when the
/// header is present and parseable, else the transport peer address.
/// IPv4-mapped IPv6 addresses are normalized to plain IPv4.
fn extract_client_ip(request: &Request<()>, peer_addr: &SocketAddr) -> IpAddr {
    if let Some(value) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = value.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip.to_canonical();
            }
        }
    }
    peer_addr.ip().to_canonical()
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Accept the WebSocket handshake, register the session with the engine,
/// and pump frames in both directions until either side closes.
///
/// # Errors
///
/// Returns an error when the handshake fails, the per-IP limit is hit, or
/// the transport reports a failure mid-stream.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), CrierdError> {
    // Bound the number of sockets that exist before the engine knows about
    // them, so a connect flood cannot exhaust file descriptors.
    let _permit = state.pre_auth_semaphore.acquire().await.map_err(|_| {
        tracing::debug!("pre-auth semaphore closed");
        CrierdError::ConnectionClosed
    })?;

    // The transport cap sits above the protocol frame limit: frames between
    // the two get an error envelope instead of a transport close.
    let transport_cap = state.config.max_frame.saturating_mul(4);
    let ws_config = WebSocketConfig {
        max_message_size: Some(transport_cap),
        max_frame_size: Some(transport_cap),
        ..WebSocketConfig::default()
    };

    let client_ip = Arc::new(std::sync::OnceLock::new());
    let ip_cell = client_ip.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: tokio_tungstenite::tungstenite::http::Response<()>| {
            let _ = ip_cell.set(extract_client_ip(req, &peer_addr));
            Ok(resp)
        },
        Some(ws_config),
    )
    .await
    .map_err(CrierdError::WebSocket)?;

    let client_ip = client_ip
        .get()
        .copied()
        .unwrap_or_else(|| peer_addr.ip().to_canonical());

    // Atomic check-and-increment for per-IP connection limiting via the
    // entry API, so two handshakes cannot both pass the check.
    let mut should_reject = false;
    match state.ip_connections.entry(client_ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            let count = *entry.get();
            if count >= state.config.max_conns_ip {
                should_reject = true;
            } else {
                *entry.get_mut() += 1;
            }
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(1);
        }
    }

    if should_reject {
        tracing::debug!(ip = %client_ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(CrierdError::ConnectionClosed);
    }

    let _ip_guard = IpGuard {
        state: state.clone(),
        ip: client_ip,
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let handle = ConnHandle {
        tx: deliver_tx,
        remote_ip: client_ip,
    };

    state
        .engine_tx
        .send(EngineCommand::Attach { id, handle })
        .await
        .map_err(|_| CrierdError::EngineUnavailable)?;

    state.active_connections.fetch_add(1, Ordering::Relaxed);
    let result = run_message_loop(&mut ws_tx, &mut ws_rx, &mut deliver_rx, &state, id).await;
    state.active_connections.fetch_sub(1, Ordering::Relaxed);

    // Removal is idempotent: engine-initiated closes already dropped the
    // session and this becomes a no-op.
    let _ = state.engine_tx.send(EngineCommand::Detach { id }).await;

    result
}

/// Drive the transport: inbound text frames go to the engine, outbound
/// instructions come back through the session's channel.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Outbound>,
    state: &ServerState,
    id: SessionId,
) -> Result<(), CrierdError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if state
                            .engine_tx
                            .send(EngineCommand::Frame { id, text })
                            .await
                            .is_err()
                        {
                            // Engine gone: the server is shutting down.
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let err = ServerMsg::error(ErrorKind::Protocol, "text frames only");
                        ws_tx
                            .send(Message::Text(err.to_json()))
                            .await
                            .map_err(CrierdError::WebSocket)?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(CrierdError::WebSocket(e)),
                    _ => {}
                }
            }
            out = deliver_rx.recv() => {
                match out {
                    Some(Outbound::Envelope(msg)) => {
                        ws_tx
                            .send(Message::Text(msg.to_json()))
                            .await
                            .map_err(CrierdError::WebSocket)?;
                    }
                    Some(Outbound::Ping) => {
                        if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                            tracing::debug!("failed to send ping: {}", e);
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

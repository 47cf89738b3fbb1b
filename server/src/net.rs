//! Websocket transport: accept loop and per-connection tasks.
//!
//! Each connection gets a reader task that feeds parsed text frames into the
//! server loop and a writer task draining a per-connection channel, so every
//! send from the server loop is a non-blocking enqueue. Close and error
//! conditions funnel into the loop as messages; the loop owns all state.

use crate::error::ClientError;
use crate::server::LoopMessage;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use shared::{ServerMessage, MAX_MESSAGE_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Connection identifier, unique per process lifetime. Distinct from the
/// controller id, which is persisted and only assigned at login.
pub type ConnId = u64;

/// What the server loop may hand a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Accepts connections forever, spawning one handler per socket.
pub async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<LoopMessage>,
    allowed_origins: Arc<Vec<String>>,
) {
    let mut next_conn: ConnId = 1;
    while let Ok((stream, addr)) = listener.accept().await {
        let conn = next_conn;
        next_conn += 1;
        debug!("connection {} accepted from {}", conn, addr);
        tokio::spawn(handle_connection(
            stream,
            addr,
            conn,
            tx.clone(),
            Arc::clone(&allowed_origins),
        ));
    }
}

// Loopback peers bypass the origin check; an empty allow-list disables it.
fn origin_allowed(origin: Option<&str>, addr: &SocketAddr, allowed: &[String]) -> bool {
    if allowed.is_empty() || addr.ip().is_loopback() {
        return true;
    }
    origin
        .map(|o| allowed.iter().any(|a| a == o))
        .unwrap_or(false)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnId,
    tx: mpsc::UnboundedSender<LoopMessage>,
    allowed_origins: Arc<Vec<String>>,
) {
    let mut origin: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        origin = request
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("handshake failed for {}: {}", addr, e);
            return;
        }
    };

    if !origin_allowed(origin.as_deref(), &addr, &allowed_origins) {
        warn!("rejected origin {:?} from {}", origin, addr);
        let mut ws = ws;
        let error = ServerMessage::Error {
            error: ClientError::BadOrigin.to_string(),
        };
        let _ = ws.send(Message::Text(error.to_text())).await;
        let _ = ws.close(None).await;
        return;
    }

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    if tx
        .send(LoopMessage::Opened {
            conn,
            addr,
            outbound: out_tx,
        })
        .is_err()
    {
        return;
    }

    while let Some(received) = ws_receiver.next().await {
        let message = match received {
            Ok(m) => m,
            Err(e) => {
                debug!("socket error on connection {}: {}", conn, e);
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if text.len() > MAX_MESSAGE_BYTES {
                    let _ = tx.send(LoopMessage::Violation {
                        conn,
                        error: ClientError::MessageTooLarge,
                    });
                    break;
                }
                if tx.send(LoopMessage::Inbound { conn, text }).is_err() {
                    break;
                }
            }
            // The protocol is JSON text end to end.
            Message::Binary(_) => {
                let _ = tx.send(LoopMessage::Violation {
                    conn,
                    error: ClientError::Malformed,
                });
                break;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = tx.send(LoopMessage::Closed { conn });
}

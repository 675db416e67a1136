//! The `/ws/{session_id}` connection handler: per-connection reader/writer
//! loop mirroring the teacher's `tokio::select!` shape in
//! `ws_forwarder.rs`/`ws_receiver.rs` (heartbeat tick, queue drain, inbound
//! recv), generalized to this session's flow-controlled fan-out protocol
//! (spec §4.5).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use loquilex_envelope::{
    decode_inbound, encode_outbound, ClientAckData, ClientHelloData, Envelope, ErrorCode, MsgType,
    ResumeRequestData,
};
use loquilex_session_core::{CloseNotice, CommitLog, StreamingSession};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::state::GatewayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: GatewayState, sid: String) {
    let session = match state.sessions.get(&sid).await {
        Ok(s) => s,
        Err(_) => {
            let _ = socket.close().await;
            return;
        }
    };
    let conn = match state.sessions.attach(&sid).await {
        Ok(c) => c,
        Err(_) => {
            let _ = socket.close().await;
            return;
        }
    };
    let Some(mut close_rx) = state.register_close_waiter(&sid, &conn.conn_id).await else {
        state.sessions.detach(&sid, &conn.conn_id).await.ok();
        let _ = socket.close().await;
        return;
    };
    info!(sid = %sid, conn_id = %conn.conn_id, "connection active");

    let max_msg_bytes = state.config.manager.engine.max_msg_bytes;
    let drain_deadline = Duration::from_millis(state.config.manager.engine.drain_deadline_ms);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut hb_interval = tokio::time::interval(Duration::from_millis(
        state.config.manager.engine.hb_interval_ms,
    ));
    hb_interval.tick().await; // first tick fires immediately; welcome already covers the opener

    loop {
        tokio::select! {
            item = conn.out_queue.poll() => {
                match item {
                    Some(env) => {
                        if write_envelope(&mut ws_tx, &session, &conn.conn_id, &env, max_msg_bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = hb_interval.tick() => {
                if let Ok(hb) = session.engine().build_heartbeat(&conn.conn_id).await
                    && write_envelope(&mut ws_tx, &session, &conn.conn_id, &hb, max_msg_bytes).await.is_err() {
                        break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&session, &conn.conn_id, text.as_bytes(), max_msg_bytes).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(sid = %sid, conn_id = %conn.conn_id, error = %e, "websocket transport error");
                        break;
                    }
                }
            }
            notice = &mut close_rx => {
                handle_close_notice(notice, &mut ws_tx, &conn, &session, max_msg_bytes, drain_deadline).await;
                break;
            }
        }
    }

    state.unregister_close_waiter(&sid, &conn.conn_id).await;
    state.sessions.detach(&sid, &conn.conn_id).await.ok();
    info!(sid = %sid, conn_id = %conn.conn_id, "connection closed");
}

async fn write_envelope(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    session: &Arc<StreamingSession>,
    conn_id: &str,
    env: &Envelope,
    max_msg_bytes: usize,
) -> Result<(), ()> {
    let bytes = encode_outbound(env, max_msg_bytes).map_err(|_| ())?;
    let text = String::from_utf8(bytes).map_err(|_| ())?;
    ws_tx.send(Message::Text(text)).await.map_err(|_| ())?;
    if env.t.is_domain_publish() {
        let _ = session.engine().mark_delivered(conn_id, env.seq).await;
    }
    Ok(())
}

async fn handle_close_notice(
    notice: Result<CloseNotice, tokio::sync::oneshot::error::RecvError>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    conn: &loquilex_session_core::ConnectionHandle,
    session: &Arc<StreamingSession>,
    max_msg_bytes: usize,
    drain_deadline: Duration,
) {
    let Ok(notice) = notice else { return };
    if notice.immediate {
        // The outbound queue is already closed by the time an immediate
        // notice fires (queue overflow, invalid ack, heartbeat timeout), so
        // the `server.error` it carries can't ride the queue -- write it
        // straight to the socket before the connection goes away (§4.5.6,
        // §8 scenarios 3 and 6).
        if let Some(code) = notice.code {
            let env = session.engine().build_error(code, notice.detail);
            let _ = write_envelope(ws_tx, session, &conn.conn_id, &env, max_msg_bytes).await;
        }
        return;
    }
    let _ = tokio::time::timeout(drain_deadline, async {
        while let Some(env) = conn.out_queue.poll().await {
            if write_envelope(ws_tx, session, &conn.conn_id, &env, max_msg_bytes)
                .await
                .is_err()
            {
                break;
            }
        }
    })
    .await;
}

async fn handle_inbound(session: &Arc<StreamingSession>, conn_id: &str, bytes: &[u8], max_msg_bytes: usize) {
    let engine = session.engine();
    let env = match decode_inbound(bytes, max_msg_bytes) {
        Ok(env) => env,
        Err(e) => {
            let _ = engine.protocol_violation(conn_id, e.code(), e.to_string()).await;
            return;
        }
    };
    if !env.t.is_client_originated() {
        let _ = engine
            .protocol_violation(conn_id, ErrorCode::InvalidMessage, format!("{:?} is not a client-originated message", env.t))
            .await;
        return;
    }
    match env.t {
        MsgType::ClientHello => {
            let hello: ClientHelloData = serde_json::from_value(env.data).unwrap_or_default();
            let _ = engine.handle_client_hello(conn_id, hello).await;
        }
        MsgType::ClientHb | MsgType::ClientFlow => {
            let _ = engine.touch_liveness(conn_id).await;
        }
        MsgType::ClientAck => match serde_json::from_value::<ClientAckData>(env.data) {
            Ok(ack) => {
                let _ = engine.handle_ack(conn_id, ack.ack_seq).await;
            }
            Err(_) => {
                let _ = engine
                    .protocol_violation(conn_id, ErrorCode::InvalidMessage, "malformed client.ack payload")
                    .await;
            }
        },
        MsgType::SessionResume => match serde_json::from_value::<ResumeRequestData>(env.data) {
            Ok(req) => handle_resume(session, conn_id, req, max_msg_bytes).await,
            Err(_) => {
                let _ = engine
                    .protocol_violation(conn_id, ErrorCode::InvalidMessage, "malformed session.resume payload")
                    .await;
            }
        },
        _ => unreachable!("is_client_originated() already filtered to these kinds"),
    }
}

/// Builds the resume response and enqueues it onto `conn_id`'s queue itself
/// (see `ProtocolEngine::resume`, which holds its state lock across the
/// whole enqueue so a concurrent `publish()` can't land in the middle of it).
async fn handle_resume(
    session: &Arc<StreamingSession>,
    conn_id: &str,
    req: ResumeRequestData,
    _max_msg_bytes: usize,
) {
    let engine = session.engine();
    let finalized = finalized_snapshot(engine.commit_log());
    if let Err(e) = engine.resume(conn_id, &req, finalized, Vec::new()).await {
        let _ = engine.protocol_violation(conn_id, e.code(), e.to_string()).await;
    }
}

fn finalized_snapshot(commit_log: &Arc<CommitLog>) -> Vec<serde_json::Value> {
    commit_log
        .query(loquilex_session_core::QueryOpts::default())
        .into_iter()
        .map(|r| r.data)
        .collect()
}

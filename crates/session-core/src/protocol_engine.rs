//! Per-session protocol state machine: handshake, sequencing, heartbeats,
//! flow control/acks, and resume (spec §4.5). Exclusive access to session
//! state is serialized behind a single `tokio::sync::Mutex` rather than an
//! actor/channel -- §5 permits either, and every operation here already
//! completes without awaiting anything but the lock itself.

use crate::bounded_queue::{BoundedQueue, OfferOutcome, QueueError};
use crate::clock::Clock;
use crate::commit_log::{CommitLog, CommitRecord, CommitType, QueryOpts};
use crate::errors::EngineError;
use crate::replay_buffer::{ReplayBuffer, ReplayError};
use loquilex_envelope::{
    encode_outbound, ClientHelloData, ConnectionLimits, ErrorCode, ErrorData, Envelope, HbLimits,
    HeartbeatData, MsgType, QueueDropData, ResumeRequestData, ResumeWindow, SessionNewData,
    SnapshotData, WelcomeData,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// Static protocol knobs, populated from `GatewayConfig` (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub hb_interval_ms: u64,
    pub hb_timeout_ms: u64,
    pub resume_window_secs: u64,
    pub max_in_flight: u64,
    pub max_msg_bytes: usize,
    pub client_event_buffer: usize,
    pub drain_deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    /// A `server.error` has been queued and the connection is being torn
    /// down once `drain_deadline_ms` has elapsed or the queue empties.
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Cumulative,
    PerMessage,
}

/// Emitted whenever the engine decides a connection must be torn down for a
/// reason the transport layer (the gateway's per-connection task) owns the
/// socket for. Mirrors the command-channel shape the teacher uses to steer
/// a forwarder's WebSocket task from outside it.
#[derive(Debug, Clone)]
pub struct CloseNotice {
    pub conn_id: String,
    /// `None` for a requested/graceful close (session stop); `Some` when the
    /// engine is closing the connection for cause.
    pub code: Option<ErrorCode>,
    pub detail: String,
    /// `true`: close the socket now. `false`: let whatever was queued drain,
    /// then close no later than `drain_deadline_ms` later.
    pub immediate: bool,
}

struct Connection {
    out_queue: Arc<BoundedQueue<Envelope>>,
    ack_notify: Arc<Notify>,
    state: ConnState,
    ack_mode: AckMode,
    last_delivered_seq: u64,
    last_ack_seq: u64,
    last_seen_mono_ns: u64,
}

struct EngineState {
    next_seq: u64,
    connections: HashMap<String, Connection>,
}

/// A connection's outbound handle, returned to the gateway's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub out_queue: Arc<BoundedQueue<Envelope>>,
    pub ack_notify: Arc<Notify>,
}

pub struct ProtocolEngine {
    sid: String,
    epoch: u64,
    created_at_mono_ns: u64,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    commit_log: Arc<CommitLog>,
    replay: Arc<ReplayBuffer>,
    state: Mutex<EngineState>,
    close_tx: mpsc::UnboundedSender<CloseNotice>,
}

impl ProtocolEngine {
    pub fn new(
        sid: String,
        epoch: u64,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        commit_log: Arc<CommitLog>,
        replay: Arc<ReplayBuffer>,
    ) -> (Self, mpsc::UnboundedReceiver<CloseNotice>) {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let engine = Self {
            created_at_mono_ns: clock.mono_ns(),
            sid,
            epoch,
            config,
            clock,
            commit_log,
            replay,
            state: Mutex::new(EngineState {
                next_seq: 1,
                connections: HashMap::new(),
            }),
            close_tx,
        };
        (engine, close_rx)
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn commit_log(&self) -> &Arc<CommitLog> {
        &self.commit_log
    }

    /// Out-of-band snapshot of session state (§4.3, §4.5.5, spec.md:199):
    /// the finalized commit history plus the latest produced seq, independent
    /// of any connection's resume handshake.
    pub async fn snapshot(&self) -> SnapshotData {
        let current_seq = self.state.lock().await.next_seq.saturating_sub(1);
        let finalized = self
            .commit_log
            .query(QueryOpts::default())
            .into_iter()
            .map(|r| r.data)
            .collect();
        SnapshotData {
            current_seq,
            finalized,
            active_partials: Vec::new(),
        }
    }

    fn elapsed_mono_ns(&self) -> u64 {
        self.clock.mono_ns() - self.created_at_mono_ns
    }

    fn new_envelope(&self, t: MsgType, seq: u64, data: serde_json::Value) -> Envelope {
        Envelope {
            v: loquilex_envelope::SCHEMA_VERSION,
            t,
            sid: Some(self.sid.clone()),
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            corr: None,
            t_wall: self.clock.wall_iso8601(),
            t_mono_ns: self.elapsed_mono_ns(),
            data,
        }
    }

    /// Register a new connection and hand back its outbound queue, seeded
    /// with the `server.welcome` envelope (seq 0, out-of-band; §4.5.1).
    pub async fn accept_connection(&self) -> Result<ConnectionHandle, EngineError> {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let out_queue = Arc::new(BoundedQueue::new(self.config.client_event_buffer));
        let welcome = self.new_envelope(
            MsgType::ServerWelcome,
            0,
            serde_json::to_value(WelcomeData {
                hb: HbLimits {
                    interval_ms: self.config.hb_interval_ms,
                    timeout_ms: self.config.hb_timeout_ms,
                },
                resume_window: ResumeWindow {
                    seconds: self.config.resume_window_secs,
                },
                limits: ConnectionLimits {
                    max_in_flight: self.config.max_in_flight,
                    max_msg_bytes: self.config.max_msg_bytes,
                },
            })
            .expect("WelcomeData always serializes"),
        );
        encode_outbound(&welcome, self.config.max_msg_bytes)?;
        out_queue.offer(welcome)?;

        let ack_notify = Arc::new(Notify::new());
        let mut st = self.state.lock().await;
        st.connections.insert(
            conn_id.clone(),
            Connection {
                out_queue: out_queue.clone(),
                ack_notify: ack_notify.clone(),
                state: ConnState::Active,
                ack_mode: AckMode::Cumulative,
                last_delivered_seq: 0,
                last_ack_seq: 0,
                last_seen_mono_ns: self.elapsed_mono_ns(),
            },
        );
        Ok(ConnectionHandle {
            conn_id,
            out_queue,
            ack_notify,
        })
    }

    pub async fn handle_client_hello(
        &self,
        conn_id: &str,
        hello: ClientHelloData,
    ) -> Result<(), EngineError> {
        let mut st = self.state.lock().await;
        let conn = conn_mut(&mut st, conn_id)?;
        if hello.ack_mode.as_deref() == Some("per-message") {
            conn.ack_mode = AckMode::PerMessage;
        }
        conn.last_seen_mono_ns = self.elapsed_mono_ns();
        Ok(())
    }

    /// Any inbound traffic (heartbeat, ack, hello, ...) refreshes liveness.
    pub async fn touch_liveness(&self, conn_id: &str) -> Result<(), EngineError> {
        let mut st = self.state.lock().await;
        let conn = conn_mut(&mut st, conn_id)?;
        conn.last_seen_mono_ns = self.elapsed_mono_ns();
        Ok(())
    }

    /// Assign the next session-wide seq, commit (if a commit kind), record
    /// into the replay buffer, and fan out to every active connection's
    /// outbound queue (§4.5.2). Oversized envelopes are rejected before any
    /// of that happens and never reach the replay buffer (§4.4).
    pub async fn publish(&self, t: MsgType, data: serde_json::Value) -> Result<u64, EngineError> {
        debug_assert!(t.is_domain_publish());
        let mut st = self.state.lock().await;
        let seq = st.next_seq;
        st.next_seq += 1;
        let env = self.new_envelope(t, seq, data);
        let bytes = encode_outbound(&env, self.config.max_msg_bytes)?;

        if t.is_commit_kind() {
            self.commit_log.append(CommitRecord::new(
                env.id.clone(),
                seq,
                env.t_mono_ns,
                commit_type_for(t),
                env.data.clone(),
            ));
        }
        self.replay.record(seq, bytes, env.t_mono_ns);

        let mut overflowed = Vec::new();
        for (conn_id, conn) in st.connections.iter_mut() {
            if conn.state != ConnState::Active {
                continue;
            }
            match conn.out_queue.offer(env.clone()) {
                Ok(OfferOutcome::Accepted) | Ok(OfferOutcome::AcceptedWithDrop { .. }) => {}
                Ok(OfferOutcome::DroppedIncoming) => {}
                Err(QueueError::Overflow) => {
                    let drop_env = self.new_envelope(
                        MsgType::QueueDrop,
                        0,
                        serde_json::to_value(QueueDropData {
                            dropped_seq: seq,
                            dropped_count: 1,
                        })
                        .expect("QueueDropData always serializes"),
                    );
                    // Best-effort: the queue is already full of non-droppable
                    // items, so this itself may fail to enqueue; the close
                    // that follows is the authoritative signal either way.
                    let _ = conn.out_queue.offer(drop_env);
                    conn.state = ConnState::Closed;
                    overflowed.push(conn_id.clone());
                }
                Err(QueueError::Closed) => {}
            }
        }
        drop(st);
        for conn_id in overflowed {
            let _ = self.close_tx.send(CloseNotice {
                conn_id,
                code: Some(ErrorCode::QueueOverflow),
                detail: "outbound queue exhausted with no droppable item to evict".into(),
                immediate: true,
            });
        }
        Ok(seq)
    }

    pub async fn build_heartbeat(&self, conn_id: &str) -> Result<Envelope, EngineError> {
        let st = self.state.lock().await;
        let conn = conn_ref(&st, conn_id)?;
        let data = HeartbeatData {
            q_out: conn.out_queue.len(),
            q_in: 0,
            latency_ms_est: None,
        };
        Ok(self.new_envelope(
            MsgType::ServerHb,
            0,
            serde_json::to_value(data).expect("HeartbeatData always serializes"),
        ))
    }

    /// Current in-flight count: delivered-but-unacked envelopes (§4.5.4).
    pub async fn in_flight(&self, conn_id: &str) -> Result<u64, EngineError> {
        let st = self.state.lock().await;
        let conn = conn_ref(&st, conn_id)?;
        Ok(conn.last_delivered_seq.saturating_sub(conn.last_ack_seq))
    }

    /// Called by the writer loop after a successful socket write of a
    /// domain-publish envelope (heartbeats/errors/welcome never advance
    /// delivery bookkeeping; clients never ack them).
    pub async fn mark_delivered(&self, conn_id: &str, seq: u64) -> Result<(), EngineError> {
        let mut st = self.state.lock().await;
        let conn = conn_mut(&mut st, conn_id)?;
        if seq > conn.last_delivered_seq {
            conn.last_delivered_seq = seq;
        }
        Ok(())
    }

    /// `client.ack` (§4.5.4). Acks are cumulative and idempotent: an ack for
    /// a seq already acked is a no-op; an ack beyond the latest delivered
    /// seq is a protocol violation and closes the connection immediately.
    pub async fn handle_ack(&self, conn_id: &str, ack_seq: u64) -> Result<(), EngineError> {
        let mut st = self.state.lock().await;
        let conn = conn_mut(&mut st, conn_id)?;
        conn.last_seen_mono_ns = self.elapsed_mono_ns();
        if ack_seq <= conn.last_ack_seq {
            return Ok(());
        }
        if ack_seq > conn.last_delivered_seq {
            let last_delivered_seq = conn.last_delivered_seq;
            // Leave the queue open here: closing it would race the writer's
            // `out_queue.poll()` select branch against this `CloseNotice`,
            // which can win and tear the connection down before the error
            // envelope is ever written. `remove_connection` closes it once
            // the gateway detaches after reading the notice.
            conn.state = ConnState::Closed;
            drop(st);
            let _ = self.close_tx.send(CloseNotice {
                conn_id: conn_id.to_string(),
                code: Some(ErrorCode::InvalidAck),
                detail: format!("ack_seq {ack_seq} exceeds last_delivered_seq {last_delivered_seq}"),
                immediate: true,
            });
            return Err(EngineError::InvalidAck {
                ack_seq,
                last_delivered_seq,
            });
        }
        conn.last_ack_seq = ack_seq;
        conn.ack_notify.notify_waiters();
        Ok(())
    }

    /// `session.resume` (§4.5.5). Builds the response (`session.new` or
    /// `session.snapshot` + replay) and enqueues all of it onto the
    /// resuming connection's outbound queue itself, under a single
    /// acquisition of `self.state`. A concurrent `publish()` also needs that
    /// lock to fan out, so it can never interleave a higher-seq envelope
    /// between the snapshot and its replay entries, or between two replay
    /// entries (§5 per-connection ordering).
    pub async fn resume(
        &self,
        conn_id: &str,
        req: &ResumeRequestData,
        finalized: Vec<serde_json::Value>,
        active_partials: Vec<serde_json::Value>,
    ) -> Result<ResumeOutcome, EngineError> {
        if req.session_id != self.sid || req.epoch != self.epoch {
            return self.resume_as_session_new(conn_id, None).await;
        }
        match self.replay.range_after(req.last_seq) {
            Ok(entries) => {
                let latest = self.replay.latest_seq().unwrap_or(req.last_seq);
                let replay: Vec<Envelope> = entries
                    .into_iter()
                    .map(|e| {
                        serde_json::from_slice(&e.envelope_bytes)
                            .expect("replay buffer only ever stores valid envelopes")
                    })
                    .collect();
                let snapshot = SnapshotData {
                    current_seq: latest,
                    finalized,
                    active_partials,
                };
                let snapshot_env = self.new_envelope(
                    MsgType::SessionSnapshot,
                    0,
                    serde_json::to_value(snapshot.clone()).expect("SnapshotData always serializes"),
                );
                let mut st = self.state.lock().await;
                let conn = conn_mut(&mut st, conn_id)?;
                conn.out_queue.offer(snapshot_env)?;
                for entry in &replay {
                    conn.out_queue.offer(entry.clone())?;
                }
                Ok(ResumeOutcome::Snapshot { snapshot, replay })
            }
            Err(ReplayError::GapTooLarge) => {
                self.resume_as_session_new(conn_id, Some("resume_gap".into())).await
            }
            Err(ReplayError::InvalidAckOrResume) => {
                let latest_seq = self.replay.latest_seq().unwrap_or(0);
                Err(EngineError::ResumeBeyondLatest {
                    last_seq: req.last_seq,
                    latest_seq,
                })
            }
        }
    }

    async fn resume_as_session_new(
        &self,
        conn_id: &str,
        reason: Option<String>,
    ) -> Result<ResumeOutcome, EngineError> {
        let env = self.new_envelope(
            MsgType::SessionNew,
            0,
            serde_json::to_value(SessionNewData {
                reason: reason.clone(),
            })
            .expect("SessionNewData always serializes"),
        );
        let mut st = self.state.lock().await;
        let conn = conn_mut(&mut st, conn_id)?;
        conn.out_queue.offer(env)?;
        Ok(ResumeOutcome::SessionNew { reason })
    }

    /// Build the `server.error{invalid_message}` + close path for a resume
    /// request whose `last_seq` is beyond anything ever produced (§4.5.5).
    pub fn build_error(&self, code: ErrorCode, detail: impl Into<String>) -> Envelope {
        self.new_envelope(
            MsgType::ServerError,
            0,
            serde_json::to_value(ErrorData::new(code, detail, None))
                .expect("ErrorData always serializes"),
        )
    }

    /// A malformed/out-of-protocol inbound message (§4.5.6): queue
    /// `server.error`, mark draining, and schedule a deferred close so the
    /// error has a chance to actually reach the client before teardown.
    pub async fn protocol_violation(
        &self,
        conn_id: &str,
        code: ErrorCode,
        detail: impl Into<String>,
    ) -> Result<(), EngineError> {
        let detail = detail.into();
        let err_env = self.build_error(code, detail.clone());
        let mut st = self.state.lock().await;
        let conn = conn_mut(&mut st, conn_id)?;
        conn.state = ConnState::Draining;
        let _ = conn.out_queue.offer(err_env);
        drop(st);
        let _ = self.close_tx.send(CloseNotice {
            conn_id: conn_id.to_string(),
            code: Some(code),
            detail,
            immediate: false,
        });
        Ok(())
    }

    /// Heartbeat-timeout sweep: closes any connection silent for longer than
    /// `hb_timeout_ms`. Intended to be driven by a periodic tick in the
    /// gateway's supervisor loop (§4.5.3).
    pub async fn sweep_heartbeat_timeouts(&self) -> Vec<String> {
        let timeout_ns = self.config.hb_timeout_ms * 1_000_000;
        let now = self.elapsed_mono_ns();
        let mut st = self.state.lock().await;
        let mut timed_out = Vec::new();
        for (conn_id, conn) in st.connections.iter_mut() {
            if conn.state == ConnState::Active
                && now.saturating_sub(conn.last_seen_mono_ns) > timeout_ns
            {
                conn.state = ConnState::Closed;
                timed_out.push(conn_id.clone());
            }
        }
        drop(st);
        for conn_id in &timed_out {
            let _ = self.close_tx.send(CloseNotice {
                conn_id: conn_id.clone(),
                code: Some(ErrorCode::HeartbeatTimeout),
                detail: "no inbound activity within hb_timeout_ms".into(),
                immediate: true,
            });
        }
        timed_out
    }

    pub async fn connection_state(&self, conn_id: &str) -> Option<ConnState> {
        self.state
            .lock()
            .await
            .connections
            .get(conn_id)
            .map(|c| c.state)
    }

    pub async fn active_connection_count(&self) -> usize {
        self.state
            .lock()
            .await
            .connections
            .values()
            .filter(|c| c.state == ConnState::Active)
            .count()
    }

    /// Session stop (§4.6, §4.7): mark every active connection draining so
    /// the writer loop sends whatever is already queued (including a
    /// `status{stopped}` from the caller's prior `publish`) and then closes,
    /// without treating the teardown as an error.
    pub async fn close_all_connections_gracefully(&self) {
        let mut st = self.state.lock().await;
        let mut ids = Vec::new();
        for (conn_id, conn) in st.connections.iter_mut() {
            if conn.state != ConnState::Closed {
                conn.state = ConnState::Draining;
                ids.push(conn_id.clone());
            }
        }
        drop(st);
        for conn_id in ids {
            let _ = self.close_tx.send(CloseNotice {
                conn_id,
                code: None,
                detail: "session stopped".into(),
                immediate: false,
            });
        }
    }

    pub async fn remove_connection(&self, conn_id: &str) {
        if let Some(conn) = self.state.lock().await.connections.remove(conn_id) {
            conn.out_queue.close();
        }
    }

    /// Defensive check for the class of bug spec §9 calls fatal-to-session:
    /// a connection whose ack counter has somehow overtaken its delivered
    /// counter. `handle_ack` rejects any such ack before it is recorded, so
    /// this should never trip; it exists for tests and the manager's audit.
    pub async fn check_invariants(&self) -> Result<(), EngineError> {
        let st = self.state.lock().await;
        for conn in st.connections.values() {
            if conn.last_ack_seq > conn.last_delivered_seq {
                return Err(EngineError::InvariantBreach(format!(
                    "last_ack_seq {} exceeds last_delivered_seq {}",
                    conn.last_ack_seq, conn.last_delivered_seq
                )));
            }
        }
        Ok(())
    }
}

fn conn_mut<'a>(st: &'a mut EngineState, conn_id: &str) -> Result<&'a mut Connection, EngineError> {
    st.connections
        .get_mut(conn_id)
        .ok_or_else(|| EngineError::UnknownConnection(conn_id.to_string()))
}

fn conn_ref<'a>(st: &'a EngineState, conn_id: &str) -> Result<&'a Connection, EngineError> {
    st.connections
        .get(conn_id)
        .ok_or_else(|| EngineError::UnknownConnection(conn_id.to_string()))
}

fn commit_type_for(t: MsgType) -> CommitType {
    match t {
        MsgType::AsrFinal => CommitType::Transcript,
        MsgType::MtFinal => CommitType::Translation,
        MsgType::Status => CommitType::Status,
        _ => unreachable!("publish() only commits is_commit_kind() types"),
    }
}

#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    SessionNew {
        reason: Option<String>,
    },
    Snapshot {
        snapshot: SnapshotData,
        replay: Vec<Envelope>,
    },
}

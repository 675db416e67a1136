//! Bridges external producers (ASR/MT) to a `ProtocolEngine` (spec §4.6).
//! Producer lifecycle (pause/resume/finalize/stop) lives here; sequencing,
//! delivery, and connection bookkeeping stay in the engine.

use crate::errors::EngineError;
use crate::protocol_engine::ProtocolEngine;
use loquilex_envelope::MsgType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Paused,
    Finalizing,
    Stopped,
}

pub struct StreamingSession {
    engine: Arc<ProtocolEngine>,
    state: Mutex<SessionState>,
    stop_requested: Arc<AtomicBool>,
    stop_deadline_ms: u64,
}

impl StreamingSession {
    pub fn new(engine: Arc<ProtocolEngine>, stop_deadline_ms: u64) -> Self {
        Self {
            engine,
            state: Mutex::new(SessionState::Starting),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_deadline_ms,
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Producers poll this cooperatively instead of being hard-cancelled
    /// (§5 "cascades to producers via a cooperative stop flag").
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub async fn mark_running(&self) -> Result<(), EngineError> {
        *self.state.lock().await = SessionState::Running;
        self.engine
            .publish(MsgType::Status, serde_json::json!({ "state": "running" }))
            .await?;
        Ok(())
    }

    /// Forward a producer event. Synchronous from the producer's
    /// perspective: returns once the envelope has a seq and is recorded,
    /// without waiting for any connection to receive it.
    pub async fn publish(
        &self,
        kind: MsgType,
        payload: serde_json::Value,
    ) -> Result<u64, EngineError> {
        self.engine.publish(kind, payload).await
    }

    /// A producer exception, isolated to this session: reported as a
    /// `status{severity=error}` envelope rather than propagated (§4.6, §7).
    pub async fn report_fault(&self, detail: impl Into<String>) {
        let env = self.engine.publish(
            MsgType::Status,
            serde_json::json!({ "state": "running", "severity": "error", "detail": detail.into() }),
        );
        if let Err(e) = env.await {
            tracing::warn!(error = %e, "failed to publish producer fault status");
        }
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        *self.state.lock().await = SessionState::Paused;
        self.engine
            .publish(MsgType::Status, serde_json::json!({ "state": "paused" }))
            .await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        *self.state.lock().await = SessionState::Running;
        self.engine
            .publish(MsgType::Status, serde_json::json!({ "state": "running" }))
            .await?;
        Ok(())
    }

    /// Flushes are the producer's responsibility (turning in-progress
    /// partials into finals); this only flips state and announces it.
    pub async fn finalize(&self) -> Result<(), EngineError> {
        *self.state.lock().await = SessionState::Finalizing;
        self.engine
            .publish(MsgType::Status, serde_json::json!({ "state": "finalized" }))
            .await?;
        Ok(())
    }

    /// Cooperative shutdown: raise the stop flag, give producers up to
    /// `stop_deadline_ms` to notice it and stop publishing, announce
    /// `status{stopped}`, then close every connection (§4.6, §5).
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        tokio::time::sleep(std::time::Duration::from_millis(self.stop_deadline_ms)).await;
        *self.state.lock().await = SessionState::Stopped;
        if let Err(e) = self
            .engine
            .publish(MsgType::Status, serde_json::json!({ "state": "stopped" }))
            .await
        {
            tracing::warn!(error = %e, "failed to publish session-stopped status");
        }
        self.engine.close_all_connections_gracefully().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::commit_log::CommitLog;
    use crate::protocol_engine::EngineConfig;
    use crate::replay_buffer::ReplayBuffer;
    use std::time::Duration;

    fn session() -> StreamingSession {
        let clock = Arc::new(ManualClock::new());
        let commit_log = Arc::new(CommitLog::new(100, 1_000_000, Duration::from_secs(3600), clock.clone()));
        let replay = Arc::new(ReplayBuffer::new(100, Duration::from_secs(60), clock.clone()));
        let (engine, _rx) = ProtocolEngine::new(
            "sid-1".into(),
            1,
            EngineConfig {
                hb_interval_ms: 1_000,
                hb_timeout_ms: 5_000,
                resume_window_secs: 60,
                max_in_flight: 32,
                max_msg_bytes: 64 * 1024,
                client_event_buffer: 16,
                drain_deadline_ms: 100,
            },
            clock,
            commit_log,
            replay,
        );
        StreamingSession::new(Arc::new(engine), 50)
    }

    #[tokio::test]
    async fn lifecycle_transitions_emit_status_events() {
        let session = session();
        let conn = session.engine().accept_connection().await.unwrap();
        conn.out_queue.poll().await; // welcome

        session.mark_running().await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
        assert_eq!(conn.out_queue.poll().await.unwrap().t, MsgType::Status);

        session.pause().await.unwrap();
        assert_eq!(session.state().await, SessionState::Paused);
        conn.out_queue.poll().await;

        session.resume().await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
        conn.out_queue.poll().await;

        session.finalize().await.unwrap();
        assert_eq!(session.state().await, SessionState::Finalizing);
    }

    #[tokio::test]
    async fn stop_raises_flag_and_closes_session() {
        let session = session();
        assert!(!session.stop_requested());
        session.stop().await;
        assert!(session.stop_requested());
        assert_eq!(session.state().await, SessionState::Stopped);
    }

    #[tokio::test]
    async fn producer_fault_is_reported_as_status_not_propagated() {
        let session = session();
        let conn = session.engine().accept_connection().await.unwrap();
        conn.out_queue.poll().await;
        session.report_fault("asr backend disconnected").await;
        let env = conn.out_queue.poll().await.unwrap();
        assert_eq!(env.t, MsgType::Status);
        let data: serde_json::Value = env.data;
        assert_eq!(data["severity"], "error");
    }
}

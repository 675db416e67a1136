//! Owns the set of live sessions: admission (device exclusivity, session
//! count cap), lifecycle proxies, and connection attach/detach (spec §4.7).

use crate::clock::Clock;
use crate::commit_log::CommitLog;
use crate::errors::AdmissionError;
use crate::protocol_engine::{CloseNotice, ConnectionHandle, EngineConfig, ProtocolEngine};
use crate::replay_buffer::ReplayBuffer;
use crate::streaming_session::StreamingSession;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    pub max_cuda_sessions: usize,
    /// If a CUDA-seeking start request finds the device semaphore exhausted:
    /// `true` silently continues on CPU, `false` fails with `ResourceBusy`.
    /// Not named by any `WS_*`/`MAX_CUDA_SESSIONS` env var in §6 -- left to
    /// the deployer; defaults to `false` (fail loud over a silent downgrade).
    pub auto_downgrade_cuda: bool,
    pub stop_deadline_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub resume_max_events: usize,
    pub session_max_commits: usize,
    pub session_max_size_bytes: usize,
    pub session_max_age_secs: u64,
    pub engine: EngineConfig,
}

#[derive(Default)]
pub struct StartRequest {
    pub wants_cuda: bool,
}

struct SessionEntry {
    session: Arc<StreamingSession>,
    close_rx: Option<mpsc::UnboundedReceiver<CloseNotice>>,
    _cuda_permit: Option<OwnedSemaphorePermit>,
}

pub struct SessionManager {
    config: SessionManagerConfig,
    clock: Arc<dyn Clock>,
    cuda: Arc<Semaphore>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, clock: Arc<dyn Clock>) -> Self {
        let cuda = Arc::new(Semaphore::new(config.max_cuda_sessions));
        Self {
            config,
            clock,
            cuda,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// §4.7 admission: session count cap, then device exclusivity.
    pub async fn start(&self, req: StartRequest) -> Result<String, AdmissionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(AdmissionError::SessionCapReached {
                max: self.config.max_sessions,
            });
        }

        let cuda_permit = if req.wants_cuda {
            match self.cuda.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) if self.config.auto_downgrade_cuda => None,
                Err(_) => {
                    return Err(AdmissionError::ResourceBusy {
                        requested_device: "cuda".into(),
                    })
                }
            }
        } else {
            None
        };

        let sid = uuid::Uuid::new_v4().to_string();
        let commit_log = Arc::new(CommitLog::new(
            self.config.session_max_commits,
            self.config.session_max_size_bytes,
            Duration::from_secs(self.config.session_max_age_secs),
            self.clock.clone(),
        ));
        let replay = Arc::new(ReplayBuffer::new(
            self.config.resume_max_events,
            Duration::from_secs(self.config.engine.resume_window_secs),
            self.clock.clone(),
        ));
        let (engine, close_rx) = ProtocolEngine::new(
            sid.clone(),
            1,
            self.config.engine,
            self.clock.clone(),
            commit_log,
            replay,
        );
        let session = Arc::new(StreamingSession::new(
            Arc::new(engine),
            self.config.stop_deadline_ms,
        ));
        sessions.insert(
            sid.clone(),
            SessionEntry {
                session,
                close_rx: Some(close_rx),
                _cuda_permit: cuda_permit,
            },
        );
        Ok(sid)
    }

    /// The gateway takes ownership of a session's `CloseNotice` stream
    /// exactly once, to drive socket teardown for that session's
    /// connections (mirrors the command-channel-per-forwarder shape).
    pub async fn take_close_receiver(
        &self,
        sid: &str,
    ) -> Option<mpsc::UnboundedReceiver<CloseNotice>> {
        self.sessions.write().await.get_mut(sid)?.close_rx.take()
    }

    pub async fn get(&self, sid: &str) -> Result<Arc<StreamingSession>, AdmissionError> {
        self.sessions
            .read()
            .await
            .get(sid)
            .map(|e| e.session.clone())
            .ok_or_else(|| AdmissionError::NotFound(sid.to_string()))
    }

    /// Thin lifecycle proxy (spec.md:199) alongside `pause`/`resume`/`finalize`:
    /// an out-of-band snapshot, independent of any connection's resume
    /// handshake.
    pub async fn snapshot(
        &self,
        sid: &str,
    ) -> Result<loquilex_envelope::SnapshotData, AdmissionError> {
        Ok(self.get(sid).await?.engine().snapshot().await)
    }

    pub async fn attach(&self, sid: &str) -> Result<ConnectionHandle, AdmissionError> {
        let session = self.get(sid).await?;
        session
            .engine()
            .accept_connection()
            .await
            .map_err(|_| AdmissionError::NotFound(sid.to_string()))
    }

    pub async fn detach(&self, sid: &str, conn_id: &str) -> Result<(), AdmissionError> {
        let session = self.get(sid).await?;
        session.engine().remove_connection(conn_id).await;
        Ok(())
    }

    pub async fn pause(&self, sid: &str) -> Result<(), AdmissionError> {
        self.get(sid)
            .await?
            .pause()
            .await
            .map_err(|_| AdmissionError::NotFound(sid.to_string()))
    }

    pub async fn resume(&self, sid: &str) -> Result<(), AdmissionError> {
        self.get(sid)
            .await?
            .resume()
            .await
            .map_err(|_| AdmissionError::NotFound(sid.to_string()))
    }

    pub async fn finalize(&self, sid: &str) -> Result<(), AdmissionError> {
        self.get(sid)
            .await?
            .finalize()
            .await
            .map_err(|_| AdmissionError::NotFound(sid.to_string()))
    }

    /// Idempotent: stopping an already-absent session reports `false`.
    pub async fn stop(&self, sid: &str) -> bool {
        let entry = self.sessions.write().await.remove(sid);
        match entry {
            Some(entry) => {
                entry.session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every live session concurrently, bounded by a global deadline,
    /// best-effort (§4.7).
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<StreamingSession>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();
        let handles: Vec<_> = sessions
            .into_iter()
            .map(|s| tokio::spawn(async move { s.stop().await }))
            .collect();
        let deadline = Duration::from_millis(self.config.shutdown_deadline_ms);
        let joined = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, joined).await.is_err() {
            tracing::warn!("session manager shutdown exceeded its deadline; some sessions may not have fully drained");
        }
    }
}

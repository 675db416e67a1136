//! Shared application state, threaded through the router exactly as the
//! teacher builds `AppState` once in `main.rs` and passes it to
//! `build_router` (spec §6, §4.7).

use loquilex_session_core::{CloseNotice, SessionManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::config::GatewayConfig;

type ConnWaiters = Mutex<HashMap<String, oneshot::Sender<CloseNotice>>>;

/// Per-session map from `conn_id` to the oneshot each connection task is
/// waiting on, fed by that session's single `CloseNotice` receiver.
/// Generalizes the teacher's `forwarder_command_senders: HashMap<String,
/// mpsc::Sender<ForwarderCommand>>` to a fan-in (one receiver) / fan-out
/// (one waiter per connection) shape instead of 1:1.
#[derive(Clone)]
pub struct GatewayState {
    pub sessions: Arc<SessionManager>,
    pub config: Arc<GatewayConfig>,
    waiters: Arc<RwLock<HashMap<String, Arc<ConnWaiters>>>>,
}

impl GatewayState {
    pub fn new(sessions: Arc<SessionManager>, config: Arc<GatewayConfig>) -> Self {
        Self {
            sessions,
            config,
            waiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawns the dispatcher task that drains a session's single
    /// `CloseNotice` receiver and routes each notice to the connection task
    /// waiting on it. Must be called exactly once per session, right after
    /// `SessionManager::start`.
    pub async fn spawn_close_dispatcher(&self, sid: &str) {
        let Some(mut close_rx) = self.sessions.take_close_receiver(sid).await else {
            return;
        };
        let registry: Arc<ConnWaiters> = Arc::new(Mutex::new(HashMap::new()));
        self.waiters
            .write()
            .await
            .insert(sid.to_owned(), registry.clone());
        tokio::spawn(async move {
            while let Some(notice) = close_rx.recv().await {
                if let Some(tx) = registry.lock().await.remove(&notice.conn_id) {
                    let _ = tx.send(notice);
                }
            }
        });
    }

    /// Registers this connection's interest in being told when the engine
    /// wants it torn down. Returns `None` if the session has no dispatcher
    /// (shouldn't happen for sessions created through this gateway).
    pub async fn register_close_waiter(
        &self,
        sid: &str,
        conn_id: &str,
    ) -> Option<oneshot::Receiver<CloseNotice>> {
        let registry = self.waiters.read().await.get(sid)?.clone();
        let (tx, rx) = oneshot::channel();
        registry.lock().await.insert(conn_id.to_owned(), tx);
        Some(rx)
    }

    /// Drops a still-pending waiter when the connection ends on its own
    /// (client disconnect, transport error) without ever being notified.
    pub async fn unregister_close_waiter(&self, sid: &str, conn_id: &str) {
        if let Some(registry) = self.waiters.read().await.get(sid) {
            registry.lock().await.remove(conn_id);
        }
    }

    pub async fn drop_session_dispatcher(&self, sid: &str) {
        self.waiters.write().await.remove(sid);
    }

    /// Periodically drives `ProtocolEngine::sweep_heartbeat_timeouts`, since
    /// nothing else in the gateway ever calls it otherwise (§4.5.3). Ticks at
    /// half the configured timeout and stops once the session is gone.
    pub fn spawn_heartbeat_sweeper(&self, sid: &str) {
        let sessions = self.sessions.clone();
        let sid = sid.to_owned();
        let period = Duration::from_millis((self.config.manager.engine.hb_timeout_ms / 2).max(25));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Ok(session) = sessions.get(&sid).await else {
                    break;
                };
                session.engine().sweep_heartbeat_timeouts().await;
            }
        });
    }
}

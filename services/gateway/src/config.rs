//! Environment-driven configuration (spec §6), following the teacher's
//! small-typed-config-built-from-env convention rather than a config-file
//! framework.

use loquilex_session_core::{EngineConfig, SessionManagerConfig};
use std::env;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    /// Serve a legacy `/events/{session_id}` alias alongside `/ws/{session_id}`.
    pub legacy_events_alias: bool,
    pub max_sessions: usize,
    pub manager: SessionManagerConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let hb_interval_ms = env_or("WS_HEARTBEAT_SEC", 5u64) * 1_000;
        let hb_timeout_ms = env_or("WS_HEARTBEAT_TIMEOUT_SEC", 15u64) * 1_000;
        let resume_window_secs = env_or("WS_RESUME_TTL", 10u64);
        let resume_max_events = env_or("WS_RESUME_MAX_EVENTS", 500usize);
        let max_in_flight = env_or("WS_MAX_IN_FLIGHT", 64u64);
        let max_msg_bytes = env_or("WS_MAX_MSG_BYTES", 131_072usize);
        let client_event_buffer = env_or("CLIENT_EVENT_BUFFER", 300usize);
        let session_max_commits = env_or("SESSION_MAX_COMMITS", 100usize);
        let session_max_size_bytes = env_or("SESSION_MAX_SIZE_BYTES", 1_048_576usize);
        let session_max_age_secs = env_or("SESSION_MAX_AGE_SECONDS", 3_600u64);
        let max_cuda_sessions = env_or("MAX_CUDA_SESSIONS", 1usize);
        let max_sessions = env_or("MAX_SESSIONS", 128usize);

        let engine = EngineConfig {
            hb_interval_ms,
            hb_timeout_ms,
            resume_window_secs,
            max_in_flight,
            max_msg_bytes,
            client_event_buffer,
            drain_deadline_ms: env_or("WS_DRAIN_DEADLINE_MS", 2_000u64),
        };

        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            legacy_events_alias: env_or("WS_LEGACY_EVENTS_ALIAS", false),
            max_sessions,
            manager: SessionManagerConfig {
                max_sessions,
                max_cuda_sessions,
                auto_downgrade_cuda: env_or("AUTO_DOWNGRADE_CUDA", false),
                stop_deadline_ms: env_or("SESSION_STOP_DEADLINE_MS", 2_000u64),
                shutdown_deadline_ms: env_or("SHUTDOWN_DEADLINE_MS", 5_000u64),
                resume_max_events,
                session_max_commits,
                session_max_size_bytes,
                session_max_age_secs,
                engine,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table_when_env_is_unset() {
        // SAFETY: tests run single-threaded within this module's harness;
        // no other test in this binary reads these same keys concurrently.
        for key in [
            "WS_HEARTBEAT_SEC",
            "WS_HEARTBEAT_TIMEOUT_SEC",
            "WS_RESUME_TTL",
            "WS_RESUME_MAX_EVENTS",
            "WS_MAX_IN_FLIGHT",
            "WS_MAX_MSG_BYTES",
            "CLIENT_EVENT_BUFFER",
            "SESSION_MAX_COMMITS",
            "SESSION_MAX_SIZE_BYTES",
            "SESSION_MAX_AGE_SECONDS",
            "MAX_CUDA_SESSIONS",
        ] {
            unsafe { env::remove_var(key) };
        }
        let cfg = GatewayConfig::from_env();
        assert_eq!(cfg.manager.engine.hb_interval_ms, 5_000);
        assert_eq!(cfg.manager.engine.hb_timeout_ms, 15_000);
        assert_eq!(cfg.manager.resume_max_events, 500);
        assert_eq!(cfg.manager.engine.max_in_flight, 64);
        assert_eq!(cfg.manager.engine.max_msg_bytes, 131_072);
        assert_eq!(cfg.manager.engine.client_event_buffer, 300);
        assert_eq!(cfg.manager.session_max_commits, 100);
        assert_eq!(cfg.manager.session_max_size_bytes, 1_048_576);
        assert_eq!(cfg.manager.session_max_age_secs, 3_600);
        assert_eq!(cfg.manager.max_cuda_sessions, 1);
    }
}

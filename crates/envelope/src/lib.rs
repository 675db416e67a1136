//! Wire schema for the LoquiLex session protocol: the `Envelope` type, the
//! closed set of message kinds, typed payload helpers, and the codec that
//! encodes/decodes/validates envelopes against size and version limits.
//!
//! Message kinds are namespaced dotted strings (`asr.partial`, `server.hb`,
//! ...) carried in the `t` field. `data` stays an opaque `serde_json::Value`
//! -- the codec never interprets it beyond size accounting, matching the
//! transport-layer opacity called for by the protocol.

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// The closed set of message kinds. Unknown `t` strings fail to deserialize,
/// which the codec turns into `EnvelopeError::UnknownType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    #[serde(rename = "server.welcome")]
    ServerWelcome,
    #[serde(rename = "server.hb")]
    ServerHb,
    #[serde(rename = "server.error")]
    ServerError,
    #[serde(rename = "server.ack")]
    ServerAck,
    #[serde(rename = "asr.partial")]
    AsrPartial,
    #[serde(rename = "asr.final")]
    AsrFinal,
    #[serde(rename = "mt.partial")]
    MtPartial,
    #[serde(rename = "mt.final")]
    MtFinal,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "session.snapshot")]
    SessionSnapshot,
    #[serde(rename = "session.new")]
    SessionNew,
    #[serde(rename = "session.ack")]
    SessionAck,
    #[serde(rename = "system.heartbeat")]
    SystemHeartbeat,
    #[serde(rename = "system.metrics")]
    SystemMetrics,
    #[serde(rename = "queue.drop")]
    QueueDrop,
    #[serde(rename = "client.hello")]
    ClientHello,
    #[serde(rename = "client.hb")]
    ClientHb,
    #[serde(rename = "client.ack")]
    ClientAck,
    #[serde(rename = "client.flow")]
    ClientFlow,
    #[serde(rename = "session.resume")]
    SessionResume,
}

impl MsgType {
    /// Only domain partials may be dropped under queue pressure (§4.1).
    pub fn is_droppable(self) -> bool {
        matches!(self, Self::AsrPartial | Self::MtPartial)
    }

    /// Domain events that flow through publish -> commit -> replay -> fan-out (§4.5.2).
    pub fn is_domain_publish(self) -> bool {
        matches!(
            self,
            Self::AsrPartial | Self::AsrFinal | Self::MtPartial | Self::MtFinal | Self::Status
        )
    }

    /// Finals and status are committed to the CommitLog; partials are not.
    pub fn is_commit_kind(self) -> bool {
        matches!(self, Self::AsrFinal | Self::MtFinal | Self::Status)
    }

    pub fn is_client_originated(self) -> bool {
        matches!(
            self,
            Self::ClientHello
                | Self::ClientHb
                | Self::ClientAck
                | Self::ClientFlow
                | Self::SessionResume
        )
    }
}

/// The sole wire unit (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub t: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
    pub t_wall: String,
    pub t_mono_ns: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Serialized size as it would cross the wire, used for the size policy in §4.4.
    pub fn wire_size(&self) -> Result<usize, EnvelopeError> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// §4.5.6 error taxonomy. `Display` text is suitable for `server.error.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Internal,
    BadRequest,
    InvalidMessage,
    InvalidAck,
    Unauthorized,
    NotFound,
    RateLimit,
    ResumeGap,
    ResumeExpired,
    HeartbeatTimeout,
    ProtocolVersionMismatch,
    QueueOverflow,
    MsgTooLarge,
}

impl ErrorCode {
    /// `retry_after_ms` is only ever set for these two codes (§4.5.6).
    pub fn carries_retry_hint(self) -> bool {
        matches!(self, Self::RateLimit | Self::ResumeExpired)
    }
}

/// Codec/validation failures (§4.4). Each maps to exactly one `ErrorCode`.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported schema version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    /// Outbound envelope rejected at the engine before it ever reaches the
    /// wire (§4.4) -- an internal sizing bug, not a client mistake.
    #[error("envelope of {size} bytes exceeds max_msg_bytes of {max}")]
    TooLarge { size: usize, max: usize },
    /// Inbound message rejected for size. Surfaced to the client as
    /// `server.error{invalid_message}`, not `msg_too_large` -- the latter is
    /// reserved for the engine's own outbound sizing bugs (§4.4).
    #[error("inbound envelope of {size} bytes exceeds max_msg_bytes of {max}")]
    InboundTooLarge { size: usize, max: usize },
}

impl EnvelopeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) => ErrorCode::InvalidMessage,
            Self::VersionMismatch { .. } => ErrorCode::ProtocolVersionMismatch,
            Self::TooLarge { .. } => ErrorCode::MsgTooLarge,
            Self::InboundTooLarge { .. } => ErrorCode::InvalidMessage,
        }
    }
}

/// Encode an outbound envelope, enforcing the size policy. Oversized outbound
/// envelopes are rejected here and never reach the replay buffer (§4.4).
pub fn encode_outbound(env: &Envelope, max_msg_bytes: usize) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = serde_json::to_vec(env)?;
    if bytes.len() > max_msg_bytes {
        return Err(EnvelopeError::TooLarge {
            size: bytes.len(),
            max: max_msg_bytes,
        });
    }
    Ok(bytes)
}

/// Decode and validate an inbound envelope: size, then schema version.
/// Unknown `t` and missing required fields surface as `EnvelopeError::Malformed`
/// (serde rejects them during deserialization); unknown fields are ignored by
/// default for forward compatibility.
pub fn decode_inbound(bytes: &[u8], max_msg_bytes: usize) -> Result<Envelope, EnvelopeError> {
    if bytes.len() > max_msg_bytes {
        return Err(EnvelopeError::InboundTooLarge {
            size: bytes.len(),
            max: max_msg_bytes,
        });
    }
    let env: Envelope = serde_json::from_slice(bytes)?;
    if env.v != SCHEMA_VERSION {
        return Err(EnvelopeError::VersionMismatch {
            found: env.v,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(env)
}

// ---------------------------------------------------------------------------
// Typed payload helpers for `data`. These are convenience views only -- the
// wire contract is the opaque JSON `data` field, not these Rust types.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HbLimits {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeWindow {
    pub seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLimits {
    pub max_in_flight: u64,
    pub max_msg_bytes: usize,
}

/// `server.welcome` payload (spec §4.5.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeData {
    pub hb: HbLimits,
    pub resume_window: ResumeWindow,
    pub limits: ConnectionLimits,
}

/// `server.hb` payload (§4.5.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub q_out: usize,
    pub q_in: usize,
    pub latency_ms_est: Option<u64>,
}

/// `server.error` payload (§4.5.6, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorData {
    pub fn new(code: ErrorCode, detail: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            code,
            detail: detail.into(),
            retry_after_ms: if code.carries_retry_hint() {
                retry_after_ms
            } else {
                None
            },
        }
    }
}

/// `client.ack` payload (§4.5.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAckData {
    pub ack_seq: u64,
}

/// `client.hello` payload (§4.5.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientHelloData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_mode: Option<String>,
}

/// `session.resume` payload (§4.5.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequestData {
    pub session_id: String,
    pub last_seq: u64,
    pub epoch: u64,
}

/// `session.new` payload (§4.5.5, §8 scenario 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNewData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `session.snapshot` payload (§4.5.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub current_seq: u64,
    pub finalized: Vec<serde_json::Value>,
    pub active_partials: Vec<serde_json::Value>,
}

/// `status` payload (§7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `queue.drop` payload -- informational, sent when a connection's outbound
/// queue drops a droppable envelope under pressure (§4.1, §8 scenario 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDropData {
    pub dropped_seq: u64,
    pub dropped_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: MsgType, seq: u64) -> Envelope {
        Envelope {
            v: SCHEMA_VERSION,
            t,
            sid: Some("abc".into()),
            id: format!("id-{seq}"),
            seq,
            corr: None,
            t_wall: "2026-07-31T00:00:00Z".into(),
            t_mono_ns: seq * 1_000_000,
            data: serde_json::json!({ "x": 1 }),
        }
    }

    #[test]
    fn round_trip_preserves_scalar_fields() {
        let env = sample(MsgType::AsrFinal, 4);
        let bytes = encode_outbound(&env, 1_000_000).unwrap();
        let back = decode_inbound(&bytes, 1_000_000).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn unknown_fields_are_tolerated_on_decode() {
        let json = serde_json::json!({
            "v": 1, "t": "asr.partial", "sid": "abc", "id": "id-1",
            "seq": 1, "t_wall": "2026-07-31T00:00:00Z", "t_mono_ns": 5,
            "data": {}, "future_field": "ignored"
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        let env = decode_inbound(&bytes, 1_000_000).unwrap();
        assert_eq!(env.t, MsgType::AsrPartial);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let json = serde_json::json!({
            "v": 1, "t": "bogus.kind", "id": "id-1",
            "seq": 1, "t_wall": "x", "t_mono_ns": 0, "data": {}
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        let err = decode_inbound(&bytes, 1_000_000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut env = sample(MsgType::Status, 1);
        env.v = 2;
        let bytes = serde_json::to_vec(&env).unwrap();
        let err = decode_inbound(&bytes, 1_000_000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolVersionMismatch);
    }

    #[test]
    fn oversized_outbound_envelope_is_rejected_before_replay() {
        let mut env = sample(MsgType::AsrPartial, 1);
        env.data = serde_json::json!({ "text": "x".repeat(100) });
        let err = encode_outbound(&env, 16).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MsgTooLarge);
    }

    #[test]
    fn oversized_inbound_envelope_is_rejected_as_invalid_message() {
        let env = sample(MsgType::ClientHb, 1);
        let bytes = serde_json::to_vec(&env).unwrap();
        let err = decode_inbound(&bytes, 4).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn droppable_classification_matches_policy() {
        assert!(MsgType::AsrPartial.is_droppable());
        assert!(MsgType::MtPartial.is_droppable());
        assert!(!MsgType::AsrFinal.is_droppable());
        assert!(!MsgType::ServerError.is_droppable());
        assert!(!MsgType::ServerHb.is_droppable());
    }

    #[test]
    fn error_data_only_carries_retry_hint_for_rate_limit_and_resume_expired() {
        let rl = ErrorData::new(ErrorCode::RateLimit, "slow down", Some(500));
        assert_eq!(rl.retry_after_ms, Some(500));
        let internal = ErrorData::new(ErrorCode::Internal, "oops", Some(500));
        assert_eq!(internal.retry_after_ms, None);
    }
}

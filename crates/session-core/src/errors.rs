//! Shared error kinds at task/engine boundaries (spec §7, §9: "sum-typed
//! results at all task boundaries; a central error kind enum matches §4.5.6
//! codes").

use loquilex_envelope::{EnvelopeError, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Queue(#[from] crate::bounded_queue::QueueError),
    #[error(transparent)]
    Replay(#[from] crate::replay_buffer::ReplayError),
    #[error("unknown connection id {0}")]
    UnknownConnection(String),
    #[error("ack_seq {ack_seq} is beyond last_delivered_seq {last_delivered_seq}")]
    InvalidAck { ack_seq: u64, last_delivered_seq: u64 },
    #[error("resume last_seq {last_seq} is beyond latest produced seq {latest_seq}")]
    ResumeBeyondLatest { last_seq: u64, latest_seq: u64 },
    #[error("engine invariant breached: {0}")]
    InvariantBreach(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Envelope(e) => e.code(),
            Self::Queue(crate::bounded_queue::QueueError::Overflow) => ErrorCode::QueueOverflow,
            Self::Queue(crate::bounded_queue::QueueError::Closed) => ErrorCode::Internal,
            Self::Replay(crate::replay_buffer::ReplayError::GapTooLarge) => ErrorCode::ResumeGap,
            Self::Replay(crate::replay_buffer::ReplayError::InvalidAckOrResume) => {
                ErrorCode::InvalidMessage
            }
            Self::UnknownConnection(_) => ErrorCode::NotFound,
            Self::InvalidAck { .. } => ErrorCode::InvalidAck,
            Self::ResumeBeyondLatest { .. } => ErrorCode::InvalidMessage,
            Self::InvariantBreach(_) => ErrorCode::Internal,
        }
    }
}

/// Admission/lifecycle errors surfaced by `SessionManager` (spec §4.7).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("resource busy: requested_device={requested_device}")]
    ResourceBusy { requested_device: String },
    #[error("session count cap of {max} reached")]
    SessionCapReached { max: usize },
    #[error("session {0} not found")]
    NotFound(String),
}

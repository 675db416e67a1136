//! Transport-agnostic core of the LoquiLex session protocol: bounded
//! queues, replay/commit logs, the per-session protocol state machine, and
//! session lifecycle/admission. No networking lives here -- a gateway
//! service wires this to WebSocket sockets.

pub mod bounded_queue;
pub mod clock;
pub mod commit_log;
pub mod errors;
pub mod protocol_engine;
pub mod replay_buffer;
pub mod session_manager;
pub mod streaming_session;

pub use bounded_queue::{BoundedQueue, Droppable, OfferOutcome, QueueError, QueueMetricsSnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit_log::{CommitLog, CommitRecord, CommitType, CommitLogStats, QueryOpts};
pub use errors::{AdmissionError, EngineError};
pub use protocol_engine::{
    AckMode, CloseNotice, ConnState, ConnectionHandle, EngineConfig, ProtocolEngine, ResumeOutcome,
};
pub use replay_buffer::{ReplayBuffer, ReplayEntry, ReplayError};
pub use session_manager::{SessionManager, SessionManagerConfig, StartRequest};
pub use streaming_session::{SessionState, StreamingSession};

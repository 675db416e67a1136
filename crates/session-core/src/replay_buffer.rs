//! Bounded ring of recently emitted envelopes enabling resume after
//! transient disconnects (spec §4.2).

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub seq: u64,
    pub envelope_bytes: Vec<u8>,
    pub t_mono_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// `last_seq` is older than anything the buffer retains; caller should
    /// respond with `session.new{reason: "resume_gap"}`.
    #[error("requested replay from seq older than earliest retained entry")]
    GapTooLarge,
    /// `last_seq` is beyond what has ever been produced.
    #[error("requested replay seq is beyond the latest produced seq")]
    InvalidAckOrResume,
}

pub struct ReplayBuffer {
    max_events: usize,
    ttl_ns: u64,
    clock: Arc<dyn Clock>,
    entries: Mutex<VecDeque<ReplayEntry>>,
}

impl ReplayBuffer {
    pub fn new(max_events: usize, resume_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        assert!(max_events > 0, "ReplayBuffer capacity must be positive");
        Self {
            max_events,
            ttl_ns: resume_ttl.as_nanos() as u64,
            clock,
            entries: Mutex::new(VecDeque::with_capacity(max_events)),
        }
    }

    /// Append; enforce size and TTL limits relative to "now" (§4.2).
    pub fn record(&self, seq: u64, envelope_bytes: Vec<u8>, t_mono_ns: u64) {
        let mut q = self.entries.lock().unwrap();
        q.push_back(ReplayEntry {
            seq,
            envelope_bytes,
            t_mono_ns,
        });
        self.evict_locked(&mut q);
    }

    fn evict_locked(&self, q: &mut VecDeque<ReplayEntry>) {
        let now = self.clock.mono_ns();
        while let Some(front) = q.front() {
            if now.saturating_sub(front.t_mono_ns) > self.ttl_ns {
                q.pop_front();
            } else {
                break;
            }
        }
        while q.len() > self.max_events {
            q.pop_front();
        }
    }

    pub fn earliest_seq(&self) -> Option<u64> {
        self.entries.lock().unwrap().front().map(|e| e.seq)
    }

    pub fn latest_seq(&self) -> Option<u64> {
        self.entries.lock().unwrap().back().map(|e| e.seq)
    }

    /// Envelopes with `seq > last_seq`, in seq order (§4.2, §8 P3/P7).
    pub fn range_after(&self, last_seq: u64) -> Result<Vec<ReplayEntry>, ReplayError> {
        let q = self.entries.lock().unwrap();
        let (Some(earliest), Some(latest)) = (q.front().map(|e| e.seq), q.back().map(|e| e.seq))
        else {
            return if last_seq == 0 {
                Ok(Vec::new())
            } else {
                Err(ReplayError::InvalidAckOrResume)
            };
        };
        if last_seq > latest {
            return Err(ReplayError::InvalidAckOrResume);
        }
        if last_seq + 1 < earliest {
            return Err(ReplayError::GapTooLarge);
        }
        Ok(q.iter()
            .filter(|e| e.seq > last_seq)
            .cloned()
            .collect())
    }
}

//! Append-only per-session ordered log of domain commits, bounded by
//! count/bytes/age, used by snapshot reads (spec §4.3).

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitType {
    Transcript,
    Translation,
    Status,
}

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub id: String,
    pub seq: u64,
    pub t_mono_ns: u64,
    pub kind: CommitType,
    pub data: serde_json::Value,
    bytes: usize,
}

impl CommitRecord {
    pub fn new(id: String, seq: u64, t_mono_ns: u64, kind: CommitType, data: serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(&data).map(|b| b.len()).unwrap_or(0);
        Self {
            id,
            seq,
            t_mono_ns,
            kind,
            data,
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOpts {
    pub kind: Option<CommitType>,
    pub since_t_mono_ns: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitLogStats {
    pub count: usize,
    pub bytes: usize,
    pub oldest_t_mono_ns: Option<u64>,
}

pub struct CommitLog {
    max_commits: usize,
    max_bytes: usize,
    max_age_ns: u64,
    clock: Arc<dyn Clock>,
    records: Mutex<VecDeque<CommitRecord>>,
}

impl CommitLog {
    pub fn new(max_commits: usize, max_bytes: usize, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_commits,
            max_bytes,
            max_age_ns: max_age.as_nanos() as u64,
            clock,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Caller assigns `seq` (the envelope's seq); the log never mints one.
    pub fn append(&self, record: CommitRecord) {
        let mut q = self.records.lock().unwrap();
        q.push_back(record);
        self.evict_locked(&mut q);
    }

    /// Apply size/count/age policy until within bounds. Strictly oldest-first.
    pub fn evict(&self) {
        let mut q = self.records.lock().unwrap();
        self.evict_locked(&mut q);
    }

    fn evict_locked(&self, q: &mut VecDeque<CommitRecord>) {
        let now = self.clock.mono_ns();
        loop {
            let over_count = q.len() > self.max_commits;
            let over_bytes = self.total_bytes_locked(q) > self.max_bytes;
            let over_age = q
                .front()
                .is_some_and(|r| now.saturating_sub(r.t_mono_ns) > self.max_age_ns);
            if over_count || over_bytes || over_age {
                if q.pop_front().is_none() {
                    break;
                }
            } else {
                break;
            }
        }
    }

    fn total_bytes_locked(&self, q: &VecDeque<CommitRecord>) -> usize {
        q.iter().map(|r| r.bytes).sum()
    }

    pub fn query(&self, opts: QueryOpts) -> Vec<CommitRecord> {
        let q = self.records.lock().unwrap();
        let mut out: Vec<CommitRecord> = q
            .iter()
            .filter(|r| opts.kind.is_none_or(|k| r.kind == k))
            .filter(|r| opts.since_t_mono_ns.is_none_or(|t| r.t_mono_ns >= t))
            .cloned()
            .collect();
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        out
    }

    pub fn stats(&self) -> CommitLogStats {
        let q = self.records.lock().unwrap();
        CommitLogStats {
            count: q.len(),
            bytes: self.total_bytes_locked(&q),
            oldest_t_mono_ns: q.front().map(|r| r.t_mono_ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn log(max_commits: usize, max_bytes: usize, max_age_secs: u64) -> (CommitLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let log = CommitLog::new(max_commits, max_bytes, Duration::from_secs(max_age_secs), clock.clone());
        (log, clock)
    }

    fn record(id: &str, seq: u64, t_mono_ns: u64, kind: CommitType) -> CommitRecord {
        CommitRecord::new(id.into(), seq, t_mono_ns, kind, serde_json::json!({"text": "hi"}))
    }

    #[test]
    fn count_bound_evicts_oldest_first() {
        let (log, _clock) = log(2, 1_000_000, 3600);
        log.append(record("a", 1, 0, CommitType::Status));
        log.append(record("b", 2, 1, CommitType::Status));
        log.append(record("c", 3, 2, CommitType::Status));
        let stats = log.stats();
        assert_eq!(stats.count, 2);
        let seqs: Vec<u64> = log.query(QueryOpts::default()).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn byte_bound_is_never_exceeded_after_append() {
        let (log, _clock) = log(1000, 40, 3600);
        for seq in 1..=10u64 {
            log.append(record("r", seq, seq, CommitType::Transcript));
            assert!(log.stats().bytes <= 40);
        }
    }

    #[test]
    fn age_bound_evicts_after_max_age() {
        let (log, clock) = log(1000, 1_000_000, 10);
        log.append(record("old", 1, clock.mono_ns(), CommitType::Status));
        clock.advance(Duration::from_secs(11));
        log.append(record("new", 2, clock.mono_ns(), CommitType::Status));
        let seqs: Vec<u64> = log.query(QueryOpts::default()).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2]);
    }

    #[test]
    fn query_filters_by_type_and_since_and_respects_limit() {
        let (log, _clock) = log(1000, 1_000_000, 3600);
        log.append(record("a", 1, 0, CommitType::Transcript));
        log.append(record("b", 2, 5, CommitType::Translation));
        log.append(record("c", 3, 10, CommitType::Transcript));
        let filtered = log.query(QueryOpts {
            kind: Some(CommitType::Transcript),
            since_t_mono_ns: Some(1),
            limit: Some(1),
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "c");
    }
}

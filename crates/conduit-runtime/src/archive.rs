//! Destination for finished run records.

use std::collections::VecDeque;

use conduit_core::ids::{RunId, UserId};
use parking_lot::Mutex;
use tracing::debug;

use crate::record::RunRecord;

/// Receives every run record once it reaches a terminal status.
pub trait RunArchive: Send + Sync {
    /// Store a finished record. Must not block.
    fn archive(&self, record: RunRecord);
}

/// Bounded in-memory archive. Oldest records are evicted first.
pub struct MemoryRunArchive {
    capacity: usize,
    records: Mutex<VecDeque<RunRecord>>,
}

impl MemoryRunArchive {
    /// Archive holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// The most recent records of `user_id`, newest first.
    pub fn recent(&self, user_id: &UserId, limit: usize) -> Vec<RunRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.user_id == *user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Look up one record.
    pub fn find(&self, run_id: &RunId) -> Option<RunRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.run_id == *run_id)
            .cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RunArchive for MemoryRunArchive {
    fn archive(&self, record: RunRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            let _ = records.pop_front();
        }
        debug!(run_id = %record.run_id, status = record.status.as_str(), "run archived");
        records.push_back(record);
    }
}

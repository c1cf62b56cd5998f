//! Participant-side registry of soft-committed processors, keyed by request id
//!
//! Finalized request ids are remembered (up to a bounded history) so a
//! redelivered write, COMMIT or ROLLBACK for a finished request is a no-op.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::txn::processor::Processor;

/// Finished request ids kept for duplicate detection.
pub const FINISHED_HISTORY: usize = 8192;

pub struct ProcessorStore {
    processors: DashMap<String, Box<dyn Processor>>,
    finished: DashSet<String>,
    finished_order: Mutex<VecDeque<String>>,
    history: usize,
}

impl Default for ProcessorStore {
    fn default() -> Self {
        Self::with_history(FINISHED_HISTORY)
    }
}

impl ProcessorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            processors: DashMap::new(),
            finished: DashSet::new(),
            finished_order: Mutex::new(VecDeque::new()),
            history: history.max(1),
        }
    }

    /// Register `processor` under `request_id`. When the id is already
    /// registered or already finished, the processor is handed back so the
    /// caller can undo its soft commit.
    pub fn register(
        &self,
        request_id: &str,
        processor: Box<dyn Processor>,
    ) -> std::result::Result<(), Box<dyn Processor>> {
        match self.processors.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                warn!("Processor already registered for request {}", request_id);
                Err(processor)
            }
            Entry::Vacant(_) if self.finished.contains(request_id) => {
                warn!("Request {} already finished, refusing to register", request_id);
                Err(processor)
            }
            Entry::Vacant(slot) => {
                slot.insert(processor);
                debug!("Registered processor for request {}", request_id);
                Ok(())
            }
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.processors.contains_key(request_id)
    }

    pub fn is_finished(&self, request_id: &str) -> bool {
        self.finished.contains(request_id)
    }

    /// Registered or finished: a write for this id must not run again.
    pub fn is_known(&self, request_id: &str) -> bool {
        self.contains(request_id) || self.is_finished(request_id)
    }

    /// Atomically remove and return the processor, recording the request as
    /// finished. A second call for the same request id returns `None`.
    pub fn get_and_unregister(&self, request_id: &str) -> Option<Box<dyn Processor>> {
        match self.processors.entry(request_id.to_string()) {
            Entry::Occupied(slot) => {
                self.mark_finished(request_id);
                Some(slot.remove())
            }
            Entry::Vacant(_) => None,
        }
    }

    fn mark_finished(&self, request_id: &str) {
        if !self.finished.insert(request_id.to_string()) {
            return;
        }
        let mut order = self
            .finished_order
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        order.push_back(request_id.to_string());
        while order.len() > self.history {
            if let Some(oldest) = order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

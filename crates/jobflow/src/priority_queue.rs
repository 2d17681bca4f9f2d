//! In-process staging area for claimed-but-not-yet-running jobs (§4.6). Ordering key is
//! `(next_run_at ASC, priority DESC)`; the processor pops from the right (next due).

use std::collections::HashSet;

use crate::job::{JobId, JobRecord};

pub struct PriorityQueue {
    items: Vec<JobRecord>,
    handled: HashSet<JobId>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            handled: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn order_key(job: &JobRecord) -> (std::cmp::Reverse<chrono::DateTime<chrono::Utc>>, i32) {
        let at = job.next_run_at.unwrap_or(job.created_at);
        (std::cmp::Reverse(at), job.priority)
    }

    /// Insert keeping the vector sorted ascending by `order_key`, so the next-due job is the
    /// last element (cheap to pop from the right).
    pub fn insert(&mut self, job: JobRecord) {
        let key = Self::order_key(&job);
        let pos = self
            .items
            .binary_search_by(|probe| Self::order_key(probe).cmp(&key))
            .unwrap_or_else(|e| e);
        self.items.insert(pos, job);
    }

    /// Remove by job id (the "remove-by-identity, with id fallback" operation from §4.6).
    pub fn remove(&mut self, id: JobId) -> Option<JobRecord> {
        let pos = self.items.iter().position(|j| j.id == id)?;
        self.handled.remove(&id);
        Some(self.items.remove(pos))
    }

    /// Pop the rightmost (next due) job unconditionally.
    pub fn pop_next(&mut self) -> Option<JobRecord> {
        let job = self.items.pop()?;
        self.handled.remove(&job.id);
        Some(job)
    }

    /// Scan right-to-left for the next job whose kind still has a free concurrency slot and
    /// that hasn't already been handled in the current admission pass. Returns the index so the
    /// caller can remove it once execution is actually admitted.
    pub fn find_next_runnable<F>(&self, mut has_slot: F) -> Option<usize>
    where
        F: FnMut(&str) -> bool,
    {
        for idx in (0..self.items.len()).rev() {
            let job = &self.items[idx];
            if self.handled.contains(&job.id) {
                continue;
            }
            if has_slot(&job.name) {
                return Some(idx);
            }
        }
        None
    }

    pub fn take_at(&mut self, idx: usize) -> JobRecord {
        let job = self.items.remove(idx);
        self.handled.remove(&job.id);
        job
    }

    pub fn mark_handled(&mut self, id: JobId) {
        self.handled.insert(id);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.items.iter().any(|j| j.id == id)
    }

    /// Reset the handled set at the start of a new admission pass (tick or notification wake),
    /// so a job denied a slot this pass is eligible again on the next one.
    pub fn clear_handled(&mut self) {
        self.handled.clear();
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

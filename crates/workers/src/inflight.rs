//! Process-wide dedupe of URLs currently being worked on, keyed by
//! `(job_id, fingerprint)`. This collapses simultaneous rediscovery; the
//! queue's coalescing and the catalog handle the durable layers.

use dashmap::DashSet;

#[derive(Default)]
pub struct InFlightIndex {
    entries: DashSet<(String, String)>,
}

impl InFlightIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(job_id, fingerprint)`. Returns a guard that releases the
    /// claim on drop, or None if the pair is already in flight. Dropping the
    /// guard covers every exit path, including a handler dropped by its
    /// timeout.
    pub fn admit(&self, job_id: &str, fingerprint: &str) -> Option<InFlightGuard<'_>> {
        let key = (job_id.to_owned(), fingerprint.to_owned());
        if self.entries.insert(key.clone()) {
            Some(InFlightGuard { index: self, key })
        } else {
            None
        }
    }

    pub fn contains(&self, job_id: &str, fingerprint: &str) -> bool {
        self.entries
            .contains(&(job_id.to_owned(), fingerprint.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct InFlightGuard<'a> {
    index: &'a InFlightIndex,
    key: (String, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.index.entries.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_admit_rejected_until_guard_drops() {
        let index = InFlightIndex::new();
        let guard = index.admit("job", "fp").unwrap();
        assert!(index.admit("job", "fp").is_none());
        assert_eq!(index.len(), 1);

        drop(guard);
        assert!(index.admit("job", "fp").is_some());
    }

    #[test]
    fn jobs_are_independent() {
        let index = InFlightIndex::new();
        let _a = index.admit("job-a", "fp").unwrap();
        let _b = index.admit("job-b", "fp").unwrap();
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_admits_allow_exactly_one() {
        let index = Arc::new(InFlightIndex::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let index = Arc::clone(&index);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                let guard = index.admit("job", "fp");
                // hold the claim until everyone has tried
                barrier.wait().await;
                guard.is_some()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}

//! Per-request node completion bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Tracks which nodes of a single flow execution have completed and
/// serializes the critical section of each node. Completion bits are dense
/// atomics keyed by node index; one async mutex per node guards the
/// check-execute-mark sequence against duplicate activations.
#[derive(Debug, Default)]
pub struct Tracker {
    met: Vec<AtomicBool>,
    locks: Vec<Mutex<()>>,
}

impl Tracker {
    pub fn new(nodes: usize) -> Self {
        Self {
            met: (0..nodes).map(|_| AtomicBool::new(false)).collect(),
            locks: (0..nodes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Reports whether every listed node has completed.
    pub fn met_all(&self, nodes: &[usize]) -> bool {
        nodes.iter().all(|&index| self.met(index))
    }

    /// Reports whether a single node has completed.
    pub fn met(&self, index: usize) -> bool {
        self.met[index].load(Ordering::Acquire)
    }

    /// Marks a node as completed.
    pub fn mark(&self, index: usize) {
        self.met[index].store(true, Ordering::Release);
    }

    /// Acquires the node's activation lock.
    pub async fn lock(&self, index: usize) -> MutexGuard<'_, ()> {
        self.locks[index].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_met() {
        let tracker = Tracker::new(3);
        assert!(!tracker.met(0));
        assert!(tracker.met_all(&[]));

        tracker.mark(0);
        tracker.mark(2);

        assert!(tracker.met(0));
        assert!(!tracker.met(1));
        assert!(tracker.met_all(&[0, 2]));
        assert!(!tracker.met_all(&[0, 1, 2]));
    }

    #[tokio::test]
    async fn test_lock_serializes() {
        let tracker = Tracker::new(1);
        let guard = tracker.lock(0).await;
        assert!(tracker.locks[0].try_lock().is_err());
        drop(guard);
        assert!(tracker.locks[0].try_lock().is_ok());
    }
}

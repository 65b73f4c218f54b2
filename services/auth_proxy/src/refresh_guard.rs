//! Per-subject single-flight guard for token refresh
//!
//! Refresh tokens are single use, so two refreshes for the same subject must
//! never overlap. Each subject gets its own async mutex; unrelated subjects do
//! not contend. The guard is process-local.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
pub struct RefreshGuard {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RefreshGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other refresh for `subject_id` is running.
    pub async fn lock(&self, subject_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries nobody else holds can go.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(subject_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_subject_is_serialized() {
        let guard = RefreshGuard::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let guard = guard.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _held = guard.lock("subject-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_subjects_do_not_wait() {
        let guard = RefreshGuard::new();
        let _held = guard.lock("subject-1").await;

        let other = tokio::time::timeout(Duration::from_millis(100), guard.lock("subject-2")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let guard = RefreshGuard::new();
        drop(guard.lock("subject-1").await);
        drop(guard.lock("subject-2").await);
        assert_eq!(guard.tracked().await, 1);
    }
}

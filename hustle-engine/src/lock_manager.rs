//! Ring-1 lock manager
//!
//! Advisory in-process leases that serialize money-touching operations on a
//! resource (`task:<uuid>`, `user:<uuid>`) before they ever reach the
//! database row lock. The storage-level `SELECT ... FOR UPDATE` on
//! `money_state_lock` remains the final authority; these leases only cut
//! contention and give fast `Busy` answers.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use tracing::debug;

use hustle_core::{CoreError, CoreResult};

#[derive(Debug, Clone)]
struct LeaseState {
    tx_id: String,
    expires_at: Instant,
}

/// Application-level resource locks with TTL and deadlock-safe batch acquire.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    leases: Arc<RwLock<HashMap<String, LeaseState>>>,
}

/// RAII hold over one or more resources; releases on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    manager: LockManager,
    resources: Vec<String>,
    tx_id: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        for resource in &self.resources {
            self.manager.release(resource, &self.tx_id).ok();
        }
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire one resource or fail with `Busy` (a concurrency conflict).
    pub fn acquire(&self, resource: &str, tx_id: &str, ttl: Duration) -> CoreResult<LeaseGuard> {
        self.acquire_batch(&[resource.to_string()], tx_id, ttl)
    }

    /// All-or-nothing batch acquire.
    ///
    /// Resource ids are sorted lexicographically before locking so two
    /// batches can never deadlock against each other; if any single
    /// resource is held by another tx the whole batch fails closed.
    pub fn acquire_batch(
        &self,
        resources: &[String],
        tx_id: &str,
        ttl: Duration,
    ) -> CoreResult<LeaseGuard> {
        let mut sorted: Vec<String> = resources.to_vec();
        sorted.sort();
        sorted.dedup();

        let now = Instant::now();
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());

        for resource in &sorted {
            if let Some(existing) = leases.get(resource) {
                if existing.expires_at > now && existing.tx_id != tx_id {
                    return Err(CoreError::ConcurrencyConflict(format!(
                        "resource {resource} is busy (held by {})",
                        existing.tx_id
                    )));
                }
            }
        }

        for resource in &sorted {
            leases.insert(
                resource.clone(),
                LeaseState {
                    tx_id: tx_id.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        debug!(?sorted, tx_id, "leases acquired");

        Ok(LeaseGuard {
            manager: self.clone(),
            resources: sorted,
            tx_id: tx_id.to_string(),
        })
    }

    /// Release one resource; only the owning tx may do so.
    pub fn release(&self, resource: &str, tx_id: &str) -> CoreResult<()> {
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());
        match leases.get(resource) {
            Some(existing) if existing.tx_id == tx_id => {
                leases.remove(resource);
                Ok(())
            }
            Some(_) => Err(CoreError::ConcurrencyConflict(format!(
                "resource {resource} is not owned by {tx_id}"
            ))),
            None => Ok(()),
        }
    }

    /// Drop every expired lease; returns how many were collected.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at > now);
        before - leases.len()
    }

    /// Background sweeper for expired leases.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = manager.sweep_expired();
                if swept > 0 {
                    debug!(swept, "expired leases collected");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn second_owner_is_busy() {
        let locks = LockManager::new();
        let _guard = locks.acquire("task:a", "tx-1", TTL).unwrap();
        let err = locks.acquire("task:a", "tx-2", TTL).unwrap_err();
        assert_eq!(err.code(), "concurrency_conflict");
    }

    #[test]
    fn drop_releases() {
        let locks = LockManager::new();
        {
            let _guard = locks.acquire("task:a", "tx-1", TTL).unwrap();
        }
        assert!(locks.acquire("task:a", "tx-2", TTL).is_ok());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let locks = LockManager::new();
        let _held = locks.acquire("task:b", "tx-1", TTL).unwrap();

        let err = locks
            .acquire_batch(
                &["task:c".to_string(), "task:b".to_string(), "task:a".to_string()],
                "tx-2",
                TTL,
            )
            .unwrap_err();
        assert_eq!(err.code(), "concurrency_conflict");

        // Nothing from the failed batch may be held.
        assert!(locks.acquire("task:a", "tx-3", TTL).is_ok());
        assert!(locks.acquire("task:c", "tx-3", TTL).is_ok());
    }

    #[test]
    fn expired_leases_are_swept_and_reacquirable() {
        let locks = LockManager::new();
        let guard = locks
            .acquire("task:a", "tx-1", Duration::from_millis(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(locks.acquire("task:a", "tx-2", TTL).is_ok());
        drop(guard);
    }

    #[test]
    fn only_owner_releases() {
        let locks = LockManager::new();
        let guard = locks.acquire("task:a", "tx-1", TTL).unwrap();
        assert!(locks.release("task:a", "tx-2").is_err());
        drop(guard);
    }
}

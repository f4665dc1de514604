//! Background Scheduler
//!
//! Named periodic loops with persisted (last_run_at, next_run_at, enabled).
//! Each tick claims a due loop by compare-and-swap on next_run_at, which
//! guarantees at-most-one-in-flight per loop even across processes. Failures
//! log and do not advance last_run_at but do advance next_run_at (no
//! hot-loop on permanent failure); after the configured consecutive-failure
//! limit the loop auto-disables.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::model::LoopState;
use crate::storage::Storage;

/// A loop handler: owns its captures, runs to completion per invocation
pub type LoopHandler =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// A named periodic unit
pub struct LoopDef {
    pub name: &'static str,
    pub cadence: Duration,
    pub handler: LoopHandler,
}

/// Drives the registered loops against the persisted loop table
pub struct Scheduler {
    storage: Arc<Storage>,
    loops: Vec<LoopDef>,
    failure_limit: u32,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, failure_limit: u32) -> Self {
        Self {
            storage,
            loops: Vec::new(),
            failure_limit,
        }
    }

    /// Register a loop. First run is one cadence out, and persisted state
    /// from earlier runs wins over re-registration.
    pub fn register<F, Fut>(&mut self, name: &'static str, cadence: Duration, f: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.storage.ensure_loop(name, Utc::now() + cadence)?;
        self.loops.push(LoopDef {
            name,
            cadence,
            handler: Arc::new(move || Box::pin(f())),
        });
        Ok(())
    }

    pub fn loop_states(&self) -> Result<Vec<LoopState>> {
        self.storage.loop_states()
    }

    /// One pass: claim and run every due loop
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let due = self.storage.due_loops(now)?;
        for state in due {
            let Some(def) = self.loops.iter().find(|d| d.name == state.name) else {
                continue;
            };
            let next = now + def.cadence;
            // The claim is the mutual exclusion: a loser sees zero rows
            if !self.storage.claim_loop(def.name, state.next_run_at, next)? {
                continue;
            }
            match (def.handler)().await {
                Ok(()) => {
                    self.storage.finish_loop(def.name, now, next)?;
                    tracing::debug!(name = def.name, "loop finished");
                }
                Err(e) => {
                    let failures =
                        self.storage.fail_loop(def.name, next, self.failure_limit)?;
                    tracing::warn!(
                        name = def.name,
                        failures,
                        "loop failed: {e:?}"
                    );
                    if failures >= self.failure_limit {
                        tracing::warn!(name = def.name, "loop auto-disabled");
                    }
                }
            }
        }
        Ok(())
    }

    /// Tick forever at `poll`; the driving task owns the schedule
    pub async fn run(self: Arc<Self>, poll: std::time::Duration) {
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!("scheduler tick failed: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler() -> (tempfile::TempDir, Arc<Storage>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("s.db"))).unwrap());
        let scheduler = Scheduler::new(Arc::clone(&storage), 5);
        (dir, storage, scheduler)
    }

    #[tokio::test]
    async fn due_loop_runs_once_per_claim() {
        let (_dir, storage, mut scheduler) = scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        scheduler
            .register("counter", Duration::hours(1), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        // Not yet due
        scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let later = Utc::now() + Duration::hours(2);
        scheduler.tick(later).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Same instant again: next_run_at moved, nothing due
        scheduler.tick(later).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let state = &storage.loop_states().unwrap()[0];
        assert_eq!(state.last_run_at, Some(later));
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failures_advance_next_but_not_last() {
        let (_dir, storage, mut scheduler) = scheduler();
        scheduler
            .register("broken", Duration::hours(1), || async {
                Err(crate::error::CoreError::internal("boom"))
            })
            .unwrap();

        let later = Utc::now() + Duration::hours(2);
        scheduler.tick(later).await.unwrap();

        let state = &storage.loop_states().unwrap()[0];
        assert_eq!(state.last_run_at, None);
        assert!(state.next_run_at > later);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn failing_loop_auto_disables() {
        let (_dir, storage, mut scheduler) = scheduler();
        scheduler
            .register("broken", Duration::seconds(0), || async {
                Err(crate::error::CoreError::internal("boom"))
            })
            .unwrap();

        let mut now = Utc::now() + Duration::seconds(1);
        for _ in 0..5 {
            scheduler.tick(now).await.unwrap();
            now += Duration::seconds(1);
        }

        let state = &storage.loop_states().unwrap()[0];
        assert!(!state.enabled);
        assert_eq!(state.consecutive_failures, 5);

        // Disabled loops never become due
        scheduler.tick(now + Duration::hours(1)).await.unwrap();
        assert_eq!(storage.loop_states().unwrap()[0].consecutive_failures, 5);
    }

    #[tokio::test]
    async fn reenable_resets_failures() {
        let (_dir, storage, mut scheduler) = scheduler();
        scheduler
            .register("flaky", Duration::seconds(0), || async { Ok(()) })
            .unwrap();
        for _ in 0..3 {
            storage.fail_loop("flaky", Utc::now(), 5).unwrap();
        }
        storage.set_loop_enabled("flaky", true).unwrap();
        assert_eq!(storage.loop_states().unwrap()[0].consecutive_failures, 0);
    }
}

//! In-process coordination
//!
//! [`LocalCoordinator`] plays the coordination server for several sessions
//! running on threads of one process, which is how the parallel protocol is
//! exercised in tests and how embedders can shard a suite without HTTP.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{ParallelClient, SyncState};

#[derive(Default)]
struct CoordinatorState {
    counter: usize,
    before_suite: Option<(SyncState, Vec<u8>)>,
    finished: HashSet<usize>,
    aborted: bool,
    primary_gone: bool,
}

pub struct LocalCoordinator {
    total: usize,
    state: Mutex<CoordinatorState>,
    changed: Condvar,
}

impl LocalCoordinator {
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            state: Mutex::new(CoordinatorState::default()),
            changed: Condvar::new(),
        })
    }

    /// Client for `process` (1-indexed)
    pub fn client(self: &Arc<Self>, process: usize) -> Arc<dyn ParallelClient> {
        Arc::new(LocalClient {
            coordinator: self.clone(),
            process,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, change: impl FnOnce(&mut CoordinatorState)) {
        change(&mut self.lock());
        self.changed.notify_all();
    }

    fn wait_until<T>(&self, mut ready: impl FnMut(&CoordinatorState) -> Option<T>) -> T {
        let mut state = self.lock();
        loop {
            if let Some(value) = ready(&state) {
                return value;
            }
            state = self.changed.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct LocalClient {
    coordinator: Arc<LocalCoordinator>,
    process: usize,
}

impl ParallelClient for LocalClient {
    fn connect(&self) -> Result<()> {
        if self.process == 0 || self.process > self.coordinator.total {
            bail!(
                "process {} is outside a run of {} processes",
                self.process,
                self.coordinator.total
            );
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.process == 1 {
            // Unblocks anyone still waiting on a before-suite result that
            // will never be posted.
            self.coordinator.update(|s| s.primary_gone = true);
        }
        Ok(())
    }

    fn fetch_next_counter(&self) -> Result<usize> {
        let mut state = self.coordinator.lock();
        let index = state.counter;
        state.counter += 1;
        Ok(index)
    }

    fn post_synchronized_before_suite_completed(
        &self,
        sync_state: SyncState,
        data: Vec<u8>,
    ) -> Result<()> {
        self.coordinator
            .update(|s| s.before_suite = Some((sync_state, data)));
        Ok(())
    }

    fn block_until_synchronized_before_suite_data(&self) -> Result<(SyncState, Vec<u8>)> {
        let result = self.coordinator.wait_until(|s| match &s.before_suite {
            Some(posted) => Some(Some(posted.clone())),
            None if s.primary_gone => Some(None),
            None => None,
        });
        match result {
            Some(posted) => Ok(posted),
            None => bail!("the primary process exited before posting its synchronized before-suite result"),
        }
    }

    fn post_did_finish(&self, process: usize) -> Result<()> {
        self.coordinator.update(|s| {
            s.finished.insert(process);
        });
        Ok(())
    }

    fn block_until_non_primary_procs_have_finished(&self) -> Result<()> {
        let total = self.coordinator.total;
        self.coordinator
            .wait_until(|s| (2..=total).all(|p| s.finished.contains(&p)).then_some(()));
        Ok(())
    }

    fn post_abort(&self) -> Result<()> {
        self.coordinator.update(|s| s.aborted = true);
        Ok(())
    }

    fn should_abort(&self) -> bool {
        self.coordinator.lock().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_is_shared() {
        let coordinator = LocalCoordinator::new(2);
        let first = coordinator.client(1);
        let second = coordinator.client(2);
        assert_eq!(first.fetch_next_counter().unwrap(), 0);
        assert_eq!(second.fetch_next_counter().unwrap(), 1);
        assert_eq!(first.fetch_next_counter().unwrap(), 2);
    }

    #[test]
    fn test_before_suite_data_reaches_waiters() {
        let coordinator = LocalCoordinator::new(3);
        let waiters: Vec<_> = (2..=3)
            .map(|p| {
                let client = coordinator.client(p);
                thread::spawn(move || client.block_until_synchronized_before_suite_data())
            })
            .collect();

        coordinator
            .client(1)
            .post_synchronized_before_suite_completed(SyncState::Passed, b"db-url".to_vec())
            .unwrap();

        for waiter in waiters {
            let (state, data) = waiter.join().unwrap().unwrap();
            assert_eq!(state, SyncState::Passed);
            assert_eq!(data, b"db-url");
        }
    }

    #[test]
    fn test_primary_waits_for_others() {
        let coordinator = LocalCoordinator::new(3);
        let primary = coordinator.client(1);
        let waiter = thread::spawn(move || primary.block_until_non_primary_procs_have_finished());

        coordinator.client(2).post_did_finish(2).unwrap();
        coordinator.client(3).post_did_finish(3).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_abort_and_connect() {
        let coordinator = LocalCoordinator::new(2);
        assert!(coordinator.client(3).connect().is_err());
        let worker = coordinator.client(2);
        assert!(!worker.should_abort());
        coordinator.client(1).post_abort().unwrap();
        assert!(worker.should_abort());
    }

    #[test]
    fn test_closed_primary_releases_waiters() {
        let coordinator = LocalCoordinator::new(2);
        coordinator.client(1).close().unwrap();
        assert!(coordinator
            .client(2)
            .block_until_synchronized_before_suite_data()
            .is_err());
    }
}

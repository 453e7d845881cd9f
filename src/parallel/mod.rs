//! Parallel run coordination
//!
//! When a suite is split across processes, each process talks to a shared
//! coordination server through a [`ParallelClient`]: claiming groups of specs
//! from a shared counter, handing synchronized before-suite data from the
//! primary process to the others, and propagating aborts.

mod http;
mod local;

pub use http::HttpParallelClient;
pub use local::LocalCoordinator;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of the primary process's synchronized before-suite body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Passed,
    Failed,
}

/// Position of this process in a parallel run; 1-indexed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    pub process: usize,
    pub total: usize,
}

impl Topology {
    pub fn new(process: usize, total: usize) -> Self {
        Self { process, total }
    }

    pub fn solo() -> Self {
        Self::new(1, 1)
    }

    pub fn is_primary(&self) -> bool {
        self.process == 1
    }

    pub fn is_parallel(&self) -> bool {
        self.total > 1
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {} of {}", self.process, self.total)
    }
}

/// Client side of the coordination protocol
pub trait ParallelClient: Send + Sync {
    /// Check that the coordination server is reachable
    fn connect(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Claim the next index of the shared work counter
    fn fetch_next_counter(&self) -> Result<usize>;

    fn post_synchronized_before_suite_completed(&self, state: SyncState, data: Vec<u8>)
        -> Result<()>;

    /// Wait for the primary process to post its synchronized before-suite result
    fn block_until_synchronized_before_suite_data(&self) -> Result<(SyncState, Vec<u8>)>;

    /// Tell the server this process has finished its specs
    fn post_did_finish(&self, process: usize) -> Result<()>;

    /// Wait until every non-primary process has posted that it finished
    fn block_until_non_primary_procs_have_finished(&self) -> Result<()>;

    fn post_abort(&self) -> Result<()>;

    /// Whether any process has posted an abort
    fn should_abort(&self) -> bool;
}

//! Interrupt detection
//!
//! The executor asks the [`InterruptHandler`] before each spec whether the
//! run has been interrupted: by the suite timeout elapsing, by another
//! process posting an abort, or by an explicit [`InterruptHandler::interrupt`].
//!
//! Asking the parallel client costs a round trip, so the answer is cached
//! for [`PEER_POLL_INTERVAL`]: an abort posted by another process can go
//! unnoticed for up to that long, and the specs started meanwhile still run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::parallel::ParallelClient;

/// How long a peer-abort answer is reused before the client is asked again
pub const PEER_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptCause {
    Timeout,
    AbortedByPeer,
    Requested,
}

impl fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptCause::Timeout => write!(f, "Interrupted by Timeout"),
            InterruptCause::AbortedByPeer => write!(f, "Interrupted by Other Parallel Process"),
            InterruptCause::Requested => write!(f, "Interrupted by User"),
        }
    }
}

pub struct InterruptHandler {
    deadline: Option<Instant>,
    client: Option<Arc<dyn ParallelClient>>,
    requested: AtomicBool,
    /// Last peer poll and whether it reported an abort
    peer: Mutex<(Option<Instant>, bool)>,
}

impl InterruptHandler {
    pub fn new(timeout: Option<Duration>, client: Option<Arc<dyn ParallelClient>>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            client,
            requested: AtomicBool::new(false),
            peer: Mutex::new((None, false)),
        }
    }

    /// Never interrupts unless asked to
    pub fn inert() -> Self {
        Self::new(None, None)
    }

    pub fn interrupt(&self) {
        warn!("interrupt requested");
        self.requested.store(true, Ordering::SeqCst);
    }

    /// The reason the run is interrupted, if it is
    pub fn status(&self) -> Option<InterruptCause> {
        if self.requested.load(Ordering::SeqCst) {
            return Some(InterruptCause::Requested);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(InterruptCause::Timeout);
        }
        if self.peer_aborted() {
            return Some(InterruptCause::AbortedByPeer);
        }
        None
    }

    fn peer_aborted(&self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        if peer.1 {
            return true;
        }
        let due = peer.0.map_or(true, |last| last.elapsed() >= PEER_POLL_INTERVAL);
        if due {
            *peer = (Some(Instant::now()), client.should_abort());
        }
        peer.1
    }
}

impl fmt::Debug for InterruptHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandler")
            .field("deadline", &self.deadline)
            .field("requested", &self.requested.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::LocalCoordinator;

    #[test]
    fn test_inert_handler() {
        assert_eq!(InterruptHandler::inert().status(), None);
    }

    #[test]
    fn test_timeout_and_request() {
        let handler = InterruptHandler::new(Some(Duration::ZERO), None);
        assert_eq!(handler.status(), Some(InterruptCause::Timeout));
        handler.interrupt();
        assert_eq!(handler.status(), Some(InterruptCause::Requested));
    }

    #[test]
    fn test_peer_abort() {
        let coordinator = LocalCoordinator::new(2);
        let handler = InterruptHandler::new(None, Some(coordinator.client(2)));
        assert_eq!(handler.status(), None);

        coordinator.client(1).post_abort().unwrap();
        // The first poll is cached, so a fresh handler sees the abort at once.
        let fresh = InterruptHandler::new(None, Some(coordinator.client(2)));
        assert_eq!(fresh.status(), Some(InterruptCause::AbortedByPeer));
    }

    #[test]
    fn test_peer_abort_seen_after_poll_interval() {
        let coordinator = LocalCoordinator::new(2);
        let handler = InterruptHandler::new(None, Some(coordinator.client(2)));
        assert_eq!(handler.status(), None);

        coordinator.client(1).post_abort().unwrap();
        assert_eq!(handler.status(), None);
        std::thread::sleep(PEER_POLL_INTERVAL);
        assert_eq!(handler.status(), Some(InterruptCause::AbortedByPeer));
    }
}

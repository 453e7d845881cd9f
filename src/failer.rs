//! Failure signalling
//!
//! `fail`, `skip` and `abort_suite` record a [`Failure`] on the run's
//! [`Failer`] and then unwind with a [`FrameworkSignal`] payload. The unwind
//! stops the current node; the executor catches it at the node boundary and
//! moves on to the next node. Unwinds are raised with
//! [`std::panic::resume_unwind`], which bypasses the panic hook, so framework
//! signals never print panic messages.
//!
//! Which thread raised the signal matters:
//!
//! - the thread executing a node records the failure with its own kind;
//! - a task wrapped in [`recover`] leaves recording to `recover`, which files
//!   whatever reached it as a `Panic` carrying the original payload;
//! - any other thread has no boundary that could catch the unwind, so the
//!   process is aborted.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use tracing::{debug, error};

use crate::models::{CodeLocation, NodeRole, SpecState};

/// Kind of a recorded failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failure,
    Skip,
    AbortSuite,
    Panic,
}

impl FailureKind {
    pub fn spec_state(&self) -> SpecState {
        match self {
            FailureKind::Failure => SpecState::Failed,
            FailureKind::Skip => SpecState::Skipped,
            FailureKind::AbortSuite => SpecState::Aborted,
            FailureKind::Panic => SpecState::Panicked,
        }
    }
}

/// Unwind payload that marks a framework-internal control signal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkSignal {
    pub kind: FailureKind,
    pub message: String,
    pub location: CodeLocation,
}

impl fmt::Display for FrameworkSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.kind, self.location, self.message)
    }
}

/// What a panicking node or task unwound with
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicPayload {
    pub description: String,
    /// Present when the payload was a framework signal
    pub signal: Option<FrameworkSignal>,
}

impl PanicPayload {
    pub fn from_unwind(payload: &(dyn Any + Send)) -> Self {
        if let Some(signal) = payload.downcast_ref::<FrameworkSignal>() {
            return Self {
                description: signal.to_string(),
                signal: Some(signal.clone()),
            };
        }
        let description = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self {
            description,
            signal: None,
        }
    }
}

/// The failure recorded for a node run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub location: CodeLocation,
    pub payload: Option<PanicPayload>,
    /// Role of the node that was running when the failure was recorded
    pub node_role: Option<NodeRole>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>, location: CodeLocation) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
            payload: None,
            node_role: None,
        }
    }

    pub fn panic(location: CodeLocation, payload: PanicPayload) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: "Test Panicked".to_string(),
            location,
            payload: Some(payload),
            node_role: None,
        }
    }

    /// True for `AbortSuite` records and for panics carrying an `AbortSuite`
    /// signal out of a recovered task
    pub fn aborts_suite(&self) -> bool {
        self.kind == FailureKind::AbortSuite
            || self
                .payload
                .as_ref()
                .and_then(|p| p.signal.as_ref())
                .is_some_and(|signal| signal.kind == FailureKind::AbortSuite)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {} ({})", self.kind, self.message, self.location)?;
        if let Some(payload) = &self.payload {
            write!(f, ": {}", payload.description)?;
        }
        Ok(())
    }
}

/// First-wins record of the current spec's outcome.
///
/// A later suite abort replaces any earlier non-abort record; everything else
/// after the first record is ignored.
#[derive(Debug, Default)]
pub struct Failer {
    state: Mutex<Option<Failure>>,
}

impl Failer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, returning whether it became the current record
    pub fn record(&self, failure: Failure) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let replace = match state.as_ref() {
            None => true,
            Some(existing) => failure.aborts_suite() && !existing.aborts_suite(),
        };
        if replace {
            debug!("recording {:?}: {}", failure.kind, failure.message);
            *state = Some(failure);
        }
        replace
    }

    pub fn fail(&self, message: impl Into<String>, location: CodeLocation) -> bool {
        self.record(Failure::new(FailureKind::Failure, message, location))
    }

    pub fn skip(&self, message: impl Into<String>, location: CodeLocation) -> bool {
        self.record(Failure::new(FailureKind::Skip, message, location))
    }

    pub fn abort_suite(&self, message: impl Into<String>, location: CodeLocation) -> bool {
        self.record(Failure::new(FailureKind::AbortSuite, message, location))
    }

    pub fn panic(&self, location: CodeLocation, payload: PanicPayload) -> bool {
        self.record(Failure::panic(location, payload))
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    pub fn snapshot(&self) -> Option<Failure> {
        self.lock().clone()
    }

    /// Tag the current record with the role of the node that produced it
    pub(crate) fn annotate_role(&self, role: NodeRole) {
        if let Some(failure) = self.lock().as_mut() {
            failure.node_role.get_or_insert(role);
        }
    }

    /// Take the record and leave the failer clean for the next spec
    pub fn drain(&self) -> Option<Failure> {
        self.lock().take()
    }

    pub fn reset(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Failure>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What the current thread is doing on behalf of the executor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExecutionScope {
    Detached,
    Node,
    Recovered,
}

thread_local! {
    static SCOPE: Cell<ExecutionScope> = const { Cell::new(ExecutionScope::Detached) };
}

pub(crate) fn current_scope() -> ExecutionScope {
    SCOPE.with(|s| s.get())
}

/// Restores the previous scope when dropped, including during unwinding
pub(crate) struct ScopeGuard {
    previous: ExecutionScope,
}

pub(crate) fn enter_scope(scope: ExecutionScope) -> ScopeGuard {
    let previous = SCOPE.with(|s| s.replace(scope));
    ScopeGuard { previous }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE.with(|s| s.set(self.previous));
    }
}

/// Record (when on a node thread) and unwind with a framework signal
pub(crate) fn raise(
    failer: &Failer,
    kind: FailureKind,
    message: String,
    location: CodeLocation,
) -> ! {
    match current_scope() {
        ExecutionScope::Node => {
            failer.record(Failure::new(kind, message.clone(), location.clone()));
        }
        ExecutionScope::Recovered => {}
        ExecutionScope::Detached => {
            error!(
                "{:?} raised at {} outside of any node or recovered task",
                kind, location
            );
            eprintln!(
                "grove: {kind:?} was raised at {location} on a thread that is not protected by \
                 SpecContext::recover; wrap spawned work in recover() so the failure can be \
                 attributed to its spec.\nmessage: {message}"
            );
            std::process::abort();
        }
    }
    panic::resume_unwind(Box::new(FrameworkSignal {
        kind,
        message,
        location,
    }))
}

/// Run a node body on the current thread, converting unwinds into records.
///
/// Returns `true` when the body completed without unwinding.
pub(crate) fn run_protected<F>(failer: &Failer, location: &CodeLocation, body: F) -> bool
where
    F: FnOnce(),
{
    let _guard = enter_scope(ExecutionScope::Node);
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => true,
        Err(payload) => {
            if !payload.is::<FrameworkSignal>() {
                failer.panic(location.clone(), PanicPayload::from_unwind(payload.as_ref()));
            }
            false
        }
    }
}

/// Catch any unwind reaching the boundary of a spawned task and file it as a
/// `Panic` failure with the original payload.
pub(crate) fn recover<R, F>(failer: &Failer, location: CodeLocation, task: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    let _guard = enter_scope(ExecutionScope::Recovered);
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(value) => Some(value),
        Err(payload) => {
            failer.panic(location, PanicPayload::from_unwind(payload.as_ref()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn loc() -> CodeLocation {
        CodeLocation::new("failer_test.rs", 3)
    }

    #[test]
    fn test_first_failure_wins() {
        let failer = Failer::new();
        assert!(failer.fail("first", loc()));
        assert!(!failer.fail("second", loc()));
        assert!(!failer.skip("skip", loc()));
        assert_eq!(failer.snapshot().unwrap().message, "first");
    }

    #[test]
    fn test_recovered_abort_overrides_earlier_records() {
        let failer = Failer::new();
        failer.fail("first", loc());
        let payload = PanicPayload {
            description: "abort from a worker".into(),
            signal: Some(FrameworkSignal {
                kind: FailureKind::AbortSuite,
                message: "stop".into(),
                location: loc(),
            }),
        };
        assert!(failer.panic(loc(), payload));
        let failure = failer.drain().unwrap();
        assert_eq!(failure.kind, FailureKind::Panic);
        assert!(failure.aborts_suite());
    }

    #[test]
    fn test_abort_overrides_earlier_records() {
        let failer = Failer::new();
        failer.skip("skipping", loc());
        assert!(failer.abort_suite("abort", loc()));
        assert!(!failer.abort_suite("abort again", loc()));
        let failure = failer.drain().unwrap();
        assert_eq!(failure.kind, FailureKind::AbortSuite);
        assert_eq!(failure.message, "abort");
        assert!(!failer.is_set());
    }

    #[test]
    fn test_run_protected_swallows_framework_signal() {
        let failer = Failer::new();
        let completed = run_protected(&failer, &loc(), || {
            raise(&failer, FailureKind::Failure, "boom".into(), loc());
        });
        assert!(!completed);
        let failure = failer.drain().unwrap();
        assert_eq!(failure.kind, FailureKind::Failure);
        assert_eq!(failure.message, "boom");
        assert_eq!(current_scope(), ExecutionScope::Detached);
    }

    #[test]
    fn test_run_protected_records_user_panic() {
        let failer = Failer::new();
        let completed = run_protected(&failer, &loc(), || panic!("kaboom"));
        assert!(!completed);
        let failure = failer.drain().unwrap();
        assert_eq!(failure.kind, FailureKind::Panic);
        assert_eq!(failure.payload.unwrap().description, "kaboom");
    }

    #[test]
    fn test_recovered_task_reports_panic_with_signal_payload() {
        let failer = Arc::new(Failer::new());
        let task_failer = failer.clone();
        let handle = thread::spawn(move || {
            recover(&task_failer, loc(), || {
                raise(&task_failer, FailureKind::Failure, "off-thread".into(), loc());
            })
        });
        assert!(handle.join().unwrap().is_none());

        let failure = failer.drain().unwrap();
        assert_eq!(failure.kind, FailureKind::Panic);
        let signal = failure.payload.unwrap().signal.unwrap();
        assert_eq!(signal.kind, FailureKind::Failure);
        assert_eq!(signal.message, "off-thread");
    }

    #[test]
    fn test_concurrent_reports_keep_one_record() {
        let failer = Arc::new(Failer::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let failer = failer.clone();
                thread::spawn(move || failer.fail(format!("failure {i}"), loc()))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

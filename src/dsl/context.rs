//! Handle passed to every running node body
//!
//! A [`SpecContext`] reaches the run's failer, writer and cleanup registry.
//! It is cheap to clone and can be moved into threads spawned by the body;
//! those threads must wrap their work in [`SpecContext::recover`] (or be
//! started with [`SpecContext::spawn`]) before raising failures.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::error;

use crate::cleanup::{resolve_scope, CleanupOutcome, CleanupRegistration, CleanupRegistry};
use crate::error::DeclarationError;
use crate::failer::{self, Failer, FailureKind};
use crate::models::{CodeLocation, NodeRole, ReportEntry};
use crate::output::Writer;
use crate::utils::Timer;

/// State shared by every node of one suite run
pub(crate) struct RunContext {
    pub failer: Failer,
    pub writer: Arc<Writer>,
    pub registry: CleanupRegistry,
    pub random_seed: u64,
    pub parallel_process: usize,
    fatal: Mutex<Vec<DeclarationError>>,
}

impl RunContext {
    pub fn new(writer: Arc<Writer>, random_seed: u64, parallel_process: usize) -> Self {
        Self {
            failer: Failer::new(),
            writer,
            registry: CleanupRegistry::new(),
            random_seed,
            parallel_process,
            fatal: Mutex::new(Vec::new()),
        }
    }

    /// Declaration errors raised while the suite was running
    pub fn take_fatal_errors(&self) -> Vec<DeclarationError> {
        std::mem::take(&mut *self.fatal.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn record_fatal(&self, err: DeclarationError) {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).push(err);
    }
}

struct ContextInner {
    run: Arc<RunContext>,
    role: NodeRole,
    active: AtomicBool,
    entries: Mutex<Vec<ReportEntry>>,
}

#[derive(Clone)]
pub struct SpecContext {
    inner: Arc<ContextInner>,
}

impl SpecContext {
    pub(crate) fn new(run: Arc<RunContext>, role: NodeRole) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run,
                role,
                active: AtomicBool::new(true),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Mark the node finished and hand back its report entries
    pub(crate) fn finish(&self) -> Vec<ReportEntry> {
        self.inner.active.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.entries())
    }

    /// Role of the node this context was created for
    pub fn role(&self) -> NodeRole {
        self.inner.role
    }

    /// False once the node has returned
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn writer(&self) -> &Writer {
        &self.inner.run.writer
    }

    pub fn random_seed(&self) -> u64 {
        self.inner.run.random_seed
    }

    pub fn parallel_process(&self) -> usize {
        self.inner.run.parallel_process
    }

    /// Fail the current spec and stop the running node
    #[track_caller]
    pub fn fail(&self, message: impl Into<String>) -> ! {
        self.fail_at(message, CodeLocation::caller())
    }

    pub fn fail_at(&self, message: impl Into<String>, location: CodeLocation) -> ! {
        failer::raise(self.failer(), FailureKind::Failure, message.into(), location)
    }

    /// Mark the current spec skipped and stop the running node
    #[track_caller]
    pub fn skip(&self, message: impl Into<String>) -> ! {
        self.skip_at(message, CodeLocation::caller())
    }

    pub fn skip_at(&self, message: impl Into<String>, location: CodeLocation) -> ! {
        failer::raise(self.failer(), FailureKind::Skip, message.into(), location)
    }

    /// Fail the current spec and skip every spec that has not run yet
    #[track_caller]
    pub fn abort_suite(&self, message: impl Into<String>) -> ! {
        self.abort_suite_at(message, CodeLocation::caller())
    }

    pub fn abort_suite_at(&self, message: impl Into<String>, location: CodeLocation) -> ! {
        failer::raise(self.failer(), FailureKind::AbortSuite, message.into(), location)
    }

    /// Run `task`, turning any unwind that reaches it into a panic failure
    /// of the current spec. Returns `None` if the task unwound.
    #[track_caller]
    pub fn recover<R>(&self, task: impl FnOnce() -> R) -> Option<R> {
        failer::recover(self.failer(), CodeLocation::caller(), task)
    }

    /// Spawn a thread whose body is wrapped in [`recover`](Self::recover)
    #[track_caller]
    pub fn spawn<F, R>(&self, task: F) -> JoinHandle<Option<R>>
    where
        F: FnOnce(SpecContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let location = CodeLocation::caller();
        let ctx = self.clone();
        thread::spawn(move || {
            let task_ctx = ctx.clone();
            failer::recover(ctx.failer(), location, move || task(task_ctx))
        })
    }

    /// Register a callback to run when the current node's scope closes.
    ///
    /// Callbacks returning `Err` fail the scope that owns them. Calling this
    /// from a cleanup or after the node returned is a declaration error:
    /// the run reports it and, while the node is still running, fails it.
    #[track_caller]
    pub fn defer_cleanup<F, R>(&self, callback: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: CleanupOutcome,
    {
        let location = CodeLocation::caller();
        if let Err(err) = self.register_cleanup(location.clone(), callback) {
            error!("{}", err);
            self.inner.run.record_fatal(err.clone());
            if self.is_active() {
                self.fail_at(err.to_string(), location);
            }
        }
    }

    /// Like [`defer_cleanup`](Self::defer_cleanup), binding `args` now
    #[track_caller]
    pub fn defer_cleanup_with<A, F, R>(&self, callback: F, args: A)
    where
        A: Send + 'static,
        F: FnOnce(A) -> R + Send + 'static,
        R: CleanupOutcome,
    {
        self.defer_cleanup(move || callback(args))
    }

    /// Register a cleanup, returning scope errors instead of failing the node
    #[track_caller]
    pub fn try_defer_cleanup<F, R>(&self, callback: F) -> Result<(), DeclarationError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: CleanupOutcome,
    {
        self.register_cleanup(CodeLocation::caller(), callback)
    }

    fn register_cleanup<F, R>(&self, location: CodeLocation, callback: F) -> Result<(), DeclarationError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: CleanupOutcome,
    {
        let role = self.is_active().then_some(self.inner.role);
        let scope = resolve_scope(role, &location)?;
        self.inner
            .run
            .registry
            .register(CleanupRegistration::new(scope, location, callback));
        Ok(())
    }

    /// Document a step: writes `STEP: text` and records a report entry
    #[track_caller]
    pub fn by(&self, text: impl Into<String>) {
        self.record_step(text.into(), CodeLocation::caller());
    }

    /// [`by`](Self::by), then run `step`; the entry also carries its duration
    #[track_caller]
    pub fn by_step<R>(&self, text: impl Into<String>, step: impl FnOnce() -> R) -> R {
        let text = text.into();
        let index = self.record_step(text.clone(), CodeLocation::caller());
        let timer = Timer::start(format!("step {text:?}"));
        let result = step();
        let duration_ms = timer.stop();
        if let Some(entry) = self.entries().get_mut(index) {
            entry.value = serde_json::json!({ "text": text, "duration_ms": duration_ms });
        }
        result
    }

    fn record_step(&self, text: String, location: CodeLocation) -> usize {
        self.writer().println(format!(
            "STEP: {text} - {}",
            Utc::now().format("%m/%d/%y %H:%M:%S%.3f")
        ));
        self.push_entry("By Step", location, serde_json::Value::String(text))
    }

    /// Attach a named value to the current spec's report
    #[track_caller]
    pub fn add_report_entry(&self, name: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| serde_json::Value::String(format!("<unserializable: {e}>")));
        self.push_entry(name, CodeLocation::caller(), value);
    }

    fn push_entry(
        &self,
        name: impl Into<String>,
        location: CodeLocation,
        value: serde_json::Value,
    ) -> usize {
        let mut entries = self.entries();
        entries.push(ReportEntry {
            name: name.into(),
            location,
            time: Utc::now(),
            value,
        });
        entries.len() - 1
    }

    fn failer(&self) -> &Failer {
        &self.inner.run.failer
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ReportEntry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SpecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecContext")
            .field("role", &self.inner.role)
            .field("active", &self.is_active())
            .finish()
    }
}

//! Suite lifecycle
//!
//! A [`Session`] owns everything a suite needs across its life: the
//! declarations made before the run, the configuration, the writer, and the
//! run-state latch. [`Session::run_specs`] vets the configuration, wires the
//! reporter, interceptor and parallel client for the topology, and hands the
//! built tree to the executor. A session runs at most once.

use std::any::{type_name, Any};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::config::{
    editor_integration, vet_config, EnvConfig, GroveConfig, ReporterConfig, SuiteConfig,
    SuiteFlags,
};
use crate::deprecation::DeprecationTracker;
use crate::dsl::Declare;
use crate::error::{ConfigError, DeclarationError, GroveError, Result};
use crate::executor::{RunRequest, Suite, TreeBuilder};
use crate::interrupt::InterruptHandler;
use crate::models::{Labels, Node, SuiteReport};
use crate::output::{
    generate_json_report, Console, DefaultReporter, InterceptorMode, NoopOutputInterceptor,
    NoopReporter, OutputInterceptor, Reporter, Writer, WriterMode,
};
use crate::parallel::{HttpParallelClient, ParallelClient};
use crate::utils::{init_logger, LogLevel};

/// Exit status of a suite that passed but left focused specs behind
pub const FOCUS_EXIT_CODE: i32 = 197;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
}

/// One positional argument of [`Session::run_specs`]
#[derive(Clone, Debug)]
pub enum RunArg {
    Suite(SuiteConfig),
    Reporter(ReporterConfig),
    Labels(Labels),
    Unrecognized(&'static str),
}

impl RunArg {
    /// Classify a dynamically typed value; unknown types become `Unrecognized`
    pub fn classify<T: Any>(value: T) -> Self {
        let name = type_name::<T>();
        let boxed: Box<dyn Any> = Box::new(value);
        let boxed = match boxed.downcast::<RunArg>() {
            Ok(arg) => return *arg,
            Err(other) => other,
        };
        let boxed = match boxed.downcast::<SuiteConfig>() {
            Ok(config) => return RunArg::Suite(*config),
            Err(other) => other,
        };
        let boxed = match boxed.downcast::<ReporterConfig>() {
            Ok(config) => return RunArg::Reporter(*config),
            Err(other) => other,
        };
        match boxed.downcast::<Labels>() {
            Ok(labels) => RunArg::Labels(*labels),
            Err(_) => RunArg::Unrecognized(name),
        }
    }
}

impl From<SuiteConfig> for RunArg {
    fn from(config: SuiteConfig) -> Self {
        RunArg::Suite(config)
    }
}

impl From<ReporterConfig> for RunArg {
    fn from(config: ReporterConfig) -> Self {
        RunArg::Reporter(config)
    }
}

impl From<Labels> for RunArg {
    fn from(labels: Labels) -> Self {
        RunArg::Labels(labels)
    }
}

/// Result of a completed run
#[derive(Debug)]
pub struct RunOutcome {
    pub passed: bool,
    pub has_focused_tests: bool,
    pub report: SuiteReport,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if !self.passed {
            1
        } else if self.has_focused_tests && !editor_integration() {
            FOCUS_EXIT_CODE
        } else {
            0
        }
    }
}

/// The host test harness's way of marking the current test failed
pub trait FailHandle {
    fn fail(&self);
}

impl<F: Fn()> FailHandle for F {
    fn fail(&self) {
        self()
    }
}

/// Builds the parallel client for a configuration
pub type ClientFactory =
    Box<dyn Fn(&SuiteConfig) -> anyhow::Result<Arc<dyn ParallelClient>> + Send + Sync>;

type InterceptorSlot = Arc<Mutex<Option<Arc<dyn OutputInterceptor>>>>;

pub struct Session {
    state: RunState,
    config: GroveConfig,
    flags: SuiteFlags,
    builder: TreeBuilder,
    deprecations: Arc<DeprecationTracker>,
    console: Console,
    writer: Arc<Writer>,
    interceptor: InterceptorSlot,
    client_factory: ClientFactory,
}

impl Session {
    /// A session with default configuration printing to stdout
    pub fn new() -> Self {
        Self::with_config(GroveConfig::default())
    }

    pub fn with_config(config: GroveConfig) -> Self {
        let deprecations = Arc::new(DeprecationTracker::new());
        let console = Console::stdout();
        Self {
            state: RunState::NotStarted,
            config,
            flags: SuiteFlags::default(),
            builder: TreeBuilder::new(deprecations.clone()),
            deprecations,
            writer: Arc::new(Writer::new(console.clone())),
            console,
            interceptor: Arc::new(Mutex::new(None)),
            client_factory: Box::new(|config: &SuiteConfig| {
                let host = config.parallel_host.clone().unwrap_or_default();
                let client: Arc<dyn ParallelClient> = Arc::new(HttpParallelClient::new(host)?);
                Ok(client)
            }),
        }
    }

    /// Configuration from the config file, `GROVE_*` variables and
    /// `--grove.*` arguments of the current process
    pub fn from_process() -> Result<Self> {
        let env = EnvConfig::load();
        let flags = SuiteFlags::from_process().map_err(|e| GroveError::Configuration(vec![e]))?;
        let config =
            GroveConfig::from_layers(&env, &flags).map_err(|e| GroveError::Configuration(vec![e]))?;
        let mut session = Self::with_config(config);
        session.flags = flags;
        Ok(session)
    }

    /// Send reporter and writer output to `console` instead of stdout
    pub fn with_console(mut self, console: Console) -> Self {
        self.writer = Arc::new(Writer::new(console.clone()));
        self.console = console;
        self
    }

    pub fn with_client_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&SuiteConfig) -> anyhow::Result<Arc<dyn ParallelClient>> + Send + Sync + 'static,
    {
        self.client_factory = Box::new(factory);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn configuration(&self) -> (&SuiteConfig, &ReporterConfig) {
        (&self.config.suite, &self.config.reporter)
    }

    pub fn random_seed(&self) -> u64 {
        self.config.suite.random_seed
    }

    pub fn parallel_process(&self) -> usize {
        self.config.suite.parallel_process
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn pause_output_interception(&self) {
        if let Some(interceptor) = self.current_interceptor() {
            interceptor.pause_intercepting();
        }
    }

    pub fn resume_output_interception(&self) {
        if let Some(interceptor) = self.current_interceptor() {
            interceptor.resume_intercepting();
        }
    }

    fn current_interceptor(&self) -> Option<Arc<dyn OutputInterceptor>> {
        self.interceptor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run every declared spec. A session can only run once.
    pub fn run_specs(
        &mut self,
        description: impl Into<String>,
        args: Vec<RunArg>,
    ) -> Result<RunOutcome> {
        if self.state != RunState::NotStarted {
            return Err(GroveError::RerunningSuite);
        }
        self.state = RunState::Running;
        let result = self.run(description.into(), args);
        self.state = RunState::Completed;
        result
    }

    fn run(&mut self, description: String, args: Vec<RunArg>) -> Result<RunOutcome> {
        let mut config = self.config.clone();
        let mut suite_labels: Vec<String> = Vec::new();
        let mut unrecognized = Vec::new();
        for arg in args {
            match arg {
                RunArg::Suite(suite) => config.suite = suite,
                RunArg::Reporter(reporter) => config.reporter = reporter,
                RunArg::Labels(labels) => suite_labels.extend(labels.iter().cloned()),
                RunArg::Unrecognized(name) => {
                    unrecognized.push(ConfigError::UnrecognizedRunArgument(name.to_string()))
                }
            }
        }
        if !unrecognized.is_empty() {
            return Err(GroveError::Configuration(unrecognized));
        }

        let problems = vet_config(&config.suite, &config.reporter);
        if !problems.is_empty() {
            return Err(GroveError::Configuration(problems));
        }
        self.config = config.clone();

        let fresh = TreeBuilder::new(self.deprecations.clone());
        let builder = std::mem::replace(&mut self.builder, fresh);
        let tree = builder.build().map_err(GroveError::Declaration)?;

        let topology = config.suite.topology();
        let mut teardown = Teardown {
            slot: self.interceptor.clone(),
            client: None,
        };

        let (reporter, interceptor): (Arc<dyn Reporter>, Arc<dyn OutputInterceptor>) =
            if topology.is_parallel() {
                let mode = InterceptorMode::from_str(&config.suite.output_interceptor_mode);
                (Arc::new(NoopReporter), Arc::from(mode.build(&self.console)))
            } else {
                let reporter = DefaultReporter::from_config(self.console.clone(), &config.reporter);
                (Arc::new(reporter), Arc::new(NoopOutputInterceptor))
            };
        teardown.install(interceptor.clone());

        if topology.is_parallel() {
            let host = config.suite.parallel_host.clone().unwrap_or_default();
            let client = (self.client_factory)(&config.suite)
                .and_then(|client| client.connect().map(|_| client))
                .map_err(|e| {
                    error!("could not connect to {}: {:#}", host, e);
                    GroveError::UnreachableParallelHost(host)
                })?;
            teardown.client = Some(client);
        }

        self.writer.set_mode(if config.reporter.verbose && !topology.is_parallel() {
            WriterMode::StreamAndBuffer
        } else {
            WriterMode::BufferOnly
        });

        let path = std::env::current_dir().map_err(GroveError::WorkingDirectory)?;
        info!("running suite {:?} from {}", description, path.display());

        let outcome = Suite::run(RunRequest {
            description,
            path: path.display().to_string(),
            tree,
            suite_labels,
            config: config.suite.clone(),
            reporter,
            interceptor,
            writer: self.writer.clone(),
            client: teardown.client.clone(),
            interrupt: InterruptHandler::new(config.suite.timeout(), teardown.client.clone()),
        });
        drop(teardown);

        self.flags.validate_deprecations(&self.deprecations);
        if self.deprecations.did_track() {
            eprintln!("{}", self.deprecations.report());
        }

        if let Some(path) = &config.reporter.json_report {
            generate_json_report(&outcome.report, path)
                .map_err(|e| GroveError::Report(format!("{e:#}")))?;
        }

        if !outcome.fatal_errors.is_empty() {
            return Err(GroveError::Declaration(outcome.fatal_errors));
        }

        Ok(RunOutcome {
            passed: outcome.passed,
            has_focused_tests: outcome.has_focused_tests,
            report: outcome.report,
        })
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Declare for Session {
    fn push_node(&mut self, node: std::result::Result<Node, Vec<DeclarationError>>) {
        match node {
            Ok(node) => self.builder.push(node),
            Err(errors) => self.builder.record_errors(errors),
        }
    }

    fn deprecations(&self) -> &DeprecationTracker {
        &self.deprecations
    }
}

/// Shuts the interceptor down and closes the parallel client on every exit path
struct Teardown {
    slot: InterceptorSlot,
    client: Option<Arc<dyn ParallelClient>>,
}

impl Teardown {
    fn install(&mut self, interceptor: Arc<dyn OutputInterceptor>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(interceptor);
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let interceptor = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(interceptor) = interceptor {
            interceptor.shutdown();
        }
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close() {
                warn!("could not close the parallel client: {:#}", e);
            }
        }
    }
}

/// Run the session and settle the process outcome the way a test binary
/// expects: errors exit 1, failures go through `fail_handle`, and a passing
/// suite with focused specs exits with [`FOCUS_EXIT_CODE`].
pub fn run_specs_or_exit(
    session: &mut Session,
    fail_handle: &dyn FailHandle,
    description: impl Into<String>,
    args: Vec<RunArg>,
) -> bool {
    if let Some(level) = EnvConfig::load().log.as_deref().and_then(LogLevel::from_str) {
        init_logger(level);
    }

    match session.run_specs(description, args) {
        Err(e) => {
            eprintln!("{}\n{}", e.heading(), e);
            std::process::exit(1);
        }
        Ok(outcome) if !outcome.passed => {
            fail_handle.fail();
            false
        }
        Ok(outcome) => {
            if outcome.exit_code() == FOCUS_EXIT_CODE {
                println!("PASS | FOCUSED");
                std::process::exit(FOCUS_EXIT_CODE);
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{label, Decorator, NodeRole, SpecState};
    use crate::output::SharedBuffer;
    use crate::parallel::LocalCoordinator;
    use std::thread;
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    fn session() -> (Session, SharedBuffer) {
        let (console, buffer) = Console::capture();
        let config = GroveConfig {
            suite: SuiteConfig {
                random_seed: 1,
                ..SuiteConfig::default()
            },
            reporter: ReporterConfig {
                no_color: true,
                ..ReporterConfig::default()
            },
        };
        (Session::with_config(config).with_console(console), buffer)
    }

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    #[test]
    fn test_focused_suite() {
        let (mut session, buffer) = session();
        let log: Log = Arc::default();
        let (a, b) = (log.clone(), log.clone());
        session.describe("Cart", move |d| {
            d.fit("adds items", move |_| push(&a, "focused"));
            d.it("removes items", move |_| push(&b, "unfocused"));
        });

        let outcome = session.run_specs("Cart Suite", vec![]).unwrap();
        assert!(outcome.passed);
        assert!(outcome.has_focused_tests);
        assert_eq!(outcome.exit_code(), FOCUS_EXIT_CODE);
        assert_eq!(*log.lock().unwrap(), vec!["focused"]);
        assert_eq!(outcome.report.skipped(), 1);
        assert!(buffer.contents().contains("Running Suite: Cart Suite"));
    }

    #[test]
    fn test_abort_suite() {
        let (mut session, _) = session();
        session.it("first", |ctx| ctx.abort_suite("infrastructure is down"));
        session.it("second", |_| {});

        let outcome = session.run_specs("Abort", vec![]).unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.report.find("first").unwrap().state, SpecState::Aborted);
        assert_eq!(outcome.report.find("second").unwrap().state, SpecState::Skipped);
    }

    #[test]
    fn test_rerun_is_rejected() {
        let (mut session, _) = session();
        let log: Log = Arc::default();
        let inner = log.clone();
        session.it("runs once", move |_| push(&inner, "ran"));

        session.run_specs("Once", vec![]).unwrap();
        assert_eq!(session.state(), RunState::Completed);
        assert!(matches!(
            session.run_specs("Once", vec![]),
            Err(GroveError::RerunningSuite)
        ));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unrecognized_arguments_are_collected() {
        let (mut session, _) = session();
        let err = session
            .run_specs(
                "Args",
                vec![
                    RunArg::classify(7u8),
                    RunArg::classify(Labels::new(["smoke"])),
                    RunArg::classify("text"),
                ],
            )
            .unwrap_err();

        match err {
            GroveError::Configuration(errors) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0], ConfigError::UnrecognizedRunArgument("u8".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_declaration_errors_are_reported_together() {
        let (mut session, _) = session();
        session.before_all(|_| {});
        session.it_with("bad label", [label(["a|b"])], |_| {});

        match session.run_specs("Broken", vec![]).unwrap_err() {
            GroveError::Declaration(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_configuration() {
        let (mut session, _) = session();
        let suite = SuiteConfig {
            parallel_total: 0,
            ..SuiteConfig::default()
        };
        let reporter = ReporterConfig {
            verbose: true,
            succinct: true,
            ..ReporterConfig::default()
        };
        let err = session
            .run_specs("Config", vec![suite.into(), reporter.into()])
            .unwrap_err();
        assert!(matches!(err, GroveError::Configuration(ref e) if e.len() == 2));
    }

    #[test]
    fn test_cleanups_run_last_in_first_out() {
        let (mut session, _) = session();
        let log: Log = Arc::default();
        let (setup, after, subject) = (log.clone(), log.clone(), log.clone());
        session.before_each(move |ctx| {
            let (a, b) = (setup.clone(), setup.clone());
            ctx.defer_cleanup(move || push(&a, "cleanup a"));
            ctx.defer_cleanup(move || push(&b, "cleanup b"));
        });
        session.after_each(move |_| push(&after, "after each"));
        session.it("spec", move |_| push(&subject, "spec"));

        assert!(session.run_specs("Cleanup", vec![]).unwrap().passed);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["spec", "after each", "cleanup b", "cleanup a"]
        );
    }

    #[test]
    fn test_cleanup_error_fails_spec() {
        let (mut session, _) = session();
        session.it("spec", |ctx| {
            ctx.defer_cleanup(|| -> std::result::Result<(), String> { Err("disk full".into()) });
        });

        let outcome = session.run_specs("Cleanup", vec![]).unwrap();
        let failure = outcome.report.find("spec").unwrap().failure.clone().unwrap();
        assert!(failure.message.contains("disk full"));
        assert_eq!(failure.node_role, Some(NodeRole::Cleanup));
    }

    #[test]
    fn test_fail_in_recovered_task_is_a_panic() {
        let (mut session, _) = session();
        session.it("spawns", |ctx| {
            let result = ctx.spawn(|ctx| ctx.fail("worker failed")).join().unwrap();
            assert!(result.is_none());
        });

        let outcome = session.run_specs("Recover", vec![]).unwrap();
        let spec = outcome.report.find("spawns").unwrap();
        assert_eq!(spec.state, SpecState::Panicked);
        let payload = spec.failure.as_ref().unwrap().payload.as_ref().unwrap();
        assert_eq!(payload.signal.as_ref().unwrap().message, "worker failed");
    }

    #[test]
    fn test_verbose_writer_streams_to_console() {
        let (console, buffer) = Console::capture();
        let config = GroveConfig {
            reporter: ReporterConfig {
                verbose: true,
                no_color: true,
                ..ReporterConfig::default()
            },
            ..GroveConfig::default()
        };
        let mut session = Session::with_config(config).with_console(console);
        session.it("talks", |ctx| ctx.writer().println("hello from the spec"));

        session.run_specs("Verbose", vec![]).unwrap();
        assert_eq!(session.writer().mode(), WriterMode::StreamAndBuffer);
        assert!(buffer.contents().contains("hello from the spec"));
    }

    #[test]
    fn test_json_report_is_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("suite.json");
        let (mut session, _) = session();
        session.it("passes", |_| {});

        let reporter = ReporterConfig {
            json_report: Some(path.clone()),
            no_color: true,
            ..ReporterConfig::default()
        };
        session.run_specs("Json", vec![reporter.into()]).unwrap();

        let written: SuiteReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.description, "Json");
        assert_eq!(written.passed(), 1);
    }

    #[test]
    fn test_unreachable_parallel_host() {
        let (session, _) = session();
        let mut session = session.with_client_factory(|_: &SuiteConfig| {
            anyhow::bail!("connection refused")
        });
        session.it("never runs", |_| {});

        let suite = SuiteConfig {
            parallel_process: 1,
            parallel_total: 2,
            parallel_host: Some("http://127.0.0.1:9".into()),
            output_interceptor_mode: "none".into(),
            ..SuiteConfig::default()
        };
        let err = session.run_specs("Parallel", vec![suite.into()]).unwrap_err();
        assert!(matches!(err, GroveError::UnreachableParallelHost(host) if host.ends_with(":9")));
    }

    #[test]
    fn test_synchronized_suite_nodes_across_processes() {
        let coordinator = LocalCoordinator::new(2);
        let log: Log = Arc::default();

        let handles: Vec<_> = (1..=2)
            .map(|process| {
                let coordinator = coordinator.clone();
                let log = log.clone();
                thread::spawn(move || {
                    let (session, _) = session();
                    let mut session = session
                        .with_client_factory(move |config: &SuiteConfig| {
                            Ok(coordinator.client(config.parallel_process))
                        });

                    let (primary, all, after_all, after_primary) =
                        (log.clone(), log.clone(), log.clone(), log.clone());
                    session.synchronized_before_suite(
                        move |_| {
                            push(&primary, "setup primary");
                            b"db-url".to_vec()
                        },
                        move |ctx, data| {
                            let data = String::from_utf8_lossy(data);
                            push(&all, format!("setup {} {}", ctx.parallel_process(), data));
                        },
                    );
                    session.synchronized_after_suite(
                        move |ctx| push(&after_all, format!("teardown {}", ctx.parallel_process())),
                        move |_| push(&after_primary, "teardown primary"),
                    );
                    for name in ["one", "two", "three", "four"] {
                        let log = log.clone();
                        session.it(name, move |_| push(&log, name));
                    }

                    let suite = SuiteConfig {
                        parallel_process: process,
                        parallel_total: 2,
                        parallel_host: Some("local".into()),
                        output_interceptor_mode: "none".into(),
                        ..SuiteConfig::default()
                    };
                    session.run_specs("Sync", vec![suite.into()]).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<RunOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(outcomes.iter().all(|o| o.passed));

        let log = log.lock().unwrap();
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert_eq!(log.iter().filter(|e| *e == "setup primary").count(), 1);
        assert!(position("setup primary") < position("setup 2 db-url"));
        assert!(log.contains(&"setup 1 db-url".to_string()));
        assert!(position("teardown 2") < position("teardown primary"));
        for name in ["one", "two", "three", "four"] {
            assert_eq!(log.iter().filter(|e| *e == name).count(), 1);
        }
    }

    #[test]
    fn test_accessors_reflect_configuration() {
        let (session, _) = session();
        assert_eq!(session.random_seed(), 1);
        assert_eq!(session.parallel_process(), 1);
        assert_eq!(session.state(), RunState::NotStarted);

        let (suite, reporter) = session.configuration();
        assert_eq!(suite.parallel_total, 1);
        assert!(reporter.no_color);

        // No interceptor is installed before the run.
        session.pause_output_interception();
        session.resume_output_interception();
    }

    #[test]
    fn test_run_arg_classification() {
        assert!(matches!(RunArg::classify(SuiteConfig::default()), RunArg::Suite(_)));
        assert!(matches!(
            RunArg::classify(RunArg::Reporter(ReporterConfig::default())),
            RunArg::Reporter(_)
        ));
        assert!(matches!(RunArg::classify(Decorator::Focus), RunArg::Unrecognized(_)));
    }
}

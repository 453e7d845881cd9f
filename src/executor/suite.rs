//! Suite execution
//!
//! Walks a built [`Tree`]: the before-suite node, then spec groups claimed
//! one at a time, then the after-suite node and suite-scope cleanups. Every
//! node body runs behind [`failer::run_protected`], so a failing node only
//! ends itself.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cleanup::CleanupScope;
use crate::config::SuiteConfig;
use crate::dsl::{RunContext, SpecContext};
use crate::error::DeclarationError;
use crate::failer::{self, Failure, FailureKind};
use crate::interrupt::InterruptHandler;
use crate::models::{
    CodeLocation, Node, NodeBody, NodeRole, ReportEntry, SpecReport, SpecState, SuiteReport,
};
use crate::output::{OutputInterceptor, Reporter, Writer};
use crate::parallel::{ParallelClient, SyncState, Topology};
use crate::utils::{Stopwatch, Timer};

use super::tree::{Disposition, Spec, Tree};

/// Everything the executor needs for one run
pub struct RunRequest {
    pub description: String,
    /// Absolute working directory of the suite
    pub path: String,
    pub tree: Tree,
    pub suite_labels: Vec<String>,
    pub config: SuiteConfig,
    pub reporter: Arc<dyn Reporter>,
    pub interceptor: Arc<dyn OutputInterceptor>,
    pub writer: Arc<Writer>,
    pub client: Option<Arc<dyn ParallelClient>>,
    pub interrupt: InterruptHandler,
}

#[derive(Debug)]
pub struct SuiteOutcome {
    pub passed: bool,
    pub has_focused_tests: bool,
    pub report: SuiteReport,
    /// Declaration errors raised while nodes were running
    pub fatal_errors: Vec<DeclarationError>,
}

pub struct Suite {
    tree: Tree,
    config: SuiteConfig,
    topology: Topology,
    run: Arc<RunContext>,
    reporter: Arc<dyn Reporter>,
    interceptor: Arc<dyn OutputInterceptor>,
    client: Option<Arc<dyn ParallelClient>>,
    interrupt: InterruptHandler,
    report: SuiteReport,
    /// Once set, every remaining spec is skipped with this reason
    halted: Option<String>,
    local_counter: usize,
}

impl Suite {
    pub fn run(request: RunRequest) -> SuiteOutcome {
        let RunRequest {
            description,
            path,
            mut tree,
            suite_labels,
            config,
            reporter,
            interceptor,
            writer,
            client,
            interrupt,
        } = request;

        let has_focused_tests = tree.apply_filters(&config, &suite_labels);
        let topology = config.topology();

        let mut report = SuiteReport::new(description, path);
        report.suite_labels = suite_labels;
        report.random_seed = config.random_seed;
        report.parallel_process = topology.process;
        report.parallel_total = topology.total;
        report.total_specs = tree.specs().len();
        report.specs_that_will_run = tree.specs_that_will_run();

        let run = Arc::new(RunContext::new(
            writer,
            config.random_seed,
            topology.process,
        ));

        let mut suite = Suite {
            tree,
            config,
            topology,
            run,
            reporter,
            interceptor,
            client,
            interrupt,
            report,
            halted: None,
            local_counter: 0,
        };
        suite.execute();

        let fatal_errors = suite.run.take_fatal_errors();
        for err in &fatal_errors {
            suite.report.special_failure_reasons.push(err.to_string());
        }
        suite.report.end_time = Utc::now();
        suite.report.succeeded = suite.succeeded();
        suite.reporter.suite_did_end(&suite.report);

        info!(
            "suite {:?} {} ({})",
            suite.report.description,
            if suite.report.succeeded { "passed" } else { "failed" },
            suite.topology
        );

        SuiteOutcome {
            passed: suite.report.succeeded,
            has_focused_tests,
            report: suite.report,
            fatal_errors,
        }
    }

    fn execute(&mut self) {
        self.reporter.suite_will_begin(&self.report);
        info!(
            "running {} of {} specs ({})",
            self.report.specs_that_will_run, self.report.total_specs, self.topology
        );

        let mut phases = Stopwatch::new();
        let run_suite_nodes = !self.config.dry_run && self.report.specs_that_will_run > 0;

        if run_suite_nodes && !self.run_before_suite() {
            warn!("before-suite node failed, skipping every spec");
            self.halted = Some("BeforeSuite failed".to_string());
        }
        phases.lap("before suite");

        let groups = self.ordered_groups();
        loop {
            let next = match self.claim_next_group() {
                Ok(next) => next,
                Err(e) => {
                    error!("could not claim the next spec group: {:#}", e);
                    self.report
                        .special_failure_reasons
                        .push(format!("Failed to coordinate with other processes: {e:#}"));
                    break;
                }
            };
            let Some(group) = groups.get(next) else {
                break;
            };
            self.run_group(group);
        }
        phases.lap("specs");

        if run_suite_nodes {
            self.run_after_suite();
        }
        if self.topology.is_parallel() && !self.topology.is_primary() {
            if let Some(client) = &self.client {
                if let Err(e) = client.post_did_finish(self.topology.process) {
                    error!("could not report completion to the primary process: {:#}", e);
                }
            }
        }
        phases.lap("after suite");
        debug!("suite phases: {}", phases.format());
    }

    fn ordered_groups(&self) -> Vec<Vec<usize>> {
        let mut groups = self.tree.groups();
        if self.config.randomize_all_specs {
            let mut rng = StdRng::seed_from_u64(self.config.random_seed);
            groups.shuffle(&mut rng);
        }
        groups
    }

    fn claim_next_group(&mut self) -> anyhow::Result<usize> {
        match &self.client {
            Some(client) if self.topology.is_parallel() => client.fetch_next_counter(),
            _ => {
                let next = self.local_counter;
                self.local_counter += 1;
                Ok(next)
            }
        }
    }

    fn run_group(&mut self, group: &[usize]) {
        let ordered = self.tree.spec(group[0]).ordered_root.is_some();
        let mut opened = false;
        let mut closed = false;
        let mut group_failed = false;
        let mut last_ran: Option<usize> = None;

        for (position, &index) in group.iter().enumerate() {
            let spec = self.tree.spec(index).clone();
            let report = self.spec_report(&spec);

            if self.halted.is_none() {
                if let Some(cause) = self.interrupt.status() {
                    warn!("{}, skipping remaining specs", cause);
                    self.report.special_failure_reasons.push(cause.to_string());
                    self.halted = Some(cause.to_string());
                }
            }

            let report = match (&self.halted, &spec.disposition) {
                (Some(reason), Disposition::Run) => self.not_run(report, SpecState::Skipped, reason),
                (_, Disposition::Pending) => self.not_run(report, SpecState::Pending, "pending"),
                (_, Disposition::Skipped(reason)) => {
                    self.not_run(report, SpecState::Skipped, reason)
                }
                (None, Disposition::Run) if group_failed => self.not_run(
                    report,
                    SpecState::Skipped,
                    "an earlier spec in the Ordered container failed",
                ),
                (None, Disposition::Run) if self.config.dry_run => {
                    self.reporter.will_run(&report);
                    self.reporter.did_run(&report);
                    report
                }
                (None, Disposition::Run) => {
                    let last = !group[position + 1..]
                        .iter()
                        .any(|&i| self.tree.spec(i).disposition == Disposition::Run);
                    let open = ordered && !opened;
                    opened = true;
                    last_ran = Some(index);
                    let (report, did_close) = self.run_spec(&spec, report, open, ordered, last);
                    closed |= did_close;
                    report
                }
            };

            if ordered && report.state.is_failure() {
                group_failed = true;
            }
            self.after_spec(&report);
            self.report.specs.push(report);
        }

        if opened && !closed {
            if let Some(index) = last_ran {
                let spec = self.tree.spec(index).clone();
                self.close_orphaned_group(&spec);
            }
        }
    }

    /// Halt the suite when a finished spec calls for it
    fn after_spec(&mut self, report: &SpecReport) {
        if self.halted.is_some() {
            return;
        }
        let aborted = report.state == SpecState::Aborted
            || report.failure.as_ref().is_some_and(Failure::aborts_suite);
        let reason = if aborted {
            "the suite was aborted by an earlier spec"
        } else if self.config.fail_fast && report.state.is_failure() {
            "--grove.fail-fast: an earlier spec failed"
        } else {
            return;
        };
        warn!("{}", reason);
        self.halted = Some(reason.to_string());
        if let Some(client) = &self.client {
            if let Err(e) = client.post_abort() {
                error!("could not tell other processes to abort: {:#}", e);
            }
        }
    }

    fn spec_report(&self, spec: &Spec) -> SpecReport {
        let subject = self.tree.node(spec.subject);
        let mut report = SpecReport::new(
            self.tree.container_texts(spec),
            subject.text.clone(),
            NodeRole::It,
            subject.location.clone(),
        );
        report.labels = spec.labels.clone();
        report.parallel_process = self.topology.process;
        report
    }

    fn not_run(&self, report: SpecReport, state: SpecState, reason: &str) -> SpecReport {
        debug!("{} {}: {}", state, report.full_text(), reason);
        let report = report.with_state(state, reason);
        self.reporter.will_run(&report);
        self.reporter.did_run(&report);
        report
    }

    /// Run one spec with its hooks. Returns the report and whether the
    /// Ordered group's AfterAll hooks ran.
    fn run_spec(
        &self,
        spec: &Spec,
        report: SpecReport,
        opens_group: bool,
        ordered: bool,
        last_in_group: bool,
    ) -> (SpecReport, bool) {
        let mut closed = false;
        let report = self.run_reported(report, |suite, entries| {
            if opens_group {
                suite.run_hooks(&suite.tree.all_hooks(spec, NodeRole::BeforeAll), entries);
            }
            for role in [NodeRole::BeforeEach, NodeRole::JustBeforeEach] {
                suite.run_hooks(&suite.tree.each_hooks(spec, role), entries);
            }
            if !suite.run.failer.is_set() {
                suite.run_node(suite.tree.node(spec.subject), entries);
            }

            for role in [NodeRole::JustAfterEach, NodeRole::AfterEach] {
                for hook in suite.tree.each_hooks(spec, role) {
                    suite.run_node(suite.tree.node(hook), entries);
                }
            }
            suite.run_cleanups(CleanupScope::Spec, entries);

            let group_ends = last_in_group
                || suite
                    .run
                    .failer
                    .snapshot()
                    .is_some_and(|f| f.kind != FailureKind::Skip)
                || suite.interrupt.status().is_some();
            if ordered && group_ends {
                suite.close_group(spec, entries);
                closed = true;
            }
        });
        (report, closed)
    }

    /// AfterAll hooks and ordered-container cleanups
    fn close_group(&self, spec: &Spec, entries: &mut Vec<ReportEntry>) {
        for hook in self.tree.all_hooks(spec, NodeRole::AfterAll) {
            self.run_node(self.tree.node(hook), entries);
        }
        self.run_cleanups(CleanupScope::OrderedContainer, entries);
    }

    /// An Ordered group whose last runnable spec was skipped still gets its
    /// AfterAll hooks, reported on their own
    fn close_orphaned_group(&mut self, spec: &Spec) {
        let location = spec
            .ordered_root
            .map(|root| self.tree.node(root).location.clone())
            .unwrap_or_default();
        let mut report = SpecReport::new(
            self.tree.container_texts(spec),
            "",
            NodeRole::AfterAll,
            location,
        );
        report.parallel_process = self.topology.process;
        let report = self.run_reported(report, |suite, entries| suite.close_group(spec, entries));
        self.report.specs.push(report);
    }

    /// Run setup hooks in order, stopping at the first failure
    fn run_hooks(&self, hooks: &[usize], entries: &mut Vec<ReportEntry>) {
        for &hook in hooks {
            if self.run.failer.is_set() {
                return;
            }
            self.run_node(self.tree.node(hook), entries);
        }
    }

    fn run_node(&self, node: &Node, entries: &mut Vec<ReportEntry>) {
        if let Some(body) = node.spec_body() {
            self.run_body(node.role, &node.location, entries, |ctx| body(ctx));
        }
    }

    fn run_body<F>(
        &self,
        role: NodeRole,
        location: &CodeLocation,
        entries: &mut Vec<ReportEntry>,
        body: F,
    ) where
        F: FnOnce(&SpecContext),
    {
        debug!("running {} at {}", role, location);
        let ctx = SpecContext::new(self.run.clone(), role);
        if !failer::run_protected(&self.run.failer, location, || body(&ctx)) {
            debug!("{} at {} did not complete", role, location);
        }
        entries.extend(ctx.finish());
        self.run.failer.annotate_role(role);
    }

    fn run_cleanups(&self, scope: CleanupScope, entries: &mut Vec<ReportEntry>) {
        for registration in self.run.registry.drain(scope) {
            let node = Node::cleanup(registration.scope, registration.body, registration.location);
            self.run_node(&node, entries);
        }
    }

    /// Run `steps` with output captured and the outcome folded into `report`
    fn run_reported<F>(&self, mut report: SpecReport, steps: F) -> SpecReport
    where
        F: FnOnce(&Self, &mut Vec<ReportEntry>),
    {
        self.reporter.will_run(&report);
        self.run.failer.reset();
        self.run.writer.truncate();
        self.interceptor.start_intercepting();

        let timer = Timer::start(report.full_text());
        report.start_time = Utc::now();
        let mut entries = Vec::new();
        steps(self, &mut entries);

        report.duration_ms = timer.stop();
        report.captured_output = self.interceptor.stop_intercepting_and_return_output();
        report.writer_output = self.run.writer.contents();
        report.entries = entries;
        if let Some(failure) = self.run.failer.drain() {
            report.state = failure.kind.spec_state();
            report.failure = Some(failure);
        }

        self.reporter.did_run(&report);
        report
    }

    fn suite_node_report(&self, node: &Node) -> SpecReport {
        let mut report = SpecReport::new(Vec::new(), "", node.role, node.location.clone());
        report.parallel_process = self.topology.process;
        report
    }

    /// Returns false when the before-suite node failed
    fn run_before_suite(&mut self) -> bool {
        let Some(index) = self.tree.before_suite() else {
            return true;
        };
        info!("running {}", self.tree.node(index).role);
        let node = self.tree.node(index);
        let report = self.run_reported(self.suite_node_report(node), |suite, entries| {
            match &node.body {
                NodeBody::SynchronizedBeforeSuite {
                    primary,
                    all_processes,
                } => suite.synchronize_before_suite(node, primary, all_processes, entries),
                _ => suite.run_node(node, entries),
            }
        });
        let passed = !report.state.is_failure();
        self.report.specs.push(report);
        passed
    }

    fn synchronize_before_suite(
        &self,
        node: &Node,
        primary: &crate::models::PrimaryFn,
        all_processes: &crate::models::AllProcessFn,
        entries: &mut Vec<ReportEntry>,
    ) {
        let client = self.client.as_ref().filter(|_| self.topology.is_parallel());

        let data = if self.topology.is_primary() {
            let mut data = Vec::new();
            self.run_body(node.role, &node.location, entries, |ctx| data = primary(ctx));
            let state = if self.run.failer.is_set() {
                SyncState::Failed
            } else {
                SyncState::Passed
            };
            if let Some(client) = client {
                if let Err(e) =
                    client.post_synchronized_before_suite_completed(state, data.clone())
                {
                    error!("could not publish before-suite state: {:#}", e);
                    self.record_failure(
                        format!("could not publish SynchronizedBeforeSuite state: {e:#}"),
                        node,
                    );
                }
            }
            (state == SyncState::Passed).then_some(data)
        } else {
            match client.map(|c| c.block_until_synchronized_before_suite_data()) {
                Some(Ok((SyncState::Passed, data))) => Some(data),
                Some(Ok((SyncState::Failed, _))) => {
                    self.record_failure(
                        "SynchronizedBeforeSuite failed on parallel process #1".to_string(),
                        node,
                    );
                    None
                }
                Some(Err(e)) => {
                    error!("could not receive before-suite state: {:#}", e);
                    self.record_failure(
                        format!("could not receive SynchronizedBeforeSuite state: {e:#}"),
                        node,
                    );
                    None
                }
                None => {
                    self.record_failure(
                        "no parallel client to receive SynchronizedBeforeSuite state".to_string(),
                        node,
                    );
                    None
                }
            }
        };

        if let Some(data) = data {
            self.run_body(node.role, &node.location, entries, |ctx| {
                all_processes(ctx, &data)
            });
        }
    }

    fn record_failure(&self, message: String, node: &Node) {
        let mut failure = Failure::new(FailureKind::Failure, message, node.location.clone());
        failure.node_role = Some(node.role);
        self.run.failer.record(failure);
    }

    fn run_after_suite(&mut self) {
        let node = self.tree.after_suite().map(|i| self.tree.node(i));
        if node.is_none() && self.run.registry.pending(CleanupScope::Suite) == 0 {
            return;
        }

        let report = match node {
            Some(node) => {
                info!("running {}", node.role);
                self.suite_node_report(node)
            }
            None => {
                let mut report = SpecReport::new(
                    Vec::new(),
                    "",
                    NodeRole::Cleanup,
                    CodeLocation::default(),
                );
                report.parallel_process = self.topology.process;
                report
            }
        };

        let report = self.run_reported(report, |suite, entries| {
            if let Some(node) = node {
                match &node.body {
                    NodeBody::SynchronizedAfterSuite {
                        all_processes,
                        primary,
                    } => {
                        suite.run_body(node.role, &node.location, entries, |ctx| {
                            all_processes(ctx)
                        });
                        if suite.topology.is_primary() {
                            suite.wait_for_other_processes(node);
                            suite.run_body(node.role, &node.location, entries, |ctx| primary(ctx));
                        }
                    }
                    _ => suite.run_node(node, entries),
                }
            }
            suite.run_cleanups(CleanupScope::Suite, entries);
        });
        self.report.specs.push(report);
    }

    fn wait_for_other_processes(&self, node: &Node) {
        let Some(client) = self.client.as_ref().filter(|_| self.topology.is_parallel()) else {
            return;
        };
        debug!("waiting for non-primary processes to finish");
        if let Err(e) = client.block_until_non_primary_procs_have_finished() {
            error!("could not wait for other processes: {:#}", e);
            self.record_failure(
                format!("could not wait for other parallel processes: {e:#}"),
                node,
            );
        }
    }

    fn succeeded(&self) -> bool {
        let failed = self.report.specs.iter().any(|s| s.state.is_failure());
        let pending = self.config.fail_on_pending && self.report.pending() > 0;
        !failed && !pending && self.report.special_failure_reasons.is_empty()
    }
}

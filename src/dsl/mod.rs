//! Declaration DSL
//!
//! [`Declare`] provides the node-registration grammar. It is implemented by
//! [`Session`](crate::Session) for top-level declarations and by [`Dsl`],
//! the handle container bodies receive, for nested ones. Every method is
//! `#[track_caller]`, so nodes record the location of the user's call.
//!
//! ```no_run
//! use grove::{Declare, Session};
//!
//! let mut session = Session::new();
//! session.describe("Cart", |d| {
//!     d.before_each(|ctx| ctx.writer().println("fresh cart"));
//!     d.it("starts empty", |ctx| {
//!         if 1 + 1 != 2 {
//!             ctx.fail("arithmetic is broken");
//!         }
//!     });
//! });
//! ```

mod context;

pub use context::SpecContext;
pub(crate) use context::RunContext;

use std::sync::Arc;

use crate::deprecation::{Deprecation, DeprecationTracker};
use crate::error::DeclarationError;
use crate::executor::TreeBuilder;
use crate::models::{CodeLocation, Decorator, Node, NodeArg, NodeRole};

/// Handle passed to container bodies
pub struct Dsl<'a> {
    builder: &'a mut TreeBuilder,
}

impl<'a> Dsl<'a> {
    pub(crate) fn new(builder: &'a mut TreeBuilder) -> Self {
        Self { builder }
    }

    /// Deprecated: register a subject that runs `body` `samples` times.
    #[deprecated(note = "time the operation inside `it` and use SpecContext::add_report_entry")]
    #[track_caller]
    pub fn measure<F>(&mut self, text: impl Into<String>, samples: usize, body: F)
    where
        F: Fn(&SpecContext) + Send + Sync + 'static,
    {
        let location = CodeLocation::caller();
        self.builder
            .deprecations()
            .track(Deprecation::measure(), Some(location.clone()));
        let node = Node::new(
            NodeRole::It,
            text,
            vec![NodeArg::body(move |ctx| {
                for _ in 0..samples {
                    body(ctx);
                }
            })],
            location,
        );
        self.push_node(node);
    }
}

impl Declare for Dsl<'_> {
    fn push_node(&mut self, node: Result<Node, Vec<DeclarationError>>) {
        match node {
            Ok(node) => self.builder.push(node),
            Err(errors) => self.builder.record_errors(errors),
        }
    }

    fn deprecations(&self) -> &DeprecationTracker {
        self.builder.deprecations()
    }
}

/// Node-registration grammar.
///
/// `f`-prefixed forms add `Focus`, `p`- and `x`-prefixed forms add `Pending`.
/// The `_with` forms take extra decorators.
pub trait Declare {
    /// Record a constructed node, or the errors from constructing it
    fn push_node(&mut self, node: Result<Node, Vec<DeclarationError>>);

    fn deprecations(&self) -> &DeprecationTracker;

    /// General form taking a classified argument list
    #[track_caller]
    fn declare(&mut self, role: NodeRole, text: impl Into<String>, args: Vec<NodeArg>) {
        let node = Node::new(role, text, args, CodeLocation::caller());
        self.push_node(node);
    }

    #[track_caller]
    fn describe_with<D, F>(&mut self, text: impl Into<String>, decorators: D, body: F)
    where
        D: IntoIterator<Item = Decorator>,
        F: FnOnce(&mut Dsl) + 'static,
    {
        let mut args = vec![NodeArg::container(body)];
        args.extend(decorators.into_iter().map(NodeArg::from));
        self.declare(NodeRole::Container, text, args);
    }

    #[track_caller]
    fn describe(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [], body)
    }

    #[track_caller]
    fn fdescribe(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [Decorator::Focus], body)
    }

    #[track_caller]
    fn pdescribe(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn xdescribe(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn context(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [], body)
    }

    #[track_caller]
    fn fcontext(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [Decorator::Focus], body)
    }

    #[track_caller]
    fn pcontext(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn xcontext(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn when(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(format!("when {}", text.into()), [], body)
    }

    #[track_caller]
    fn fwhen(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(format!("when {}", text.into()), [Decorator::Focus], body)
    }

    #[track_caller]
    fn pwhen(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(format!("when {}", text.into()), [Decorator::Pending], body)
    }

    #[track_caller]
    fn xwhen(&mut self, text: impl Into<String>, body: impl FnOnce(&mut Dsl) + 'static) {
        self.describe_with(format!("when {}", text.into()), [Decorator::Pending], body)
    }

    #[track_caller]
    fn it_with<D, F>(&mut self, text: impl Into<String>, decorators: D, body: F)
    where
        D: IntoIterator<Item = Decorator>,
        F: Fn(&SpecContext) + Send + Sync + 'static,
    {
        let mut args = vec![NodeArg::body(body)];
        args.extend(decorators.into_iter().map(NodeArg::from));
        self.declare(NodeRole::It, text, args);
    }

    #[track_caller]
    fn it(&mut self, text: impl Into<String>, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.it_with(text, [], body)
    }

    #[track_caller]
    fn fit(&mut self, text: impl Into<String>, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.it_with(text, [Decorator::Focus], body)
    }

    #[track_caller]
    fn pit(&mut self, text: impl Into<String>, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.it_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn xit(&mut self, text: impl Into<String>, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.it_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn specify(
        &mut self,
        text: impl Into<String>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) {
        self.it_with(text, [], body)
    }

    #[track_caller]
    fn fspecify(
        &mut self,
        text: impl Into<String>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) {
        self.it_with(text, [Decorator::Focus], body)
    }

    #[track_caller]
    fn pspecify(
        &mut self,
        text: impl Into<String>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) {
        self.it_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn xspecify(
        &mut self,
        text: impl Into<String>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) {
        self.it_with(text, [Decorator::Pending], body)
    }

    #[track_caller]
    fn before_each(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::BeforeEach, "", vec![NodeArg::body(body)]);
    }

    #[track_caller]
    fn just_before_each(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::JustBeforeEach, "", vec![NodeArg::body(body)]);
    }

    #[track_caller]
    fn after_each(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::AfterEach, "", vec![NodeArg::body(body)]);
    }

    #[track_caller]
    fn just_after_each(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::JustAfterEach, "", vec![NodeArg::body(body)]);
    }

    /// Runs once before the first spec of the enclosing Ordered container
    #[track_caller]
    fn before_all(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::BeforeAll, "", vec![NodeArg::body(body)]);
    }

    /// Runs once after the last spec of the enclosing Ordered container
    #[track_caller]
    fn after_all(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::AfterAll, "", vec![NodeArg::body(body)]);
    }

    #[track_caller]
    fn before_suite(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::BeforeSuite, "", vec![NodeArg::body(body)]);
    }

    #[track_caller]
    fn after_suite(&mut self, body: impl Fn(&SpecContext) + Send + Sync + 'static) {
        self.declare(NodeRole::AfterSuite, "", vec![NodeArg::body(body)]);
    }

    /// `primary` runs on process 1 only and its bytes are handed to
    /// `all_processes` on every process
    #[track_caller]
    fn synchronized_before_suite<P, A>(&mut self, primary: P, all_processes: A)
    where
        P: Fn(&SpecContext) -> Vec<u8> + Send + Sync + 'static,
        A: Fn(&SpecContext, &[u8]) + Send + Sync + 'static,
    {
        self.declare(
            NodeRole::SynchronizedBeforeSuite,
            "",
            vec![NodeArg::SynchronizedBeforeSuite(
                Arc::new(primary),
                Arc::new(all_processes),
            )],
        );
    }

    /// `all_processes` runs everywhere; `primary` runs on process 1 once
    /// every other process has finished
    #[track_caller]
    fn synchronized_after_suite<A, P>(&mut self, all_processes: A, primary: P)
    where
        A: Fn(&SpecContext) + Send + Sync + 'static,
        P: Fn(&SpecContext) + Send + Sync + 'static,
    {
        self.declare(
            NodeRole::SynchronizedAfterSuite,
            "",
            vec![NodeArg::SynchronizedAfterSuite(
                Arc::new(all_processes),
                Arc::new(primary),
            )],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Disposition;
    use crate::models::label;

    fn builder() -> TreeBuilder {
        TreeBuilder::new(Arc::new(DeprecationTracker::new()))
    }

    #[test]
    fn test_aliases_share_one_constructor() {
        let mut builder = builder();
        {
            let mut d = Dsl::new(&mut builder);
            d.when("empty", |d| {
                d.xit("skipped", |_| {});
                d.fspecify("focused", |_| {});
            });
            d.xcontext("later", |d| d.specify("pending by ancestry", |_| {}));
        }
        let mut tree = builder.build().unwrap();
        assert!(tree.apply_filters(&Default::default(), &[]));

        let dispositions: Vec<_> = tree.specs().iter().map(|s| s.disposition.clone()).collect();
        assert_eq!(
            dispositions,
            vec![Disposition::Pending, Disposition::Run, Disposition::Pending]
        );
        assert_eq!(tree.full_text(tree.spec(1)), "when empty focused");
    }

    #[test]
    fn test_location_is_users_call_site() {
        let mut builder = builder();
        let line = line!() + 1;
        Dsl::new(&mut builder).it_with("x", [label(["fast"])], |_| {});
        let tree = builder.build().unwrap();
        let node = tree.node(tree.spec(0).subject);
        assert_eq!(node.location.line, line);
        assert!(node.location.file.ends_with("mod.rs"));
        assert_eq!(node.labels, vec!["fast"]);
    }

    #[inline(never)]
    fn shared_subject(d: &mut Dsl) {
        d.it_with("shared", [Decorator::Offset(1)], |_| {});
    }

    #[test]
    fn test_offset_reports_the_wrappers_caller() {
        let mut builder = builder();
        let line = line!() + 1;
        shared_subject(&mut Dsl::new(&mut builder));
        let tree = builder.build().unwrap();
        let node = tree.node(tree.spec(0).subject);
        assert_eq!(node.location.line, line);
        assert_eq!(node.location.offset, 1);
        assert!(node.location.file.ends_with("mod.rs"));
    }

    #[test]
    fn test_errors_from_several_calls_accumulate() {
        let mut builder = builder();
        {
            let mut d = Dsl::new(&mut builder);
            d.declare(NodeRole::It, "no body", vec![]);
            d.it_with("ordered subject", [Decorator::Ordered], |_| {});
        }
        let errors = builder.build().err().unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    #[allow(deprecated)]
    fn test_measure_is_tracked() {
        let tracker = Arc::new(DeprecationTracker::new());
        let mut builder = TreeBuilder::new(tracker.clone());
        Dsl::new(&mut builder).measure("timing", 3, |_| {});
        let tree = builder.build().unwrap();
        assert_eq!(tree.specs().len(), 1);
        assert!(tracker.did_track());
        assert!(tracker.report().contains("Dsl::measure"));
    }
}

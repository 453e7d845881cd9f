//! grove - behavior-driven spec trees for Rust test binaries
//!
//! Declare containers, setup hooks and subjects as a tree, then run them with
//! focus, pending, labels, ordered containers, deferred cleanup and
//! parallel sharding across processes.
//!
//! ## Features
//!
//! - Nested `describe`/`context`/`when` containers with `it` subjects
//! - BeforeEach/JustBeforeEach/AfterEach/JustAfterEach, BeforeAll/AfterAll in
//!   Ordered containers, and suite-level (optionally synchronized) nodes
//! - `fail`, `skip` and `abort_suite` that stop only the running node
//! - `defer_cleanup` scoped to the spec, ordered container or suite
//! - Focus/skip/label filtering from code, config files, env or `--grove.*` flags
//! - Parallel runs coordinated over HTTP or in-process
//!
//! ## Usage
//!
//! ```no_run
//! use grove::{run_specs_or_exit, Declare, Session};
//!
//! let mut session = Session::from_process().expect("valid configuration");
//! session.describe("Stack", |d| {
//!     d.it("starts empty", |ctx| {
//!         let stack: Vec<u8> = Vec::new();
//!         if !stack.is_empty() {
//!             ctx.fail("new stacks should be empty");
//!         }
//!     });
//! });
//! run_specs_or_exit(&mut session, &|| panic!("suite failed"), "Stack Suite", vec![]);
//! ```

pub mod cleanup;
pub mod config;
pub mod deprecation;
pub mod dsl;
pub mod error;
pub mod executor;
pub mod failer;
pub mod interrupt;
pub mod lifecycle;
pub mod models;
pub mod output;
pub mod parallel;
pub mod utils;

pub use cleanup::{CleanupOutcome, CleanupScope};
pub use config::{GroveConfig, ReporterConfig, SuiteConfig};
pub use dsl::{Declare, Dsl, SpecContext};
pub use error::{ConfigError, DeclarationError, GroveError};
pub use failer::{Failure, FailureKind};
pub use lifecycle::{run_specs_or_exit, FailHandle, RunArg, RunOutcome, Session, FOCUS_EXIT_CODE};
pub use models::{
    label, CodeLocation, Decorator, Labels, NodeArg, NodeRole, SpecReport, SpecState, SuiteReport,
};

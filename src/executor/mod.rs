//! Spec tree assembly and execution
//!
//! [`TreeBuilder`] turns declarations into a [`Tree`]; [`Suite`] runs it.

mod suite;
mod tree;

pub use suite::{RunRequest, Suite, SuiteOutcome};
pub use tree::{Disposition, Spec, Tree, TreeBuilder};

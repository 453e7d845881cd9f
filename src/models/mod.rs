//! Data models for spec trees and their reports
//!
//! This module contains the node descriptions produced by declarations and
//! the reports produced by runs.

mod location;
mod node;
mod report;

pub use location::CodeLocation;
pub use node::{
    label, validate_label, AllProcessFn, ContainerFn, CustomDecorator, Decorator, Labels, Node,
    NodeArg, NodeRole, PrimaryFn, SpecFn,
};
pub(crate) use node::NodeBody;
pub use report::{ReportEntry, SpecReport, SpecState, SuiteReport};

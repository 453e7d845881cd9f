//! Error types
//!
//! Spec-level failures (`fail`, `skip`, `abort_suite`, panics) are not errors:
//! they are recorded by the [`Failer`](crate::failer::Failer) and end up in
//! reports. The types here cover everything that stops a suite from running.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::models::{CodeLocation, NodeRole};

/// Malformed declarations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    #[error("{location}: {role} received an argument of unrecognized type `{type_name}`")]
    UnrecognizedArgument {
        role: NodeRole,
        type_name: String,
        location: CodeLocation,
    },

    #[error("{location}: {role} was given more than one body")]
    MultipleBodies {
        role: NodeRole,
        location: CodeLocation,
    },

    #[error("{location}: {role} requires a body")]
    MissingBody {
        role: NodeRole,
        location: CodeLocation,
    },

    #[error("{location}: {role} cannot take a {body} body")]
    WrongBodyKind {
        role: NodeRole,
        body: &'static str,
        location: CodeLocation,
    },

    #[error("{location}: the {decorator} decorator cannot be applied to {role}")]
    InvalidDecorator {
        role: NodeRole,
        decorator: &'static str,
        location: CodeLocation,
    },

    #[error("{location}: {role} cannot be both focused and pending")]
    FocusedAndPending {
        role: NodeRole,
        location: CodeLocation,
    },

    #[error("{location}: invalid label {label:?}: {reason}")]
    InvalidLabel {
        label: String,
        reason: &'static str,
        location: CodeLocation,
    },

    #[error("{location}: cannot declare {role} inside {parent}")]
    InvalidNesting {
        role: NodeRole,
        parent: NodeRole,
        location: CodeLocation,
    },

    #[error("{location}: {role} must be declared at the top level")]
    SuiteNodeNotAtTopLevel {
        role: NodeRole,
        location: CodeLocation,
    },

    #[error("{location}: {role} conflicts with the {existing} declared at {existing_location}")]
    DuplicateSuiteNode {
        role: NodeRole,
        existing: NodeRole,
        existing_location: CodeLocation,
        location: CodeLocation,
    },

    #[error("{location}: {role} must be declared inside an Ordered container")]
    OutsideOrderedContainer {
        role: NodeRole,
        location: CodeLocation,
    },

    #[error("{location}: defer_cleanup must be called from a setup or subject node that is still running")]
    CleanupOutsideNode { location: CodeLocation },

    #[error("{location}: defer_cleanup cannot be called from inside a cleanup callback")]
    CleanupInCleanup { location: CodeLocation },
}

/// Invalid suite or reporter configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("run_specs received an argument of unrecognized type `{0}`")]
    UnrecognizedRunArgument(String),

    #[error("--grove.parallel.total must be at least 1 (got {0})")]
    InvalidParallelTotal(usize),

    #[error("--grove.parallel.process must be between 1 and {total} (got {process})")]
    InvalidParallelProcess { process: usize, total: usize },

    #[error("--grove.parallel.host must be set when running in parallel")]
    MissingParallelHost,

    #[error("--grove.dry-run cannot be combined with parallel processes")]
    DryRunInParallel,

    #[error("--grove.v and --grove.succinct cannot both be set")]
    VerboseAndSuccinct,

    #[error("invalid label filter {label:?}: {reason}")]
    InvalidLabelFilter { label: String, reason: &'static str },

    #[error("invalid --grove flags: {0}")]
    Flags(String),

    #[error("could not load configuration: {0}")]
    File(String),
}

/// Errors that prevent a suite run
#[derive(Error, Debug)]
pub enum GroveError {
    #[error("{}", ErrorList(.0))]
    Declaration(Vec<DeclarationError>),

    #[error("{}", ErrorList(.0))]
    Configuration(Vec<ConfigError>),

    #[error("could not reach the parallel coordination host at {0}")]
    UnreachableParallelHost(String),

    #[error("could not determine the suite's working directory: {0}")]
    WorkingDirectory(#[source] io::Error),

    #[error("run_specs was called more than once; a suite may only run once per process")]
    RerunningSuite,

    #[error("failed to generate report: {0}")]
    Report(String),
}

impl GroveError {
    /// Heading printed above the error on the way out of the process
    pub fn heading(&self) -> &'static str {
        match self {
            GroveError::Declaration(_) => "grove detected issues with the spec tree:",
            GroveError::Configuration(_) => "grove detected configuration issues:",
            _ => "grove could not run the suite:",
        }
    }
}

struct ErrorList<'a, E>(&'a Vec<E>);

impl<E: fmt::Display> fmt::Display for ErrorList<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {err}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, GroveError>;

//! Source locations attached to nodes and failures

use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use tracing::debug;

/// A file/line pair pointing at user code
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Frame offset requested through the `Offset` decorator
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl CodeLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: 0,
            offset: 0,
        }
    }

    /// Capture the location of the caller.
    ///
    /// Every public entry point that records a location is `#[track_caller]`,
    /// so helpers that are themselves `#[track_caller]` report the location of
    /// *their* caller instead of their own.
    #[track_caller]
    pub fn caller() -> Self {
        Self::from(Location::caller())
    }

    /// Move `offset` frames up the current call stack from this location.
    ///
    /// Used by wrappers that declare nodes on behalf of their caller without
    /// being `#[track_caller]` themselves. The location has to be a frame of
    /// the current stack; when it cannot be found in the captured backtrace
    /// (no debug info, or a synthetic location) it is kept as is.
    pub fn with_offset(self, offset: usize) -> Self {
        if offset == 0 {
            return self;
        }
        let trace = Backtrace::force_capture().to_string();
        let frames = stack_frames(&trace);
        let adjusted = frames
            .iter()
            .position(|frame| frame.same_line(&self))
            .and_then(|start| frames.get(start + offset))
            .cloned();
        match adjusted {
            Some(frame) => Self { offset, ..frame },
            None => {
                debug!("no frame {} above {}, keeping it", offset, self);
                Self { offset, ..self }
            }
        }
    }

    fn same_line(&self, other: &CodeLocation) -> bool {
        if self.line != other.line || other.is_unknown() {
            return false;
        }
        let theirs = other.file.trim_start_matches("./");
        let ours = self.file.as_str();
        ours == theirs || ours.ends_with(&format!("/{theirs}"))
    }

    pub fn is_unknown(&self) -> bool {
        self.file.is_empty()
    }
}

impl From<&Location<'_>> for CodeLocation {
    fn from(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
            offset: 0,
        }
    }
}

/// Source positions of a rendered backtrace, innermost first
fn stack_frames(trace: &str) -> Vec<CodeLocation> {
    trace
        .lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .filter_map(|position| {
            let mut parts = position.rsplitn(3, ':');
            let column = parts.next()?.parse().ok()?;
            let line = parts.next()?.parse().ok()?;
            let file = parts.next()?.trim_start_matches("./");
            Some(CodeLocation {
                file: file.to_string(),
                line,
                column,
                offset: 0,
            })
        })
        .collect()
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "<unknown>");
        }
        write!(f, "{}:{}", self.file, self.line)
    }
}

//! Deprecation tracking
//!
//! Deprecated declaration forms and flags are recorded while the suite is
//! declared and configured, then reported once at the end of the run.

use std::fmt::Write as _;
use std::sync::Mutex;

use crate::models::CodeLocation;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deprecation {
    pub message: String,
    /// Release in which the deprecated form will be removed
    pub removed_in: Option<String>,
}

impl Deprecation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            removed_in: None,
        }
    }

    pub fn removed_in(mut self, version: impl Into<String>) -> Self {
        self.removed_in = Some(version.into());
        self
    }

    pub fn measure() -> Self {
        Self::new(
            "Dsl::measure is deprecated; time the operation inside an `it` and record it \
             with SpecContext::add_report_entry instead",
        )
        .removed_in("0.3.0")
    }

    pub fn slow_spec_threshold() -> Self {
        Self::new(
            "--grove.slow-spec-threshold is deprecated and has no effect; spec durations are \
             always included in reports",
        )
        .removed_in("0.3.0")
    }
}

#[derive(Debug, Default)]
pub struct DeprecationTracker {
    tracked: Mutex<Vec<(Deprecation, Vec<CodeLocation>)>>,
}

impl DeprecationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a use of `deprecation`, optionally with where it happened
    pub fn track(&self, deprecation: Deprecation, location: Option<CodeLocation>) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        let index = match tracked.iter().position(|(d, _)| *d == deprecation) {
            Some(index) => index,
            None => {
                tracked.push((deprecation, Vec::new()));
                tracked.len() - 1
            }
        };
        if let Some(location) = location {
            tracked[index].1.push(location);
        }
    }

    pub fn did_track(&self) -> bool {
        !self
            .tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Consolidated report of everything tracked, in first-use order
    pub fn report(&self) -> String {
        let tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        out.push_str("You're using deprecated grove functionality:\n");
        out.push_str("=============================================\n");
        for (deprecation, locations) in tracked.iter() {
            let _ = writeln!(out, "  {}", deprecation.message);
            if let Some(version) = &deprecation.removed_in {
                let _ = writeln!(out, "  Scheduled for removal in {version}");
            }
            for location in locations {
                let _ = writeln!(out, "    {location}");
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_groups_locations() {
        let tracker = DeprecationTracker::new();
        assert!(!tracker.did_track());

        tracker.track(Deprecation::measure(), Some(CodeLocation::new("a.rs", 3)));
        tracker.track(Deprecation::measure(), Some(CodeLocation::new("b.rs", 9)));
        tracker.track(Deprecation::slow_spec_threshold(), None);
        assert!(tracker.did_track());

        let report = tracker.report();
        assert_eq!(report.matches("Dsl::measure is deprecated").count(), 1);
        assert!(report.contains("    a.rs:3\n    b.rs:9"));
        assert!(report.contains("slow-spec-threshold"));
    }
}

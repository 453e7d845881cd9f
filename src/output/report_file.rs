//! Report files

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::models::SuiteReport;

/// Write the suite report as pretty-printed JSON, creating parent directories
pub fn generate_json_report(report: &SuiteReport, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(())
}

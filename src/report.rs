use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::discovery::{DiscoveryReport, Endpoint};
use crate::orchestrator::AttemptResult;
use crate::stats::RunSummary;
use crate::variant::{Variant, VariantStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Attack,
    ScanOnly,
    VariantsOnly,
}

/// Structured output of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub target: Option<String>,
    pub email: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// True when a deadline or interrupt cut the matrix short.
    pub interrupted: bool,
    pub discovery: Option<DiscoveryReport>,
    pub endpoints: Vec<Endpoint>,
    pub variants: Vec<Variant>,
    pub variant_stats: VariantStats,
    pub attempts: Vec<AttemptResult>,
    pub summary: RunSummary,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot write report to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialise report: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RunReport {
    pub fn successes(&self) -> impl Iterator<Item = &AttemptResult> {
        self.attempts
            .iter()
            .filter(|a| a.outcome == crate::classifier::Outcome::Success)
    }

    pub fn file_name(&self) -> String {
        format!("report_{}.json", self.started_at.format("%Y%m%d_%H%M%S"))
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the report as pretty JSON into `dir`, creating it if needed.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ReportError::Io { path, source }
        };

        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = dir.join(self.file_name());
        fs::write(&path, self.to_json()?).map_err(io_err(&path))?;
        Ok(path)
    }
}

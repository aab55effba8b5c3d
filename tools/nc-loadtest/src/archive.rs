//! Run persistence.
//!
//! Every run gets its own directory `<results dir>/<UTC timestamp>` holding `results.json`
//! and a `suite.yml` snapshot, which is all `analyse` needs to rebuild the report later.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::report::{ResultRecord, RunSummary};
use crate::suite::SuiteDefinition;

pub const RESULTS_FILE: &str = "results.json";
pub const SUITE_FILE: &str = "suite.yml";
pub const DEFAULT_RESULTS_DIR: &str = "results";

const DIR_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedRun {
    pub executed_at: Timestamp,
    pub summary: RunSummary,
    /// arrival order
    pub records: Vec<ResultRecord>,
}

/// A loaded archive
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub dir: PathBuf,
    pub suite: SuiteDefinition,
    pub run: ArchivedRun,
}

/// Write one run below `results_dir`, returns the run's directory
pub fn store(results_dir: &Path, suite: &SuiteDefinition, run: &ArchivedRun) -> Result<PathBuf> {
    fs::create_dir_all(results_dir)
        .with_context(|| format!("failed to create `{}`", results_dir.display()))?;
    let dir = results_dir.join(run.executed_at.strftime(DIR_FORMAT).to_string());
    // a second run in the same second must not overwrite the first
    fs::create_dir(&dir).with_context(|| format!("failed to create `{}`", dir.display()))?;

    let results = serde_json::to_vec_pretty(run).context("failed to serialize results")?;
    fs::write(dir.join(RESULTS_FILE), results)
        .with_context(|| format!("failed to write results to `{}`", dir.display()))?;
    fs::write(dir.join(SUITE_FILE), suite.to_yaml()?)
        .with_context(|| format!("failed to write suite to `{}`", dir.display()))?;

    info!(dir = %dir.display(), records = run.records.len(), "results archived");
    Ok(dir)
}

/// Reload a run directory written by [`store`]
pub fn load(dir: &Path) -> Result<Archive> {
    let path = dir.join(RESULTS_FILE);
    let raw = fs::read(&path).with_context(|| format!("failed to read `{}`", path.display()))?;
    let run: ArchivedRun = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse `{}`", path.display()))?;
    let suite = SuiteDefinition::load(dir.join(SUITE_FILE))?;

    Ok(Archive {
        dir: dir.to_owned(),
        suite,
        run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    static SUITE: &str = r#"
iterations: 1
clients: 2
configs:
  - {hostname: r1, username: admin, password: secret, reuseconnection: true}
blocks:
  - actions:
      - netconf: {hostname: r1, operation: get}
"#;

    #[test]
    fn store_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let suite = SuiteDefinition::parse_str(SUITE).unwrap();
        let records = vec![
            ResultRecord {
                latency_millis: 12.5,
                when_millis: 20.0,
                message_id: "101".to_owned(),
                session_id: 7,
                ..ResultRecord::new(0, "r1", "get")
            },
            ResultRecord {
                error_text: "session has expired".to_owned(),
                ..ResultRecord::new(1, "r1", "get")
            },
        ];
        let run = ArchivedRun {
            executed_at: "2024-05-01T10:20:30Z".parse::<Timestamp>().unwrap(),
            summary: RunSummary::new(&suite, &records, false),
            records,
        };

        let dir = store(&tmp.path().join("results"), &suite, &run).unwrap();
        assert!(dir.ends_with("20240501T102030Z"));
        assert!(dir.join(RESULTS_FILE).is_file());

        let archive = load(&dir).unwrap();
        assert_eq!(archive.run, run);
        assert_eq!(archive.suite, suite);
        assert!(archive.suite.is_reuse_connection("r1"));

        // same timestamp again is refused rather than overwritten
        assert!(store(&tmp.path().join("results"), &suite, &run).is_err());
    }

    #[test]
    fn missing_archive_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains(RESULTS_FILE));
    }
}

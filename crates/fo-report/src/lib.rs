#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fo_match::MatchReport;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Terminal result for one fixture run. A Fail or Error is never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureResult {
    pub fixture: String,
    pub outcome: Outcome,
    /// Skip reason or harness error text.
    pub detail: Option<String>,
    pub blocks: Vec<MatchReport>,
    pub subject_exit: Option<i32>,
    pub duration_ms: u64,
}

impl FixtureResult {
    #[must_use]
    pub fn first_mismatch_path(&self) -> Option<&str> {
        self.blocks
            .iter()
            .find_map(|block| block.first_mismatch())
            .map(|mismatch| mismatch.path.as_str())
    }

    #[must_use]
    pub fn report_line(&self) -> String {
        let mut line = format!("fixture={} outcome={}", self.fixture, self.outcome);
        match self.outcome {
            Outcome::Fail => {
                if let Some(path) = self.first_mismatch_path() {
                    line.push_str(&format!(" first_mismatch={path}"));
                }
            }
            Outcome::Skip | Outcome::Error => {
                if let Some(detail) = self.detail.as_deref() {
                    line.push_str(&format!(" detail={detail:?}"));
                }
            }
            Outcome::Pass => {
                line.push_str(&format!(" blocks={}", self.blocks.len()));
            }
        }
        line.push_str(&format!(" duration_ms={}", self.duration_ms));
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub results: Vec<FixtureResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: FixtureResult) {
        self.fixture_count += 1;
        match result.outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Skip => self.skipped += 1,
            Outcome::Error => self.errored += 1,
        }
        self.results.push(result);
    }

    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    /// 0 = all pass/skip, 1 = any match failure, 2 = any harness error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.errored > 0 {
            2
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }

    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "fixtures={} passed={} failed={} skipped={} errored={} green={}",
            self.fixture_count,
            self.passed,
            self.failed,
            self.skipped,
            self.errored,
            self.is_green()
        )
    }

    /// Every mismatch across the suite, flattened for failure listings.
    #[must_use]
    pub fn failure_listing(&self) -> Vec<String> {
        let mut listing = Vec::new();
        for result in &self.results {
            for block in &result.blocks {
                for mismatch in &block.mismatches {
                    listing.push(format!(
                        "{} {} at {}: {} (expected {}, actual {})",
                        result.fixture,
                        block.kind,
                        mismatch.path,
                        mismatch.reason,
                        mismatch.expected,
                        mismatch
                            .actual
                            .as_ref()
                            .map_or_else(|| "<absent>".to_owned(), ToString::to_string),
                    ));
                }
            }
        }
        listing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub ts_unix_ms: u64,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub report_hash: String,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Appends one JSONL row describing this run, with a content hash of the
/// full serialized report for drift auditing.
pub fn append_run_history(
    path: impl AsRef<Path>,
    report: &SuiteReport,
) -> Result<PathBuf, ReportError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let report_json = serde_json::to_vec(report)?;
    let entry = RunHistoryEntry {
        ts_unix_ms: now_unix_ms(),
        fixture_count: report.fixture_count,
        passed: report.passed,
        failed: report.failed,
        skipped: report.skipped,
        errored: report.errored,
        report_hash: format!("sha256:{}", hash_bytes(&report_json)),
    };

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(&entry)?)?;
    Ok(path.to_path_buf())
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use fo_match::{MatchReport, Mismatch};
    use fo_tree::PayloadKind;
    use serde_json::json;

    use super::{FixtureResult, Outcome, SuiteReport, append_run_history};

    fn failing_result(fixture: &str) -> FixtureResult {
        FixtureResult {
            fixture: fixture.to_owned(),
            outcome: Outcome::Fail,
            detail: None,
            blocks: vec![MatchReport {
                kind: PayloadKind::ErrorEvents,
                mismatches: vec![Mismatch {
                    path: "[1].events_seen".to_owned(),
                    expected: json!(1),
                    actual: Some(json!(2)),
                    reason: "value mismatch".to_owned(),
                }],
                matched_paths: vec!["[1].reservoir_size".to_owned()],
            }],
            subject_exit: Some(0),
            duration_ms: 12,
        }
    }

    fn passing_result(fixture: &str) -> FixtureResult {
        FixtureResult {
            fixture: fixture.to_owned(),
            outcome: Outcome::Pass,
            detail: None,
            blocks: Vec::new(),
            subject_exit: Some(0),
            duration_ms: 8,
        }
    }

    #[test]
    fn counts_follow_pushed_outcomes() {
        let mut report = SuiteReport::new();
        report.push(passing_result("a.t"));
        report.push(failing_result("b.t"));
        report.push(FixtureResult {
            outcome: Outcome::Skip,
            detail: Some("not supported".to_owned()),
            ..passing_result("c.t")
        });
        assert_eq!(report.fixture_count, 3);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert!(!report.is_green());
    }

    #[test]
    fn exit_codes_rank_error_over_fail() {
        let mut report = SuiteReport::new();
        report.push(passing_result("a.t"));
        assert_eq!(report.exit_code(), 0);

        report.push(failing_result("b.t"));
        assert_eq!(report.exit_code(), 1);

        report.push(FixtureResult {
            outcome: Outcome::Error,
            detail: Some("subject process exceeded the 5s execution bound".to_owned()),
            ..passing_result("c.t")
        });
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn skips_count_as_green() {
        let mut report = SuiteReport::new();
        report.push(FixtureResult {
            outcome: Outcome::Skip,
            detail: Some("runtime too old".to_owned()),
            ..passing_result("a.t")
        });
        assert!(report.is_green());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn report_lines_name_the_first_mismatch() {
        let line = failing_result("b.t").report_line();
        assert!(line.contains("fixture=b.t"));
        assert!(line.contains("outcome=fail"));
        assert!(line.contains("first_mismatch=[1].events_seen"));
    }

    #[test]
    fn failure_listing_includes_expected_and_actual() {
        let mut report = SuiteReport::new();
        report.push(failing_result("b.t"));
        let listing = report.failure_listing();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].contains("[1].events_seen"));
        assert!(listing[0].contains("expected 1"));
        assert!(listing[0].contains("actual 2"));
    }

    #[test]
    fn run_history_appends_hashed_jsonl_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let history_path = dir.path().join("history/run_history.jsonl");

        let mut report = SuiteReport::new();
        report.push(passing_result("a.t"));
        append_run_history(&history_path, &report).expect("first append");
        report.push(failing_result("b.t"));
        append_run_history(&history_path, &report).expect("second append");

        let contents = std::fs::read_to_string(&history_path).expect("history");
        let rows = contents.lines().collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);
        let last: super::RunHistoryEntry = serde_json::from_str(rows[1]).expect("row");
        assert_eq!(last.fixture_count, 2);
        assert_eq!(last.failed, 1);
        assert!(last.report_hash.starts_with("sha256:"));
    }
}

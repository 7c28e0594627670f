#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use fo_driver::{
    DriverError, DriverOptions, SkipDecision, SubjectProfile, drive_fixture, evaluate_skipif,
};
use fo_fixture::{SectionMarkers, parse_fixture_file};
use fo_match::{MatchContext, MatchPolicy, MatchReport, match_payload};
use fo_report::{FixtureResult, Outcome, SuiteReport};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub subject: SubjectProfile,
    pub markers: SectionMarkers,
    pub match_policy: MatchPolicy,
    pub timeout: Duration,
    pub extra_env: BTreeMap<String, String>,
    /// Worker thread count; 0 means one per available core.
    pub jobs: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            subject: SubjectProfile::default(),
            markers: SectionMarkers::default(),
            match_policy: MatchPolicy::default(),
            timeout: Duration::from_secs(30),
            extra_env: BTreeMap::new(),
            jobs: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("fixture path does not exist: {0}")]
    MissingPath(String),
    #[error("no fixtures found under the given paths")]
    NoFixtures,
}

/// Expands the CLI inputs into a sorted, deduplicated fixture list. A file
/// is taken as-is; a directory is walked recursively, skipping dotfiles.
pub fn collect_fixture_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, SuiteError> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            walk_directory(input, &mut files)?;
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            return Err(SuiteError::MissingPath(input.display().to_string()));
        }
    }
    files.sort();
    files.dedup();
    if files.is_empty() {
        return Err(SuiteError::NoFixtures);
    }
    Ok(files)
}

fn walk_directory(root: &Path, files: &mut Vec<PathBuf>) -> Result<(), SuiteError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with('.'));
            if hidden {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(())
}

/// Runs every fixture through parse -> skip-check -> drive -> match and
/// aggregates the outcomes. Fixtures execute in parallel on scoped worker
/// threads; a single collector owns the report, so no fixture's failure can
/// touch a sibling's result.
#[must_use]
pub fn run_suite(config: &RunnerConfig, paths: &[PathBuf]) -> SuiteReport {
    let mut report = SuiteReport::new();
    if paths.is_empty() {
        return report;
    }

    let jobs = effective_jobs(config.jobs, paths.len());
    info!(fixtures = paths.len(), jobs, "running fixture suite");

    let cursor = AtomicUsize::new(0);
    let (sender, receiver) = mpsc::channel::<(usize, FixtureResult)>();
    let mut slots: Vec<Option<FixtureResult>> = (0..paths.len()).map(|_| None).collect();

    thread::scope(|scope| {
        for _ in 0..jobs {
            let sender = sender.clone();
            let cursor = &cursor;
            scope.spawn(move || {
                loop {
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    if index >= paths.len() {
                        break;
                    }
                    let result = run_fixture_path(config, &paths[index]);
                    if sender.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(sender);
        for (index, result) in receiver {
            slots[index] = Some(result);
        }
    });

    for result in slots.into_iter().flatten() {
        report.push(result);
    }
    report
}

/// One fixture end to end. Harness failures short-circuit the remaining
/// phases for this fixture only and surface as Outcome::Error.
pub fn run_fixture_path(config: &RunnerConfig, path: &Path) -> FixtureResult {
    let started = Instant::now();
    let label = path.display().to_string();

    let fixture = match parse_fixture_file(path, &config.markers) {
        Ok(fixture) => fixture,
        Err(error) => return harness_error(label, error.to_string(), started, None),
    };

    let options = DriverOptions {
        timeout: config.timeout,
        extra_env: config.extra_env.clone(),
    };

    match evaluate_skipif(&config.subject, &fixture, &options) {
        Ok(SkipDecision::Run) => {}
        Ok(SkipDecision::Skip { reason }) => {
            debug!(fixture = %label, reason = %reason, "fixture skipped");
            return FixtureResult {
                fixture: label,
                outcome: Outcome::Skip,
                detail: Some(reason),
                blocks: Vec::new(),
                subject_exit: None,
                duration_ms: elapsed_ms(started),
            };
        }
        Err(error) => return harness_error(label, error.to_string(), started, None),
    }

    let capture = match drive_fixture(&config.subject, &fixture, &options) {
        Ok(capture) => capture,
        Err(DriverError::Timeout {
            timeout_secs,
            partial,
        }) => {
            let detail = format!(
                "subject process exceeded the {timeout_secs}s execution bound; salvaged {} telemetry payloads",
                partial.payload_count()
            );
            return harness_error(label, detail, started, partial.exit_code);
        }
        Err(error) => return harness_error(label, error.to_string(), started, None),
    };

    let context = MatchContext::with_file(capture.body_path.display().to_string());
    let blocks = fixture
        .expectations
        .iter()
        .map(|block| {
            match_payload(
                block.kind,
                &block.expected,
                capture.first_payload(block.kind),
                config.match_policy,
                &context,
            )
        })
        .collect::<Vec<_>>();

    let outcome = if blocks.iter().all(MatchReport::is_match) {
        Outcome::Pass
    } else {
        Outcome::Fail
    };

    FixtureResult {
        fixture: label,
        outcome,
        detail: None,
        blocks,
        subject_exit: capture.exit_code,
        duration_ms: elapsed_ms(started),
    }
}

fn harness_error(
    fixture: String,
    detail: String,
    started: Instant,
    subject_exit: Option<i32>,
) -> FixtureResult {
    FixtureResult {
        fixture,
        outcome: Outcome::Error,
        detail: Some(detail),
        blocks: Vec::new(),
        subject_exit,
        duration_ms: elapsed_ms(started),
    }
}

fn effective_jobs(requested: usize, fixture_count: usize) -> usize {
    let available = if requested > 0 {
        requested
    } else {
        thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    };
    available.min(fixture_count).max(1)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

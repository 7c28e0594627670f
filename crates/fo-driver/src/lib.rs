#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use fo_fixture::Fixture;
use fo_tree::PayloadKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const BODY_PLACEHOLDER: &str = "{body}";
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// How to invoke the subject runtime. The argument template may reference
/// `{body}` and `{config}`; the config path is additionally exported through
/// `config_env_var`, and the telemetry sink path through `sink_env_var`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectProfile {
    pub interpreter: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub config_env_var: String,
    pub sink_env_var: String,
}

impl Default for SubjectProfile {
    fn default() -> Self {
        Self {
            interpreter: "sh".to_owned(),
            args: vec![BODY_PLACEHOLDER.to_owned()],
            env: BTreeMap::new(),
            config_env_var: "FO_SUBJECT_CONFIG".to_owned(),
            sink_env_var: "FO_TELEMETRY_SINK".to_owned(),
        }
    }
}

impl SubjectProfile {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, DriverError> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn render_args(&self, body: &Path, config: &Path) -> Vec<String> {
        let body = body.display().to_string();
        let config = config.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(BODY_PLACEHOLDER, &body)
                    .replace(CONFIG_PLACEHOLDER, &config)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub timeout: Duration,
    pub extra_env: BTreeMap<String, String>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            extra_env: BTreeMap::new(),
        }
    }
}

/// Everything captured from one subject run. Telemetry payloads are grouped
/// by kind in emission order; stdout/stderr are captured separately.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub body_path: PathBuf,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub payloads: BTreeMap<PayloadKind, Vec<Value>>,
    pub malformed_sink_lines: usize,
}

impl Capture {
    #[must_use]
    pub fn first_payload(&self, kind: PayloadKind) -> Option<&Value> {
        self.payloads.get(&kind).and_then(|emitted| emitted.first())
    }

    #[must_use]
    pub fn payload_count(&self) -> usize {
        self.payloads.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    Run,
    Skip { reason: String },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch subject interpreter {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("subject process exceeded the {timeout_secs}s execution bound")]
    Timeout {
        timeout_secs: u64,
        partial: Box<Capture>,
    },
    #[error("skip predicate failed: {0}")]
    SkipEvaluation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize)]
struct SinkRecord {
    kind: PayloadKind,
    payload: Value,
}

/// Runs the fixture's SKIPIF predicate through the subject interpreter.
/// Stdout beginning with `skip` (optionally `skip: reason`) means Skip; a
/// predicate that errors without printing a skip line is a harness error,
/// never a Skip.
pub fn evaluate_skipif(
    profile: &SubjectProfile,
    fixture: &Fixture,
    options: &DriverOptions,
) -> Result<SkipDecision, DriverError> {
    let Some(code) = fixture.skipif.as_deref() else {
        return Ok(SkipDecision::Run);
    };

    let scratch = tempfile::tempdir()?;
    let predicate_path = scratch.path().join("skipif");
    fs::write(&predicate_path, code)?;
    let config_path = scratch.path().join("subject.ini");
    fs::write(&config_path, render_settings(&fixture.settings))?;

    let outcome = run_subject(
        profile,
        options,
        scratch.path(),
        &predicate_path,
        &config_path,
        None,
    )?;
    if outcome.timed_out {
        return Err(DriverError::SkipEvaluation(format!(
            "predicate exceeded the {}s execution bound",
            options.timeout.as_secs()
        )));
    }

    let stdout = outcome.stdout.trim();
    if stdout.len() >= 4 && stdout.as_bytes()[..4].eq_ignore_ascii_case(b"skip") {
        let reason = stdout[4..].trim_start_matches(':').trim();
        return Ok(SkipDecision::Skip {
            reason: if reason.is_empty() {
                "skip requested by fixture".to_owned()
            } else {
                reason.to_owned()
            },
        });
    }
    if outcome.exit_code != Some(0) {
        return Err(DriverError::SkipEvaluation(format!(
            "predicate exited with {:?}: {}",
            outcome.exit_code,
            outcome.stderr.trim()
        )));
    }
    Ok(SkipDecision::Run)
}

/// Drives one fixture: isolated scratch dir, body + rendered config files,
/// telemetry sink interception, bounded wait. On timeout the subject is
/// killed and whatever reached the sink is carried inside the error.
pub fn drive_fixture(
    profile: &SubjectProfile,
    fixture: &Fixture,
    options: &DriverOptions,
) -> Result<Capture, DriverError> {
    let scratch = tempfile::tempdir()?;
    let body_name = fixture
        .source_path
        .file_name()
        .map_or_else(|| OsString::from("body"), ToOwned::to_owned);
    let body_path = scratch.path().join(body_name);
    fs::write(&body_path, &fixture.body)?;
    let config_path = scratch.path().join("subject.ini");
    fs::write(&config_path, render_settings(&fixture.settings))?;
    let sink_path = scratch.path().join("telemetry.jsonl");
    fs::write(&sink_path, "")?;

    debug!(
        fixture = %fixture.source_path.display(),
        interpreter = %profile.interpreter,
        "launching subject process"
    );
    let outcome = run_subject(
        profile,
        options,
        scratch.path(),
        &body_path,
        &config_path,
        Some(&sink_path),
    )?;

    let (payloads, malformed_sink_lines) = read_sink(&sink_path);
    if malformed_sink_lines > 0 {
        warn!(
            fixture = %fixture.source_path.display(),
            lines = malformed_sink_lines,
            "discarded malformed telemetry sink lines"
        );
    }

    let capture = Capture {
        body_path,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        payloads,
        malformed_sink_lines,
    };

    if outcome.timed_out {
        return Err(DriverError::Timeout {
            timeout_secs: options.timeout.as_secs(),
            partial: Box::new(capture),
        });
    }
    Ok(capture)
}

struct RunOutcome {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

fn run_subject(
    profile: &SubjectProfile,
    options: &DriverOptions,
    scratch: &Path,
    body: &Path,
    config: &Path,
    sink: Option<&Path>,
) -> Result<RunOutcome, DriverError> {
    let mut command = Command::new(&profile.interpreter);
    command
        .args(profile.render_args(body, config))
        .current_dir(scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(&profile.env)
        .envs(&options.extra_env)
        .env(&profile.config_env_var, config);
    if let Some(sink) = sink {
        command.env(&profile.sink_env_var, sink);
    }

    let mut child = command.spawn().map_err(|source| DriverError::Launch {
        program: profile.interpreter.clone(),
        source,
    })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());
    let (exit_code, timed_out) = wait_bounded(&mut child, options.timeout)?;

    // After a kill, orphaned descendants of the subject may keep the pipes
    // open; abandon the readers instead of waiting them out.
    let (stdout, stderr) = if timed_out {
        (String::new(), String::new())
    } else {
        (
            stdout_reader.join().unwrap_or_default(),
            stderr_reader.join().unwrap_or_default(),
        )
    };

    Ok(RunOutcome {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let Some(mut source) = source else {
            return String::new();
        };
        let mut bytes = Vec::new();
        let _ = source.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn wait_bounded(child: &mut Child, timeout: Duration) -> Result<(Option<i32>, bool), DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status.code(), false));
        }
        if Instant::now() >= deadline {
            // Kill and reap so no zombie outlives the run.
            let _ = child.kill();
            let _ = child.wait();
            return Ok((None, true));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_sink(path: &Path) -> (BTreeMap<PayloadKind, Vec<Value>>, usize) {
    let mut payloads: BTreeMap<PayloadKind, Vec<Value>> = BTreeMap::new();
    let mut malformed = 0usize;
    let Ok(content) = fs::read_to_string(path) else {
        return (payloads, malformed);
    };
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<SinkRecord>(trimmed) {
            Ok(record) => payloads.entry(record.kind).or_default().push(record.payload),
            Err(error) => {
                malformed += 1;
                debug!(error = %error, "telemetry sink line did not parse");
            }
        }
    }
    (payloads, malformed)
}

fn render_settings(settings: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in settings {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

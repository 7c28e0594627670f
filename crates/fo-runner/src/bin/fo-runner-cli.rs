#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use fo_driver::SubjectProfile;
use fo_match::MatchPolicy;
use fo_report::append_run_history;
use fo_runner::{RunnerConfig, collect_fixture_paths, run_suite};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("fo-runner-cli error: {error}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<ExitCode, String> {
    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(command) => command,
        None => {
            print_help();
            return Err("a command is required".to_owned());
        }
    };
    match command.as_str() {
        "run" => {}
        "-h" | "--help" => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        other => return Err(format!("unknown command: {other}")),
    }

    let mut inputs: Vec<PathBuf> = Vec::new();
    let mut config = RunnerConfig::default();
    let mut write_history = false;
    let mut history_path = PathBuf::from("artifacts/run_history.jsonl");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--timeout" => {
                let value = args.next().ok_or("--timeout requires a value in seconds")?;
                let seconds = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --timeout value: {value}"))?;
                config.timeout = Duration::from_secs(seconds);
            }
            "--env" => {
                let value = args.next().ok_or("--env requires KEY=VAL")?;
                let (key, val) = value
                    .split_once('=')
                    .ok_or_else(|| format!("--env expects KEY=VAL, got {value}"))?;
                config.extra_env.insert(key.to_owned(), val.to_owned());
            }
            "--subject-profile" => {
                let value = args.next().ok_or("--subject-profile requires a file path")?;
                config.subject =
                    SubjectProfile::from_yaml_file(&value).map_err(|error| error.to_string())?;
            }
            "--jobs" => {
                let value = args.next().ok_or("--jobs requires a worker count")?;
                config.jobs = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --jobs value: {value}"))?;
            }
            "--match-policy" => {
                let value = args.next().ok_or("--match-policy requires strict or lenient")?;
                config.match_policy = match value.as_str() {
                    "strict" => MatchPolicy::Strict,
                    "lenient" => MatchPolicy::Lenient,
                    _ => return Err(format!("unsupported match policy: {value}")),
                };
            }
            "--write-history" => {
                write_history = true;
            }
            "--history-path" => {
                let value = args.next().ok_or("--history-path requires a file path")?;
                history_path = PathBuf::from(value);
            }
            "-h" | "--help" => {
                print_help();
                return Ok(ExitCode::SUCCESS);
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown argument: {flag}"));
            }
            path => inputs.push(PathBuf::from(path)),
        }
    }

    if inputs.is_empty() {
        return Err("run requires at least one fixture path or directory".to_owned());
    }

    let paths = collect_fixture_paths(&inputs).map_err(|error| error.to_string())?;
    let report = run_suite(&config, &paths);

    for result in &report.results {
        println!("{}", result.report_line());
    }
    for line in report.failure_listing() {
        println!("mismatch {line}");
    }
    println!("{}", report.summary_line());

    if write_history {
        let written =
            append_run_history(&history_path, &report).map_err(|error| error.to_string())?;
        println!("wrote run_history={}", written.display());
    }

    Ok(ExitCode::from(report.exit_code()))
}

fn print_help() {
    println!(
        "fo-runner-cli\n\
         Usage:\n\
         \tfo-runner-cli run <fixture-path-or-dir>... [options]\n\
         Options:\n\
         \t--timeout <seconds>        Execution bound per subject process (default 30)\n\
         \t--env <KEY=VAL>            Extra environment for the subject (repeatable)\n\
         \t--subject-profile <file>   YAML subject profile (interpreter, args, env)\n\
         \t--jobs <n>                 Worker threads (default: one per core)\n\
         \t--match-policy <policy>    strict (default) or lenient empty-mapping handling\n\
         \t--write-history            Append a hashed summary row to the run history\n\
         \t--history-path <file>      Run history location (default artifacts/run_history.jsonl)\n\
         \t-h, --help                 Show this help\n\
         Exit codes: 0 all pass/skip, 1 any match failure, 2 harness error"
    );
}

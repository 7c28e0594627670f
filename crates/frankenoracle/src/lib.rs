#![forbid(unsafe_code)]

pub use fo_driver::{
    Capture, DriverError, DriverOptions, SkipDecision, SubjectProfile, drive_fixture,
    evaluate_skipif,
};
pub use fo_fixture::{
    ExpectationBlock, Fixture, FixtureError, SectionMarkers, parse_fixture_file,
    parse_fixture_str,
};
pub use fo_match::{MatchContext, MatchPolicy, MatchReport, Mismatch, match_payload};
pub use fo_report::{
    FixtureResult, Outcome, ReportError, RunHistoryEntry, SuiteReport, append_run_history,
};
pub use fo_runner::{
    RunnerConfig, SuiteError, collect_fixture_paths, run_fixture_path, run_suite,
};
pub use fo_tree::{
    ExpectedNode, NodePath, PathSegment, PayloadKind, ScalarValue, TextPattern, TreeError,
};

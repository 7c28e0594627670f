#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use fo_tree::{ExpectedNode, PayloadKind, TreeError};
use thiserror::Error;

const DESCRIPTION_KEYWORD: &str = "DESCRIPTION";
const SKIPIF_KEYWORD: &str = "SKIPIF";
const INI_KEYWORD: &str = "INI";
const EXPECT_PREFIX: &str = "EXPECT_";

/// Block boundary markers. The defaults match C-style comment delimiters,
/// but nothing here depends on the subject language having comments at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionMarkers {
    pub start: String,
    pub end: String,
}

impl SectionMarkers {
    #[must_use]
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

impl Default for SectionMarkers {
    fn default() -> Self {
        Self::new("/*", "*/")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectationBlock {
    pub kind: PayloadKind,
    pub expected: ExpectedNode,
}

/// One parsed fixture. Immutable after parse; the body is the source text
/// with directive sections removed and is otherwise untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub source_path: PathBuf,
    pub description: String,
    pub skipif: Option<String>,
    pub settings: BTreeMap<String, String>,
    pub expectations: Vec<ExpectationBlock>,
    pub body: String,
}

impl Fixture {
    #[must_use]
    pub fn expectation(&self, kind: PayloadKind) -> Option<&ExpectationBlock> {
        self.expectations.iter().find(|block| block.kind == kind)
    }
}

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{path}: missing required DESCRIPTION block")]
    MissingDescription { path: String },
    #[error("{path}: fixture declares no EXPECT_* blocks")]
    NoExpectations { path: String },
    #[error("{path}:{line}: unknown expectation keyword {keyword:?}")]
    UnknownKeyword {
        path: String,
        line: usize,
        keyword: String,
    },
    #[error("{path}:{line}: duplicate {keyword} block")]
    DuplicateBlock {
        path: String,
        line: usize,
        keyword: String,
    },
    #[error("{path}:{line}: {keyword} block is never terminated")]
    UnterminatedBlock {
        path: String,
        line: usize,
        keyword: String,
    },
    #[error("{path}: {keyword} block is not valid JSON: {source}")]
    InvalidExpectation {
        path: String,
        keyword: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {keyword} block: {source}")]
    InvalidTree {
        path: String,
        keyword: String,
        #[source]
        source: TreeError,
    },
    #[error("{path}:{line}: malformed setting line {content:?}")]
    MalformedSetting {
        path: String,
        line: usize,
        content: String,
    },
}

pub fn parse_fixture_file(
    path: impl AsRef<Path>,
    markers: &SectionMarkers,
) -> Result<Fixture, FixtureError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    parse_fixture_str(path, &text, markers)
}

/// Pure transformation from source text to a `Fixture`. Directive blocks may
/// appear in any order; everything outside them becomes the executable body.
pub fn parse_fixture_str(
    path: impl AsRef<Path>,
    text: &str,
    markers: &SectionMarkers,
) -> Result<Fixture, FixtureError> {
    let path = path.as_ref();
    let label = path.display().to_string();

    let mut description: Option<String> = None;
    let mut skipif: Option<String> = None;
    let mut settings: Option<BTreeMap<String, String>> = None;
    let mut expectations: Vec<ExpectationBlock> = Vec::new();
    let mut body_lines: Vec<&str> = Vec::new();

    let lines = text.split('\n').collect::<Vec<_>>();
    let mut cursor = 0usize;
    while cursor < lines.len() {
        let line = lines[cursor];
        let Some(keyword) = directive_keyword(line, markers) else {
            body_lines.push(line);
            cursor += 1;
            continue;
        };

        let block_line = cursor + 1;
        let (content, next) = collect_block(&lines, cursor, &keyword, markers).ok_or_else(|| {
            FixtureError::UnterminatedBlock {
                path: label.clone(),
                line: block_line,
                keyword: keyword.clone(),
            }
        })?;
        cursor = next;

        match keyword.as_str() {
            DESCRIPTION_KEYWORD => {
                if description.is_some() {
                    return Err(FixtureError::DuplicateBlock {
                        path: label,
                        line: block_line,
                        keyword,
                    });
                }
                description = Some(content.trim().to_owned());
            }
            SKIPIF_KEYWORD => {
                if skipif.is_some() {
                    return Err(FixtureError::DuplicateBlock {
                        path: label,
                        line: block_line,
                        keyword,
                    });
                }
                skipif = Some(content);
            }
            INI_KEYWORD => {
                if settings.is_some() {
                    return Err(FixtureError::DuplicateBlock {
                        path: label,
                        line: block_line,
                        keyword,
                    });
                }
                settings = Some(parse_settings(&label, block_line, &content)?);
            }
            expect => {
                let Some(kind) = PayloadKind::from_block_keyword(expect) else {
                    return Err(FixtureError::UnknownKeyword {
                        path: label,
                        line: block_line,
                        keyword,
                    });
                };
                if expectations.iter().any(|block| block.kind == kind) {
                    return Err(FixtureError::DuplicateBlock {
                        path: label,
                        line: block_line,
                        keyword,
                    });
                }
                let value: serde_json::Value = serde_json::from_str(&content).map_err(|err| {
                    FixtureError::InvalidExpectation {
                        path: label.clone(),
                        keyword: keyword.clone(),
                        source: err,
                    }
                })?;
                let expected =
                    ExpectedNode::from_value(&value).map_err(|err| FixtureError::InvalidTree {
                        path: label.clone(),
                        keyword: keyword.clone(),
                        source: err,
                    })?;
                expectations.push(ExpectationBlock { kind, expected });
            }
        }
    }

    let description = match description {
        Some(text) if !text.is_empty() => text,
        _ => return Err(FixtureError::MissingDescription { path: label }),
    };
    if expectations.is_empty() {
        return Err(FixtureError::NoExpectations { path: label });
    }

    Ok(Fixture {
        source_path: path.to_path_buf(),
        description,
        skipif,
        settings: settings.unwrap_or_default(),
        expectations,
        body: body_lines.join("\n"),
    })
}

/// A directive starts where the start marker is immediately followed by an
/// uppercase keyword on the same line. `DESCRIPTION`, `SKIPIF`, and `INI`
/// are always directives; otherwise only `EXPECT_*`-shaped keywords count,
/// so ordinary delimited comments in the body stay body text.
fn directive_keyword(line: &str, markers: &SectionMarkers) -> Option<String> {
    let rest = line.trim_start().strip_prefix(markers.start.as_str())?;
    let keyword = rest
        .chars()
        .take_while(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || *ch == '_')
        .collect::<String>();
    let known = keyword == DESCRIPTION_KEYWORD
        || keyword == SKIPIF_KEYWORD
        || keyword == INI_KEYWORD
        || keyword.starts_with(EXPECT_PREFIX);
    known.then_some(keyword)
}

/// Returns the block content and the line index just past the end marker,
/// or `None` when the block never terminates.
fn collect_block(
    lines: &[&str],
    start: usize,
    keyword: &str,
    markers: &SectionMarkers,
) -> Option<(String, usize)> {
    let opening = lines[start].trim_start();
    let after_marker = &opening[markers.start.len()..];
    let remainder = &after_marker[keyword.len()..];

    // Inline form: the end marker sits on the keyword line.
    if let Some(inline) = remainder.split_once(markers.end.as_str()) {
        return Some((inline.0.trim().to_owned(), start + 1));
    }

    let mut content = Vec::new();
    if !remainder.trim().is_empty() {
        content.push(remainder.trim_end());
    }
    for (offset, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim() == markers.end {
            return Some((content.join("\n"), offset + 1));
        }
        content.push(*line);
    }
    None
}

fn parse_settings(
    path: &str,
    block_line: usize,
    content: &str,
) -> Result<BTreeMap<String, String>, FixtureError> {
    let mut settings = BTreeMap::new();
    for (offset, line) in content.split('\n').enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        let parsed = trimmed
            .split_once('=')
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty());
        let Some((key, value)) = parsed else {
            return Err(FixtureError::MalformedSetting {
                path: path.to_owned(),
                line: block_line + offset + 1,
                content: trimmed.to_owned(),
            });
        };
        settings.insert(key.to_owned(), value.to_owned());
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use fo_tree::{ExpectedNode, PayloadKind};
    use pretty_assertions::assert_eq;

    use super::{FixtureError, SectionMarkers, parse_fixture_str};

    const SAMPLE: &str = r#"/*DESCRIPTION
The subject should not attach code-level attributes when capture is off.
 */

/*SKIPIF
if [ -z "$TELEMETRY_READY" ]; then
  echo "skip: telemetry channel unavailable"
fi
*/

/*INI
distributed_tracing.enabled=1
span_events.enabled=1
code_level_metrics.enabled=false
*/

/*EXPECT_ERROR_EVENTS
[
  "?? agent run id",
  {
    "reservoir_size": "??",
    "events_seen": 1
  },
  [
    [
      {
        "type": "TransactionError",
        "error.message": "I'M COVERED IN BEES!"
      },
      {},
      {}
    ]
  ]
]
*/

emit_error "I'M COVERED IN BEES!"
"#;

    fn parse(text: &str) -> Result<super::Fixture, FixtureError> {
        parse_fixture_str("fixture.t", text, &SectionMarkers::default())
    }

    #[test]
    fn sample_fixture_parses_every_section() {
        let fixture = parse(SAMPLE).expect("fixture");
        assert_eq!(
            fixture.description,
            "The subject should not attach code-level attributes when capture is off."
        );
        assert!(fixture.skipif.as_deref().is_some_and(|code| code.contains("skip:")));
        assert_eq!(
            fixture.settings.get("code_level_metrics.enabled").map(String::as_str),
            Some("false")
        );
        assert_eq!(fixture.expectations.len(), 1);
        assert_eq!(fixture.expectations[0].kind, PayloadKind::ErrorEvents);
        assert!(fixture.body.contains("emit_error"));
        assert!(!fixture.body.contains("EXPECT_ERROR_EVENTS"));
    }

    #[test]
    fn block_order_does_not_matter() {
        let reordered = r#"/*EXPECT_SPAN_EVENTS
["??", {}, []]
*/
/*DESCRIPTION
Order independence.
*/
body here
"#;
        let fixture = parse(reordered).expect("fixture");
        assert_eq!(fixture.description, "Order independence.");
        assert_eq!(fixture.expectations[0].kind, PayloadKind::SpanEvents);
        assert_eq!(fixture.body.trim(), "body here");
    }

    #[test]
    fn missing_description_is_malformed() {
        let err = parse("/*EXPECT_SPAN_EVENTS\n[]\n*/\n").expect_err("must fail");
        assert!(matches!(err, FixtureError::MissingDescription { .. }));
    }

    #[test]
    fn fixture_without_expectations_is_malformed() {
        let err = parse("/*DESCRIPTION\nNo oracle here.\n*/\nbody\n").expect_err("must fail");
        assert!(matches!(err, FixtureError::NoExpectations { .. }));
    }

    #[test]
    fn unknown_expectation_keyword_is_malformed() {
        let text = "/*DESCRIPTION\nD.\n*/\n/*EXPECT_METRICS\n[]\n*/\n";
        let err = parse(text).expect_err("must fail");
        match err {
            FixtureError::UnknownKeyword { keyword, line, .. } => {
                assert_eq!(keyword, "EXPECT_METRICS");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_blocks_are_malformed() {
        let text = "/*DESCRIPTION\nD.\n*/\n/*DESCRIPTION\nAgain.\n*/\n";
        let err = parse(text).expect_err("must fail");
        assert!(matches!(err, FixtureError::DuplicateBlock { .. }));
    }

    #[test]
    fn unterminated_block_is_malformed() {
        let text = "/*DESCRIPTION\nD.\n*/\n/*EXPECT_SPAN_EVENTS\n[\"??\"]\n";
        let err = parse(text).expect_err("must fail");
        assert!(matches!(err, FixtureError::UnterminatedBlock { .. }));
    }

    #[test]
    fn invalid_expectation_json_is_malformed() {
        let text = "/*DESCRIPTION\nD.\n*/\n/*EXPECT_SPAN_EVENTS\n[not json\n*/\n";
        let err = parse(text).expect_err("must fail");
        assert!(matches!(err, FixtureError::InvalidExpectation { .. }));
    }

    #[test]
    fn malformed_setting_line_is_reported_with_position() {
        let text = "/*DESCRIPTION\nD.\n*/\n/*INI\nvalid=1\nbroken line\n*/\n/*EXPECT_SPAN_EVENTS\n[]\n*/\n";
        let err = parse(text).expect_err("must fail");
        match err {
            FixtureError::MalformedSetting { line, content, .. } => {
                assert_eq!(content, "broken line");
                assert_eq!(line, 6);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn setting_values_keep_embedded_separators() {
        let text =
            "/*DESCRIPTION\nD.\n*/\n/*INI\nlicense=abc=def\n*/\n/*EXPECT_SPAN_EVENTS\n[]\n*/\n";
        let fixture = parse(text).expect("fixture");
        assert_eq!(fixture.settings.get("license").map(String::as_str), Some("abc=def"));
    }

    #[test]
    fn plain_delimited_comments_stay_in_the_body() {
        let text = "/*DESCRIPTION\nD.\n*/\n/* plain comment */\n/*EXPECT_SPAN_EVENTS\n[\"??\"]\n*/\nbody\n";
        let fixture = parse(text).expect("fixture");
        assert!(fixture.body.contains("/* plain comment */"));
    }

    #[test]
    fn inline_blocks_parse_on_one_line() {
        let text = "/*DESCRIPTION inline description */\n/*EXPECT_SPAN_EVENTS [\"??\"] */\nbody\n";
        let fixture = parse(text).expect("fixture");
        assert_eq!(fixture.description, "inline description");
        assert!(matches!(
            fixture.expectations[0].expected,
            ExpectedNode::Sequence(_)
        ));
    }

    #[test]
    fn alternate_markers_are_honoured() {
        let markers = SectionMarkers::new("##[", "]##");
        let text = "##[DESCRIPTION\nD.\n]##\n##[EXPECT_SPAN_EVENTS\n[\"??\"]\n]##\nbody\n";
        let fixture = parse_fixture_str("alt.t", text, &markers).expect("fixture");
        assert_eq!(fixture.description, "D.");
        assert_eq!(fixture.body.trim(), "body");
    }
}

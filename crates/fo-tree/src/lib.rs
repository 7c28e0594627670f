#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const WILDCARD_SENTINEL: &str = "??";
pub const ELLIPSIS_SENTINEL: &str = "??*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    TracedErrors,
    ErrorEvents,
    AnalyticsEvents,
    SpanEvents,
}

impl PayloadKind {
    pub const ALL: [Self; 4] = [
        Self::TracedErrors,
        Self::ErrorEvents,
        Self::AnalyticsEvents,
        Self::SpanEvents,
    ];

    #[must_use]
    pub fn block_keyword(self) -> &'static str {
        match self {
            Self::TracedErrors => "EXPECT_TRACED_ERRORS",
            Self::ErrorEvents => "EXPECT_ERROR_EVENTS",
            Self::AnalyticsEvents => "EXPECT_ANALYTICS_EVENTS",
            Self::SpanEvents => "EXPECT_SPAN_EVENTS",
        }
    }

    #[must_use]
    pub fn from_block_keyword(keyword: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.block_keyword() == keyword)
    }

    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::TracedErrors => "traced_errors",
            Self::ErrorEvents => "error_events",
            Self::AnalyticsEvents => "analytics_events",
            Self::SpanEvents => "span_events",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    /// Exact equality against a JSON leaf. Integer and float representations
    /// never coerce into each other.
    #[must_use]
    pub fn matches_value(&self, actual: &Value) -> bool {
        match (self, actual) {
            (Self::Null, Value::Null) => true,
            (Self::Bool(expected), Value::Bool(actual)) => expected == actual,
            (Self::Int64(expected), Value::Number(actual)) => actual.as_i64() == Some(*expected),
            (Self::Float64(expected), Value::Number(actual)) => {
                actual.is_f64() && actual.as_f64() == Some(*expected)
            }
            (Self::Utf8(expected), Value::String(actual)) => expected == actual,
            _ => false,
        }
    }

    #[must_use]
    pub fn render(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(v) => Value::Bool(*v),
            Self::Int64(v) => Value::from(*v),
            Self::Float64(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
            Self::Utf8(v) => Value::String(v.clone()),
        }
    }
}

/// An expected string with embedded `??` segments. The literal segments must
/// appear in the actual string in order, anchored at both ends. Placeholder
/// tokens (`__FILE__`) stay literal here; the matcher substitutes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPattern {
    raw: String,
    segments: Vec<String>,
}

impl TextPattern {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = raw
            .split(WILDCARD_SENTINEL)
            .map(str::to_owned)
            .collect::<Vec<_>>();
        Self { raw, segments }
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpectedNode {
    Wildcard { hint: Option<String> },
    AnyElements,
    Text(TextPattern),
    Scalar(ScalarValue),
    Sequence(Vec<ExpectedNode>),
    Mapping(BTreeMap<String, ExpectedNode>),
}

pub const FILE_PLACEHOLDER: &str = "__FILE__";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("sequence ellipsis {ELLIPSIS_SENTINEL:?} is only valid as a sequence element")]
    MisplacedEllipsis,
    #[error("a sequence may carry at most one {ELLIPSIS_SENTINEL:?} ellipsis element")]
    MultipleEllipses,
    #[error("number {0} is not representable as i64 or f64")]
    UnsupportedNumber(String),
}

impl ExpectedNode {
    /// Resolves wildcard sentinels into tagged variants once, so comparison
    /// sites never re-inspect sentinel strings.
    pub fn from_value(value: &Value) -> Result<Self, TreeError> {
        let node = Self::convert(value)?;
        if matches!(node, Self::AnyElements) {
            return Err(TreeError::MisplacedEllipsis);
        }
        Ok(node)
    }

    fn convert(value: &Value) -> Result<Self, TreeError> {
        match value {
            Value::Null => Ok(Self::Scalar(ScalarValue::Null)),
            Value::Bool(v) => Ok(Self::Scalar(ScalarValue::Bool(*v))),
            Value::Number(v) => {
                if let Some(int) = v.as_i64() {
                    Ok(Self::Scalar(ScalarValue::Int64(int)))
                } else if let Some(float) = v.as_f64() {
                    Ok(Self::Scalar(ScalarValue::Float64(float)))
                } else {
                    Err(TreeError::UnsupportedNumber(v.to_string()))
                }
            }
            Value::String(v) => Ok(Self::classify_string(v)),
            Value::Array(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                let mut ellipses = 0usize;
                for item in items {
                    let node = Self::convert(item)?;
                    if matches!(node, Self::AnyElements) {
                        ellipses += 1;
                        if ellipses > 1 {
                            return Err(TreeError::MultipleEllipses);
                        }
                    }
                    nodes.push(node);
                }
                Ok(Self::Sequence(nodes))
            }
            Value::Object(entries) => {
                let mut mapping = BTreeMap::new();
                for (key, entry) in entries {
                    let node = Self::convert(entry)?;
                    if matches!(node, Self::AnyElements) {
                        return Err(TreeError::MisplacedEllipsis);
                    }
                    mapping.insert(key.clone(), node);
                }
                Ok(Self::Mapping(mapping))
            }
        }
    }

    fn classify_string(raw: &str) -> Self {
        if raw == ELLIPSIS_SENTINEL {
            return Self::AnyElements;
        }
        if raw == WILDCARD_SENTINEL {
            return Self::Wildcard { hint: None };
        }
        if let Some(hint) = raw.strip_prefix("?? ") {
            return Self::Wildcard {
                hint: Some(hint.to_owned()),
            };
        }
        if raw.contains(WILDCARD_SENTINEL) || raw.contains(FILE_PLACEHOLDER) {
            return Self::Text(TextPattern::new(raw));
        }
        Self::Scalar(ScalarValue::Utf8(raw.to_owned()))
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard { .. })
    }

    /// Renders the expectation back into a JSON value for diff output.
    /// Wildcard hints survive the round trip; matching never reads them.
    #[must_use]
    pub fn render(&self) -> Value {
        match self {
            Self::Wildcard { hint: None } => Value::String(WILDCARD_SENTINEL.to_owned()),
            Self::Wildcard { hint: Some(hint) } => Value::String(format!("?? {hint}")),
            Self::AnyElements => Value::String(ELLIPSIS_SENTINEL.to_owned()),
            Self::Text(pattern) => Value::String(pattern.raw().to_owned()),
            Self::Scalar(scalar) => scalar.render(),
            Self::Sequence(items) => Value::Array(items.iter().map(Self::render).collect()),
            Self::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, node)| (key.clone(), node.render()))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodePath {
    segments: Vec<PathSegment>,
}

impl NodePath {
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn child_index(&self, index: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Index(index));
        Self { segments }
    }

    #[must_use]
    pub fn child_key(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Key(key.to_owned()));
        Self { segments }
    }

    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("(root)");
        }
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Index(index) => write!(f, "[{index}]")?,
                PathSegment::Key(key) if position == 0 => f.write_str(key)?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ExpectedNode, NodePath, PayloadKind, ScalarValue, TextPattern, TreeError,
    };

    #[test]
    fn sentinel_strings_become_tagged_variants() {
        let node = ExpectedNode::from_value(&json!("??")).expect("wildcard");
        assert!(node.is_wildcard());

        let node = ExpectedNode::from_value(&json!("?? agent run id")).expect("hinted wildcard");
        assert_eq!(
            node,
            ExpectedNode::Wildcard {
                hint: Some("agent run id".to_owned())
            }
        );
    }

    #[test]
    fn embedded_wildcards_become_text_patterns() {
        let raw = " in newrelic_notice_error called at __FILE__ (??)";
        let node = ExpectedNode::from_value(&json!(raw)).expect("pattern");
        match node {
            ExpectedNode::Text(pattern) => {
                assert_eq!(pattern.raw(), raw);
                assert_eq!(pattern.segments().len(), 2);
            }
            other => panic!("expected text pattern, got {other:?}"),
        }
    }

    #[test]
    fn plain_strings_stay_exact_scalars() {
        let node = ExpectedNode::from_value(&json!("I'M COVERED IN BEES!")).expect("scalar");
        assert_eq!(
            node,
            ExpectedNode::Scalar(ScalarValue::Utf8("I'M COVERED IN BEES!".to_owned()))
        );
    }

    #[test]
    fn integer_and_float_never_coerce() {
        assert!(ScalarValue::Int64(10_000).matches_value(&json!(10_000)));
        assert!(!ScalarValue::Int64(10_000).matches_value(&json!(10_000.0)));
        assert!(ScalarValue::Float64(1.5).matches_value(&json!(1.5)));
        assert!(!ScalarValue::Float64(1.0).matches_value(&json!(1)));
    }

    #[test]
    fn ellipsis_is_rejected_outside_sequences() {
        let err = ExpectedNode::from_value(&json!({"events": "??*"})).expect_err("must fail");
        assert_eq!(err, TreeError::MisplacedEllipsis);

        let err = ExpectedNode::from_value(&json!("??*")).expect_err("must fail");
        assert_eq!(err, TreeError::MisplacedEllipsis);

        let err =
            ExpectedNode::from_value(&json!(["a", "??*", "b", "??*"])).expect_err("must fail");
        assert_eq!(err, TreeError::MultipleEllipses);

        let node = ExpectedNode::from_value(&json!(["a", "??*", "b"])).expect("single ellipsis");
        assert!(matches!(node, ExpectedNode::Sequence(_)));
    }

    #[test]
    fn node_paths_render_like_diff_output() {
        let path = NodePath::root().child_index(1).child_key("events_seen");
        assert_eq!(path.to_string(), "[1].events_seen");
        assert_eq!(NodePath::root().to_string(), "(root)");
        assert_eq!(
            NodePath::root().child_key("intrinsics").child_index(0).to_string(),
            "intrinsics[0]"
        );
    }

    #[test]
    fn block_keywords_round_trip() {
        for kind in PayloadKind::ALL {
            assert_eq!(
                PayloadKind::from_block_keyword(kind.block_keyword()),
                Some(kind)
            );
        }
        assert_eq!(PayloadKind::from_block_keyword("EXPECT_METRICS"), None);
    }

    #[test]
    fn expectation_render_round_trips_sentinels() {
        let source = json!({
            "stack_trace": [" at __FILE__ (??)"],
            "agentAttributes": {},
            "intrinsics": "??"
        });
        let node = ExpectedNode::from_value(&source).expect("tree");
        assert_eq!(node.render(), source);
    }

    #[test]
    fn text_pattern_segments_split_on_sentinel() {
        let pattern = TextPattern::new("a??b??c");
        assert_eq!(pattern.segments(), ["a", "b", "c"]);
        let pattern = TextPattern::new("??tail");
        assert_eq!(pattern.segments(), ["", "tail"]);
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use fo_tree::{ExpectedNode, NodePath, PayloadKind, TextPattern};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Empty-mapping comparison policy. `Strict` reads an empty expected mapping
/// as "exactly empty"; `Lenient` reads it as "any mapping, not checked
/// further". One policy applies consistently to a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    Strict,
    Lenient,
}

/// Placeholder substitutions applied to expected text before comparison,
/// e.g. `__FILE__` -> the executed body path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchContext {
    placeholders: BTreeMap<String, String>,
}

impl MatchContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(path: impl Into<String>) -> Self {
        let mut ctx = Self::default();
        ctx.insert(fo_tree::FILE_PLACEHOLDER, path);
        ctx
    }

    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        self.placeholders.insert(token.into(), value.into());
    }

    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for (token, value) in &self.placeholders {
            if out.contains(token.as_str()) {
                out = out.replace(token.as_str(), value);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub path: String,
    pub expected: Value,
    pub actual: Option<Value>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub kind: PayloadKind,
    pub mismatches: Vec<Mismatch>,
    pub matched_paths: Vec<String>,
}

impl MatchReport {
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }

    #[must_use]
    pub fn first_mismatch(&self) -> Option<&Mismatch> {
        self.mismatches.first()
    }
}

/// Compares one expectation tree against the payload captured for its kind.
/// `None` means no payload of that kind was emitted; only a whole-payload
/// wildcard matches that. All mismatching paths are collected, alongside
/// every leaf path that did match.
#[must_use]
pub fn match_payload(
    kind: PayloadKind,
    expected: &ExpectedNode,
    actual: Option<&Value>,
    policy: MatchPolicy,
    context: &MatchContext,
) -> MatchReport {
    let mut walker = Walker {
        policy,
        context,
        mismatches: Vec::new(),
        matched_paths: Vec::new(),
    };
    walker.node(&NodePath::root(), expected, actual);
    MatchReport {
        kind,
        mismatches: walker.mismatches,
        matched_paths: walker.matched_paths,
    }
}

struct Walker<'a> {
    policy: MatchPolicy,
    context: &'a MatchContext,
    mismatches: Vec<Mismatch>,
    matched_paths: Vec<String>,
}

impl Walker<'_> {
    fn node(&mut self, path: &NodePath, expected: &ExpectedNode, actual: Option<&Value>) {
        if expected.is_wildcard() {
            self.matched_paths.push(path.to_string());
            return;
        }

        let Some(actual) = actual else {
            let reason = if path.is_root() {
                "no payload of this kind was captured".to_owned()
            } else {
                "missing from actual payload".to_owned()
            };
            self.mismatch(path, expected, None, reason);
            return;
        };

        match expected {
            ExpectedNode::Wildcard { .. } => unreachable!("handled above"),
            // Parsing confines ellipses to sequence element position.
            ExpectedNode::AnyElements => self.matched_paths.push(path.to_string()),
            ExpectedNode::Text(pattern) => self.text(path, expected, pattern, actual),
            ExpectedNode::Scalar(scalar) => {
                if scalar.matches_value(actual) {
                    self.matched_paths.push(path.to_string());
                } else {
                    self.mismatch(path, expected, Some(actual), "value mismatch".to_owned());
                }
            }
            ExpectedNode::Sequence(items) => self.sequence(path, expected, items, actual),
            ExpectedNode::Mapping(entries) => self.mapping(path, expected, entries, actual),
        }
    }

    fn text(
        &mut self,
        path: &NodePath,
        expected: &ExpectedNode,
        pattern: &TextPattern,
        actual: &Value,
    ) {
        let Value::String(text) = actual else {
            self.mismatch(path, expected, Some(actual), "expected a string".to_owned());
            return;
        };
        if pattern_matches(pattern, self.context, text) {
            self.matched_paths.push(path.to_string());
        } else {
            self.mismatch(
                path,
                expected,
                Some(actual),
                "text pattern mismatch".to_owned(),
            );
        }
    }

    fn sequence(
        &mut self,
        path: &NodePath,
        expected: &ExpectedNode,
        items: &[ExpectedNode],
        actual: &Value,
    ) {
        let Value::Array(actual_items) = actual else {
            self.mismatch(path, expected, Some(actual), "expected a sequence".to_owned());
            return;
        };

        let ellipsis = items
            .iter()
            .position(|item| matches!(item, ExpectedNode::AnyElements));

        match ellipsis {
            None => {
                if items.len() != actual_items.len() {
                    self.mismatch(
                        path,
                        expected,
                        Some(actual),
                        format!(
                            "sequence length mismatch: expected {}, actual {}",
                            items.len(),
                            actual_items.len()
                        ),
                    );
                }
                // Still walk the overlap so the diff names what did line up.
                for (index, item) in items.iter().enumerate().take(actual_items.len()) {
                    self.node(&path.child_index(index), item, Some(&actual_items[index]));
                }
                if items.is_empty() && actual_items.is_empty() {
                    self.matched_paths.push(path.to_string());
                }
            }
            Some(split) => {
                let prefix = &items[..split];
                let suffix = &items[split + 1..];
                if actual_items.len() < prefix.len() + suffix.len() {
                    self.mismatch(
                        path,
                        expected,
                        Some(actual),
                        format!(
                            "sequence has {} elements but the pattern needs at least {}",
                            actual_items.len(),
                            prefix.len() + suffix.len()
                        ),
                    );
                    return;
                }
                for (index, item) in prefix.iter().enumerate() {
                    self.node(&path.child_index(index), item, Some(&actual_items[index]));
                }
                let tail_start = actual_items.len() - suffix.len();
                for (offset, item) in suffix.iter().enumerate() {
                    let index = tail_start + offset;
                    self.node(&path.child_index(index), item, Some(&actual_items[index]));
                }
            }
        }
    }

    fn mapping(
        &mut self,
        path: &NodePath,
        expected: &ExpectedNode,
        entries: &BTreeMap<String, ExpectedNode>,
        actual: &Value,
    ) {
        let Value::Object(actual_entries) = actual else {
            self.mismatch(path, expected, Some(actual), "expected a mapping".to_owned());
            return;
        };

        if entries.is_empty() {
            match self.policy {
                MatchPolicy::Lenient => self.matched_paths.push(path.to_string()),
                MatchPolicy::Strict if actual_entries.is_empty() => {
                    self.matched_paths.push(path.to_string());
                }
                MatchPolicy::Strict => self.mismatch(
                    path,
                    expected,
                    Some(actual),
                    format!(
                        "expected an empty mapping, actual has {} entries",
                        actual_entries.len()
                    ),
                ),
            }
            return;
        }

        // Extra actual keys under a non-empty expected mapping are tolerated.
        for (key, item) in entries {
            self.node(&path.child_key(key), item, actual_entries.get(key));
        }
    }

    fn mismatch(
        &mut self,
        path: &NodePath,
        expected: &ExpectedNode,
        actual: Option<&Value>,
        reason: String,
    ) {
        self.mismatches.push(Mismatch {
            path: path.to_string(),
            expected: expected.render(),
            actual: actual.cloned(),
            reason,
        });
    }
}

fn pattern_matches(pattern: &TextPattern, context: &MatchContext, actual: &str) -> bool {
    let mut source = String::from("(?s)^");
    for (index, segment) in pattern.segments().iter().enumerate() {
        if index > 0 {
            source.push_str(".*");
        }
        source.push_str(&regex::escape(&context.apply(segment)));
    }
    source.push('$');
    Regex::new(&source).is_ok_and(|re| re.is_match(actual))
}

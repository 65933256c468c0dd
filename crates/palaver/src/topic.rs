//! Topic pattern validation and resolution.
//!
//! Request and response topics are configured as patterns with `{token}`
//! placeholders (`devices/{executorId}/commands/{commandName}`). A pattern
//! is validated once at construction; afterwards it can be resolved into a
//! concrete publish topic or into a subscribe filter where unresolved
//! tokens widen to `+`.

use std::collections::HashMap;
use std::fmt;

use crate::error::ProtocolError;

pub const TOKEN_MODEL_ID: &str = "modelId";
pub const TOKEN_EXECUTOR_ID: &str = "executorId";
pub const TOKEN_INVOKER_CLIENT_ID: &str = "invokerClientId";
pub const TOKEN_COMMAND_NAME: &str = "commandName";
pub const TOKEN_SENDER_ID: &str = "senderId";
pub const TOKEN_TELEMETRY_NAME: &str = "telemetryName";

/// Prefix marking user-defined tokens, as in `{ex:region}`.
pub const CUSTOM_TOKEN_PREFIX: &str = "ex:";

/// Replacement values keyed by token name (`"executorId"`, `"ex:region"`).
pub type TokenMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Label {
    Literal(String),
    Token(String),
}

/// A validated topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    pattern: String,
    labels: Vec<Label>,
}

impl TopicPattern {
    /// Validate and parse a pattern. Rejections are all
    /// `invalid configuration`: empty pattern, empty label, leading `$`,
    /// characters outside the label charset, unrecognized token.
    pub fn new(pattern: impl Into<String>) -> Result<Self, ProtocolError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(invalid_pattern(&pattern, "pattern must not be empty"));
        }
        if pattern.starts_with('$') {
            return Err(invalid_pattern(&pattern, "first label must not start with '$'"));
        }

        let mut labels = Vec::new();
        for label in pattern.split('/') {
            if label.is_empty() {
                return Err(invalid_pattern(&pattern, "pattern contains an empty label"));
            }
            if let Some(token) = label.strip_prefix('{').and_then(|l| l.strip_suffix('}')) {
                if !is_known_token(token) {
                    return Err(invalid_pattern(
                        &pattern,
                        format!("unrecognized token {{{token}}}"),
                    ));
                }
                labels.push(Label::Token(token.to_string()));
            } else if is_valid_label(label) {
                labels.push(Label::Literal(label.to_string()));
            } else {
                return Err(invalid_pattern(
                    &pattern,
                    format!("label {label:?} contains invalid characters"),
                ));
            }
        }

        Ok(Self { pattern, labels })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True when the pattern contains the named token.
    pub fn has_token(&self, token: &str) -> bool {
        self.labels
            .iter()
            .any(|l| matches!(l, Label::Token(t) if t == token))
    }

    /// Substitute every token and return a concrete topic. A token with no
    /// replacement, or a replacement outside the label charset, is an error.
    pub fn resolve(&self, tokens: &TokenMap) -> Result<String, ProtocolError> {
        let mut out = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            match label {
                Label::Literal(text) => out.push(text.as_str()),
                Label::Token(token) => match tokens.get(token) {
                    Some(value) if is_valid_label(value) => out.push(value.as_str()),
                    Some(value) => {
                        return Err(ProtocolError::configuration_invalid(
                            token.clone(),
                            value.clone(),
                            "replacement contains invalid characters",
                        ));
                    }
                    None => {
                        return Err(ProtocolError::configuration_invalid(
                            token.clone(),
                            "",
                            format!("no replacement for token {{{token}}}"),
                        ));
                    }
                },
            }
        }
        Ok(out.join("/"))
    }

    /// Substitute the tokens that have replacements and widen the rest to
    /// the `+` wildcard, producing a subscribe filter.
    pub fn to_filter(&self, tokens: &TokenMap) -> String {
        let labels: Vec<&str> = self
            .labels
            .iter()
            .map(|label| match label {
                Label::Literal(text) => text.as_str(),
                Label::Token(token) => match tokens.get(token) {
                    Some(value) if is_valid_label(value) => value.as_str(),
                    _ => "+",
                },
            })
            .collect();
        labels.join("/")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn invalid_pattern(pattern: &str, message: impl Into<String>) -> ProtocolError {
    ProtocolError::configuration_invalid("topicPattern", pattern, message)
}

fn is_known_token(token: &str) -> bool {
    matches!(
        token,
        TOKEN_MODEL_ID
            | TOKEN_EXECUTOR_ID
            | TOKEN_INVOKER_CLIENT_ID
            | TOKEN_COMMAND_NAME
            | TOKEN_SENDER_ID
            | TOKEN_TELEMETRY_NAME
    ) || token
        .strip_prefix(CUSTOM_TOKEN_PREFIX)
        .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphabetic()))
}

/// Printable ASCII excluding space, `"`, `+`, `#`, `{`, `}`, and `/`.
fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .bytes()
            .all(|b| (0x21..=0x7e).contains(&b) && !matches!(b, b'"' | b'+' | b'#' | b'{' | b'}' | b'/'))
}

/// Validate replacement values once at engine construction, so later
/// `to_filter` calls cannot silently produce malformed filters.
pub fn validate_token_map(tokens: &TokenMap) -> Result<(), ProtocolError> {
    for (token, value) in tokens {
        if !is_known_token(token) {
            return Err(ProtocolError::configuration_invalid(
                token.clone(),
                value.clone(),
                "unrecognized token name",
            ));
        }
        if !is_valid_label(value) {
            return Err(ProtocolError::configuration_invalid(
                token.clone(),
                value.clone(),
                "replacement contains invalid characters",
            ));
        }
    }
    Ok(())
}

/// Validate a topic namespace: one or more literal labels, no tokens, no
/// leading `$`.
pub fn validate_namespace(namespace: &str) -> Result<(), ProtocolError> {
    if namespace.is_empty() {
        return Err(ProtocolError::configuration_invalid(
            "topicNamespace",
            namespace,
            "namespace must not be empty",
        ));
    }
    if namespace.starts_with('$') {
        return Err(ProtocolError::configuration_invalid(
            "topicNamespace",
            namespace,
            "namespace must not start with '$'",
        ));
    }
    for label in namespace.split('/') {
        if !is_valid_label(label) {
            return Err(ProtocolError::configuration_invalid(
                "topicNamespace",
                namespace,
                format!("namespace label {label:?} is invalid"),
            ));
        }
    }
    Ok(())
}

/// Join a namespace onto a topic or filter with exactly one `/` separator.
pub fn prepend_namespace(topic: &str, namespace: &str) -> String {
    let ns = namespace.trim_end_matches('/');
    let topic = topic.trim_start_matches('/');
    format!("{ns}/{topic}")
}

/// Wrap a resolved filter in a shared-subscription group. The group name is
/// opaque to pattern validation but must itself be a single valid label.
pub fn share_group(filter: &str, group: &str) -> Result<String, ProtocolError> {
    if !is_valid_label(group) {
        return Err(ProtocolError::configuration_invalid(
            "sharedSubscriptionGroup",
            group,
            "group must be a single valid topic label",
        ));
    }
    Ok(format!("$share/{group}/{filter}"))
}

/// True for a concrete, publishable topic: non-empty labels only, no
/// wildcards or pattern braces, no leading `$`.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.starts_with('$') && !topic.is_empty() && topic.split('/').all(is_valid_label)
}

/// MQTT filter matching, wildcards included. Topics beginning with `$` are
/// not matched by filters whose first label is a wildcard.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_labels = filter.split('/');
    let mut topic_labels = topic.split('/').peekable();

    if topic.starts_with('$') && matches!(filter.bytes().next(), Some(b'+') | Some(b'#')) {
        return false;
    }

    loop {
        match (filter_labels.next(), topic_labels.peek()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {
                topic_labels.next();
            }
            (Some(expected), Some(actual)) => {
                if expected != *actual {
                    return false;
                }
                topic_labels.next();
            }
            (None, None) => return true,
            // "sport/#" also matches "sport" per the MQTT spec; plain
            // label exhaustion on either side does not.
            (Some(_), None) | (None, Some(_)) => {
                return false;
            }
        }
    }
}

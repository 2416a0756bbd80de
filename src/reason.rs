//! Completion outcomes attached to commands

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute set with case-normalised (lower-case) keys.
///
/// Inserting a key that is already present overwrites its value; later
/// writers always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// Empty attribute set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, normalising the key. Returns the previous value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0
            .insert(
                key.as_ref()
                    .to_ascii_lowercase(),
                value.into(),
            )
    }

    /// Look up a value by key, in any case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Overlay `other` onto `self`; keys from `other` win.
    pub fn merge(&mut self, other: &Attributes) {
        for (k, v) in &other.0 {
            self.0
                .insert(k.clone(), v.clone());
        }
    }

    /// `self` overlaid by `other`, leaving both untouched.
    pub fn overlaid(&self, other: &Attributes) -> Attributes {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0
            .len()
    }

    /// `true` if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0
            .is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (k, v) in iter {
            attributes.insert(k, v);
        }
        attributes
    }
}

define_parse_error!(
    /// Error returned when parsing an unknown input mode.
    ParseInputModeError,
    "input mode"
);

define_wire_enum! {
    error_type: ParseInputModeError,
    /// How input was collected.
    pub enum InputMode {
        Speech => "speech",
        Dtmf => "dtmf",
        Any => "any",
    }
}

/// Success or error; every [`CompletionReason`] reduces to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command ran to completion.
    Success,
    /// The command failed.
    Error,
}

/// The single outcome attached to a completed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum CompletionReason {
    /// Completed normally.
    Success {
        message: Option<String>,
        attributes: Attributes,
    },
    /// Failed; `details` carries the remote or local failure text.
    Error { details: String },
    /// Stopped on request.
    Stop,
    /// The call hung up while the command was running.
    Hangup,
    /// Input matched a grammar.
    Match {
        mode: Option<InputMode>,
        confidence: Option<f32>,
        utterance: Option<String>,
        interpretation: Option<String>,
    },
    /// Input did not match any grammar.
    #[serde(rename = "nomatch")]
    NoMatch,
    /// Nothing was heard before the initial timeout.
    InitialTimeout,
    /// Too long between DTMF digits.
    InterDigitTimeout,
    /// Silence exceeded the maximum.
    MaxSilence,
    /// A result arrived below the minimum confidence.
    MinConfidence,
}

impl CompletionReason {
    /// `Success` with a message and attribute set.
    pub fn success(message: Option<String>, attributes: Attributes) -> Self {
        CompletionReason::Success {
            message,
            attributes,
        }
    }

    /// `Error` with the given details.
    pub fn error(details: impl Into<String>) -> Self {
        CompletionReason::Error {
            details: details.into(),
        }
    }

    /// Wire name of the reason.
    pub fn name(&self) -> &'static str {
        match self {
            CompletionReason::Success { .. } => "success",
            CompletionReason::Error { .. } => "error",
            CompletionReason::Stop => "stop",
            CompletionReason::Hangup => "hangup",
            CompletionReason::Match { .. } => "match",
            CompletionReason::NoMatch => "nomatch",
            CompletionReason::InitialTimeout => "initial-timeout",
            CompletionReason::InterDigitTimeout => "inter-digit-timeout",
            CompletionReason::MaxSilence => "max-silence",
            CompletionReason::MinConfidence => "min-confidence",
        }
    }

    /// Reduce to success/error.
    pub fn outcome(&self) -> Outcome {
        match self {
            CompletionReason::Error { .. } => Outcome::Error,
            _ => Outcome::Success,
        }
    }

    /// `true` unless this is an `Error`.
    pub fn is_success(&self) -> bool {
        self.outcome() == Outcome::Success
    }

    /// `true` for the input reasons that mean nothing usable was heard.
    pub fn is_no_input(&self) -> bool {
        matches!(
            self,
            CompletionReason::InitialTimeout
                | CompletionReason::InterDigitTimeout
                | CompletionReason::MaxSilence
                | CompletionReason::MinConfidence
        )
    }

    /// Failure details of an `Error`.
    pub fn details(&self) -> Option<&str> {
        match self {
            CompletionReason::Error { details } => Some(details),
            _ => None,
        }
    }

    /// Message of a `Success`.
    pub fn message(&self) -> Option<&str> {
        match self {
            CompletionReason::Success { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    /// Attributes of a `Success`.
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            CompletionReason::Success { attributes, .. } => Some(attributes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_normalised() {
        let mut attrs = Attributes::new();
        attrs.insert("Exten", "idonno");
        assert_eq!(attrs.get("exten"), Some("idonno"));
        assert_eq!(attrs.get("EXTEN"), Some("idonno"));
        assert_eq!(
            attrs
                .iter()
                .next(),
            Some(("exten", "idonno"))
        );
    }

    #[test]
    fn later_writer_wins() {
        let mut base: Attributes = [("Context", "default"), ("Status", "-1")]
            .into_iter()
            .collect();
        let overlay: Attributes = [("context", "adhearsion"), ("Channel", "SIP/x")]
            .into_iter()
            .collect();
        base.merge(&overlay);
        assert_eq!(base.get("context"), Some("adhearsion"));
        assert_eq!(base.get("status"), Some("-1"));
        assert_eq!(base.get("channel"), Some("SIP/x"));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn reasons_reduce_to_success_or_error() {
        assert!(CompletionReason::NoMatch.is_success());
        assert!(CompletionReason::Hangup.is_success());
        assert!(CompletionReason::success(None, Attributes::new()).is_success());
        assert_eq!(
            CompletionReason::error("Action failed").outcome(),
            Outcome::Error
        );
        assert_eq!(
            CompletionReason::error("Action failed").details(),
            Some("Action failed")
        );
    }

    #[test]
    fn no_input_reasons() {
        assert!(CompletionReason::InitialTimeout.is_no_input());
        assert!(CompletionReason::MinConfidence.is_no_input());
        assert!(!CompletionReason::NoMatch.is_no_input());
    }

    #[test]
    fn serializes_with_reason_tag() {
        let json = serde_json::to_value(CompletionReason::InterDigitTimeout).unwrap();
        assert_eq!(json["reason"], "inter-digit-timeout");
        let json = serde_json::to_value(CompletionReason::NoMatch).unwrap();
        assert_eq!(json["reason"], "nomatch");
        let json = serde_json::to_value(CompletionReason::error("boom")).unwrap();
        assert_eq!(json["details"], "boom");
    }

    #[test]
    fn match_reason_carries_input_mode_as_wire_name() {
        let reason = CompletionReason::Match {
            mode: Some(InputMode::Dtmf),
            confidence: Some(0.5),
            utterance: Some("1 2 3".to_string()),
            interpretation: Some("123".to_string()),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "match");
        assert_eq!(json["mode"], "dtmf");
        let back: CompletionReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, reason);
    }

    #[test]
    fn unknown_input_mode_fails_to_deserialize() {
        let json = serde_json::json!({ "reason": "match", "mode": "telepathy" });
        let err = serde_json::from_value::<CompletionReason>(json).unwrap_err();
        assert!(err
            .to_string()
            .contains("unknown input mode: telepathy"));
        let mode: InputMode = serde_json::from_value(serde_json::json!("SPEECH")).unwrap();
        assert_eq!(mode, InputMode::Speech);
    }
}

//! Pattern-based redaction of secrets in audit records.
//!
//! Records are serialized to JSON text, rewritten by an ordered rule list,
//! then re-parsed. If a rule corrupts the structure the original record is
//! kept so the audit trail never loses an event, and the caller is told so.

use regex::Regex;
use serde_json::{Map, Value};

use crate::logging::{self, obj, v_str, Domain};

pub const REDACTION_MARKER: &str = "[REDACTED]";

const SECRET_KEYS: &str = "password|passwd|api_key|api_secret|secret|token|passphrase|private_key";

/// What happened to a record on its way through the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionOutcome {
    /// No rule matched.
    Clean,
    /// At least one secret was replaced.
    Redacted,
    /// A rule broke the record's structure; the unredacted original was
    /// kept. Leak risk, surfaced via a warn log and this variant.
    FallbackUnredacted,
}

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

pub struct RedactionFilter {
    rules: Vec<Rule>,
}

impl Default for RedactionFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RedactionFilter {
    pub fn new() -> Self {
        // Rule order matters: the JSON-field rule preserves structure, the
        // embedded-assignment rule catches secrets inside free-text values.
        let rules = vec![
            Rule {
                pattern: Regex::new(&format!(
                    r#"(?i)("(?:{SECRET_KEYS})"\s*:\s*")([^"\\]*)(")"#
                ))
                .expect("static regex"),
                replacement: "${1}[REDACTED]${3}",
            },
            Rule {
                pattern: Regex::new(&format!(
                    r"(?i)\b((?:{SECRET_KEYS})\s*[=:]\s*)([A-Za-z0-9+/_.-]+)"
                ))
                .expect("static regex"),
                replacement: "${1}[REDACTED]",
            },
        ];
        Self { rules }
    }

    /// Redact a record. Returns the record to persist and the outcome.
    pub fn apply(&self, record: &Map<String, Value>) -> (Map<String, Value>, RedactionOutcome) {
        let original = Value::Object(record.clone());
        let serialized = original.to_string();

        let mut text = serialized.clone();
        for rule in &self.rules {
            text = rule
                .pattern
                .replace_all(&text, rule.replacement)
                .into_owned();
        }

        if text == serialized {
            return (record.clone(), RedactionOutcome::Clean);
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => (map, RedactionOutcome::Redacted),
            _ => {
                logging::warn(
                    Domain::Audit,
                    "redaction_fallback",
                    obj(&[(
                        "event",
                        v_str(
                            record
                                .get("event")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown"),
                        ),
                    )]),
                );
                (record.clone(), RedactionOutcome::FallbackUnredacted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_password_field_masked() {
        let filter = RedactionFilter::new();
        let rec = record(&[
            ("event", json!("Login")),
            ("password", json!("secret123")),
            ("user", json!("alice")),
        ]);
        let (out, outcome) = filter.apply(&rec);
        assert_eq!(outcome, RedactionOutcome::Redacted);
        assert_eq!(out.get("password").unwrap(), REDACTION_MARKER);
        assert_eq!(out.get("user").unwrap(), "alice");
        assert!(!Value::Object(out).to_string().contains("secret123"));
    }

    #[test]
    fn test_clean_record_untouched() {
        let filter = RedactionFilter::new();
        let rec = record(&[("event", json!("OrderAccepted")), ("qty", json!(1.5))]);
        let (out, outcome) = filter.apply(&rec);
        assert_eq!(outcome, RedactionOutcome::Clean);
        assert_eq!(out, rec);
    }

    #[test]
    fn test_embedded_assignment_masked() {
        let filter = RedactionFilter::new();
        let rec = record(&[
            ("event", json!("ConfigChanged")),
            ("detail", json!("set api_key=AKIA123456 in broker.toml")),
        ]);
        let (out, outcome) = filter.apply(&rec);
        assert_eq!(outcome, RedactionOutcome::Redacted);
        let detail = out.get("detail").unwrap().as_str().unwrap();
        assert!(detail.contains(REDACTION_MARKER));
        assert!(!detail.contains("AKIA123456"));
    }

    #[test]
    fn test_case_insensitive_keys() {
        let filter = RedactionFilter::new();
        let rec = record(&[("API_KEY", json!("topsecret"))]);
        let (out, outcome) = filter.apply(&rec);
        assert_eq!(outcome, RedactionOutcome::Redacted);
        assert_eq!(out.get("API_KEY").unwrap(), REDACTION_MARKER);
    }

    #[test]
    fn test_structure_break_falls_back_to_original() {
        // A hostile rule that strips quotes, corrupting the JSON.
        let filter = RedactionFilter {
            rules: vec![Rule {
                pattern: Regex::new(r#""password"\s*:\s*"[^"]*""#).unwrap(),
                replacement: "password: broken",
            }],
        };
        let rec = record(&[("event", json!("Login")), ("password", json!("hunter2"))]);
        let (out, outcome) = filter.apply(&rec);
        assert_eq!(outcome, RedactionOutcome::FallbackUnredacted);
        assert_eq!(out, rec);
    }
}

//! Intent schema validator.
//!
//! A pure, total check of reasoning output before it may cross the boundary
//! into execution. It never panics and never returns a transport error:
//! misshaped candidates yield a human-readable error string summarising each
//! path-level violation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of executable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    Search,
    Calculate,
    Summarize,
    Translate,
}

impl IntentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentAction::Search => "search",
            IntentAction::Calculate => "calculate",
            IntentAction::Summarize => "summarize",
            IntentAction::Translate => "translate",
        }
    }

    pub fn parse(raw: &str) -> Option<IntentAction> {
        match raw {
            "search" => Some(IntentAction::Search),
            "calculate" => Some(IntentAction::Calculate),
            "summarize" => Some(IntentAction::Summarize),
            "translate" => Some(IntentAction::Translate),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate that passed validation, with the action narrowed to the
/// closed set.
#[derive(Debug, Clone)]
pub struct ValidatedIntent {
    pub intent_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub action: IntentAction,
    pub parameters: Map<String, Value>,
    pub confidence: f64,
}

/// Validation outcome. `Invalid` is not an error in the transport sense.
#[derive(Debug, Clone)]
pub enum IntentValidation {
    Valid(ValidatedIntent),
    Invalid { error: String },
}

impl IntentValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, IntentValidation::Valid(_))
    }
}

/// Validate an intent candidate against the schema:
/// `{intentId: UUID, conversationId: non-empty, messageId: non-empty,
/// action ∈ {search, calculate, summarize, translate}, parameters: map,
/// confidence ∈ [0, 1]}`.
pub fn validate_intent(raw: &Value) -> IntentValidation {
    let mut violations: Vec<String> = Vec::new();

    let Some(object) = raw.as_object() else {
        return IntentValidation::Invalid {
            error: "candidate must be a JSON object".to_string(),
        };
    };

    let intent_id = require_string(object, "intentId", &mut violations);
    if let Some(id) = &intent_id {
        if uuid::Uuid::parse_str(id).is_err() {
            violations.push(format!("intentId: '{}' is not a UUID", id));
        }
    }

    let conversation_id = require_string(object, "conversationId", &mut violations);
    let message_id = require_string(object, "messageId", &mut violations);

    let action = match object.get("action") {
        Some(Value::String(raw_action)) => match IntentAction::parse(raw_action) {
            Some(action) => Some(action),
            None => {
                violations.push(format!(
                    "action: '{}' is not one of [search, calculate, summarize, translate]",
                    raw_action
                ));
                None
            }
        },
        Some(other) => {
            violations.push(format!("action: expected string, got {}", kind_of(other)));
            None
        }
        None => {
            violations.push("action: missing".to_string());
            None
        }
    };

    let parameters = match object.get("parameters") {
        Some(Value::Object(map)) => Some(map.clone()),
        Some(other) => {
            violations.push(format!(
                "parameters: expected object, got {}",
                kind_of(other)
            ));
            None
        }
        // An omitted parameter map is an empty one.
        None => Some(Map::new()),
    };

    let confidence = match object.get("confidence") {
        Some(value) => match value.as_f64() {
            Some(number) if (0.0..=1.0).contains(&number) => Some(number),
            Some(number) => {
                violations.push(format!("confidence: {} is outside [0, 1]", number));
                None
            }
            None => {
                violations.push(format!(
                    "confidence: expected number, got {}",
                    kind_of(value)
                ));
                None
            }
        },
        None => {
            violations.push("confidence: missing".to_string());
            None
        }
    };

    if !violations.is_empty() {
        return IntentValidation::Invalid {
            error: violations.join("; "),
        };
    }

    // All fields validated above; the unwraps cannot fail past this point,
    // but stay total anyway.
    match (
        intent_id,
        conversation_id,
        message_id,
        action,
        parameters,
        confidence,
    ) {
        (Some(intent_id), Some(conversation_id), Some(message_id), Some(action), Some(parameters), Some(confidence)) => {
            IntentValidation::Valid(ValidatedIntent {
                intent_id,
                conversation_id,
                message_id,
                action,
                parameters,
                confidence,
            })
        }
        _ => IntentValidation::Invalid {
            error: "candidate failed validation".to_string(),
        },
    }
}

fn require_string(
    object: &Map<String, Value>,
    field: &str,
    violations: &mut Vec<String>,
) -> Option<String> {
    match object.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.clone()),
        Some(Value::String(_)) => {
            violations.push(format!("{}: must not be empty", field));
            None
        }
        Some(other) => {
            violations.push(format!("{}: expected string, got {}", field, kind_of(other)));
            None
        }
        None => {
            violations.push(format!("{}: missing", field));
            None
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate() -> Value {
        json!({
            "intentId": uuid::Uuid::new_v4().to_string(),
            "conversationId": "conv-1",
            "messageId": "msg-1",
            "action": "search",
            "parameters": {"query": "cats"},
            "confidence": 0.9,
        })
    }

    #[test]
    fn test_valid_candidate_narrows_action() {
        let outcome = validate_intent(&candidate());
        match outcome {
            IntentValidation::Valid(intent) => {
                assert_eq!(intent.action, IntentAction::Search);
                assert_eq!(intent.conversation_id, "conv-1");
                assert_eq!(intent.parameters["query"], json!("cats"));
                assert!((intent.confidence - 0.9).abs() < f64::EPSILON);
            }
            IntentValidation::Invalid { error } => panic!("unexpected invalid: {}", error),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let mut raw = candidate();
        raw["action"] = json!("dance");

        match validate_intent(&raw) {
            IntentValidation::Invalid { error } => {
                assert!(error.contains("action: 'dance'"), "error was: {}", error);
            }
            IntentValidation::Valid(_) => panic!("'dance' must not validate"),
        }
    }

    #[test]
    fn test_all_violations_are_reported() {
        let raw = json!({
            "intentId": "not-a-uuid",
            "conversationId": "",
            "action": 7,
            "parameters": "nope",
            "confidence": 1.5,
        });

        match validate_intent(&raw) {
            IntentValidation::Invalid { error } => {
                assert!(error.contains("intentId"), "error was: {}", error);
                assert!(error.contains("conversationId"), "error was: {}", error);
                assert!(error.contains("messageId: missing"), "error was: {}", error);
                assert!(error.contains("action"), "error was: {}", error);
                assert!(error.contains("parameters"), "error was: {}", error);
                assert!(error.contains("confidence"), "error was: {}", error);
            }
            IntentValidation::Valid(_) => panic!("must not validate"),
        }
    }

    #[test]
    fn test_confidence_bounds_are_inclusive() {
        for bound in [0.0, 1.0] {
            let mut raw = candidate();
            raw["confidence"] = json!(bound);
            assert!(validate_intent(&raw).is_valid(), "bound {} rejected", bound);
        }
    }

    #[test]
    fn test_omitted_parameters_default_to_empty_map() {
        let mut raw = candidate();
        raw.as_object_mut().expect("object").remove("parameters");

        match validate_intent(&raw) {
            IntentValidation::Valid(intent) => assert!(intent.parameters.is_empty()),
            IntentValidation::Invalid { error } => panic!("unexpected invalid: {}", error),
        }
    }

    #[test]
    fn test_non_object_candidate_is_total() {
        assert!(!validate_intent(&json!(null)).is_valid());
        assert!(!validate_intent(&json!([1, 2])).is_valid());
        assert!(!validate_intent(&json!("text")).is_valid());
    }
}

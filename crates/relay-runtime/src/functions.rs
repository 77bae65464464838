//! Deterministic reasoning and tool functions.
//!
//! The pipeline treats both as black boxes supplied by the deployment; the
//! implementations here are the defaults a single-node deployment ships
//! with. Both are pure: repeated invocation with the same inputs yields the
//! same outputs, which is what keeps replays harmless even when every dedup
//! layer misses.

use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Maps message content to an intent candidate for schema validation.
pub trait ReasoningFn: Send + Sync {
    fn reason(&self, conversation_id: &str, message_id: &str, content: &str) -> Value;
}

/// Executes a validated intent as a tool call.
pub trait ToolFn: Send + Sync {
    fn execute(&self, action: &str, parameters: &Map<String, Value>) -> ToolOutcome;
}

/// Result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Map<String, Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    fn success(result: Map<String, Value>) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    fn failure(result: Map<String, Value>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result,
            error: Some(error.into()),
        }
    }
}

const KNOWN_ACTIONS: [&str; 4] = ["search", "calculate", "summarize", "translate"];

/// Keyword-based reasoner: the first known action word found in the content
/// picks the action; otherwise the first token of the message is offered as
/// an action guess and left to the validator to reject.
pub struct KeywordReasoner;

impl ReasoningFn for KeywordReasoner {
    fn reason(&self, conversation_id: &str, message_id: &str, content: &str) -> Value {
        let lowered = content.to_lowercase();
        let matched = KNOWN_ACTIONS
            .iter()
            .find(|action| lowered.contains(*action));
        let (action, confidence) = match matched {
            Some(action) => ((*action).to_string(), 0.9),
            None => (
                lowered
                    .split_whitespace()
                    .next()
                    .unwrap_or("unknown")
                    .to_string(),
                0.2,
            ),
        };

        // The intent ID is derived from the message so a crash-replay of the
        // reasoner reproduces the identical candidate.
        let intent_id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", conversation_id, message_id).as_bytes(),
        );

        json!({
            "intentId": intent_id.to_string(),
            "conversationId": conversation_id,
            "messageId": message_id,
            "action": action,
            "parameters": { "query": content },
            "confidence": confidence,
        })
    }
}

/// Deterministic implementations of the four executable actions.
pub struct BuiltinToolbox;

impl BuiltinToolbox {
    fn query(parameters: &Map<String, Value>) -> String {
        parameters
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

impl ToolFn for BuiltinToolbox {
    fn execute(&self, action: &str, parameters: &Map<String, Value>) -> ToolOutcome {
        let query = Self::query(parameters);
        match action {
            "search" => {
                let mut result = Map::new();
                result.insert("tool".to_string(), json!("search"));
                result.insert("query".to_string(), json!(query));
                result.insert(
                    "results".to_string(),
                    json!([
                        format!("result 1 for '{}'", query),
                        format!("result 2 for '{}'", query),
                        format!("result 3 for '{}'", query),
                    ]),
                );
                ToolOutcome::success(result)
            }
            "calculate" => {
                let mut result = Map::new();
                result.insert("tool".to_string(), json!("calculate"));
                match evaluate_expression(&query) {
                    Some(value) => {
                        result.insert("expression".to_string(), json!(query));
                        result.insert("value".to_string(), json!(value));
                        ToolOutcome::success(result)
                    }
                    None => ToolOutcome::failure(
                        result,
                        format!("could not evaluate arithmetic in '{}'", query),
                    ),
                }
            }
            "summarize" => {
                let summary: String = query.chars().take(80).collect();
                let mut result = Map::new();
                result.insert("tool".to_string(), json!("summarize"));
                result.insert("summary".to_string(), json!(summary));
                result.insert(
                    "truncated".to_string(),
                    json!(query.chars().count() > 80),
                );
                ToolOutcome::success(result)
            }
            "translate" => {
                let mut result = Map::new();
                result.insert("tool".to_string(), json!("translate"));
                result.insert(
                    "translation".to_string(),
                    json!(format!("[translated] {}", query)),
                );
                ToolOutcome::success(result)
            }
            other => ToolOutcome::failure(Map::new(), format!("unknown action '{}'", other)),
        }
    }
}

/// Evaluate the first `a <op> b` pair found in the text. Returns `None`
/// when no such pair parses.
fn evaluate_expression(text: &str) -> Option<f64> {
    for (index, op) in text.char_indices().skip(1) {
        if !matches!(op, '+' | '-' | '*' | '/') {
            continue;
        }
        let lhs = extract_trailing_number(&text[..index])?;
        let rhs = extract_leading_number(&text[index + op.len_utf8()..])?;
        return match op {
            '+' => Some(lhs + rhs),
            '-' => Some(lhs - rhs),
            '*' => Some(lhs * rhs),
            '/' if rhs != 0.0 => Some(lhs / rhs),
            _ => None,
        };
    }
    None
}

fn extract_trailing_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_end();
    // Step past the full width of the last non-numeric char; a bare byte
    // offset would split multibyte chars.
    let start = trimmed
        .char_indices()
        .rev()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, ch)| i + ch.len_utf8())
        .unwrap_or(0);
    trimmed[start..].parse().ok()
}

fn extract_leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let end = trimmed
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::validator::{validate_intent, IntentValidation};

    #[test]
    fn test_keyword_reasoner_detects_action() {
        let candidate = KeywordReasoner.reason("conv-1", "msg-1", "search for cats");
        assert_eq!(candidate["action"], "search");
        assert_eq!(candidate["parameters"]["query"], "search for cats");
        assert!(validate_intent(&candidate).is_valid());
    }

    #[test]
    fn test_keyword_reasoner_guess_fails_validation() {
        let candidate = KeywordReasoner.reason("conv-1", "msg-1", "dance for me");
        assert_eq!(candidate["action"], "dance");
        assert!(matches!(
            validate_intent(&candidate),
            IntentValidation::Invalid { .. }
        ));
    }

    #[test]
    fn test_keyword_reasoner_is_deterministic() {
        let a = KeywordReasoner.reason("conv-1", "msg-1", "search for cats");
        let b = KeywordReasoner.reason("conv-1", "msg-1", "search for cats");
        assert_eq!(a, b);
        assert_eq!(a["intentId"], b["intentId"]);
    }

    #[test]
    fn test_toolbox_search_echoes_query() {
        let mut parameters = Map::new();
        parameters.insert("query".to_string(), json!("search for cats"));

        let outcome = BuiltinToolbox.execute("search", &parameters);
        assert!(outcome.success);
        assert_eq!(outcome.result["tool"], "search");
        assert_eq!(outcome.result["query"], "search for cats");
        assert_eq!(
            outcome.result["results"].as_array().map(Vec::len),
            Some(3)
        );
    }

    #[test]
    fn test_toolbox_calculate_evaluates_expression() {
        let mut parameters = Map::new();
        parameters.insert("query".to_string(), json!("calculate 6 * 7"));

        let outcome = BuiltinToolbox.execute("calculate", &parameters);
        assert!(outcome.success);
        assert_eq!(outcome.result["value"], json!(42.0));
    }

    #[test]
    fn test_toolbox_calculate_rejects_nonsense() {
        let mut parameters = Map::new();
        parameters.insert("query".to_string(), json!("calculate the vibe"));

        let outcome = BuiltinToolbox.execute("calculate", &parameters);
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_toolbox_unknown_action_fails() {
        let outcome = BuiltinToolbox.execute("dance", &Map::new());
        assert!(!outcome.success);
    }

    #[test]
    fn test_evaluate_expression_handles_division_by_zero() {
        assert_eq!(evaluate_expression("10 / 0"), None);
        assert_eq!(evaluate_expression("10 / 2"), Some(5.0));
        assert_eq!(evaluate_expression("3 + 4"), Some(7.0));
        assert_eq!(evaluate_expression("no numbers here"), None);
    }

    #[test]
    fn test_evaluate_expression_tolerates_multibyte_chars() {
        // Non-ASCII directly before an operator must not split the scan.
        assert_eq!(evaluate_expression("café-5"), None);
        assert_eq!(evaluate_expression("π+2"), None);
        assert_eq!(evaluate_expression("café 3+4"), Some(7.0));

        let mut parameters = Map::new();
        parameters.insert("query".to_string(), json!("calculate café-5"));
        let outcome = BuiltinToolbox.execute("calculate", &parameters);
        assert!(!outcome.success);
    }
}

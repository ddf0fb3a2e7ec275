// Workflow definition format consumed by the state-machine compiler

//! # State Machine Definitions
//!
//! Workflows are written in the states-language format:
//!
//! ```json
//! {
//!   "StartAt": "SetupParameters",
//!   "States": {
//!     "SetupParameters": {"Type": "Pass", "Next": "Parallel"},
//!     "Parallel": {"Type": "Parallel", "End": true, "Branches": [ ... ]}
//!   }
//! }
//! ```
//!
//! The `States` object is kept in **declaration order** so that compilation
//! is deterministic, including the numbering of synthetic closing triggers.
//! Fields the compiler does not interpret (`Result`, `ResultPath`,
//! `Resource`, ...) are preserved in [`StateSpec::extra`] and travel into the
//! trigger context untouched.
//!
//! ## Rust Learning Notes:
//!
//! ### Custom (De)serialization with `serde(with = ...)`
//! JSON objects have no guaranteed order once they land in a map type. The
//! `ordered_states` module implements a `Visitor` that walks the object entry
//! by entry and collects a `Vec<(String, StateSpec)>` instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, TriggerflowError};

/// A complete (sub-)workflow: a start state and the named states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachineDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    pub start_at: String,

    #[serde(with = "ordered_states")]
    pub states: Vec<(String, StateSpec)>,
}

impl StateMachineDefinition {
    /// Parse a definition from JSON text, keeping state order
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn state(&self, name: &str) -> Option<&StateSpec> {
        self.states
            .iter()
            .find(|(state_name, _)| state_name == name)
            .map(|(_, spec)| spec)
    }
}

/// The kind of a workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    Pass,
    Task,
    Choice,
    Parallel,
    Map,
    Wait,
    Succeed,
    Fail,
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One state of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateSpec {
    #[serde(rename = "Type")]
    pub state_type: StateType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,

    /// Choice rules, each naming a target state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ChoiceRule>,

    /// Choice fallback target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Parallel sub-workflows
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<StateMachineDefinition>,

    /// Map sub-workflow run per item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<Box<StateMachineDefinition>>,

    /// Every other field, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StateSpec {
    /// Plain state of the given type with no transitions
    pub fn of(state_type: StateType) -> Self {
        Self {
            state_type,
            next: None,
            end: false,
            choices: Vec::new(),
            default: None,
            branches: Vec::new(),
            iterator: None,
            extra: Map::new(),
        }
    }

    /// Every state a Choice can route to, `Default` last
    pub fn choice_targets(&self) -> impl Iterator<Item = &str> {
        self.choices
            .iter()
            .map(|choice| choice.next.as_str())
            .chain(self.default.as_deref())
    }

    /// The state as JSON, for embedding in trigger contexts
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A single Choice rule: a predicate and the state it routes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRule {
    #[serde(rename = "Next")]
    pub next: String,

    /// `Variable` plus one comparison, or a nested `And`/`Or`/`Not`
    #[serde(flatten)]
    pub predicate: Map<String, Value>,
}

impl ChoiceRule {
    /// Evaluate the predicate against a state input document
    pub fn evaluate(&self, input: &Value) -> Result<bool> {
        evaluate_predicate(&self.predicate, input)
    }
}

/// Evaluate a choice predicate object
///
/// Supports `And`, `Or`, `Not` and the comparisons `StringEquals`,
/// `NumericEquals`, `NumericGreaterThan`, `NumericGreaterThanEquals`,
/// `NumericLessThan`, `NumericLessThanEquals` and `BooleanEquals` applied to
/// the value found at `Variable` (a `$.a.b` path). A missing variable makes
/// the comparison false.
pub fn evaluate_predicate(predicate: &Map<String, Value>, input: &Value) -> Result<bool> {
    if let Some(rules) = predicate.get("And") {
        for rule in as_predicates(rules)? {
            if !evaluate_predicate(rule, input)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    if let Some(rules) = predicate.get("Or") {
        for rule in as_predicates(rules)? {
            if evaluate_predicate(rule, input)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    if let Some(rule) = predicate.get("Not") {
        let rule = rule.as_object().ok_or_else(|| {
            TriggerflowError::InvalidDefinition(format!("Not must hold a rule object: {}", rule))
        })?;
        return Ok(!evaluate_predicate(rule, input)?);
    }

    let path = predicate
        .get("Variable")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            TriggerflowError::InvalidDefinition(format!(
                "choice rule has no Variable: {}",
                Value::Object(predicate.clone())
            ))
        })?;
    let actual = lookup_path(input, path);

    for (operator, expected) in predicate {
        let result = match operator.as_str() {
            "Variable" | "Next" => continue,
            "StringEquals" | "BooleanEquals" => actual.map_or(false, |v| v == expected),
            "NumericEquals" => compare_numbers(actual, expected, |a, b| (a - b).abs() < f64::EPSILON),
            "NumericGreaterThan" => compare_numbers(actual, expected, |a, b| a > b),
            "NumericGreaterThanEquals" => compare_numbers(actual, expected, |a, b| a >= b),
            "NumericLessThan" => compare_numbers(actual, expected, |a, b| a < b),
            "NumericLessThanEquals" => compare_numbers(actual, expected, |a, b| a <= b),
            other => {
                return Err(TriggerflowError::Unimplemented(format!(
                    "choice comparison {} in {}",
                    other,
                    Value::Object(predicate.clone())
                )))
            }
        };
        return Ok(result);
    }

    Err(TriggerflowError::InvalidDefinition(format!(
        "choice rule has no comparison: {}",
        Value::Object(predicate.clone())
    )))
}

fn as_predicates(rules: &Value) -> Result<Vec<&Map<String, Value>>> {
    rules
        .as_array()
        .map(|rules| rules.iter().filter_map(Value::as_object).collect())
        .ok_or_else(|| {
            TriggerflowError::InvalidDefinition(format!("expected a list of rules: {}", rules))
        })
}

fn compare_numbers(actual: Option<&Value>, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Resolve a `$.a.b` path inside a JSON document
pub fn lookup_path<'a>(input: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.strip_prefix('$')?;
    trimmed
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(input, |value, segment| value.get(segment))
}

/// Write `value` at a `$.a.b` path, creating objects along the way
///
/// `$` replaces the whole document. Non-object documents on the path are
/// replaced by objects.
pub fn set_path(document: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path
        .trim_start_matches('$')
        .split('.')
        .filter(|segment| !segment.is_empty())
        .collect();

    let Some((last, parents)) = segments.split_last() else {
        *document = value;
        return;
    };

    let mut current = document;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => unreachable!(),
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

mod ordered_states {
    use std::fmt;

    use serde::de::{Error, MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    use super::StateSpec;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(states: &Vec<(String, StateSpec)>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(states.iter().map(|(name, spec)| (name, spec)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, StateSpec)>, D::Error> {
        struct StatesVisitor;

        impl<'de> Visitor<'de> for StatesVisitor {
            type Value = Vec<(String, StateSpec)>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of state names to state definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut states: Vec<(String, StateSpec)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, spec)) = access.next_entry::<String, StateSpec>()? {
                    if states.iter().any(|(existing, _)| existing == &name) {
                        return Err(A::Error::custom(format!("duplicate state {}", name)));
                    }
                    states.push((name, spec));
                }
                Ok(states)
            }
        }

        deserializer.deserialize_map(StatesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_states_keep_declaration_order() {
        let definition = StateMachineDefinition::from_json(
            r#"{
                "StartAt": "Zeta",
                "States": {
                    "Zeta": {"Type": "Pass", "Next": "Alpha"},
                    "Alpha": {"Type": "Task", "Resource": "arn:fn", "End": true}
                }
            }"#,
        )
        .unwrap();

        let names: Vec<&str> = definition.states.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);

        let alpha = definition.state("Alpha").unwrap();
        assert_eq!(alpha.state_type, StateType::Task);
        assert!(alpha.end);
        assert_eq!(alpha.extra.get("Resource"), Some(&json!("arn:fn")));
    }

    #[test]
    fn test_duplicate_state_names_rejected() {
        let result = StateMachineDefinition::from_json(
            r#"{"StartAt": "A", "States": {"A": {"Type": "Pass", "End": true}, "A": {"Type": "Pass", "End": true}}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_state_round_trips_extra_fields() {
        let state: StateSpec = serde_json::from_value(json!({
            "Type": "Pass",
            "Result": 2,
            "ResultPath": "$.my_number",
            "Next": "Parallel"
        }))
        .unwrap();

        let value = state.to_value();
        assert_eq!(value["Type"], "Pass");
        assert_eq!(value["Next"], "Parallel");
        assert_eq!(value["Result"], 2);
        assert!(value.get("End").is_none());
    }

    #[test]
    fn test_choice_targets_include_default() {
        let state: StateSpec = serde_json::from_value(json!({
            "Type": "Choice",
            "Choices": [
                {"Variable": "$.n", "NumericEquals": 1, "Next": "One"},
                {"Variable": "$.n", "NumericEquals": 2, "Next": "Two"}
            ],
            "Default": "Other"
        }))
        .unwrap();

        let targets: Vec<&str> = state.choice_targets().collect();
        assert_eq!(targets, vec!["One", "Two", "Other"]);
        assert!(state.choices[0].predicate.get("Next").is_none());
    }

    #[test]
    fn test_numeric_and_string_predicates() {
        let input = json!({"my_number": 2, "status": "ok", "nested": {"flag": true}});

        let rule: ChoiceRule = serde_json::from_value(json!({
            "Variable": "$.my_number", "NumericEquals": 2, "Next": "Result2"
        }))
        .unwrap();
        assert!(rule.evaluate(&input).unwrap());

        let rule: ChoiceRule = serde_json::from_value(json!({
            "Variable": "$.my_number", "NumericGreaterThan": 5, "Next": "Big"
        }))
        .unwrap();
        assert!(!rule.evaluate(&input).unwrap());

        let rule: ChoiceRule = serde_json::from_value(json!({
            "And": [
                {"Variable": "$.status", "StringEquals": "ok"},
                {"Not": {"Variable": "$.nested.flag", "BooleanEquals": false}}
            ],
            "Next": "Both"
        }))
        .unwrap();
        assert!(rule.evaluate(&input).unwrap());
    }

    #[test]
    fn test_missing_variable_is_false() {
        let rule: ChoiceRule = serde_json::from_value(json!({
            "Variable": "$.absent", "NumericLessThan": 3, "Next": "X"
        }))
        .unwrap();
        assert!(!rule.evaluate(&json!({})).unwrap());
    }

    #[test]
    fn test_unsupported_comparison_fails() {
        let rule: ChoiceRule = serde_json::from_value(json!({
            "Variable": "$.ts", "TimestampEquals": "2020-01-01T00:00:00Z", "Next": "X"
        }))
        .unwrap();
        assert!(matches!(
            rule.evaluate(&json!({"ts": "x"})),
            Err(TriggerflowError::Unimplemented(_))
        ));
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"a": {"b": 3}});
        assert_eq!(lookup_path(&doc, "$.a.b"), Some(&json!(3)));
        assert_eq!(lookup_path(&doc, "$"), Some(&doc));
        assert_eq!(lookup_path(&doc, "a.b"), None);
    }

    #[test]
    fn test_set_path() {
        let mut document = json!({"keep": 1});
        set_path(&mut document, "$.my_number", json!(2));
        assert_eq!(document, json!({"keep": 1, "my_number": 2}));

        set_path(&mut document, "$.a.b", json!("x"));
        assert_eq!(lookup_path(&document, "$.a.b"), Some(&json!("x")));

        let mut scalar = json!(7);
        set_path(&mut scalar, "$", json!({"replaced": true}));
        assert_eq!(scalar, json!({"replaced": true}));
    }
}

/// Condition interpreter
///
/// Evaluates `Condition` trees against an execution's variable bag. Field
/// lookup goes through JSONPath so nested payloads ("trigger_payload.data.plan")
/// resolve the same way as flat variables. The operator set is closed.

use crate::funnel::{Condition, ConditionOperator, LogicalOperator};
use serde_json::Value;

/// Evaluator bound to one variable snapshot
pub struct ConditionEvaluator<'a> {
    root: &'a Value,
}

impl<'a> ConditionEvaluator<'a> {
    /// `root` is the variable bag as a JSON object
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// Evaluate a condition tree; an empty condition is true
    pub fn evaluate(&self, condition: &Condition) -> bool {
        if !condition.children.is_empty() || condition.logic.is_some() {
            return self.evaluate_group(condition);
        }
        match (&condition.field, condition.operator) {
            (Some(field), Some(operator)) => {
                let actual = self.lookup(field);
                compare(actual.as_ref(), operator, condition.value.as_ref())
            }
            (Some(field), None) => self.lookup(field).map(|value| is_truthy(&value)).unwrap_or(false),
            (None, _) => true,
        }
    }

    fn evaluate_group(&self, condition: &Condition) -> bool {
        match condition.logic.unwrap_or(LogicalOperator::And) {
            LogicalOperator::And => condition.children.iter().all(|child| self.evaluate(child)),
            LogicalOperator::Or => condition.children.iter().any(|child| self.evaluate(child)),
            LogicalOperator::Not => !condition.children.iter().all(|child| self.evaluate(child)),
        }
    }

    /// Resolve a field path; `variables.` prefixes are accepted and stripped
    ///
    /// A top-level key matching the whole field wins over a dotted descent, so
    /// keys such as "utm.source" stay addressable.
    pub fn lookup(&self, field: &str) -> Option<Value> {
        if !field.starts_with('$') {
            let key = field.strip_prefix("variables.").unwrap_or(field);
            if let Some(value) = self.root.get(key) {
                return Some(value.clone());
            }
        }
        let path = to_json_path(field);
        match jsonpath_lib::select(self.root, &path) {
            Ok(matches) => matches.first().map(|value| (*value).clone()),
            Err(e) => {
                tracing::debug!("🔍 Unresolvable condition field '{}': {:?}", field, e);
                None
            }
        }
    }
}

/// Evaluate a condition against a variable bag
pub fn evaluate(condition: &Condition, root: &Value) -> bool {
    ConditionEvaluator::new(root).evaluate(condition)
}

fn to_json_path(field: &str) -> String {
    if field.starts_with('$') {
        return field.to_string();
    }
    let field = field.strip_prefix("variables.").unwrap_or(field);

    let mut path = String::from("$");
    for segment in field.split('.') {
        if is_identifier(segment) {
            path.push('.');
            path.push_str(segment);
        } else if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{}]", segment));
        } else {
            let quoted = segment.replace('\\', "\\\\").replace('\'', "\\'");
            path.push_str(&format!("['{}']", quoted));
        }
    }
    path
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn compare(actual: Option<&Value>, operator: ConditionOperator, expected: Option<&Value>) -> bool {
    use ConditionOperator::*;

    let present = actual.filter(|value| !value.is_null());
    match operator {
        Exists => present.is_some(),
        NotExists => present.is_none(),
        IsEmpty => present.map(is_empty).unwrap_or(true),
        IsNotEmpty => present.map(|value| !is_empty(value)).unwrap_or(false),
        Equals => matches_equal(present, expected),
        NotEquals => !matches_equal(present, expected),
        GreaterThan => ordering(present, expected).map(|o| o.is_gt()).unwrap_or(false),
        LessThan => ordering(present, expected).map(|o| o.is_lt()).unwrap_or(false),
        GreaterThanOrEqual => ordering(present, expected).map(|o| o.is_ge()).unwrap_or(false),
        LessThanOrEqual => ordering(present, expected).map(|o| o.is_le()).unwrap_or(false),
        Contains => contains(present, expected),
        NotContains => !contains(present, expected),
        StartsWith => string_pair(present, expected)
            .map(|(a, b)| a.starts_with(b))
            .unwrap_or(false),
        EndsWith => string_pair(present, expected)
            .map(|(a, b)| a.ends_with(b))
            .unwrap_or(false),
        In => member_of(present, expected),
        NotIn => !member_of(present, expected),
    }
}

fn matches_equal(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (Some(a), Some(b)) => values_equal(a, b),
        (None, None) => true,
        (None, Some(b)) => b.is_null(),
        (Some(_), None) => false,
    }
}

/// Equality with numeric normalization (80 == 80.0 == "80")
fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x == y;
        }
    }
    a == b
}

fn ordering(actual: Option<&Value>, expected: Option<&Value>) -> Option<std::cmp::Ordering> {
    let (a, b) = (actual?, expected?);
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    let (Some(actual), Some(expected)) = (actual, expected) else {
        return false;
    };
    match actual {
        Value::String(haystack) => expected
            .as_str()
            .map(|needle| haystack.contains(needle))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        Value::Object(map) => expected.as_str().map(|key| map.contains_key(key)).unwrap_or(false),
        _ => false,
    }
}

fn member_of(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (Some(actual), Some(Value::Array(options))) => {
            options.iter().any(|option| values_equal(actual, option))
        }
        _ => false,
    }
}

fn string_pair<'v>(actual: Option<&'v Value>, expected: Option<&'v Value>) -> Option<(&'v str, &'v str)> {
    Some((actual?.as_str()?, expected?.as_str()?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        other => !is_empty(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "score": 80,
            "name": "Ana",
            "email": "ana@example.com",
            "tags": ["vip", "trial"],
            "empty": "",
            "trigger_payload": {"data": {"plan": "pro"}}
        })
    }

    fn leaf(field: &str, operator: ConditionOperator, value: Value) -> Condition {
        Condition::leaf(field, operator, value)
    }

    #[test]
    fn test_numeric_comparisons() {
        let root = vars();
        assert!(evaluate(&leaf("variables.score", ConditionOperator::GreaterThan, json!(50)), &root));
        assert!(!evaluate(&leaf("score", ConditionOperator::LessThan, json!(50)), &root));
        assert!(evaluate(&leaf("score", ConditionOperator::GreaterThanOrEqual, json!(80)), &root));
        assert!(evaluate(&leaf("score", ConditionOperator::LessThanOrEqual, json!("80")), &root));
        assert!(evaluate(&leaf("score", ConditionOperator::Equals, json!(80.0)), &root));
    }

    #[test]
    fn test_string_operators() {
        let root = vars();
        assert!(evaluate(&leaf("email", ConditionOperator::EndsWith, json!("@example.com")), &root));
        assert!(evaluate(&leaf("name", ConditionOperator::StartsWith, json!("An")), &root));
        assert!(evaluate(&leaf("email", ConditionOperator::Contains, json!("ana")), &root));
        assert!(evaluate(&leaf("email", ConditionOperator::NotContains, json!("bob")), &root));
        assert!(evaluate(&leaf("name", ConditionOperator::NotEquals, json!("Bob")), &root));
    }

    #[test]
    fn test_collection_operators() {
        let root = vars();
        assert!(evaluate(&leaf("tags", ConditionOperator::Contains, json!("vip")), &root));
        assert!(evaluate(&leaf("name", ConditionOperator::In, json!(["Ana", "Bia"])), &root));
        assert!(evaluate(&leaf("name", ConditionOperator::NotIn, json!(["Caio"])), &root));
        assert!(!evaluate(&leaf("name", ConditionOperator::In, json!("Ana")), &root));
    }

    #[test]
    fn test_presence_operators() {
        let root = vars();
        assert!(evaluate(&leaf("name", ConditionOperator::Exists, Value::Null), &root));
        assert!(evaluate(&leaf("missing", ConditionOperator::NotExists, Value::Null), &root));
        assert!(evaluate(&leaf("empty", ConditionOperator::IsEmpty, Value::Null), &root));
        assert!(evaluate(&leaf("missing", ConditionOperator::IsEmpty, Value::Null), &root));
        assert!(evaluate(&leaf("tags", ConditionOperator::IsNotEmpty, Value::Null), &root));
    }

    #[test]
    fn test_missing_field_never_orders() {
        let root = vars();
        assert!(!evaluate(&leaf("missing", ConditionOperator::GreaterThan, json!(1)), &root));
        assert!(!evaluate(&leaf("missing", ConditionOperator::LessThan, json!(1)), &root));
    }

    #[test]
    fn test_nested_payload_lookup() {
        let root = vars();
        assert!(evaluate(
            &leaf("trigger_payload.data.plan", ConditionOperator::Equals, json!("pro")),
            &root
        ));
        assert!(evaluate(
            &leaf("$.trigger_payload.data.plan", ConditionOperator::Equals, json!("pro")),
            &root
        ));
    }

    #[test]
    fn test_keys_that_are_not_identifiers() {
        let root = json!({
            "user-id": 7,
            "first name": "Ana",
            "utm.source": "ads",
            "profile": {"zip-code": "01310", "last name": "Lima"},
            "orders": [10, 20]
        });
        assert!(evaluate(&leaf("user-id", ConditionOperator::Equals, json!(7)), &root));
        assert!(evaluate(&leaf("variables.first name", ConditionOperator::Equals, json!("Ana")), &root));
        assert!(evaluate(&leaf("utm.source", ConditionOperator::Equals, json!("ads")), &root));
        assert!(evaluate(&leaf("profile.zip-code", ConditionOperator::StartsWith, json!("013")), &root));
        assert!(evaluate(&leaf("profile.last name", ConditionOperator::Exists, Value::Null), &root));
        assert!(evaluate(&leaf("orders.1", ConditionOperator::GreaterThan, json!(15)), &root));
    }

    #[test]
    fn test_json_path_quotes_non_identifier_segments() {
        assert_eq!(to_json_path("trigger_payload.data.plan"), "$.trigger_payload.data.plan");
        assert_eq!(to_json_path("profile.zip-code"), "$.profile['zip-code']");
        assert_eq!(to_json_path("orders.0"), "$.orders[0]");
        assert_eq!(to_json_path("$.raw"), "$.raw");
    }

    #[test]
    fn test_logical_combinators() {
        let root = vars();
        let high = leaf("score", ConditionOperator::GreaterThan, json!(50));
        let bob = leaf("name", ConditionOperator::Equals, json!("Bob"));

        assert!(!evaluate(&Condition::all(vec![high.clone(), bob.clone()]), &root));
        assert!(evaluate(&Condition::any(vec![high.clone(), bob.clone()]), &root));
        assert!(evaluate(&Condition::not(bob), &root));
        assert!(!evaluate(&Condition::not(high), &root));
        assert!(evaluate(&Condition::all(Vec::new()), &root));
        assert!(!evaluate(&Condition::any(Vec::new()), &root));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let root = vars();
        let condition = Condition::any(vec![
            leaf("score", ConditionOperator::GreaterThan, json!(90)),
            leaf("tags", ConditionOperator::Contains, json!("trial")),
        ]);
        let first = evaluate(&condition, &root);
        for _ in 0..10 {
            assert_eq!(evaluate(&condition, &root), first);
        }
    }
}

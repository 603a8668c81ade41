use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

/// Compiled regex cache shared by every filter evaluation.
static REGEX_CACHE: LazyLock<Mutex<HashMap<String, Regex>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Match a document against MongoDB-like filter criteria.
///
/// Used for "all connections matching X" broadcasts: the document is a
/// connection's attributes (`connectionId`, `userId`, `deviceId`, `sessionId`,
/// `region`, `rooms`, `subscriptions`).
///
/// Supported operators:
///   $eq, $ne, $gt, $lt, $gte, $lte, $in, $nin,
///   $regex, $exists, $contains, $startswith, $endswith,
///   $and, $or
///
/// Nested field access via dot notation: "meta.site". When the field holds an
/// array, a scalar criterion matches if any element matches.
pub fn matches(doc: &Value, criteria: &Value) -> bool {
    let Some(criteria) = criteria.as_object() else {
        // Non-object criteria select nothing
        return criteria.is_null();
    };

    for (key, expected) in criteria {
        let ok = match key.as_str() {
            "$and" => expected
                .as_array()
                .is_some_and(|subs| subs.iter().all(|sub| matches(doc, sub))),
            "$or" => expected
                .as_array()
                .is_some_and(|subs| subs.iter().any(|sub| matches(doc, sub))),
            field => match_value(get_nested(doc, field), expected),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Navigate nested objects via dot-separated path.
fn get_nested<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

/// Compare a value against an expected criterion (scalar or operator object).
fn match_value(value: Option<&Value>, expected: &Value) -> bool {
    if let Some(ops) = expected.as_object()
        && ops.keys().all(|k| k.starts_with('$'))
        && !ops.is_empty()
    {
        return ops.iter().all(|(op, arg)| match_operator(value, op, arg));
    }
    value_eq(value, expected)
}

fn value_eq(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|v| v == expected),
        Some(v) => v == expected,
        None => expected.is_null(),
    }
}

fn match_operator(value: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$eq" => value_eq(value, arg),
        "$ne" => !value_eq(value, arg),
        "$gt" => compare(value, arg).is_some_and(|o| o.is_gt()),
        "$lt" => compare(value, arg).is_some_and(|o| o.is_lt()),
        "$gte" => compare(value, arg).is_some_and(|o| o.is_ge()),
        "$lte" => compare(value, arg).is_some_and(|o| o.is_le()),
        "$in" => arg
            .as_array()
            .is_some_and(|list| list.iter().any(|candidate| value_eq(value, candidate))),
        "$nin" => arg
            .as_array()
            .is_none_or(|list| !list.iter().any(|candidate| value_eq(value, candidate))),
        "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
        "$regex" => match (value.map(text_of), arg.as_str()) {
            (Some(text), Some(pattern)) => regex_matches(pattern, &text),
            _ => false,
        },
        "$contains" => match value {
            Some(Value::Array(items)) => items.contains(arg),
            Some(v) => arg.as_str().is_some_and(|s| text_of(v).contains(s)),
            None => false,
        },
        "$startswith" => match (value, arg.as_str()) {
            (Some(v), Some(prefix)) => text_of(v).starts_with(prefix),
            _ => false,
        },
        "$endswith" => match (value, arg.as_str()) {
            (Some(v), Some(suffix)) => text_of(v).ends_with(suffix),
            _ => false,
        },
        _ => true,
    }
}

fn compare(value: Option<&Value>, arg: &Value) -> Option<std::cmp::Ordering> {
    match (value?, arg) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Check if a string matches a regex pattern (with caching).
/// Anchors to start-of-string unless the pattern already starts with ^.
/// Invalid patterns never match.
fn regex_matches(pattern: &str, text: &str) -> bool {
    let anchored = if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^(?:{})", pattern)
    };

    let mut cache = REGEX_CACHE.lock();
    if let Some(re) = cache.get(&anchored) {
        return re.is_match(text);
    }
    match Regex::new(&anchored) {
        Ok(re) => {
            let hit = re.is_match(text);
            cache.insert(anchored, re);
            hit
        }
        Err(e) => {
            tracing::debug!(pattern, error = %e, "invalid filter regex");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn_doc() -> Value {
        json!({
            "connectionId": "c-1",
            "userId": "alice",
            "deviceId": "thermo-3",
            "region": "eu-west",
            "rooms": ["ops", "floor-2"],
            "subscriptions": ["thermo-3", "door-1"],
            "meta": {"site": "plant-a", "load": 7},
        })
    }

    #[test]
    fn empty_criteria_match_everything() {
        assert!(matches(&conn_doc(), &json!({})));
        assert!(matches(&conn_doc(), &Value::Null));
        assert!(!matches(&conn_doc(), &json!("region")));
    }

    #[test]
    fn scalar_equality_and_arrays() {
        assert!(matches(&conn_doc(), &json!({"region": "eu-west"})));
        assert!(!matches(&conn_doc(), &json!({"region": "us-east"})));
        assert!(matches(&conn_doc(), &json!({"rooms": "ops"})));
        assert!(!matches(&conn_doc(), &json!({"rooms": "lobby"})));
    }

    #[test]
    fn comparison_and_set_operators() {
        let doc = conn_doc();
        assert!(matches(&doc, &json!({"meta.load": {"$gt": 5, "$lte": 7}})));
        assert!(!matches(&doc, &json!({"meta.load": {"$lt": 7}})));
        assert!(matches(&doc, &json!({"region": {"$in": ["eu-west", "eu-north"]}})));
        assert!(matches(&doc, &json!({"userId": {"$nin": ["bob"]}})));
        assert!(matches(&doc, &json!({"subscriptions": {"$contains": "door-1"}})));
        assert!(matches(&doc, &json!({"missing": {"$exists": false}})));
        assert!(!matches(&doc, &json!({"deviceId": {"$exists": false}})));
    }

    #[test]
    fn string_operators() {
        let doc = conn_doc();
        assert!(matches(&doc, &json!({"deviceId": {"$startswith": "thermo"}})));
        assert!(matches(&doc, &json!({"meta.site": {"$endswith": "-a"}})));
        assert!(matches(&doc, &json!({"userId": {"$regex": "al.*"}})));
        assert!(!matches(&doc, &json!({"userId": {"$regex": "ice"}})));
        assert!(!matches(&doc, &json!({"userId": {"$regex": "("}})));
    }

    #[test]
    fn logical_operators() {
        let doc = conn_doc();
        assert!(matches(
            &doc,
            &json!({"$or": [{"region": "us-east"}, {"rooms": "ops"}]})
        ));
        assert!(!matches(
            &doc,
            &json!({"$and": [{"region": "eu-west"}, {"userId": "bob"}]})
        ));
    }
}

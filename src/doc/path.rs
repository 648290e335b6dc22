//! Dotted-path addressing over `serde_json::Value` trees.
//!
//! Writes only ever create objects: any intermediate that is not an object
//! is replaced by an empty one. Reads additionally accept decimal segments
//! as array indices.

use serde_json::{Map, Number, Value};

use crate::error::{RelayError, RelayResult};

/// Split `a.b.c` into segments, dropping empty ones.
pub fn parse_path(path: &str) -> Vec<&str> {
    path.split('.').map(str::trim).filter(|s| !s.is_empty()).collect()
}

pub fn get_at<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |node, seg| match node {
        Value::Object(map) => map.get(*seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Assign `value` at `segments`, creating or replacing intermediates.
pub fn set_at(root: &mut Value, segments: &[&str], value: Value) -> RelayResult<()> {
    let (last, parents) = segments.split_last().ok_or(RelayError::PathRequired)?;
    let mut node = root;
    for seg in parents {
        node = ensure_object(node)
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.to_string(), value);
    Ok(())
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just made an object"),
    }
}

/// Numeric view of a stored value. Numeric strings count as numbers.
pub fn as_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Integral results that fit `i64` stay integers on the wire.
pub fn number_value(n: f64) -> Value {
    // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Turn request input into the value to store.
///
/// `raw_json` wins when present and must parse. Otherwise a number-looking
/// `raw` becomes a number and anything else stays a string.
pub fn coerce_value(raw: Option<&str>, raw_json: Option<&str>) -> RelayResult<Value> {
    if let Some(encoded) = raw_json {
        return serde_json::from_str(encoded).map_err(|_| RelayError::InvalidValue);
    }
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(Value::Number(Number::from(i)));
        }
        if let Some(n) = trimmed.parse::<f64>().ok().filter(|f| f.is_finite()) {
            return Ok(number_value(n));
        }
    }
    Ok(Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path_drops_empty_segments() {
        assert_eq!(parse_path("a..b."), vec!["a", "b"]);
        assert!(parse_path("").is_empty());
        assert!(parse_path(" . ").is_empty());
    }

    #[test]
    fn test_set_then_get() {
        let mut doc = json!({});
        set_at(&mut doc, &parse_path("a.b.c"), json!(42)).unwrap();
        assert_eq!(get_at(&doc, &parse_path("a.b.c")), Some(&json!(42)));
        assert_eq!(get_at(&doc, &parse_path("a.b")), Some(&json!({"c": 42})));
        assert_eq!(get_at(&doc, &parse_path("a.x")), None);
    }

    #[test]
    fn test_scalar_intermediate_replaced() {
        let mut doc = json!({"a": 5});
        set_at(&mut doc, &parse_path("a.b"), json!("v")).unwrap();
        assert_eq!(doc, json!({"a": {"b": "v"}}));
    }

    #[test]
    fn test_array_index_read() {
        let doc = json!({"list": [10, {"k": "v"}]});
        assert_eq!(get_at(&doc, &parse_path("list.1.k")), Some(&json!("v")));
        assert_eq!(get_at(&doc, &parse_path("list.9")), None);
    }

    #[test]
    fn test_set_requires_segment() {
        let mut doc = json!({});
        assert_eq!(set_at(&mut doc, &[], json!(1)), Err(RelayError::PathRequired));
    }

    #[test]
    fn test_coerce_value() {
        assert_eq!(coerce_value(Some("42"), None).unwrap(), json!(42));
        assert_eq!(coerce_value(Some("1.5"), None).unwrap(), json!(1.5));
        assert_eq!(coerce_value(Some("hello"), None).unwrap(), json!("hello"));
        assert_eq!(coerce_value(Some("NaN"), None).unwrap(), json!("NaN"));
        assert_eq!(coerce_value(Some("x"), Some(r#"{"a":[1]}"#)).unwrap(), json!({"a": [1]}));
        assert_eq!(coerce_value(None, Some("{oops")), Err(RelayError::InvalidValue));
        assert_eq!(coerce_value(None, None).unwrap(), Value::Null);
    }

    #[test]
    fn test_as_number() {
        assert_eq!(as_number(Some(&json!(3))), 3.0);
        assert_eq!(as_number(Some(&json!("2.5"))), 2.5);
        assert_eq!(as_number(Some(&json!({"a": 1}))), 0.0);
        assert_eq!(as_number(None), 0.0);
    }

    #[test]
    fn test_number_value_keeps_integers() {
        assert_eq!(number_value(120.0), json!(120));
        assert_eq!(number_value(0.25), json!(0.25));
        assert_eq!(number_value(-9_223_372_036_854_775_808.0), json!(i64::MIN));
    }

    #[test]
    fn test_number_value_beyond_i64_stays_float() {
        let two_pow_63 = 9_223_372_036_854_775_808.0_f64;
        let v = number_value(two_pow_63);
        assert_eq!(v.as_i64(), None);
        assert_eq!(v.as_f64(), Some(two_pow_63));

        let coerced = coerce_value(Some("9223372036854775808"), None).unwrap();
        assert_eq!(coerced.as_i64(), None);
        assert_eq!(coerced.as_f64(), Some(two_pow_63));
        assert_eq!(coerce_value(Some("9223372036854775807"), None).unwrap(), json!(i64::MAX));
    }
}

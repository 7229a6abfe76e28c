//! First-match JSONPath evaluation

use serde_json::Value;
use serde_json_path::JsonPath;

use crate::context::number_text;
use crate::error::{ReplayError, ReplayResult};

/// Evaluate `path` against `body` and return the first matching node.
///
/// Paths written without the leading `$` (`data.id`, `[0].id`) are rooted.
pub fn first_match(body: &Value, path: &str) -> ReplayResult<Option<Value>> {
    let path = path.trim();
    let rooted = if path.starts_with('$') {
        path.to_string()
    } else if path.starts_with('[') {
        format!("${}", path)
    } else {
        format!("$.{}", path)
    };
    let compiled = JsonPath::parse(&rooted)
        .map_err(|e| ReplayError::SpecValidation(format!("invalid jsonpath {}: {}", path, e)))?;
    Ok(compiled.query(body).all().into_iter().next().cloned())
}

/// Text form of a value found in a response body, for comparisons and
/// anchor capture. Unlike substitution text, `null` renders as `null`.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => number_text(n),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_match() {
        let body = json!({"code": 0, "data": {"items": [{"id": 11}, {"id": 12}]}});
        assert_eq!(first_match(&body, "$.data.items[0].id").unwrap(), Some(json!(11)));
        assert_eq!(first_match(&body, "$.data.items[*].id").unwrap(), Some(json!(11)));
        assert_eq!(first_match(&body, "data.items[1].id").unwrap(), Some(json!(12)));
        assert_eq!(first_match(&body, "$.data.missing").unwrap(), None);
    }

    #[test]
    fn test_display_value() {
        let body = json!({"data": {"amount": 100.0, "rate": 0.25, "memo": null, "tag": "x"}});
        let shown = |path| display_value(&first_match(&body, path).unwrap().unwrap());
        assert_eq!(shown("$.data.amount"), "100");
        assert_eq!(shown("$.data.rate"), "0.25");
        assert_eq!(shown("$.data.memo"), "null");
        assert_eq!(shown("$.data.tag"), "x");
    }

    #[test]
    fn test_invalid_path_is_an_error() {
        assert!(first_match(&json!({}), "$[?").is_err());
    }
}

//! Substitution context and `${key}` templating

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::anchors::AnchorStore;
use crate::spec::Spec;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"));

/// Flat lookup built from variables < env < anchors.
///
/// A context is a snapshot: build a fresh one before every evaluation so
/// anchors written since the last build are visible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    values: BTreeMap<String, String>,
}

impl Context {
    pub fn build(spec: &Spec, anchors: &AnchorStore) -> Self {
        Self::layered(&spec.variables, &spec.env, anchors)
    }

    pub fn layered(
        variables: &Map<String, Value>,
        env: &Map<String, Value>,
        anchors: &AnchorStore,
    ) -> Self {
        let mut values = BTreeMap::new();
        for (k, v) in variables.iter().chain(env.iter()) {
            values.insert(k.clone(), value_text(v));
        }
        values.extend(anchors.snapshot());
        Self { values }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// First non-empty value among `keys`
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().filter_map(|k| self.get(k)).find(|v| !v.is_empty())
    }

    pub fn substitute(&self, template: &str) -> String {
        substitute(template, self)
    }
}

/// Everything needed to rebuild a [`Context`] later, detached from the spec.
#[derive(Debug, Clone)]
pub struct ContextSource {
    variables: Arc<Map<String, Value>>,
    env: Arc<Map<String, Value>>,
    anchors: AnchorStore,
}

impl ContextSource {
    pub fn new(spec: &Spec, anchors: &AnchorStore) -> Self {
        Self {
            variables: Arc::new(spec.variables.clone()),
            env: Arc::new(spec.env.clone()),
            anchors: anchors.clone(),
        }
    }

    pub fn snapshot(&self) -> Context {
        Context::layered(&self.variables, &self.env, &self.anchors)
    }

    pub fn anchors(&self) -> &AnchorStore {
        &self.anchors
    }

    pub fn env(&self) -> &Map<String, Value> {
        &self.env
    }
}

/// Largest integer an IEEE double holds exactly (2^53 - 1)
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Text form of a JSON value as used for substitution and comparison:
/// strings verbatim, `null` empty, numbers via [`number_text`], everything
/// else compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => number_text(n),
        other => other.to_string(),
    }
}

/// Numbers render the way a browser stringifies them: a float with no
/// fractional part inside the safe integer range drops its `.0`.
pub fn number_text(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

/// Replace every `${key}` with its context value. Unknown keys become empty.
pub fn substitute(template: &str, ctx: &Context) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match ctx.get(key) {
                Some(v) => v.to_string(),
                None => {
                    warn!(
                        key = %key,
                        "template key not found in context, substituting empty string"
                    );
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Apply [`substitute`] to every string leaf of a JSON structure.
pub fn deep_substitute(value: &Value, ctx: &Context) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, ctx)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| deep_substitute(v, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), deep_substitute(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute a template given as an arbitrary JSON value and return text.
pub fn substitute_value(value: &Value, ctx: &Context) -> String {
    match value {
        Value::String(s) => substitute(s, ctx),
        other => value_text(other),
    }
}

fn is_absolute(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Make a path-absolute URL absolute against `api_origin`, or else the
/// origin of `base_url`. Anything else is returned unchanged.
pub fn absolutize_url(url: &str, ctx: &Context) -> String {
    if url.is_empty() || is_absolute(url) || !url.starts_with('/') {
        return url.to_string();
    }

    if let Some(api_origin) = ctx
        .first_of(&["api_origin", "API_ORIGIN"])
        .filter(|o| is_absolute(o))
    {
        return format!("{}{}", api_origin.trim_end_matches('/'), url);
    }

    if let Some(base) = ctx.first_of(&["base_url", "BASE_URL"]).filter(|b| is_absolute(b)) {
        if let Ok(parsed) = url::Url::parse(base) {
            return format!("{}{}", parsed.origin().ascii_serialization(), url);
        }
    }

    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn spec_with(variables: Value, env: Value) -> Spec {
        serde_json::from_value(json!({"variables": variables, "env": env})).unwrap()
    }

    #[test]
    fn test_precedence_anchor_over_env_over_variables() {
        let spec = spec_with(
            json!({"a": "var", "b": "var", "c": "var"}),
            json!({"b": "env", "c": "env"}),
        );
        let anchors = AnchorStore::new();
        anchors.set("c", "anchor");

        let ctx = Context::build(&spec, &anchors);
        assert_eq!(ctx.get("a"), Some("var"));
        assert_eq!(ctx.get("b"), Some("env"));
        assert_eq!(ctx.get("c"), Some("anchor"));
    }

    #[test_case(json!(100.0), "100" ; "integral float drops fraction")]
    #[test_case(json!(-0.0), "0" ; "negative zero")]
    #[test_case(json!(12.5), "12.5" ; "fraction kept")]
    #[test_case(json!(42), "42" ; "integer")]
    #[test_case(json!(1.0e300), "1e300" ; "beyond safe range unchanged")]
    fn test_number_text(value: Value, expected: &str) {
        assert_eq!(value_text(&value), expected);
    }

    #[test]
    fn test_non_string_values_are_stringified() {
        let spec = spec_with(json!({"n": 3, "flag": true, "nothing": null}), json!({}));
        let ctx = Context::build(&spec, &AnchorStore::new());
        assert_eq!(ctx.substitute("${n}-${flag}-${nothing}"), "3-true-");
    }

    #[test]
    fn test_missing_key_becomes_empty() {
        let ctx = Context::from_pairs([("present", "x")]);
        assert_eq!(substitute("a${missing_key}b${present}", &ctx), "abx");
    }

    #[test]
    fn test_deep_substitute_keeps_scalars() {
        let ctx = Context::from_pairs([("id", "42")]);
        let input = json!({
            "order": {"id": "${id}", "qty": 2, "paid": false, "note": null},
            "tags": ["t-${id}", 1]
        });
        let output = deep_substitute(&input, &ctx);
        assert_eq!(
            output,
            json!({
                "order": {"id": "42", "qty": 2, "paid": false, "note": null},
                "tags": ["t-42", 1]
            })
        );
    }

    #[test_case(
        "https://api.example.com/x", &[], "https://api.example.com/x" ;
        "absolute passes through"
    )]
    #[test_case(
        "/api/x", &[("api_origin", "http://api:8080/")], "http://api:8080/api/x" ;
        "api origin wins"
    )]
    #[test_case(
        "/api/x", &[("BASE_URL", "http://web:5173/h5/#/home")], "http://web:5173/api/x" ;
        "base url origin"
    )]
    #[test_case(
        "/api/x", &[("api_origin", "api:8080"), ("base_url", "http://web")], "http://web/api/x" ;
        "relative api origin ignored"
    )]
    #[test_case("/api/x", &[], "/api/x" ; "nothing to resolve against")]
    #[test_case("api/x", &[("base_url", "http://web")], "api/x" ; "relative path untouched")]
    fn test_absolutize_url(url: &str, pairs: &[(&str, &str)], expected: &str) {
        let ctx = Context::from_pairs(pairs.iter().copied());
        assert_eq!(absolutize_url(url, &ctx), expected);
    }
}

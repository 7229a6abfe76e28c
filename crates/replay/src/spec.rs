//! Declarative JSON replay specification

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::value_text;
use crate::error::{ReplayError, ReplayResult};

/// Hard limit on prerequisites declared by a single spec.
pub const MAX_PREREQUISITES: usize = 2;

/// A complete replay unit parsed from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    /// Lowest-precedence substitution values
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub variables: Map<String, Value>,

    /// Middle-precedence substitution values
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub env: Map<String, Value>,

    /// Initial anchor store contents (honored for the root spec only)
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub anchors: Map<String, Value>,

    #[serde(default, deserialize_with = "lenient::nullable")]
    pub metadata: Map<String, Value>,

    /// Spec paths, relative to this spec's directory
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub prerequisites: Vec<String>,

    #[serde(default, deserialize_with = "lenient::nullable")]
    pub steps: Vec<Step>,

    #[serde(default, deserialize_with = "lenient::nullable")]
    pub db_checks: Vec<DbCheck>,

    /// Spec-wide must-rules
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub net_rules: Vec<NetRule>,

    /// Spec-wide `net.must` section
    #[serde(default)]
    pub net: Option<NetSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetSection {
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub must: Vec<NetRule>,
}

impl Spec {
    pub fn from_json(json: &str) -> ReplayResult<Self> {
        serde_json::from_str(json).map_err(|e| ReplayError::SpecParse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> ReplayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ReplayError::SpecParse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| ReplayError::SpecParse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Every must-rule of the spec: per-step rules in step order, then the
    /// spec-wide `net_rules` and `net.must`.
    pub fn must_rules(&self) -> ReplayResult<Vec<NetRule>> {
        let mut rules = Vec::new();
        for step in &self.steps {
            rules.extend(step.must_rules()?);
        }
        rules.extend(self.net_rules.iter().cloned());
        if let Some(net) = &self.net {
            rules.extend(net.must.iter().cloned());
        }
        Ok(rules)
    }

    pub fn anchor_seed(&self) -> BTreeMap<String, String> {
        self.anchors
            .iter()
            .map(|(k, v)| (k.clone(), value_text(v)))
            .collect()
    }

    /// `env.base_url`, falling back to `env.BASE_URL`
    pub fn declared_base_url(&self) -> Option<String> {
        ["base_url", "BASE_URL"]
            .iter()
            .filter_map(|k| self.env.get(*k))
            .map(value_text)
            .find(|v| !v.is_empty())
    }

    /// True when some step touches the UI but none navigates explicitly.
    pub fn needs_default_navigation(&self) -> bool {
        let has_ui = self.steps.iter().any(|s| s.ui.is_some());
        let has_goto = self.steps.iter().any(|s| s.op_tag() == Some("ui.goto"));
        has_ui && !has_goto
    }
}

/// One step: exactly one category object carries the `op` tag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub step_id: Option<String>,

    #[serde(default)]
    pub ui: Option<Map<String, Value>>,

    #[serde(default)]
    pub db: Option<Map<String, Value>>,

    #[serde(default)]
    pub util: Option<Map<String, Value>>,

    #[serde(default)]
    pub net: Option<Map<String, Value>>,
}

impl Step {
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.step_id.as_deref())
            .unwrap_or("")
    }

    /// The first non-empty category object, in `ui`, `db`, `util`, `net` order.
    fn category(&self) -> Option<&Map<String, Value>> {
        [&self.ui, &self.db, &self.util, &self.net]
            .into_iter()
            .flatten()
            .find(|body| !body.is_empty())
    }

    pub fn op_tag(&self) -> Option<&str> {
        self.category()
            .and_then(|body| body.get("op"))
            .and_then(Value::as_str)
            .filter(|op| !op.trim().is_empty())
    }

    /// Parse the step into an operation. `Ok(None)` means the step carries no
    /// op and is skipped.
    pub fn operation(&self) -> ReplayResult<Option<Operation>> {
        let (Some(body), Some(op)) = (self.category(), self.op_tag()) else {
            return Ok(None);
        };
        Operation::parse(op, body, self.label()).map(Some)
    }

    pub fn must_rules(&self) -> ReplayResult<Vec<NetRule>> {
        let Some(raw) = self.net.as_ref().and_then(|net| net.get("must")) else {
            return Ok(Vec::new());
        };
        if raw.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(raw.clone()).map_err(|e| {
            ReplayError::SpecValidation(format!(
                "invalid net.must rules: {}. step={}",
                e,
                self.label()
            ))
        })
    }
}

/// Every operation the dispatcher knows how to run
#[derive(Debug, Clone)]
pub enum Operation {
    GenId(KeyArgs),
    GenTs(KeyArgs),
    Goto(GotoArgs),
    HashNavigate(HashNavigateArgs),
    Eval(EvalArgs),
    PickerSelect(PickerSelectArgs),
    Click(ClickArgs),
    Fill(FillArgs),
    ClickText(TextArgs),
    WaitText(TextArgs),
    WaitSelector(WaitSelectorArgs),
    FillForm(FillFormArgs),
    WaitMs(WaitMsArgs),
    VerifyUrlContains(VerifyUrlArgs),
    NetCall(Box<NetCallArgs>),
    DbExec(DbExecArgs),
}

impl Operation {
    pub fn parse(op: &str, body: &Map<String, Value>, step: &str) -> ReplayResult<Self> {
        fn args<T: DeserializeOwned>(
            op: &str,
            body: &Map<String, Value>,
            step: &str,
        ) -> ReplayResult<T> {
            serde_json::from_value(Value::Object(body.clone())).map_err(|e| {
                ReplayError::SpecValidation(format!(
                    "invalid {} arguments: {}. step={}",
                    op, e, step
                ))
            })
        }

        let parsed = match op {
            "util.gen_id" => Operation::GenId(args(op, body, step)?),
            "util.gen_ts" => Operation::GenTs(args(op, body, step)?),
            "ui.goto" => Operation::Goto(args(op, body, step)?),
            "ui.hash_navigate" => Operation::HashNavigate(args(op, body, step)?),
            "ui.eval" => Operation::Eval(args(op, body, step)?),
            "ui.picker_select" => Operation::PickerSelect(args(op, body, step)?),
            "ui.click" => Operation::Click(args(op, body, step)?),
            "ui.fill" => Operation::Fill(args(op, body, step)?),
            "ui.click_text" => Operation::ClickText(args(op, body, step)?),
            "ui.wait_text" => Operation::WaitText(args(op, body, step)?),
            "ui.wait_selector" => Operation::WaitSelector(args(op, body, step)?),
            "ui.fill_form" => Operation::FillForm(args(op, body, step)?),
            "ui.wait_ms" => Operation::WaitMs(args(op, body, step)?),
            "ui.verify_url_contains" => Operation::VerifyUrlContains(args(op, body, step)?),
            "net.call" => Operation::NetCall(Box::new(args(op, body, step)?)),
            "db.exec" => Operation::DbExec(args(op, body, step)?),
            biz if biz.starts_with("biz.") => {
                return Err(ReplayError::SpecValidation(format!(
                    "Biz op not implemented: {}. Expand it into ui.*/net.*/db.* steps. step={}",
                    biz, step
                )));
            }
            unknown => {
                return Err(ReplayError::SpecValidation(format!(
                    "Unknown op: {}. step={}",
                    unknown, step
                )));
            }
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::GenId(_) => "util.gen_id",
            Operation::GenTs(_) => "util.gen_ts",
            Operation::Goto(_) => "ui.goto",
            Operation::HashNavigate(_) => "ui.hash_navigate",
            Operation::Eval(_) => "ui.eval",
            Operation::PickerSelect(_) => "ui.picker_select",
            Operation::Click(_) => "ui.click",
            Operation::Fill(_) => "ui.fill",
            Operation::ClickText(_) => "ui.click_text",
            Operation::WaitText(_) => "ui.wait_text",
            Operation::WaitSelector(_) => "ui.wait_selector",
            Operation::FillForm(_) => "ui.fill_form",
            Operation::WaitMs(_) => "ui.wait_ms",
            Operation::VerifyUrlContains(_) => "ui.verify_url_contains",
            Operation::NetCall(_) => "net.call",
            Operation::DbExec(_) => "db.exec",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyArgs {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GotoArgs {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashNavigateArgs {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalArgs {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PickerSelectArgs {
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub index: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickArgs {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Force DOM dispatch instead of a pointer click
    #[serde(default)]
    pub use_eval: bool,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillArgs {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub index: Option<u64>,
    #[serde(default)]
    pub textarea: bool,
    #[serde(default)]
    pub use_eval: bool,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextArgs {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub exact: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitSelectorArgs {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub state: Option<WaitState>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillFormArgs {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitMsArgs {
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyUrlArgs {
    #[serde(default)]
    pub url_contains: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetCallArgs {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub headers: Map<String, Value>,
    /// JSON request body
    #[serde(default)]
    pub json: Option<Value>,
    /// Form-encoded request body
    #[serde(default)]
    pub form: Option<Value>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub status: Option<u64>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub expect_json: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub expect_jsonpath: Map<String, Value>,
    #[serde(default)]
    pub anchor: Option<AnchorCapture>,
    #[serde(default)]
    pub require: Option<Requirement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbExecArgs {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

/// A "must-occur" network expectation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetRule {
    #[serde(default)]
    pub method: Option<String>,

    /// Template matched as a substring of the response URL
    #[serde(default)]
    pub url_contains: Option<String>,

    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub status: Option<u64>,

    /// Top-level body key -> expected template
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub expect_json: Map<String, Value>,

    /// JSONPath -> expected template
    #[serde(default, deserialize_with = "lenient::nullable")]
    pub expect_jsonpath: Map<String, Value>,

    #[serde(default)]
    pub anchor: Option<AnchorCapture>,

    /// Anchor key -> JSONPath
    #[serde(default, alias = "anchors", deserialize_with = "lenient::nullable")]
    pub capture_anchors: BTreeMap<String, String>,

    #[serde(default)]
    pub require: Option<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorCapture {
    pub key: String,
    pub jsonpath: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub need_unit: Option<Value>,
}

/// A post-condition query against the backing store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbCheck {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub dms: Option<String>,

    pub sql: String,

    #[serde(default, deserialize_with = "lenient::nullable")]
    pub params: BTreeMap<String, Value>,

    /// Field -> expected template, `not_null` or `not_empty`
    #[serde(rename = "assert", default, deserialize_with = "lenient::nullable")]
    pub assertions: BTreeMap<String, Value>,

    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub retry_attempts: Option<u64>,

    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub retry_interval_ms: Option<u64>,
}

impl DbCheck {
    pub fn attempts(&self) -> u64 {
        self.retry_attempts.filter(|n| *n > 0).unwrap_or(1)
    }

    pub fn interval_ms(&self) -> u64 {
        self.retry_interval_ms.unwrap_or(500)
    }
}

/// Deserializers tolerant of the loosely typed JSON agents emit
mod lenient {
    use serde::de::{self, Deserialize, Deserializer};
    use serde_json::Value;

    /// Accepts a JSON number or a numeric string.
    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .map(Some)
                .ok_or_else(|| {
                    de::Error::custom(format!("expected a non-negative number, got {}", n))
                }),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| de::Error::custom(format!("expected a number, got {:?}", s))),
            Some(other) => Err(de::Error::custom(format!("expected a number, got {}", other))),
        }
    }

    /// Treats an explicit `null` like a missing field.
    pub fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_spec() {
        let json = r#"{
            "unit_id": "u-1",
            "variables": {"tenant": "acme"},
            "env": {"base_url": "http://localhost:5173/h5"},
            "anchors": {"seed": 7},
            "prerequisites": ["login.json"],
            "steps": [
                {"name": "id", "util": {"op": "util.gen_id", "key": "order_id"}},
                {"name": "open", "ui": {"op": "ui.goto", "url": "${base_url}/orders"},
                 "net": {"must": [
                     {"method": "GET", "url_contains": "/api/orders", "status": "200"}
                 ]}},
                {"name": "idle", "ui": {"op": "ui.wait_ms", "ms": "250"}}
            ],
            "db_checks": [
                {"name": "row", "sql": "select 1", "assert": {"x": "not_null"}, "retry_attempts": 3}
            ],
            "net_rules": [{"url_contains": "/api/me"}]
        }"#;
        let spec = Spec::from_json(json).unwrap();

        assert_eq!(spec.steps.len(), 3);
        assert_eq!(spec.prerequisites, vec!["login.json".to_string()]);
        assert_eq!(spec.anchor_seed().get("seed").map(String::as_str), Some("7"));
        assert_eq!(spec.declared_base_url().as_deref(), Some("http://localhost:5173/h5"));
        assert_eq!(spec.db_checks[0].attempts(), 3);
        assert_eq!(spec.db_checks[0].interval_ms(), 500);

        let rules = spec.must_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].status, Some(200));
        assert_eq!(rules[1].url_contains.as_deref(), Some("/api/me"));

        match spec.steps[2].operation().unwrap() {
            Some(Operation::WaitMs(args)) => assert_eq!(args.ms, Some(250)),
            other => panic!("unexpected operation: {:?}", other),
        }
    }

    #[test]
    fn test_null_sections_are_empty() {
        let spec =
            Spec::from_json(r#"{"variables": null, "steps": null, "db_checks": null}"#).unwrap();
        assert!(spec.variables.is_empty());
        assert!(spec.steps.is_empty());
        assert!(spec.db_checks.is_empty());
    }

    #[test]
    fn test_step_without_op_is_skipped() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "rules only",
            "net": {"must": [{"url_contains": "/x"}]}
        }))
        .unwrap();
        assert!(step.operation().unwrap().is_none());
        assert_eq!(step.must_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_category_does_not_shadow_later_one() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "ui": {},
            "util": {"op": "util.gen_ts", "key": "ts"}
        }))
        .unwrap();
        assert_eq!(step.op_tag(), Some("util.gen_ts"));
    }

    #[test]
    fn test_unknown_op_names_step_and_op() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "mystery",
            "ui": {"op": "ui.teleport"}
        }))
        .unwrap();
        let err = step.operation().unwrap_err().to_string();
        assert!(err.contains("ui.teleport"), "{}", err);
        assert!(err.contains("mystery"), "{}", err);
    }

    #[test]
    fn test_biz_op_is_rejected() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "checkout",
            "util": {"op": "biz.create_order"}
        }))
        .unwrap();
        let err = step.operation().unwrap_err();
        assert!(matches!(err, ReplayError::SpecValidation(_)));
        assert!(err.to_string().contains("Biz op not implemented"));
    }

    #[test]
    fn test_capture_anchors_alias() {
        let rule: NetRule = serde_json::from_value(serde_json::json!({
            "url_contains": "/login",
            "anchors": {"token": "$.data.token"}
        }))
        .unwrap();
        assert_eq!(rule.capture_anchors.get("token").map(String::as_str), Some("$.data.token"));
    }

    #[test]
    fn test_bad_number_is_a_validation_error() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "ui": {"op": "ui.wait_ms", "ms": "soon"}
        }))
        .unwrap();
        assert!(matches!(step.operation(), Err(ReplayError::SpecValidation(_))));
    }
}

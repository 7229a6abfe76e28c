//! Must-occur network rules
//!
//! The matcher sees every response the page receives while a spec runs.
//! Rules are not tied to the step that declared them: a response can satisfy
//! a rule whenever it arrives. Verification happens once, after the steps.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::{substitute_value, Context, ContextSource};
use crate::error::{ReplayError, ReplayResult};
use crate::jsonpath::{display_value, first_match};
use crate::session::ObservedResponse;
use crate::spec::NetRule;

/// Responses retained for failure diagnostics
pub const RECENT_CAPACITY: usize = 50;

/// Responses listed in an unmatched-rule failure
pub const RECENT_TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HitKey {
    pub method: String,
    pub url_contains: String,
    pub status: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentResponse {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub biz_code: Option<String>,
    pub biz_message: Option<String>,
}

impl RecentResponse {
    fn line(&self) -> String {
        let code = self
            .biz_code
            .as_ref()
            .map(|c| format!(" code={}", c))
            .unwrap_or_default();
        format!("{} {}{} {}", self.method, self.status, code, self.url)
    }
}

/// Compare `expect_json` (top-level keys) and `expect_jsonpath` against a
/// response body. Expected values are substituted first.
pub fn check_expectations(
    body: Option<&Value>,
    expect_json: &Map<String, Value>,
    expect_jsonpath: &Map<String, Value>,
    ctx: &Context,
) -> Result<(), String> {
    if expect_json.is_empty() && expect_jsonpath.is_empty() {
        return Ok(());
    }
    let body = body
        .filter(|b| b.is_object() || b.is_array())
        .ok_or_else(|| "response json is not object".to_string())?;

    for (key, raw) in expect_json {
        let expected = substitute_value(raw, ctx);
        let actual = body.get(key).map(display_value);
        if actual.as_deref() != Some(expected.as_str()) {
            return Err(format!(
                "expect_json mismatch key={} expected={} actual={}",
                key,
                expected,
                actual.unwrap_or_else(|| "undefined".to_string())
            ));
        }
    }

    for (path, raw) in expect_jsonpath {
        let expected = substitute_value(raw, ctx);
        let actual = first_match(body, path)
            .map_err(|e| e.to_string())?
            .map(|v| display_value(&v));
        if actual.as_deref() != Some(expected.as_str()) {
            return Err(format!(
                "expect_jsonpath mismatch path={} expected={} actual={}",
                path,
                expected,
                actual.unwrap_or_else(|| "undefined".to_string())
            ));
        }
    }

    Ok(())
}

/// Matches must-rules against observed responses and records hits
#[derive(Debug, Default)]
pub struct RuleMatcher {
    rules: Vec<NetRule>,
    hits: BTreeMap<HitKey, BTreeSet<usize>>,
    recent: VecDeque<RecentResponse>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<NetRule>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    pub fn rules(&self) -> &[NetRule] {
        &self.rules
    }

    pub fn recent(&self) -> impl Iterator<Item = &RecentResponse> {
        self.recent.iter()
    }

    pub fn is_hit(&self, rule_index: usize) -> bool {
        self.hits.values().any(|rules| rules.contains(&rule_index))
    }

    pub fn observe(&mut self, response: &ObservedResponse, source: &ContextSource) {
        let body = response.json();
        self.remember(response, body.as_ref());

        for (index, rule) in self.rules.iter().enumerate() {
            // Rebuilt per rule: a capture by an earlier rule is visible to later ones.
            let ctx = source.snapshot();
            let url_contains = rule
                .url_contains
                .as_deref()
                .map(|t| ctx.substitute(t))
                .unwrap_or_default();

            if !rule_matches(rule, &url_contains, response, body.as_ref(), &ctx) {
                continue;
            }

            debug!(
                method = %response.method,
                url = %response.url,
                status = response.status,
                "must-rule matched"
            );
            let key = HitKey {
                method: rule.method.clone().unwrap_or_else(|| "*".to_string()),
                url_contains: if url_contains.is_empty() { "*".to_string() } else { url_contains },
                status: rule.status.map(|s| s.to_string()).unwrap_or_else(|| "*".to_string()),
                url: response.url.clone(),
            };
            self.hits.entry(key).or_default().insert(index);

            if let Some(body) = body.as_ref() {
                capture_anchors(rule, body, source);
            }
        }
    }

    fn remember(&mut self, response: &ObservedResponse, body: Option<&Value>) {
        let field = |name: &str| {
            body.and_then(Value::as_object)
                .and_then(|o| o.get(name))
                .map(display_value)
        };
        self.recent.push_back(RecentResponse {
            method: response.method.clone(),
            url: response.url.clone(),
            status: response.status,
            biz_code: field("code"),
            biz_message: field("message"),
        });
        while self.recent.len() > RECENT_CAPACITY {
            self.recent.pop_front();
        }
    }

    /// Fail on the first rule that never matched.
    pub fn verify(&self, ctx: &Context) -> ReplayResult<()> {
        let Some((_, rule)) = self
            .rules
            .iter()
            .enumerate()
            .find(|(index, _)| !self.is_hit(*index))
        else {
            return Ok(());
        };

        let url_contains = rule
            .url_contains
            .as_deref()
            .map(|t| ctx.substitute(t))
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "*".to_string());
        let method = rule.method.clone().unwrap_or_else(|| "*".to_string());
        let status = rule.status.map(|s| s.to_string()).unwrap_or_else(|| "*".to_string());

        let skip = self.recent.len().saturating_sub(RECENT_TAIL);
        let tail: Vec<String> = self.recent.iter().skip(skip).map(RecentResponse::line).collect();

        let mut message = format!(
            "Net check failed: missing request method={} url_contains={} status={}",
            method, url_contains, status
        );
        if !tail.is_empty() {
            message.push_str("\nRecent responses:\n");
            message.push_str(&tail.join("\n"));
        }
        Err(ReplayError::Assertion(message))
    }
}

fn rule_matches(
    rule: &NetRule,
    url_contains: &str,
    response: &ObservedResponse,
    body: Option<&Value>,
    ctx: &Context,
) -> bool {
    if let Some(method) = rule.method.as_deref().filter(|m| !m.is_empty()) {
        if !method.eq_ignore_ascii_case(&response.method) {
            return false;
        }
    }
    if !url_contains.is_empty() && !response.url.contains(url_contains) {
        return false;
    }
    if let Some(status) = rule.status {
        if status != u64::from(response.status) {
            return false;
        }
    }
    check_expectations(body, &rule.expect_json, &rule.expect_jsonpath, ctx).is_ok()
}

fn capture_anchors(rule: &NetRule, body: &Value, source: &ContextSource) {
    let single = rule.anchor.iter().map(|a| (&a.key, &a.jsonpath));
    for (key, path) in single.chain(rule.capture_anchors.iter()) {
        match first_match(body, path) {
            Ok(Some(value)) if !value.is_null() => {
                source.anchors().set(key.clone(), display_value(&value))
            }
            Ok(_) => debug!(anchor = %key, path = %path, "capture path matched nothing"),
            Err(e) => warn!(anchor = %key, "capture skipped: {}", e),
        }
    }
}

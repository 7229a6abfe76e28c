//! Browser session capability
//!
//! The interpreter never talks to a browser directly. It drives a
//! [`BrowserSession`], which performs page operations and publishes every
//! observed response and console message on a broadcast stream.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ReplayResult;
use crate::spec::WaitState;

/// A network response seen by the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResponse {
    pub method: String,
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Raw body text when the session could read it
    #[serde(default)]
    pub body: Option<String>,
}

impl ObservedResponse {
    /// Best-effort JSON parse of the body.
    pub fn json(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    /// Console method: `log`, `warning`, `error`, ...
    pub level: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Response(ObservedResponse),
    Console(ConsoleMessage),
}

/// How `fill` finds its input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FillTarget {
    Selector { selector: String },
    Label { label: String },
    /// The `index`-th match of `selector`
    Nth { selector: String, index: usize },
    First { selector: String },
}

/// Request issued from the page's own request context (shares cookies)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub json: Option<Value>,
    pub form: Option<Value>,
}

impl HttpRequest {
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: String,
}

impl HttpResponse {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

/// Device profile applied when mobile emulation is on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub user_agent: String,
    pub has_touch: bool,
}

impl DeviceProfile {
    pub fn iphone() -> Self {
        Self {
            width: 390,
            height: 844,
            device_scale_factor: 3.0,
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) \
                         AppleWebKit/605.1.15 (KHTML, like Gecko) \
                         Version/15.0 Mobile/15E148 Safari/604.1"
                .to_string(),
            has_touch: true,
        }
    }
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate and wait for DOMContentLoaded.
    async fn goto(&self, url: &str) -> ReplayResult<()>;

    /// Rewrite `location.hash` in the page.
    async fn set_location_hash(&self, hash: &str) -> ReplayResult<()>;

    /// Run operator-supplied script in the page and return its result.
    async fn evaluate_script(&self, code: &str) -> ReplayResult<Value>;

    /// Standard pointer click; a timeout surfaces as `ReplayError::Timeout`.
    async fn click(&self, selector: &str, timeout_ms: u64) -> ReplayResult<()>;

    /// `element.click()` on the first match, bypassing actionability checks.
    async fn dom_click(&self, selector: &str) -> ReplayResult<()>;

    async fn click_role(&self, role: &str, name: &str) -> ReplayResult<()>;

    async fn click_text(&self, text: &str, exact: bool) -> ReplayResult<()>;

    async fn wait_text(&self, text: &str, exact: bool, timeout_ms: u64) -> ReplayResult<()>;

    async fn wait_selector(
        &self,
        selector: &str,
        state: WaitState,
        timeout_ms: u64,
    ) -> ReplayResult<()>;

    async fn count(&self, selector: &str) -> ReplayResult<usize>;

    async fn fill(&self, target: &FillTarget, value: &str) -> ReplayResult<()>;

    /// Dispatch a bubbling `change` event with `{value: index}` on the
    /// `index`-th match of `selector` (first match if out of range).
    async fn dispatch_change(&self, selector: &str, index: usize) -> ReplayResult<()>;

    async fn local_storage_item(&self, key: &str) -> ReplayResult<Option<String>>;

    async fn fetch(&self, request: &HttpRequest) -> ReplayResult<HttpResponse>;

    async fn current_url(&self) -> ReplayResult<String>;

    async fn title(&self) -> ReplayResult<String>;

    async fn content(&self) -> ReplayResult<String>;

    async fn screenshot(&self, path: &Path, full_page: bool) -> ReplayResult<()>;

    /// New receiver for responses and console messages emitted from now on.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn close(&self) -> ReplayResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_response_json_is_best_effort() {
        let mut resp = ObservedResponse {
            method: "GET".into(),
            url: "http://x/api".into(),
            status: 200,
            content_type: Some("application/json".into()),
            body: Some(r#"{"code":0}"#.into()),
        };
        assert_eq!(resp.json(), Some(serde_json::json!({"code": 0})));

        resp.body = Some("<html>".into());
        assert_eq!(resp.json(), None);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut req = HttpRequest::default();
        req.headers.insert("authorization".into(), "Bearer x".into());
        assert!(req.has_header("Authorization"));
    }
}

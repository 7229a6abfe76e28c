//! Scripted collaborators for replay integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;

use syzygy_replay::config::{DatabaseSettings, DbTarget, RunConfig};
use syzygy_replay::database::{Database, DbConnector, DbRow};
use syzygy_replay::session::{
    BrowserSession, ConsoleMessage, FillTarget, HttpRequest, HttpResponse, ObservedResponse,
    SessionEvent,
};
use syzygy_replay::spec::WaitState;
use syzygy_replay::{ReplayError, ReplayReport, ReplayResult, Runner, Spec};

pub fn response(method: &str, url: &str, status: u16, body: Value) -> SessionEvent {
    SessionEvent::Response(ObservedResponse {
        method: method.to_string(),
        url: url.to_string(),
        status,
        content_type: Some("application/json".to_string()),
        body: Some(body.to_string()),
    })
}

pub fn console_error(text: &str) -> SessionEvent {
    SessionEvent::Console(ConsoleMessage {
        level: "error".to_string(),
        text: text.to_string(),
    })
}

pub fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        content_type: Some("application/json; charset=utf-8".to_string()),
        body: body.to_string(),
    }
}

/// Browser session that records every call and emits scripted events
pub struct FakeSession {
    events: broadcast::Sender<SessionEvent>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<HttpRequest>>,
    page_events: Mutex<Vec<(String, Vec<SessionEvent>)>>,
    responses: Mutex<Vec<(String, HttpResponse)>>,
    storage: Mutex<BTreeMap<String, String>>,
    url: Mutex<String>,
    click_times_out: AtomicBool,
    inputs: AtomicUsize,
}

impl FakeSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            page_events: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            storage: Mutex::new(BTreeMap::new()),
            url: Mutex::new("about:blank".to_string()),
            click_times_out: AtomicBool::new(false),
            inputs: AtomicUsize::new(0),
        }
    }

    /// Emit `events` whenever a navigation URL contains `fragment`.
    pub fn on_goto(&self, fragment: &str, events: Vec<SessionEvent>) {
        self.page_events.lock().push((fragment.to_string(), events));
    }

    /// Answer in-page fetches whose URL contains `fragment`.
    pub fn respond(&self, fragment: &str, response: HttpResponse) {
        self.responses.lock().push((fragment.to_string(), response));
    }

    pub fn set_storage(&self, key: &str, value: &str) {
        self.storage.lock().insert(key.to_string(), value.to_string());
    }

    pub fn click_times_out(&self) {
        self.click_times_out.store(true, Ordering::SeqCst);
    }

    pub fn set_inputs(&self, count: usize) {
        self.inputs.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&self, url: &str) -> ReplayResult<()> {
        self.record(format!("goto {}", url));
        *self.url.lock() = url.to_string();
        let scripted: Vec<SessionEvent> = self
            .page_events
            .lock()
            .iter()
            .filter(|(fragment, _)| url.contains(fragment.as_str()))
            .flat_map(|(_, events)| events.clone())
            .collect();
        for event in scripted {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn set_location_hash(&self, hash: &str) -> ReplayResult<()> {
        self.record(format!("hash {}", hash));
        Ok(())
    }

    async fn evaluate_script(&self, code: &str) -> ReplayResult<Value> {
        self.record(format!("eval {}", code));
        Ok(Value::Null)
    }

    async fn click(&self, selector: &str, timeout_ms: u64) -> ReplayResult<()> {
        self.record(format!("click {}", selector));
        if self.click_times_out.load(Ordering::SeqCst) {
            return Err(ReplayError::Timeout(format!(
                "click {} exceeded {}ms",
                selector, timeout_ms
            )));
        }
        Ok(())
    }

    async fn dom_click(&self, selector: &str) -> ReplayResult<()> {
        self.record(format!("dom_click {}", selector));
        Ok(())
    }

    async fn click_role(&self, role: &str, name: &str) -> ReplayResult<()> {
        self.record(format!("click_role {} {}", role, name));
        Ok(())
    }

    async fn click_text(&self, text: &str, exact: bool) -> ReplayResult<()> {
        self.record(format!("click_text {} exact={}", text, exact));
        Ok(())
    }

    async fn wait_text(&self, text: &str, exact: bool, timeout_ms: u64) -> ReplayResult<()> {
        self.record(format!("wait_text {} exact={} timeout={}", text, exact, timeout_ms));
        Ok(())
    }

    async fn wait_selector(
        &self,
        selector: &str,
        state: WaitState,
        timeout_ms: u64,
    ) -> ReplayResult<()> {
        self.record(format!(
            "wait_selector {} {} timeout={}",
            selector,
            state.as_str(),
            timeout_ms
        ));
        Ok(())
    }

    async fn count(&self, _selector: &str) -> ReplayResult<usize> {
        Ok(self.inputs.load(Ordering::SeqCst))
    }

    async fn fill(&self, target: &FillTarget, value: &str) -> ReplayResult<()> {
        let target = match target {
            FillTarget::Selector { selector } => selector.clone(),
            FillTarget::Label { label } => format!("label={}", label),
            FillTarget::Nth { selector, index } => format!("{}[{}]", selector, index),
            FillTarget::First { selector } => format!("{}:first", selector),
        };
        self.record(format!("fill {} = {}", target, value));
        Ok(())
    }

    async fn dispatch_change(&self, selector: &str, index: usize) -> ReplayResult<()> {
        self.record(format!("change {} {}", selector, index));
        Ok(())
    }

    async fn local_storage_item(&self, key: &str) -> ReplayResult<Option<String>> {
        Ok(self.storage.lock().get(key).cloned())
    }

    async fn fetch(&self, request: &HttpRequest) -> ReplayResult<HttpResponse> {
        self.record(format!("fetch {} {}", request.method, request.url));
        self.requests.lock().push(request.clone());
        let scripted = self
            .responses
            .lock()
            .iter()
            .find(|(fragment, _)| request.url.contains(fragment.as_str()))
            .map(|(_, response)| response.clone());
        Ok(scripted.unwrap_or(HttpResponse {
            status: 404,
            content_type: Some("text/plain".to_string()),
            body: "not found".to_string(),
        }))
    }

    async fn current_url(&self) -> ReplayResult<String> {
        Ok(self.url.lock().clone())
    }

    async fn title(&self) -> ReplayResult<String> {
        Ok("Fake page".to_string())
    }

    async fn content(&self) -> ReplayResult<String> {
        Ok("<html><body>fake</body></html>".to_string())
    }

    async fn screenshot(&self, path: &Path, _full_page: bool) -> ReplayResult<()> {
        std::fs::write(path, b"\x89PNG")?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> ReplayResult<()> {
        self.record("close".to_string());
        Ok(())
    }
}

/// Connector whose queries answer from a queue of scripted result sets.
/// An exhausted queue answers with no rows.
#[derive(Default)]
pub struct FakeConnector {
    results: Arc<Mutex<VecDeque<Vec<DbRow>>>>,
    log: Arc<Mutex<Vec<String>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn queue(&self, rows: Vec<DbRow>) {
        self.results.lock().push_back(rows);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every statement run, as `query|exec <sql> <values>`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

/// `["a", NULL]`
fn bound(params: &[Option<String>]) -> String {
    let items: Vec<String> = params
        .iter()
        .map(|p| match p {
            Some(v) => format!("{:?}", v),
            None => "NULL".to_string(),
        })
        .collect();
    format!("[{}]", items.join(", "))
}

pub fn row(pairs: &[(&str, Option<&str>)]) -> DbRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect()
}

struct FakeDb {
    results: Arc<Mutex<VecDeque<Vec<DbRow>>>>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DbConnector for FakeConnector {
    async fn connect(&self, _target: &DbTarget) -> ReplayResult<Box<dyn Database>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDb {
            results: self.results.clone(),
            log: self.log.clone(),
        }))
    }
}

#[async_trait]
impl Database for FakeDb {
    async fn query(&mut self, sql: &str, params: &[Option<String>]) -> ReplayResult<Vec<DbRow>> {
        self.log.lock().push(format!("query {} {}", sql, bound(params)));
        Ok(self.results.lock().pop_front().unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, params: &[Option<String>]) -> ReplayResult<()> {
        self.log.lock().push(format!("exec {} {}", sql, bound(params)));
        Ok(())
    }

    async fn close(self: Box<Self>) -> ReplayResult<()> {
        Ok(())
    }
}

/// Spec files in a temp dir plus fake collaborators
pub struct Harness {
    pub dir: TempDir,
    pub session: Arc<FakeSession>,
    pub db: Arc<FakeConnector>,
    pub config: RunConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            artifacts_dir: dir.path().join("artifacts"),
            database: DatabaseSettings {
                host: Some("db".to_string()),
                user: Some("replay".to_string()),
                database: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            dir,
            session: Arc::new(FakeSession::new()),
            db: Arc::new(FakeConnector::default()),
            config,
        }
    }

    pub fn write_spec(&self, name: &str, spec: Value) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, serde_json::to_string_pretty(&spec).unwrap()).unwrap();
        path
    }

    pub async fn run(&self, root: &Path) -> ReplayResult<ReplayReport> {
        Runner::new(self.session.clone(), self.db.clone(), self.config.clone())
            .run(root)
            .await
    }

    /// Replay a root spec parsed by the caller
    pub async fn run_loaded(&self, root: &Path, spec: &Spec) -> ReplayResult<ReplayReport> {
        Runner::new(self.session.clone(), self.db.clone(), self.config.clone())
            .run_loaded(root, spec)
            .await
    }

    /// File names written to the artifacts directory
    pub fn artifacts(&self) -> Vec<String> {
        std::fs::read_dir(&self.config.artifacts_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

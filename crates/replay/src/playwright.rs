//! Playwright browser session driven through a Node.js bridge
//!
//! The bridge script is staged in a temp directory and spawned with `node`.
//! Commands go out as JSON lines on stdin; replies and page events come back
//! as JSON lines on stdout. A reader task routes replies to their waiting
//! callers and fans events out on a broadcast channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::{ReplayError, ReplayResult};
use crate::session::{
    BrowserSession, ConsoleMessage, DeviceProfile, FillTarget, HttpRequest, HttpResponse,
    ObservedResponse, SessionEvent,
};
use crate::spec::WaitState;

const BRIDGE_SCRIPT: &str = include_str!("bridge.cjs");
const EVENT_CAPACITY: usize = 4096;

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    /// Node.js binary
    pub node_binary: PathBuf,

    /// Extra module search path for `require('playwright')`
    pub node_path: Option<PathBuf>,

    pub headless: bool,

    /// Mobile emulation profile, if enabled
    pub device: Option<DeviceProfile>,

    pub launch_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            node_path: None,
            headless: true,
            device: None,
            launch_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeMessage {
    Reply(BridgeReply),
    Event(BridgeEvent),
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Response(ObservedResponse),
    Console(ConsoleMessage),
}

#[derive(Serialize)]
struct BridgeOptions<'a> {
    headless: bool,
    device: Option<&'a DeviceProfile>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeReply>>>>;

/// Live Playwright page behind a bridge process
pub struct PlaywrightSession {
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    _workdir: tempfile::TempDir,
}

impl PlaywrightSession {
    /// Spawn the bridge and wait until the browser page is ready
    pub async fn launch(config: PlaywrightConfig) -> ReplayResult<Self> {
        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("syzygy-bridge.cjs");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        let options = serde_json::to_string(&BridgeOptions {
            headless: config.headless,
            device: config.device.as_ref(),
        })?;

        let mut cmd = Command::new(&config.node_binary);
        cmd.arg(&script_path)
            .env("SYZYGY_BRIDGE_OPTIONS", options)
            .env("NODE_PATH", node_path(config.node_path.as_deref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!(
            headless = config.headless,
            mobile = config.device.is_some(),
            "launching Playwright bridge"
        );

        let mut child = cmd.spawn().map_err(|e| {
            ReplayError::Browser(format!(
                "failed to spawn {}: {}",
                config.node_binary.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReplayError::Browser("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReplayError::Browser("bridge stdout unavailable".to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let (ready_tx, ready_rx) = oneshot::channel();
        pending.lock().insert(0, ready_tx);
        tokio::spawn(read_bridge(stdout, pending.clone(), events.clone()));

        let ready = tokio::time::timeout(config.launch_timeout, ready_rx)
            .await
            .map_err(|_| {
                ReplayError::Timeout("Playwright bridge did not become ready".to_string())
            })?
            .map_err(|_| {
                ReplayError::Browser("Playwright bridge exited during launch".to_string())
            })?;
        if !ready.ok {
            return Err(ReplayError::Browser(format!(
                "browser launch failed: {}",
                ready.error.unwrap_or_default()
            )));
        }

        Ok(Self {
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            events,
            _workdir: workdir,
        })
    }

    async fn call<T: DeserializeOwned>(&self, cmd: &str, args: Value) -> ReplayResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&json!({ "id": id, "cmd": cmd, "args": args }))?;
        line.push('\n');
        debug!(id, cmd, "bridge request");
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().remove(&id);
                return Err(ReplayError::Browser(format!("bridge write failed: {}", e)));
            }
            stdin.flush().await?;
        }

        let reply = rx
            .await
            .map_err(|_| ReplayError::Browser(format!("bridge exited while running {}", cmd)))?;
        if reply.ok {
            return Ok(serde_json::from_value(reply.result)?);
        }
        let message = format!("{}: {}", cmd, reply.error.unwrap_or_default());
        if reply.timeout {
            Err(ReplayError::Timeout(message))
        } else {
            Err(ReplayError::Browser(message))
        }
    }
}

fn node_path(extra: Option<&Path>) -> String {
    let mut paths = Vec::new();
    if let Some(extra) = extra {
        paths.push(extra.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("node_modules"));
    }
    if let Some(existing) = std::env::var_os("NODE_PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn read_bridge(
    stdout: ChildStdout,
    pending: Pending,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("bridge read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BridgeMessage>(&line) {
            Ok(BridgeMessage::Reply(reply)) => {
                if let Some(tx) = pending.lock().remove(&reply.id) {
                    let _ = tx.send(reply);
                }
            }
            Ok(BridgeMessage::Event(BridgeEvent::Response(resp))) => {
                let _ = events.send(SessionEvent::Response(resp));
            }
            Ok(BridgeMessage::Event(BridgeEvent::Console(msg))) => {
                let _ = events.send(SessionEvent::Console(msg));
            }
            Err(_) => debug!("bridge: {}", line),
        }
    }
    // Dropping the senders wakes every caller still waiting on a reply.
    pending.lock().clear();
    debug!("bridge stdout closed");
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    async fn goto(&self, url: &str) -> ReplayResult<()> {
        self.call("goto", json!({ "url": url })).await
    }

    async fn set_location_hash(&self, hash: &str) -> ReplayResult<()> {
        self.call::<Value>("set_hash", json!({ "hash": hash })).await.map(|_| ())
    }

    async fn evaluate_script(&self, code: &str) -> ReplayResult<Value> {
        self.call("evaluate", json!({ "code": code })).await
    }

    async fn click(&self, selector: &str, timeout_ms: u64) -> ReplayResult<()> {
        self.call::<Value>("click", json!({ "selector": selector, "timeout_ms": timeout_ms }))
            .await
            .map(|_| ())
    }

    async fn dom_click(&self, selector: &str) -> ReplayResult<()> {
        self.call::<bool>("dom_click", json!({ "selector": selector })).await.map(|_| ())
    }

    async fn click_role(&self, role: &str, name: &str) -> ReplayResult<()> {
        self.call::<Value>("click_role", json!({ "role": role, "name": name }))
            .await
            .map(|_| ())
    }

    async fn click_text(&self, text: &str, exact: bool) -> ReplayResult<()> {
        self.call::<Value>("click_text", json!({ "text": text, "exact": exact }))
            .await
            .map(|_| ())
    }

    async fn wait_text(&self, text: &str, exact: bool, timeout_ms: u64) -> ReplayResult<()> {
        self.call::<Value>(
            "wait_text",
            json!({ "text": text, "exact": exact, "timeout_ms": timeout_ms }),
        )
        .await
        .map(|_| ())
    }

    async fn wait_selector(
        &self,
        selector: &str,
        state: WaitState,
        timeout_ms: u64,
    ) -> ReplayResult<()> {
        self.call::<Value>(
            "wait_selector",
            json!({ "selector": selector, "state": state.as_str(), "timeout_ms": timeout_ms }),
        )
        .await
        .map(|_| ())
    }

    async fn count(&self, selector: &str) -> ReplayResult<usize> {
        self.call("count", json!({ "selector": selector })).await
    }

    async fn fill(&self, target: &FillTarget, value: &str) -> ReplayResult<()> {
        self.call::<Value>("fill", json!({ "target": target, "value": value }))
            .await
            .map(|_| ())
    }

    async fn dispatch_change(&self, selector: &str, index: usize) -> ReplayResult<()> {
        self.call::<bool>("dispatch_change", json!({ "selector": selector, "index": index }))
            .await
            .map(|_| ())
    }

    async fn local_storage_item(&self, key: &str) -> ReplayResult<Option<String>> {
        self.call("local_storage", json!({ "key": key })).await
    }

    async fn fetch(&self, request: &HttpRequest) -> ReplayResult<HttpResponse> {
        self.call("fetch", serde_json::to_value(request)?).await
    }

    async fn current_url(&self) -> ReplayResult<String> {
        self.call("url", Value::Null).await
    }

    async fn title(&self) -> ReplayResult<String> {
        self.call("title", Value::Null).await
    }

    async fn content(&self) -> ReplayResult<String> {
        self.call("content", Value::Null).await
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> ReplayResult<()> {
        self.call(
            "screenshot",
            json!({ "path": path.to_string_lossy(), "full_page": full_page }),
        )
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> ReplayResult<()> {
        let closed =
            tokio::time::timeout(Duration::from_secs(10), self.call::<Value>("close", Value::Null))
                .await;
        let mut child = self.child.lock().await;
        match closed {
            Ok(Ok(_)) => {
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            }
            Ok(Err(e)) => warn!("browser close failed: {}", e),
            Err(_) => warn!("browser close timed out"),
        }
        if let Ok(None) = child.try_wait() {
            child.start_kill()?;
        }
        info!("Playwright bridge stopped");
        Ok(())
    }
}

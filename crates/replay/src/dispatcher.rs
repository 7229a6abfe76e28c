//! Step dispatch
//!
//! Every step resolves to exactly one [`Operation`] and one handler. Handlers
//! read a fresh [`Context`] so they see anchors written by earlier steps and
//! by responses the observer has already processed.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactWriter;
use crate::config::{DbTarget, RunConfig};
use crate::context::{
    absolutize_url, deep_substitute, substitute_value, value_text, Context, ContextSource,
};
use crate::database::{to_positional, DbConnector};
use crate::error::{ReplayError, ReplayResult};
use crate::ids::{fs_timestamp, IdGenerator};
use crate::jsonpath::{display_value, first_match};
use crate::network::check_expectations;
use crate::observer::SessionObserver;
use crate::session::{BrowserSession, FillTarget, HttpRequest};
use crate::spec::{ClickArgs, DbExecArgs, FillArgs, NetCallArgs, Operation, Spec, Step, WaitState};

const DEFAULT_CLICK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_HASH_WAIT_MS: u64 = 2_000;
const DEFAULT_SCRIPT_WAIT_MS: u64 = 1_000;
const DEFAULT_IDLE_MS: u64 = 500;

const UNI_INPUT: &str = "input.uni-input-input";
const UNI_TEXTAREA: &str = "textarea.uni-textarea-textarea";
const UNI_PICKER: &str = "uni-picker";

/// Collaborators a handler may use
pub struct StepDispatcher<'r> {
    pub session: &'r dyn BrowserSession,
    pub connector: &'r dyn DbConnector,
    pub config: &'r RunConfig,
    pub artifacts: &'r ArtifactWriter,
    pub ids: &'r IdGenerator,
}

fn missing(op: &str, what: &str, step: &Step) -> ReplayError {
    ReplayError::SpecValidation(format!("{} requires {}. step={}", op, what, step.label()))
}

/// Substitute an optional template; an absent or blank result is missing.
fn required(
    template: Option<&str>,
    ctx: &Context,
    op: &str,
    what: &str,
    step: &Step,
) -> ReplayResult<String> {
    template
        .map(|t| ctx.substitute(t))
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing(op, what, step))
}

fn key_of<'s>(key: &'s Option<String>, op: &str, step: &Step) -> ReplayResult<&'s str> {
    key.as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| missing(op, "key", step))
}

/// uni-app components swallow pointer clicks; these are clicked through the DOM.
fn is_uni_component(selector: &str) -> bool {
    selector.starts_with("uni-") || selector.contains("uni-button") || selector.contains("uni-view")
}

async fn idle(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

impl<'r> StepDispatcher<'r> {
    /// Run the steps of `spec` in order, syncing with the observer first so
    /// captures from earlier responses are visible.
    pub async fn run_steps(
        &self,
        spec: &Spec,
        source: &ContextSource,
        observer: &SessionObserver,
    ) -> ReplayResult<()> {
        for (index, step) in spec.steps.iter().enumerate() {
            observer.sync().await;
            let Some(operation) = step.operation()? else {
                debug!(index, step = step.label(), "step has no op, skipping");
                continue;
            };
            info!(index, step = step.label(), op = operation.name(), "running step");
            self.dispatch(step, &operation, source).await?;
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        step: &Step,
        operation: &Operation,
        source: &ContextSource,
    ) -> ReplayResult<()> {
        let ctx = source.snapshot();
        let anchors = source.anchors();

        match operation {
            Operation::GenId(args) => {
                let key = key_of(&args.key, "util.gen_id", step)?;
                anchors.set(key, self.ids.next_id().to_string());
            }
            Operation::GenTs(args) => {
                let key = key_of(&args.key, "util.gen_ts", step)?;
                anchors.set(key, fs_timestamp(Utc::now()));
            }
            Operation::Goto(args) => {
                let url = required(args.url.as_deref(), &ctx, "ui.goto", "url", step)?;
                self.session.goto(&url).await?;
            }
            Operation::HashNavigate(args) => {
                let hash = required(args.hash.as_deref(), &ctx, "ui.hash_navigate", "hash", step)?;
                self.session.set_location_hash(&hash).await?;
                idle(args.wait_ms.unwrap_or(DEFAULT_HASH_WAIT_MS)).await;
            }
            Operation::Eval(args) => {
                if !self.config.allow_script_eval {
                    return Err(ReplayError::Config(format!(
                        "ui.eval is disabled; rerun with --allow-eval or SYZYGY_ALLOW_EVAL=1 \
                         to run page scripts. step={}",
                        step.label()
                    )));
                }
                let code = required(args.code.as_deref(), &ctx, "ui.eval", "code", step)?;
                self.session.evaluate_script(&code).await?;
                idle(args.wait_ms.unwrap_or(DEFAULT_SCRIPT_WAIT_MS)).await;
            }
            Operation::PickerSelect(args) => {
                let index = args.index.unwrap_or(0) as usize;
                self.session.dispatch_change(UNI_PICKER, index).await?;
                idle(args.wait_ms.unwrap_or(DEFAULT_SCRIPT_WAIT_MS)).await;
            }
            Operation::Click(args) => self.click(step, args, &ctx).await?,
            Operation::Fill(args) => self.fill(step, args, &ctx).await?,
            Operation::ClickText(args) => {
                let text = required(args.text.as_deref(), &ctx, "ui.click_text", "text", step)?;
                self.session.click_text(&text, args.exact.unwrap_or(true)).await?;
            }
            Operation::WaitText(args) => {
                let text = required(args.text.as_deref(), &ctx, "ui.wait_text", "text", step)?;
                let timeout = args.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
                self.session
                    .wait_text(&text, args.exact.unwrap_or(false), timeout)
                    .await?;
            }
            Operation::WaitSelector(args) => {
                let selector =
                    required(args.selector.as_deref(), &ctx, "ui.wait_selector", "selector", step)?;
                let timeout = args.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
                self.session
                    .wait_selector(&selector, args.state.unwrap_or_default(), timeout)
                    .await?;
            }
            Operation::FillForm(args) => {
                let selector =
                    required(args.selector.as_deref(), &ctx, "ui.fill_form", "selector", step)?;
                let value = args
                    .value
                    .as_ref()
                    .filter(|v| !v.is_null())
                    .map(|v| substitute_value(v, &ctx))
                    .ok_or_else(|| missing("ui.fill_form", "value", step))?;
                let timeout = args.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
                self.session
                    .wait_selector(&selector, WaitState::Visible, timeout)
                    .await?;
                self.session
                    .fill(&FillTarget::Selector { selector }, &value)
                    .await?;
            }
            Operation::WaitMs(args) => idle(args.ms.unwrap_or(DEFAULT_IDLE_MS)).await,
            Operation::VerifyUrlContains(args) => {
                let needle = required(
                    args.url_contains.as_deref(),
                    &ctx,
                    "ui.verify_url_contains",
                    "url_contains",
                    step,
                )?;
                let current = self.session.current_url().await?;
                if !current.contains(&needle) {
                    return Err(ReplayError::Assertion(format!(
                        "URL check failed: expected url to contain {} but was {}. step={}",
                        needle,
                        current,
                        step.label()
                    )));
                }
            }
            Operation::NetCall(args) => self.net_call(step, args, source, &ctx).await?,
            Operation::DbExec(args) => self.db_exec(step, args, &ctx).await?,
        }
        Ok(())
    }

    async fn click(&self, step: &Step, args: &ClickArgs, ctx: &Context) -> ReplayResult<()> {
        if let Some(selector) = args.selector.as_deref().filter(|s| !s.is_empty()) {
            let selector = ctx.substitute(selector);
            if args.use_eval || is_uni_component(&selector) {
                return self.session.dom_click(&selector).await;
            }
            let timeout = args.timeout_ms.unwrap_or(DEFAULT_CLICK_TIMEOUT_MS);
            return match self.session.click(&selector, timeout).await {
                Err(e) if e.is_timeout() => {
                    warn!(selector = %selector, "click timed out, falling back to DOM click");
                    self.session.dom_click(&selector).await
                }
                other => other,
            };
        }

        match (args.role.as_deref(), args.name.as_deref()) {
            (Some(role), Some(name)) if !role.is_empty() && !name.is_empty() => {
                self.session.click_role(role, &ctx.substitute(name)).await
            }
            _ => Err(missing("ui.click", "selector or role+name", step)),
        }
    }

    async fn fill(&self, step: &Step, args: &FillArgs, ctx: &Context) -> ReplayResult<()> {
        let value = args
            .value
            .as_ref()
            .map(|v| substitute_value(v, ctx))
            .unwrap_or_default();
        let index = args.index.map(|i| i as usize);

        let target = if let Some(selector) = args.selector.as_deref().filter(|s| !s.is_empty()) {
            let selector = ctx.substitute(selector);
            if args.use_eval || selector.contains("uni-input") {
                match index {
                    Some(index) => self.uni_input(index).await?,
                    None => FillTarget::Selector { selector },
                }
            } else if selector.contains("uni-textarea") {
                FillTarget::First {
                    selector: UNI_TEXTAREA.to_string(),
                }
            } else {
                FillTarget::Selector { selector }
            }
        } else if let Some(label) = args.label.as_deref().filter(|l| !l.is_empty()) {
            FillTarget::Label {
                label: ctx.substitute(label),
            }
        } else if let Some(index) = index {
            self.uni_input(index).await?
        } else if args.textarea {
            FillTarget::First {
                selector: UNI_TEXTAREA.to_string(),
            }
        } else {
            return Err(missing("ui.fill", "selector, label, index, or textarea", step));
        };

        debug!(?target, "filling");
        self.session.fill(&target, &value).await
    }

    /// The `index`-th uni-app input, which must exist.
    async fn uni_input(&self, index: usize) -> ReplayResult<FillTarget> {
        let count = self.session.count(UNI_INPUT).await?;
        if index >= count {
            return Err(ReplayError::Assertion(format!(
                "ui.fill: input index {} not found ({} inputs on page)",
                index, count
            )));
        }
        Ok(FillTarget::Nth {
            selector: UNI_INPUT.to_string(),
            index,
        })
    }

    async fn net_call(
        &self,
        step: &Step,
        args: &NetCallArgs,
        source: &ContextSource,
        ctx: &Context,
    ) -> ReplayResult<()> {
        let raw_url = args
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| missing("net.call", "url", step))?;

        let method = args
            .method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let url = absolutize_url(&ctx.substitute(raw_url), ctx);
        let headers: BTreeMap<String, String> = args
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), substitute_value(v, ctx)))
            .collect();

        let mut request = HttpRequest {
            method,
            url,
            headers,
            json: args.json.as_ref().map(|body| deep_substitute(body, ctx)),
            form: args.form.as_ref().map(|body| deep_substitute(body, ctx)),
        };

        if !request.has_header("authorization") {
            match self.session.local_storage_item("token").await {
                Ok(Some(token)) if !token.is_empty() => {
                    request
                        .headers
                        .insert("Authorization".to_string(), format!("Bearer {}", token));
                }
                Ok(_) => {}
                Err(e) => debug!("token lookup skipped: {}", e),
            }
        }

        let Err(err) = self.perform_call(step, args, &request, source, ctx).await else {
            return Ok(());
        };

        let message = match &args.require {
            Some(requirement) => {
                let text = requirement
                    .message
                    .as_deref()
                    .map(|m| ctx.substitute(m))
                    .unwrap_or_else(|| "prerequisite not satisfied".to_string());
                let need = requirement
                    .need_unit
                    .as_ref()
                    .map(value_text)
                    .filter(|n| !n.is_empty())
                    .map(|n| format!(" need_unit={}", n))
                    .unwrap_or_default();
                format!(
                    "Requirement failed: {}{}. step={}. url={} err={}",
                    text,
                    need,
                    step.label(),
                    request.url,
                    err
                )
            }
            None => format!(
                "net.call failed: step={} url={} err={}",
                step.label(),
                request.url,
                err
            ),
        };

        Err(match err {
            ReplayError::Timeout(_) => ReplayError::Timeout(message),
            ReplayError::Browser(_) => ReplayError::Browser(message),
            _ => ReplayError::Assertion(message),
        })
    }

    async fn perform_call(
        &self,
        step: &Step,
        args: &NetCallArgs,
        request: &HttpRequest,
        source: &ContextSource,
        ctx: &Context,
    ) -> ReplayResult<()> {
        debug!(method = %request.method, url = %request.url, "net.call");
        let response = self.session.fetch(request).await?;

        if let Some(expected) = args.status {
            if u64::from(response.status) != expected {
                return Err(ReplayError::Assertion(format!(
                    "status mismatch expected={} actual={}",
                    expected, response.status
                )));
            }
        }

        let body: Option<Value> = if response.is_json() {
            serde_json::from_str(&response.body).ok()
        } else {
            None
        };

        check_expectations(body.as_ref(), &args.expect_json, &args.expect_jsonpath, ctx)
            .map_err(ReplayError::Assertion)?;

        let anchored = match &args.anchor {
            Some(anchor) => {
                let json = body.as_ref().ok_or_else(|| {
                    ReplayError::Assertion("anchor requires json response".to_string())
                })?;
                let value = first_match(json, &anchor.jsonpath)?
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| {
                        ReplayError::Assertion(format!(
                            "anchor jsonpath not found: {}",
                            anchor.jsonpath
                        ))
                    })?;
                let text = display_value(&value);
                source.anchors().set(anchor.key.clone(), text.clone());
                Some(json!({"key": anchor.key, "value": text, "jsonpath": anchor.jsonpath}))
            }
            None => None,
        };

        self.artifacts.write_json(
            "net-call",
            &json!({
                "step": step.label(),
                "method": request.method,
                "url": request.url,
                "status": response.status,
                "expect_status": args.status,
                "request": {
                    "has_json": request.json.is_some(),
                    "has_form": request.form.is_some(),
                },
                "anchored": anchored,
                "body": body,
            }),
        );
        Ok(())
    }

    async fn db_exec(&self, step: &Step, args: &DbExecArgs, ctx: &Context) -> ReplayResult<()> {
        let sql = args
            .sql
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| missing("db.exec", "sql", step))?;
        let statement = to_positional(sql, &args.params, ctx)?;
        let target = DbTarget::resolve(ctx, &self.config.database)?;

        let mut db = self.connector.connect(&target).await?;
        let result = db.execute(&statement.sql, &statement.values).await;
        if let Err(e) = db.close().await {
            warn!("closing mysql connection failed: {}", e);
        }
        result
    }
}

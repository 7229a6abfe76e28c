//! Run orchestration: prerequisite composition, observation, verification

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::anchors::AnchorStore;
use crate::artifacts::ArtifactWriter;
use crate::config::{mobile_profile, RunConfig};
use crate::context::ContextSource;
use crate::database::{DbConnector, MysqlConnector};
use crate::db_checks::run_db_checks;
use crate::dispatcher::StepDispatcher;
use crate::error::{ReplayError, ReplayResult};
use crate::ids::IdGenerator;
use crate::network::RuleMatcher;
use crate::observer::SessionObserver;
use crate::playwright::{PlaywrightConfig, PlaywrightSession};
use crate::session::BrowserSession;
use crate::spec::{Spec, MAX_PREREQUISITES};

/// Deepest allowed prerequisite nesting below the root spec
pub const MAX_NESTING: usize = 8;

/// Success report printed on stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub ok: bool,
    pub anchors: BTreeMap<String, String>,
}

/// Replays specs against one session and one anchor store.
pub struct Runner {
    session: Arc<dyn BrowserSession>,
    connector: Arc<dyn DbConnector>,
    config: RunConfig,
    artifacts: ArtifactWriter,
    ids: IdGenerator,
}

impl Runner {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        connector: Arc<dyn DbConnector>,
        config: RunConfig,
    ) -> Self {
        let artifacts = ArtifactWriter::new(config.artifacts_dir.clone());
        Self {
            session,
            connector,
            config,
            artifacts,
            ids: IdGenerator::new(),
        }
    }

    pub fn artifacts(&self) -> &ArtifactWriter {
        &self.artifacts
    }

    /// Replay the root spec at `path`, prerequisites included.
    pub async fn run(&self, path: &Path) -> ReplayResult<ReplayReport> {
        let root = Spec::from_file(path)?;
        self.run_loaded(path, &root).await
    }

    /// Replay an already parsed root spec. `path` locates the spec's
    /// prerequisites and marks it in the cycle chain; the file is not read
    /// again.
    ///
    /// The anchor store is seeded from the root spec only. On failure the
    /// page state is captured as `replay-failed` artifacts before the error
    /// is returned.
    pub async fn run_loaded(&self, path: &Path, root: &Spec) -> ReplayResult<ReplayReport> {
        let started = Instant::now();
        let anchors = AnchorStore::seeded(root.anchor_seed());
        info!("Replaying {}", path.display());

        match self.compose(path, root, &anchors, &[canonical(path)]).await {
            Ok(()) => {
                info!(
                    anchors = anchors.write_log().len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Replay passed"
                );
                Ok(ReplayReport {
                    ok: true,
                    anchors: anchors.snapshot(),
                })
            }
            Err(e) => {
                error!(category = e.category(), "Replay failed: {}", e);
                self.artifacts
                    .capture_failure(self.session.as_ref(), "replay-failed")
                    .await;
                Err(e)
            }
        }
    }

    /// Load and execute a prerequisite spec. `ancestors` is the chain of
    /// specs currently composing this one.
    fn run_spec<'a>(
        &'a self,
        path: &'a Path,
        anchors: &'a AnchorStore,
        ancestors: &'a [PathBuf],
    ) -> BoxFuture<'a, ReplayResult<()>> {
        async move {
            let canonical = canonical(path);
            if ancestors.contains(&canonical) {
                let chain: Vec<String> = ancestors
                    .iter()
                    .chain(std::iter::once(&canonical))
                    .map(|p| p.display().to_string())
                    .collect();
                return Err(ReplayError::Config(format!(
                    "Prerequisite cycle: {}",
                    chain.join(" -> ")
                )));
            }
            if ancestors.len() > MAX_NESTING {
                return Err(ReplayError::Config(format!(
                    "Prerequisites nested deeper than {} levels at {}",
                    MAX_NESTING,
                    path.display()
                )));
            }

            let spec = Spec::from_file(path)?;
            let chain: Vec<PathBuf> = ancestors
                .iter()
                .cloned()
                .chain(std::iter::once(canonical))
                .collect();
            self.compose(path, &spec, anchors, &chain).await
        }
        .boxed()
    }

    /// Run the prerequisites of `spec`, then its own steps, must-rules,
    /// console check and DB checks. `chain` ends with `spec` itself.
    async fn compose(
        &self,
        path: &Path,
        spec: &Spec,
        anchors: &AnchorStore,
        chain: &[PathBuf],
    ) -> ReplayResult<()> {
        if spec.prerequisites.len() > MAX_PREREQUISITES {
            return Err(ReplayError::Config(format!(
                "Too many prerequisites (max {}). count={} spec={}. \
                 Implement deeper prerequisites as separate units, \
                 or assume the environment is already prepared.",
                MAX_PREREQUISITES,
                spec.prerequisites.len(),
                path.display()
            )));
        }

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        for prerequisite in &spec.prerequisites {
            let prerequisite = base_dir.join(prerequisite);
            debug!("running prerequisite {}", prerequisite.display());
            self.run_spec(&prerequisite, anchors, chain).await?;
        }

        info!(steps = spec.steps.len(), "Running spec {}", path.display());
        self.run_own(spec, anchors).await
    }

    async fn run_own(&self, spec: &Spec, anchors: &AnchorStore) -> ReplayResult<()> {
        let source = ContextSource::new(spec, anchors);
        let matcher = RuleMatcher::new(spec.must_rules()?);
        let observer = SessionObserver::arm(self.session.subscribe(), matcher, source.clone());

        let dispatcher = StepDispatcher {
            session: self.session.as_ref(),
            connector: self.connector.as_ref(),
            config: &self.config,
            artifacts: &self.artifacts,
            ids: &self.ids,
        };

        let executed = async {
            if spec.needs_default_navigation() {
                if let Some(base_url) = spec.declared_base_url() {
                    let url = source.snapshot().substitute(&base_url);
                    debug!("default navigation to {}", url);
                    self.session.goto(&url).await?;
                }
            }
            dispatcher.run_steps(spec, &source, &observer).await
        }
        .await;

        let observed = observer.finish().await?;
        executed?;

        observed.network.verify(&source.snapshot())?;
        observed.console.verify()?;

        run_db_checks(
            spec,
            &source,
            self.connector.as_ref(),
            &self.config.database,
            &self.artifacts,
        )
        .await
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Launch a Playwright session for the root spec at `spec_path`, replay it
/// against MySQL, and close the session whatever the outcome.
pub async fn execute(config: RunConfig, spec_path: &Path) -> ReplayResult<ReplayReport> {
    let root = Spec::from_file(spec_path)?;
    let device = mobile_profile(&root, config.browser.force_mobile);
    if device.is_some() {
        info!("Mobile emulation enabled");
    }

    let session = PlaywrightSession::launch(PlaywrightConfig {
        node_binary: config.browser.node_binary.clone(),
        node_path: config.browser.node_path.clone(),
        headless: config.browser.headless,
        device,
        ..Default::default()
    })
    .await?;
    let session: Arc<dyn BrowserSession> = Arc::new(session);

    let runner = Runner::new(session.clone(), Arc::new(MysqlConnector), config);
    let result = runner.run_loaded(spec_path, &root).await;

    if let Err(e) = session.close().await {
        error!("closing browser session failed: {}", e);
    }
    result
}

//! Syzygy runner - Main Entry Point
//!
//! Replays one spec and prints `{ "ok": true, "anchors": {...} }` on stdout.
//! Logs go to stderr; any failure exits with status 1.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, CommandFactory, Parser};
use syzygy_replay::config::resolve_artifacts_dir;
use syzygy_replay::{BrowserSettings, DatabaseSettings, RunConfig};

/// Replay a declarative UI/network/database spec
#[derive(Parser, Debug)]
#[command(name = "syzygy-runner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root spec to replay
    #[arg(env = "SYZYGY_SPEC")]
    spec: Option<PathBuf>,

    /// Run the browser headless
    #[arg(
        long,
        env = "HEADLESS",
        action = ArgAction::Set,
        default_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    headless: bool,

    /// Force mobile emulation
    #[arg(
        long,
        env = "MOBILE_EMULATION",
        action = ArgAction::Set,
        default_value = "false",
        value_parser = BoolishValueParser::new()
    )]
    mobile: bool,

    /// Directory for failure and call artifacts
    #[arg(long, env = "SYZYGY_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Allow `ui.eval` steps to run scripts in the page
    #[arg(
        long,
        env = "SYZYGY_ALLOW_EVAL",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        default_value = "false"
    )]
    allow_eval: bool,

    /// Node.js binary used for the Playwright bridge
    #[arg(long, env = "SYZYGY_NODE", default_value = "node")]
    node: PathBuf,

    /// Extra module directory containing `playwright`
    #[arg(long, env = "SYZYGY_NODE_PATH")]
    node_path: Option<PathBuf>,

    #[arg(long, env = "MYSQL_HOST")]
    mysql_host: Option<String>,

    #[arg(long, env = "MYSQL_USER")]
    mysql_user: Option<String>,

    #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
    mysql_password: Option<String>,

    #[arg(long, env = "MYSQL_DATABASE")]
    mysql_database: Option<String>,

    #[arg(long, env = "MYSQL_PORT")]
    mysql_port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn run_config(&self, spec: &std::path::Path) -> RunConfig {
        RunConfig {
            artifacts_dir: resolve_artifacts_dir(self.artifacts_dir.as_deref(), Some(spec)),
            allow_script_eval: self.allow_eval,
            database: DatabaseSettings {
                host: self.mysql_host.clone(),
                user: self.mysql_user.clone(),
                password: self.mysql_password.clone(),
                database: self.mysql_database.clone(),
                port: self.mysql_port,
            },
            browser: BrowserSettings {
                headless: self.headless,
                force_mobile: self.mobile,
                node_binary: self.node.clone(),
                node_path: self.node_path.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for the report
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Some(spec) = cli.spec.clone() else {
        let _ = Cli::command().print_help();
        println!();
        return;
    };

    if let Err(e) = run(&cli, spec).await {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, spec: PathBuf) -> anyhow::Result<()> {
    let config = cli.run_config(&spec);
    tracing::debug!("artifacts dir: {}", config.artifacts_dir.display());

    let report = syzygy_replay::execute(config, &spec)
        .await
        .with_context(|| format!("replay of {} failed", spec.display()))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

//! Syzygy replay engine
//!
//! Replays a declarative JSON spec of UI, network, database and utility
//! steps against a live browser session and a MySQL store, then verifies
//! that the expected responses and rows materialized.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Runner                               │
//! │    ├── prerequisites (max 2 per spec, recursive)            │
//! │    ├── SessionObserver ── RuleMatcher / ConsoleErrors       │
//! │    ├── StepDispatcher                                       │
//! │    │     ├── util.gen_id / util.gen_ts                      │
//! │    │     ├── ui.* ──────────────▶ BrowserSession            │
//! │    │     ├── net.call ──────────▶ BrowserSession::fetch     │
//! │    │     └── db.exec ───────────▶ DbConnector               │
//! │    └── db_checks (retrying) ────▶ DbConnector               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AnchorStore: one per run, shared by every spec             │
//! │  Context: variables < env < anchors, rebuilt on each use    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod anchors;
pub mod artifacts;
pub mod config;
pub mod console;
pub mod context;
pub mod database;
pub mod db_checks;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod jsonpath;
pub mod network;
pub mod observer;
pub mod playwright;
pub mod runner;
pub mod session;
pub mod spec;

pub use anchors::AnchorStore;
pub use config::{BrowserSettings, DatabaseSettings, RunConfig};
pub use database::{Database, DbConnector, MysqlConnector};
pub use error::{ReplayError, ReplayResult};
pub use runner::{execute, ReplayReport, Runner};
pub use session::BrowserSession;
pub use spec::Spec;

//! Run configuration
//!
//! Everything a run needs from its environment is resolved once, up front,
//! into a [`RunConfig`] that is passed explicitly to the components using it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{ReplayError, ReplayResult};
use crate::session::DeviceProfile;
use crate::spec::Spec;

/// Configuration shared by every component of a run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Where diagnostic artifacts are written
    pub artifacts_dir: PathBuf,

    /// Operator opt-in for `ui.eval`
    pub allow_script_eval: bool,

    /// Database defaults; spec context keys override them
    pub database: DatabaseSettings,

    pub browser: BrowserSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("syzygy/artifacts"),
            allow_script_eval: false,
            database: DatabaseSettings::default(),
            browser: BrowserSettings::default(),
        }
    }
}

/// Browser launch settings
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,

    /// Force mobile emulation regardless of spec heuristics
    pub force_mobile: bool,

    pub node_binary: PathBuf,

    pub node_path: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            force_mobile: false,
            node_binary: PathBuf::from("node"),
            node_path: None,
        }
    }
}

/// Database connection parameters as provided by the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub port: Option<u16>,
}

/// A resolved database connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTarget {
    pub host: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    pub port: u16,
}

impl DbTarget {
    /// Resolve a target from the spec context (`MYSQL_HOST` / `mysql_host`
    /// ...), falling back to the configured settings. Host, user and database
    /// are required.
    pub fn resolve(ctx: &Context, settings: &DatabaseSettings) -> ReplayResult<Self> {
        let pick = |upper: &str, lower: &str, fallback: &Option<String>| {
            ctx.first_of(&[upper, lower])
                .map(str::to_string)
                .or_else(|| fallback.clone().filter(|v| !v.is_empty()))
        };

        let host = pick("MYSQL_HOST", "mysql_host", &settings.host);
        let user = pick("MYSQL_USER", "mysql_user", &settings.user);
        let database = pick("MYSQL_DATABASE", "mysql_database", &settings.database);
        let password = pick("MYSQL_PASSWORD", "mysql_password", &settings.password);
        let port = match ctx.first_of(&["MYSQL_PORT", "mysql_port"]) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ReplayError::Config(format!("invalid MYSQL_PORT: {}", raw)))?,
            None => settings.port.unwrap_or(3306),
        };

        match (host, user, database) {
            (Some(host), Some(user), Some(database)) => Ok(Self {
                host,
                user,
                password,
                database,
                port,
            }),
            _ => Err(ReplayError::Config(
                "Missing MySQL env. Required: MYSQL_HOST, MYSQL_USER, MYSQL_DATABASE \
                 (and MYSQL_PASSWORD if needed)"
                    .to_string(),
            )),
        }
    }

    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Artifacts directory: explicit override, else `<spec dir>/../artifacts`,
/// else `./syzygy/artifacts`.
pub fn resolve_artifacts_dir(explicit: Option<&Path>, root_spec: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return absolute(dir);
    }
    if let Some(spec) = root_spec {
        let spec = absolute(spec);
        if let Some(parent) = spec.parent() {
            return parent.join("..").join("artifacts");
        }
    }
    absolute(Path::new("syzygy/artifacts"))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Mobile emulation is on when the spec says it targets a mobile framework,
/// when forced, or when the declared base URL points at an `/h5` build.
pub fn mobile_profile(spec: &Spec, force: bool) -> Option<DeviceProfile> {
    let declared_mobile = spec.metadata.get("mobile") == Some(&Value::Bool(true));
    let uni_app = spec
        .metadata
        .get("framework")
        .and_then(Value::as_str)
        .map(|f| f.eq_ignore_ascii_case("uni-app"))
        .unwrap_or(false);
    let h5 = spec
        .declared_base_url()
        .map(|u| u.contains("/h5"))
        .unwrap_or(false);

    (declared_mobile || force || uni_app || h5).then(DeviceProfile::iphone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> Spec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_db_target_prefers_context() {
        let ctx = Context::from_pairs([("mysql_host", "db.internal"), ("MYSQL_PORT", "3307")]);
        let settings = DatabaseSettings {
            host: Some("localhost".into()),
            user: Some("root".into()),
            database: Some("app".into()),
            ..Default::default()
        };
        let target = DbTarget::resolve(&ctx, &settings).unwrap();
        assert_eq!(target.host, "db.internal");
        assert_eq!(target.port, 3307);
        assert_eq!(target.password, None);
        assert_eq!(target.describe(), "db.internal:3307/app");
    }

    #[test]
    fn test_db_target_requires_host_user_database() {
        let err = DbTarget::resolve(&Context::default(), &DatabaseSettings::default()).unwrap_err();
        assert!(matches!(err, ReplayError::Config(_)));
    }

    #[test]
    fn test_artifacts_dir_resolution() {
        let explicit =
            resolve_artifacts_dir(Some(Path::new("/tmp/out")), Some(Path::new("/a/specs/x.json")));
        assert_eq!(explicit, PathBuf::from("/tmp/out"));

        let sibling = resolve_artifacts_dir(None, Some(Path::new("/a/specs/x.json")));
        assert_eq!(sibling, PathBuf::from("/a/specs/../artifacts"));
    }

    #[test]
    fn test_mobile_detection() {
        let detected = |value: Value, forced: bool| mobile_profile(&spec(value), forced).is_some();
        assert!(detected(json!({"metadata": {"mobile": true}}), false));
        assert!(detected(json!({"metadata": {"framework": "uni-app"}}), false));
        assert!(detected(json!({"env": {"base_url": "http://x/h5/#/"}}), false));
        assert!(detected(json!({}), true));
        assert!(!detected(json!({"env": {"base_url": "http://x/admin"}}), false));
    }
}

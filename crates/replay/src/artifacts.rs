//! Best-effort diagnostic artifacts
//!
//! Every public method here is infallible by signature: persistence problems
//! are logged and swallowed so they can never mask the error being diagnosed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::ids::fs_timestamp;
use crate::session::BrowserSession;

#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<timestamp>-<label>` without extension
    fn base_path(&self, label: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}", fs_timestamp(Utc::now()), sanitize_label(label)))
    }

    fn with_ext(base: &Path, ext: &str) -> PathBuf {
        let mut name = base.as_os_str().to_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    }

    /// Write `payload` as pretty JSON. Returns the path on success.
    pub fn write_json<T: Serialize>(&self, label: &str, payload: &T) -> Option<PathBuf> {
        let path = Self::with_ext(&self.base_path(label), "json");
        let result = std::fs::create_dir_all(&self.dir)
            .and_then(|_| serde_json::to_string_pretty(payload).map_err(std::io::Error::other))
            .and_then(|text| std::fs::write(&path, text));
        match result {
            Ok(()) => {
                debug!("artifact written: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("could not write artifact {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Capture URL, title, HTML and a full-page screenshot of the session.
    pub async fn capture_failure(&self, session: &dyn BrowserSession, label: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("could not create artifacts dir {}: {}", self.dir.display(), e);
            return;
        }
        let base = self.base_path(label);

        let url = session.current_url().await.ok();
        let title = session.title().await.ok();
        let info = json!({ "url": url, "title": title });
        if let Ok(text) = serde_json::to_string_pretty(&info) {
            if let Err(e) = std::fs::write(Self::with_ext(&base, "json"), text) {
                warn!("could not write failure info: {}", e);
            }
        }

        if let Ok(html) = session.content().await {
            if let Err(e) = std::fs::write(Self::with_ext(&base, "html"), html) {
                warn!("could not write failure html: {}", e);
            }
        }

        if let Err(e) = session.screenshot(&Self::with_ext(&base, "png"), true).await {
            warn!("could not capture failure screenshot: {}", e);
        }

        info!("failure artifacts captured under {}", self.dir.display());
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize_label(label: &str) -> String {
    let label = if label.is_empty() { "artifact" } else { label };
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("db check/failed:1"), "db_check_failed_1");
        assert_eq!(sanitize_label(""), "artifact");
    }

    #[test]
    fn test_write_json_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(tmp.path().join("nested/artifacts"));

        let path = writer.write_json("net-call", &json!({"status": 200})).unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().ends_with("-net-call.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"status\": 200"));
    }

    #[test]
    fn test_write_json_swallows_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let writer = ArtifactWriter::new(blocker.join("sub"));
        assert!(writer.write_json("x", &json!({})).is_none());
    }
}

//! Console error observation

use once_cell::sync::Lazy;
use regex::RegexSet;
use tracing::debug;

use crate::error::{ReplayError, ReplayResult};
use crate::session::ConsoleMessage;

/// Dev-server and framework chatter that is never a page failure
static BENIGN: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"Failed to load resource",
        r"\[Vue warn\]",
        r"\[intlify\]",
        r"(?i)missing translation",
        r"(?i)not found '.*' key in '.*' locale messages",
        r"\[vite\]",
        r"\[HMR\]",
        r"\[webpack-dev-server\]",
    ])
    .expect("console noise patterns are valid")
});

pub fn is_benign(text: &str) -> bool {
    BENIGN.is_match(text)
}

/// Unsuppressed `console.error` messages seen during one spec
#[derive(Debug, Default, Clone)]
pub struct ConsoleErrors {
    errors: Vec<String>,
}

impl ConsoleErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, message: &ConsoleMessage) {
        if message.level != "error" {
            return;
        }
        if is_benign(&message.text) {
            debug!("ignoring benign console error: {}", message.text);
            return;
        }
        self.errors.push(message.text.clone());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn verify(&self) -> ReplayResult<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(ReplayError::Assertion(format!(
            "Console has errors: {}",
            self.errors.join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn error(text: &str) -> ConsoleMessage {
        ConsoleMessage {
            level: "error".to_string(),
            text: text.to_string(),
        }
    }

    #[test_case(
        "Failed to load resource: the server responded with a status of 404" ;
        "resource 404"
    )]
    #[test_case("[Vue warn]: Extraneous non-props attributes" ; "vue warn")]
    #[test_case("[intlify] Not found 'order.title' key in 'en' locale messages." ; "intlify")]
    #[test_case("[vite] connecting..." ; "vite")]
    #[test_case("[HMR] Waiting for update signal from WDS..." ; "hmr")]
    #[test_case("[webpack-dev-server] Disconnected!" ; "webpack")]
    fn test_benign_noise_is_ignored(text: &str) {
        let mut console = ConsoleErrors::new();
        console.observe(&error(text));
        assert!(console.verify().is_ok());
    }

    #[test]
    fn test_real_errors_fail() {
        let mut console = ConsoleErrors::new();
        console.observe(&error("TypeError: cannot read properties of undefined"));
        console.observe(&ConsoleMessage {
            level: "warning".to_string(),
            text: "deprecated".to_string(),
        });

        assert_eq!(console.errors().len(), 1);
        let err = console.verify().unwrap_err().to_string();
        assert!(err.starts_with("Console has errors: TypeError"), "{}", err);
    }
}

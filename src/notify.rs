// =============================================================================
// Notifier — fire-and-forget webhook notifications
// =============================================================================
//
// One-way `notify(title, body)` used for unrecoverable engine events and
// trade confirmations. The POST runs in its own task with a 5 s timeout and
// its result is only logged: notification delivery must never block or fail
// the trading path. With no webhook configured the notifier degrades to a
// debug log line.
// =============================================================================

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
        }
    }

    /// Disabled notifier for tests and minimal deployments.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Send a notification without waiting for the result.
    pub fn notify(&self, title: &str, body: &str) {
        let Some(url) = self.webhook_url.clone() else {
            debug!(title, "notification (no webhook configured)");
            return;
        };

        let client = self.client.clone();
        let payload = json!({ "title": title, "body": body });
        let title = title.to_string();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(title, "notification delivered");
                }
                Ok(resp) => {
                    warn!(title, status = %resp.status(), "notification rejected by webhook");
                }
                Err(e) => {
                    warn!(title, error = %e, "notification delivery failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("configured", &self.webhook_url.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_is_a_noop() {
        // Must not panic or block without a runtime target.
        let notifier = Notifier::disabled();
        notifier.notify("test", "body");
    }

    #[test]
    fn debug_never_exposes_the_url() {
        let notifier = Notifier::new(Some("https://hooks.example/secret-token".into()));
        let rendered = format!("{notifier:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("configured: true"));
    }
}

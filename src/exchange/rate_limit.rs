// =============================================================================
// Request-weight tracker — keeps the adapter under the venue's rate limits
// =============================================================================
//
// Binance enforces a request-weight budget of 1200 per minute; we hard-cap
// ourselves at 1000 and start warning at 800. The tracker reads the
// `X-MBX-USED-WEIGHT-1M` response header after every request and keeps atomic
// counters that any engine task may query lock-free. When the budget is
// exhausted the adapter sleeps out the remainder of the minute window instead
// of collecting 429s.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Thread-safe request-weight tracker backed by atomic counters.
pub struct WeightTracker {
    used_weight_1m: AtomicU32,
    /// Unix seconds of the minute window the counter belongs to.
    window_start_secs: AtomicU64,
}

impl WeightTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            window_start_secs: AtomicU64::new(0),
        }
    }

    /// Update the counter from the venue's response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        self.window_start_secs
            .store(now_unix_secs(), Ordering::Relaxed);

        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight crossed warning threshold"
            );
        } else {
            debug!(used_weight_1m = weight, "request weight updated");
        }
    }

    /// How long to pause before sending a request costing `weight`, if the
    /// budget would otherwise be exceeded. `None` means send immediately.
    pub fn throttle_delay(&self, weight: u32) -> Option<Duration> {
        let window = self.window_start_secs.load(Ordering::Relaxed);
        let used = self.used_weight_1m.load(Ordering::Relaxed);

        if used + weight <= WEIGHT_HARD_LIMIT {
            return None;
        }

        // Sleep out the remainder of the minute window the counter was read
        // in; the venue resets the budget at the window boundary.
        let elapsed = now_unix_secs().saturating_sub(window);
        let remaining = 60u64.saturating_sub(elapsed).max(1);
        warn!(
            used_weight = used,
            request_weight = weight,
            sleep_secs = remaining,
            "request weight budget exhausted, throttling"
        );
        Some(Duration::from_secs(remaining))
    }
}

impl Default for WeightTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

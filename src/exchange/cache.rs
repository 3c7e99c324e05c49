// =============================================================================
// TTL cache — one soft cache type for spot balance, funding balance, and
// total account value
// =============================================================================
//
// Contract: `get` returns a clone of the cached value while it is younger
// than the TTL; `put` stamps a fresh value; `invalidate` drops the value
// immediately. Every mutating adapter operation (orders, transfers) calls
// `invalidate` on the balance caches before returning, so a subsequent read
// from any engine is guaranteed to refetch.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct TtlCache<T> {
    inner: Mutex<Option<(Instant, T)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(None),
            ttl,
        }
    }

    /// Return the cached value if it is still fresh.
    pub fn get(&self) -> Option<T> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some((stamped, value)) if stamped.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    /// Return the last stored value regardless of age (fallback on fetch
    /// failure paths).
    pub fn get_stale(&self) -> Option<T> {
        self.inner.lock().as_ref().map(|(_, v)| v.clone())
    }

    pub fn put(&self, value: T) {
        *self.inner.lock() = Some((Instant::now(), value));
    }

    pub fn invalidate(&self) {
        *self.inner.lock() = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_value_is_returned() {
        let cache = TtlCache::new(Duration::from_secs(30));
        assert!(cache.get().is_none());
        cache.put(42u32);
        assert_eq!(cache.get(), Some(42));
    }

    #[test]
    fn invalidate_drops_value() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.put("hello".to_string());
        cache.invalidate();
        assert!(cache.get().is_none());
        assert!(cache.get_stale().is_none());
    }

    #[test]
    fn expired_value_not_returned_but_stale_read_works() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.put(7i64);
        // TTL of zero expires immediately.
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get().is_none());
        assert_eq!(cache.get_stale(), Some(7));
    }

    #[test]
    fn put_refreshes_timestamp() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.put(1u8);
        cache.put(2u8);
        assert_eq!(cache.get(), Some(2));
    }
}

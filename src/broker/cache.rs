//! Registry of live tunnels keyed by `device:port`.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Key under which a device port's tunnel is cached.
pub fn cache_key(device_id: &str, device_port: u16) -> String {
    format!("{device_id}:{device_port}")
}

/// One established tunnel. The cache owns it and is the only place its
/// cancellation function is ever invoked.
pub struct TunnelHandle {
    local_port: u16,
    cancel: Option<Box<dyn FnOnce() + Send>>,
    last_used: Instant,
}

impl TunnelHandle {
    pub fn new(local_port: u16, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            local_port,
            cancel: Some(Box::new(cancel)),
            last_used: Instant::now(),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("local_port", &self.local_port)
            .field("last_used", &self.last_used)
            .finish_non_exhaustive()
    }
}

/// Mutex-guarded map of cached tunnels with idle eviction.
///
/// Cancellation functions always run after the lock is released.
pub struct ConnectionCache {
    entries: Mutex<HashMap<String, TunnelHandle>>,
    ttl: Duration,
}

impl ConnectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Register `handle` under `key`, cancelling any tunnel it displaces.
    pub async fn add(&self, key: String, handle: TunnelHandle) {
        let displaced = self.entries.lock().await.insert(key, handle);
        if let Some(old) = displaced {
            old.cancel();
        }
    }

    /// Local port of the tunnel cached under `key`. A hit counts as use.
    pub async fn get(&self, key: &str) -> Option<u16> {
        let mut entries = self.entries.lock().await;
        let handle = entries.get_mut(key)?;
        handle.last_used = Instant::now();
        Some(handle.local_port)
    }

    /// Tear down and forget the tunnel under `key`.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.entries.lock().await.remove(key);
        removed.map(TunnelHandle::cancel).is_some()
    }

    /// Like [`remove`](Self::remove), but only while `key` still maps to the
    /// tunnel on `local_port`, so a replacement under the same key survives.
    pub async fn remove_if_port(&self, key: &str, local_port: u16) -> bool {
        let removed = {
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some(handle) if handle.local_port == local_port => entries.remove(key),
                _ => None,
            }
        };
        removed.map(TunnelHandle::cancel).is_some()
    }

    /// Cancel and evict every tunnel idle for longer than the TTL.
    pub async fn clean_up(&self) -> usize {
        self.clean_up_at(Instant::now()).await
    }

    pub(crate) async fn clean_up_at(&self, now: Instant) -> usize {
        let expired: Vec<(String, TunnelHandle)> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, h)| now.saturating_duration_since(h.last_used) > self.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|h| (k, h)))
                .collect()
        };

        let count = expired.len();
        for (key, handle) in expired {
            debug!(key, port = handle.local_port, "Evicting idle tunnel");
            handle.cancel();
        }
        count
    }

    /// Cancel everything. Used on shutdown.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<TunnelHandle> = self.entries.lock().await.drain().map(|(_, h)| h).collect();
        let count = drained.len();
        drained.into_iter().for_each(TunnelHandle::cancel);
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    fn counted(port: u16, counter: &Arc<AtomicUsize>) -> TunnelHandle {
        let counter = counter.clone();
        TunnelHandle::new(port, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn hit_until_idle_expiry() {
        let cache = ConnectionCache::new(TTL);
        let cancels = Arc::new(AtomicUsize::new(0));
        cache.add("dev1:80".into(), counted(4000, &cancels)).await;

        assert_eq!(cache.get("dev1:80").await, Some(4000));
        assert_eq!(cache.get("dev1:80").await, Some(4000));

        // Still fresh
        assert_eq!(cache.clean_up().await, 0);
        assert_eq!(cache.get("dev1:80").await, Some(4000));

        let later = Instant::now() + TTL + Duration::from_secs(1);
        assert_eq!(cache.clean_up_at(later).await, 1);
        assert_eq!(cache.get("dev1:80").await, None);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        // A second sweep must not cancel again
        assert_eq!(cache.clean_up_at(later).await, 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clean_up_keeps_recently_used() {
        let cache = ConnectionCache::new(TTL);
        let cancels = Arc::new(AtomicUsize::new(0));
        cache.add("old:80".into(), counted(4000, &cancels)).await;
        cache.add("new:80".into(), counted(4001, &cancels)).await;

        let later = Instant::now() + TTL + Duration::from_secs(1);
        // Simulate a hit just before the sweep
        cache.entries.lock().await.get_mut("new:80").unwrap().last_used = later;

        assert_eq!(cache.clean_up_at(later).await, 1);
        assert_eq!(cache.get("old:80").await, None);
        assert_eq!(cache.get("new:80").await, Some(4001));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_cancels_displaced_handle() {
        let cache = ConnectionCache::new(TTL);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        cache.add("dev:80".into(), counted(4000, &first)).await;
        cache.add("dev:80".into(), counted(4001, &second)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get("dev:80").await, Some(4001));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn remove_if_port_spares_replacement() {
        let cache = ConnectionCache::new(TTL);
        let cancels = Arc::new(AtomicUsize::new(0));
        cache.add("dev:80".into(), counted(4001, &cancels)).await;

        assert!(!cache.remove_if_port("dev:80", 4000).await);
        assert_eq!(cache.get("dev:80").await, Some(4001));

        assert!(cache.remove_if_port("dev:80", 4001).await);
        assert!(cache.is_empty().await);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_and_cancel_all() {
        let cache = ConnectionCache::new(TTL);
        let cancels = Arc::new(AtomicUsize::new(0));
        cache.add(cache_key("a", 80), counted(4000, &cancels)).await;
        cache.add(cache_key("b", 80), counted(4001, &cancels)).await;
        cache.add(cache_key("c", 22), counted(4002, &cancels)).await;

        assert!(cache.remove("a:80").await);
        assert!(!cache.remove("a:80").await);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        assert_eq!(cache.cancel_all().await, 2);
        assert_eq!(cancels.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty().await);
    }
}

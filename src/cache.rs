use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::CacheConfig;

/// Concurrent verdict cache mapping canonical site keys to their phishing
/// classification. Shared by every connection task; all operations take the
/// one lock, so no connection observes a half-updated verdict.
///
/// There is no per-entry expiry. The janitor loops clear the whole map on a
/// timer or when it outgrows its cap.
#[derive(Debug, Default)]
pub struct VerdictCache {
    entries: Mutex<HashMap<String, bool>>,
}

impl VerdictCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries.lock().unwrap().get(key).copied()
    }

    pub fn set(&self, key: &str, phishing: bool) {
        self.entries.lock().unwrap().insert(key.to_string(), phishing);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn phishing_count(&self) -> usize {
        self.entries.lock().unwrap().values().filter(|v| **v).count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Spawns the three background cache loops: unconditional clear on a fixed
/// interval, wholesale clear when the size cap is exceeded, and a periodic
/// status line.
pub fn spawn_janitors(cache: Arc<VerdictCache>, config: &CacheConfig) {
    let clear_interval = config.clear_interval();
    let size_poll = config.size_poll();
    let status_interval = config.status_interval();
    let max_entries = config.max_entries;

    let on_interval = Arc::clone(&cache);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(clear_interval).await;
            info!("clearing verdict cache (interval)");
            on_interval.clear();
        }
    });

    let on_size = Arc::clone(&cache);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(size_poll).await;
            if on_size.len() > max_entries {
                info!(max_entries, "clearing verdict cache (size)");
                on_size.clear();
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(status_interval).await;
            info!(
                entries = cache.len(),
                phishing = cache.phishing_count(),
                "verdict cache status"
            );
        }
    });
}

//! Registry of open piece caches, one per active torrent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::Cache;
use crate::config::CacheConfig;
use crate::torrent::{InfoHash, TorrentLayout};

/// Owns the cache of every active torrent.
#[derive(Debug)]
pub struct CacheRegistry {
    config: CacheConfig,
    caches: Mutex<HashMap<InfoHash, Arc<Cache>>>,
}

impl CacheRegistry {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            caches: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cache for `info_hash`, creating it on first use.
    pub fn open_cache(self: &Arc<Self>, info_hash: InfoHash, layout: TorrentLayout) -> Arc<Cache> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(&info_hash) {
            return Arc::clone(cache);
        }
        let cache = Cache::new(info_hash, layout, &self.config, Arc::downgrade(self));
        caches.insert(info_hash, Arc::clone(&cache));
        cache
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<Cache>> {
        self.caches.lock().get(info_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.lock().is_empty()
    }

    /// Snapshot of all open caches.
    pub fn caches(&self) -> Vec<Arc<Cache>> {
        self.caches.lock().values().cloned().collect()
    }

    /// Closes and forgets the cache of a removed torrent.
    ///
    /// Returns false when no cache was open for `info_hash`.
    pub fn close_cache(&self, info_hash: &InfoHash) -> bool {
        let removed = self.caches.lock().remove(info_hash);
        match removed {
            Some(cache) => {
                cache.close();
                true
            }
            None => false,
        }
    }

    /// Removes a cache that closed itself.
    pub(crate) fn deregister(&self, info_hash: &InfoHash) {
        if self.caches.lock().remove(info_hash).is_some() {
            debug!("Deregistered cache for {}", info_hash);
        }
    }

    /// Runs cleanup on every cache, and disk fill on disk caches, each `interval`.
    ///
    /// The task ends once the registry is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        info!("Starting cache maintenance every {:?}", interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(caches) = registry_caches(&registry) else {
                    debug!("Cache registry dropped, stopping maintenance");
                    break;
                };

                let pass = tokio::task::spawn_blocking(move || {
                    for cache in caches {
                        cache.clean_pieces();
                        if cache.is_disk() {
                            cache.load_pieces_on_disk();
                        }
                    }
                });
                if let Err(e) = pass.await {
                    warn!("Cache maintenance pass failed: {}", e);
                }
            }
        })
    }
}

fn registry_caches(registry: &Weak<CacheRegistry>) -> Option<Vec<Arc<Cache>>> {
    registry.upgrade().map(|registry| registry.caches())
}

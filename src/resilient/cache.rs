// src/resilient/cache.rs
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::transport::NormalizedRequest;

/// Opportunistic purge kicks in above this many entries.
const PURGE_ABOVE: usize = 1024;

/// Stable key for a normalized request. Credentials never reach this function.
pub fn cache_key(request: &NormalizedRequest) -> String {
    let canonical = serde_json::to_vec(request).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Shared TTL map. Expired entries behave as absent and are removed lazily.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        {
            let map = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match map.get(key) {
                None => return None,
                Some((at, v)) if at.elapsed() < self.ttl => return Some(v.clone()),
                Some(_) => {}
            }
        }
        let mut map = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if map.get(key).is_some_and(|(at, _)| at.elapsed() >= self.ttl) {
            map.remove(key);
        }
        None
    }

    /// Last writer wins.
    pub fn insert(&self, key: String, value: V) {
        let mut map = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if map.len() >= PURGE_ABOVE {
            let ttl = self.ttl;
            map.retain(|_, (at, _)| at.elapsed() < ttl);
        }
        map.insert(key, (Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

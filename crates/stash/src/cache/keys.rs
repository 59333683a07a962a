//! Striped per-key locks serializing cache mutations.
//!
//! A hydrate from the durable tier and a write-through for the same key must
//! not interleave. Keys hash onto a fixed set of async mutexes; two keys may
//! share a stripe, which only costs a little parallelism.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

use crate::cache::types::AssetKey;

#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    pub async fn lock(&self, key: &AssetKey) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_for(key)].lock().await
    }

    fn stripe_for(&self, key: &AssetKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}

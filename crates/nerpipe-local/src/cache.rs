//! In-process cache backend.

use nerpipe_core::{Cache, Error, GetPipeline, Lookup, LookupHandle, Result, SetPipeline};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Key/value map holding cache values in their JSON wire form.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous lookup used by the dictionary recogniser's local mode.
    pub fn lookup(&self, key: &str) -> Result<Option<Lookup>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::Cache(e.to_string()))?;
        entries.get(key).map(|v| Lookup::from_slice(v)).transpose()
    }

    pub fn insert(&self, key: impl Into<String>, lookup: &Lookup) -> Result<()> {
        self.insert_raw(key.into(), lookup.to_vec()?)
    }

    fn insert_raw(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.entries
            .write()
            .map_err(|e| Error::Cache(e.to_string()))?
            .insert(key, value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &'static str {
        "local"
    }

    fn new_get_pipeline(&self, capacity: usize) -> Box<dyn GetPipeline> {
        Box::new(MemoryGetPipeline {
            cache: self.clone(),
            queue: Vec::with_capacity(capacity),
        })
    }

    fn new_set_pipeline(&self, capacity: usize) -> Box<dyn SetPipeline> {
        Box::new(MemorySetPipeline {
            cache: self.clone(),
            queue: Vec::with_capacity(capacity),
        })
    }

    async fn ready(&self) -> bool {
        true
    }
}

struct MemoryGetPipeline {
    cache: MemoryCache,
    queue: Vec<(LookupHandle, String)>,
}

#[async_trait::async_trait]
impl GetPipeline for MemoryGetPipeline {
    fn get(&mut self, handle: LookupHandle, key: String) {
        self.queue.push((handle, key));
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    async fn exec(&mut self) -> Result<Vec<(LookupHandle, Option<Lookup>)>> {
        std::mem::take(&mut self.queue)
            .into_iter()
            .map(|(handle, key)| Ok((handle, self.cache.lookup(&key)?)))
            .collect()
    }
}

struct MemorySetPipeline {
    cache: MemoryCache,
    queue: Vec<(String, Vec<u8>)>,
}

#[async_trait::async_trait]
impl SetPipeline for MemorySetPipeline {
    fn set(&mut self, key: String, value: Vec<u8>) {
        self.queue.push((key, value));
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    async fn exec(&mut self) -> Result<()> {
        for (key, value) in std::mem::take(&mut self.queue) {
            self.cache.insert_raw(key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(dictionary: &str) -> Lookup {
        Lookup {
            dictionary: dictionary.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sync_lookup_sees_inserts_through_clones() {
        let cache = MemoryCache::new();
        let other = cache.clone();
        other.insert("calcium", &lookup("chebi")).unwrap();
        assert_eq!(cache.lookup("calcium").unwrap().unwrap().dictionary, "chebi");
        assert!(cache.lookup("sodium").unwrap().is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn pipelines_batch_and_drain() {
        let cache = MemoryCache::new();
        let mut set = cache.new_set_pipeline(4);
        set.set("a".to_string(), lookup("d1").to_vec().unwrap());
        set.set("b".to_string(), lookup("d2").to_vec().unwrap());
        assert_eq!(set.size(), 2);
        assert!(cache.is_empty());
        set.exec().await.unwrap();
        assert_eq!(set.size(), 0);
        assert_eq!(cache.len(), 2);

        let mut get = cache.new_get_pipeline(4);
        get.get(7, "a".to_string());
        get.get(8, "missing".to_string());
        let mut got = get.exec().await.unwrap();
        got.sort_by_key(|(h, _)| *h);
        assert_eq!(got[0].0, 7);
        assert_eq!(got[0].1.as_ref().unwrap().dictionary, "d1");
        assert_eq!(got[1], (8, None));
        assert_eq!(get.size(), 0);
    }

    #[tokio::test]
    async fn malformed_values_surface_as_decode_errors() {
        let cache = MemoryCache::new();
        let mut set = cache.new_set_pipeline(1);
        set.set("bad".to_string(), b"{".to_vec());
        set.exec().await.unwrap();
        let mut get = cache.new_get_pipeline(1);
        get.get(0, "bad".to_string());
        assert!(matches!(get.exec().await, Err(Error::Decode(_))));
    }
}

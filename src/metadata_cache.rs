// =============================================================================
// Metadata cache — process-wide, lazily populated instrument metadata
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::InstrumentMeta;

/// Symbol → immutable instrument facts. Populated once on the first
/// successful scan and never invalidated afterward; a miss is always treated
/// by callers as "skip this symbol", never as a reason to fetch synchronously
/// mid-scan.
#[derive(Debug, Default)]
pub struct MetadataCache {
    inner: RwLock<HashMap<String, InstrumentMeta>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<InstrumentMeta> {
        self.inner.read().get(symbol).cloned()
    }

    /// Replace the whole table. Called once, after the orchestrator's
    /// metadata fetch step observes an empty cache.
    pub fn populate(&self, entries: Vec<InstrumentMeta>) {
        let mut guard = self.inner.write();
        for entry in entries {
            guard.insert(entry.symbol.clone(), entry);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(symbol: &str) -> InstrumentMeta {
        InstrumentMeta {
            symbol: symbol.to_string(),
            asset_index: 0,
            size_decimals: 3,
            max_leverage: 20,
            only_isolated: false,
        }
    }

    #[test]
    fn empty_cache_reports_empty() {
        let cache = MetadataCache::new();
        assert!(cache.is_empty());
        assert!(cache.get("BTC").is_none());
    }

    #[test]
    fn populate_then_get() {
        let cache = MetadataCache::new();
        cache.populate(vec![sample("BTC"), sample("ETH")]);
        assert!(!cache.is_empty());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("BTC").unwrap().max_leverage, 20);
        assert!(cache.get("SOL").is_none());
    }

    #[test]
    fn repopulate_merges_rather_than_replaces() {
        let cache = MetadataCache::new();
        cache.populate(vec![sample("BTC")]);
        cache.populate(vec![sample("ETH")]);
        assert_eq!(cache.len(), 2);
    }
}

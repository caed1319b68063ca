//! Channel address table
//!
//! Maps the stable numeric ids handed out to the rest of the platform onto
//! network-native channel identifiers. Channels and private conversations are
//! kept in separate maps since a peer and a channel may share a native key.

use herald_core::types::{ChannelAddress, UNMAPPED_CHANNELS_ID};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tokio::sync::Mutex;

/// Where a real id points on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTarget<K> {
    pub key: K,
    pub is_private: bool,
}

/// Outcome of replacing the mapped channel set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapResult<K> {
    /// Addresses of the full desired set, in the order given
    pub addresses: Vec<ChannelAddress>,
    /// Keys mapped now that were not mapped before
    pub added: Vec<K>,
    /// Keys that were mapped before and no longer are
    pub removed: Vec<K>,
}

struct TableInner<K> {
    next_id: u64,
    channels: HashMap<K, u64>,
    private: HashMap<K, u64>,
    by_id: HashMap<u64, NativeTarget<K>>,
    /// Currently configured channels, by real id
    mapped: HashMap<u64, ChannelAddress>,
}

impl<K: Eq + Hash + Clone> TableInner<K> {
    fn resolve(&mut self, key: &K, is_private: bool) -> u64 {
        let map = if is_private {
            &mut self.private
        } else {
            &mut self.channels
        };
        if let Some(id) = map.get(key) {
            return *id;
        }

        let id = self.next_id;
        self.next_id += 1;
        map.insert(key.clone(), id);
        self.by_id.insert(
            id,
            NativeTarget {
                key: key.clone(),
                is_private,
            },
        );
        id
    }

    fn mapped_keys(&self) -> Vec<K> {
        self.mapped
            .keys()
            .filter_map(|id| self.by_id.get(id))
            .map(|target| target.key.clone())
            .collect()
    }
}

/// Bidirectional real id <-> native key table guarded by one lock
pub struct ChannelAddressTable<K> {
    inner: Mutex<TableInner<K>>,
}

impl<K: Eq + Hash + Clone> ChannelAddressTable<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                // 0 is reserved for "all unmapped channels"
                next_id: UNMAPPED_CHANNELS_ID + 1,
                channels: HashMap::new(),
                private: HashMap::new(),
                by_id: HashMap::new(),
                mapped: HashMap::new(),
            }),
        }
    }

    /// Get the real id for a native key, assigning a new one on first sight
    pub async fn resolve(&self, key: &K, is_private: bool) -> u64 {
        self.inner.lock().await.resolve(key, is_private)
    }

    /// Find the native target of a real id
    pub async fn lookup(&self, real_id: u64) -> Option<NativeTarget<K>> {
        self.inner.lock().await.by_id.get(&real_id).cloned()
    }

    /// Configured address for a mapped channel
    pub async fn mapped_address(&self, real_id: u64) -> Option<ChannelAddress> {
        self.inner.lock().await.mapped.get(&real_id).cloned()
    }

    /// Whether a native channel key is part of the configured set
    pub async fn is_mapped(&self, key: &K) -> bool {
        let inner = self.inner.lock().await;
        inner
            .channels
            .get(key)
            .is_some_and(|id| inner.mapped.contains_key(id))
    }

    pub async fn mapped_keys(&self) -> Vec<K> {
        self.inner.lock().await.mapped_keys()
    }

    /// Replace the configured channel set.
    ///
    /// Channels keep their real id across remaps, including channels dropped from
    /// the set, so messages already in flight stay addressable. The `real_id` of
    /// each incoming address is overwritten with the assigned id.
    pub async fn remap(&self, desired: Vec<(K, ChannelAddress)>) -> RemapResult<K> {
        let mut inner = self.inner.lock().await;
        let previous: HashSet<K> = inner.mapped_keys().into_iter().collect();

        let mut mapped = HashMap::new();
        let mut addresses = Vec::new();
        let mut current = HashSet::new();
        let mut added = Vec::new();
        for (key, mut address) in desired {
            let id = inner.resolve(&key, false);
            if mapped.contains_key(&id) {
                continue;
            }
            address.real_id = id;
            address.is_private = false;
            if !previous.contains(&key) {
                added.push(key.clone());
            }
            current.insert(key);
            addresses.push(address.clone());
            mapped.insert(id, address);
        }

        let removed = previous
            .into_iter()
            .filter(|key| !current.contains(key))
            .collect();
        inner.mapped = mapped;

        RemapResult {
            addresses,
            added,
            removed,
        }
    }
}

impl<K: Eq + Hash + Clone> Default for ChannelAddressTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(name: &str) -> ChannelAddress {
        ChannelAddress {
            real_id: 0,
            is_private: false,
            is_admin_channel: false,
            tag: None,
            connection_name: "irc.example.org".to_string(),
            friendly_name: name.to_string(),
        }
    }

    fn desired(names: &[&str]) -> Vec<(String, ChannelAddress)> {
        names
            .iter()
            .map(|n| (n.to_string(), address(n)))
            .collect()
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let table = ChannelAddressTable::new();
        let a = table.resolve(&"#a".to_string(), false).await;
        let b = table.resolve(&"#b".to_string(), false).await;
        assert_eq!(a, table.resolve(&"#a".to_string(), false).await);
        assert_ne!(a, b);
        assert_ne!(a, UNMAPPED_CHANNELS_ID);
        assert_eq!(a, 1);
    }

    #[tokio::test]
    async fn test_private_and_channel_keys_do_not_collide() {
        let table = ChannelAddressTable::new();
        let channel = table.resolve(&"same".to_string(), false).await;
        let private = table.resolve(&"same".to_string(), true).await;
        assert_ne!(channel, private);

        let target = table.lookup(private).await.unwrap();
        assert!(target.is_private);
        assert_eq!(target.key, "same");
        assert!(!table.lookup(channel).await.unwrap().is_private);
    }

    #[tokio::test]
    async fn test_lookup_unknown() {
        let table: ChannelAddressTable<u64> = ChannelAddressTable::new();
        assert!(table.lookup(42).await.is_none());
    }

    #[tokio::test]
    async fn test_remap_keeps_ids_and_diffs() {
        let table = ChannelAddressTable::new();
        let first = table.remap(desired(&["#a", "#b"])).await;
        assert_eq!(first.added, vec!["#a".to_string(), "#b".to_string()]);
        assert!(first.removed.is_empty());
        let b_id = first.addresses[1].real_id;
        let a_id = first.addresses[0].real_id;

        let second = table.remap(desired(&["#b", "#c"])).await;
        assert_eq!(second.added, vec!["#c".to_string()]);
        assert_eq!(second.removed, vec!["#a".to_string()]);
        assert_eq!(second.addresses[0].real_id, b_id);
        assert_eq!(second.addresses.len(), 2);

        // The unmapped channel is still addressable
        assert_eq!(table.lookup(a_id).await.unwrap().key, "#a");
        assert!(!table.is_mapped(&"#a".to_string()).await);
        assert!(table.is_mapped(&"#c".to_string()).await);
        assert!(table.mapped_address(a_id).await.is_none());

        // Mapping it again restores the old id
        let third = table.remap(desired(&["#a"])).await;
        assert_eq!(third.addresses[0].real_id, a_id);
    }

    #[tokio::test]
    async fn test_remap_deduplicates() {
        let table = ChannelAddressTable::new();
        let result = table.remap(desired(&["#a", "#a"])).await;
        assert_eq!(result.addresses.len(), 1);
        assert_eq!(table.mapped_keys().await, vec!["#a".to_string()]);
    }

    #[tokio::test]
    async fn test_resolved_channel_is_not_mapped() {
        let table = ChannelAddressTable::new();
        table.resolve(&"#random".to_string(), false).await;
        assert!(!table.is_mapped(&"#random".to_string()).await);
    }
}

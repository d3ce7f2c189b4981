//! Health record store backed by a concurrent map.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use finlink_core::{HealthRecordStore, ProviderHealthRecord, ProviderKey, Region, StoreError};

/// Health records held in a `DashMap`.
///
/// `update` runs under the map's entry lock, which serializes writers of the
/// same key while leaving other keys free.
#[derive(Debug, Default)]
pub struct MemoryHealthStore {
    records: DashMap<ProviderKey, ProviderHealthRecord>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl HealthRecordStore for MemoryHealthStore {
    fn get(&self, key: &ProviderKey) -> Result<Option<ProviderHealthRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    fn list_for_region(&self, region: Region) -> Result<Vec<ProviderHealthRecord>, StoreError> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.key().region == region)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(records)
    }

    fn update(
        &self,
        key: &ProviderKey,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut ProviderHealthRecord),
    ) -> Result<ProviderHealthRecord, StoreError> {
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| ProviderHealthRecord::new(key, now));
        apply(entry.value_mut());
        entry.updated_at = now;
        Ok(entry.value().clone())
    }

    fn remove(&self, key: &ProviderKey) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_creates_missing_record() {
        let store = MemoryHealthStore::new();
        let key = ProviderKey::new("plaid", Region::Us);
        let now = Utc::now();

        let record = store
            .update(&key, now, &mut |r| r.success_count += 1)
            .unwrap();

        assert_eq!(record.success_count, 1);
        assert_eq!(record.window_start_at, now);
        assert_eq!(store.get(&key).unwrap(), Some(record));
    }

    #[test]
    fn test_list_for_region_filters_and_sorts() {
        let store = MemoryHealthStore::new();
        let now = Utc::now();
        for (provider, region) in [("mx", Region::Us), ("plaid", Region::Us), ("truelayer", Region::Uk)] {
            store
                .update(&ProviderKey::new(provider, region), now, &mut |_| {})
                .unwrap();
        }

        let us = store.list_for_region(Region::Us).unwrap();
        let names: Vec<_> = us.iter().map(|r| r.provider.to_string()).collect();
        assert_eq!(names, vec!["mx", "plaid"]);
        assert!(store.list_for_region(Region::In).unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let store = MemoryHealthStore::new();
        let key = ProviderKey::new("mx", Region::Ca);
        store.update(&key, Utc::now(), &mut |_| {}).unwrap();
        store.remove(&key).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryHealthStore::new());
        let key = ProviderKey::new("plaid", Region::Us);
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store
                            .update(&key, now, &mut |r| r.failure_count += 1)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(&key).unwrap().unwrap().failure_count, 2000);
    }
}

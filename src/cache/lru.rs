//! Fixed-capacity key/value store with least-recently-used eviction.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::trace;

/// Returned by [`LruCache::get`] when the key is absent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("element '{0}' not in cache")]
pub struct CacheMiss(pub String);

/// Named, thread-safe LRU cache keyed by strings.
///
/// Every operation, including `get`, takes the same exclusive lock since
/// a hit reorders recency.
pub struct LruCache<V> {
  name: String,
  entries: Mutex<lru::LruCache<String, V>>,
}

impl<V: Clone> LruCache<V> {
  pub fn new(name: impl Into<String>, capacity: NonZeroUsize) -> Self {
    Self {
      name: name.into(),
      entries: Mutex::new(lru::LruCache::new(capacity)),
    }
  }

  /// Instance name, for logging.
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn capacity(&self) -> usize {
    self.lock().cap().get()
  }

  // Every operation leaves the inner cache consistent, so poisoning is ignored.
  fn lock(&self) -> MutexGuard<'_, lru::LruCache<String, V>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Insert or update `key`. Returns true if another entry was evicted to
  /// make room.
  pub fn add(&self, key: &str, value: V) -> bool {
    let mut entries = self.lock();
    if entries.contains(key) {
      entries.put(key.to_string(), value);
      return false;
    }
    match entries.push(key.to_string(), value) {
      Some((evicted, _)) => {
        trace!(cache = %self.name, key = %evicted, "evicted");
        true
      }
      None => false,
    }
  }

  /// Look up `key`, marking it as most recently used on a hit.
  pub fn get(&self, key: &str) -> Result<V, CacheMiss> {
    self
      .lock()
      .get(key)
      .cloned()
      .ok_or_else(|| CacheMiss(key.to_string()))
  }

  /// Remove `key`. Returns whether it was present.
  pub fn delete(&self, key: &str) -> bool {
    self.lock().pop(key).is_some()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Most recently used entry, without touching recency.
  #[cfg(test)]
  pub fn front(&self) -> Option<(String, V)> {
    self.lock().iter().next().map(|(k, v)| (k.clone(), v.clone()))
  }

  /// Least recently used entry (next to be evicted), without touching recency.
  #[cfg(test)]
  pub fn back(&self) -> Option<(String, V)> {
    self.lock().peek_lru().map(|(k, v)| (k.clone(), v.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn cache(capacity: usize) -> LruCache<i32> {
    LruCache::new("test", NonZeroUsize::new(capacity).unwrap())
  }

  #[test]
  fn test_add_new_element_goes_to_front() {
    let lru = cache(3);
    assert!(!lru.add("one", 1));
    assert!(!lru.add("two", 2));
    assert!(!lru.add("three", 3));

    assert_eq!(lru.front(), Some(("three".to_string(), 3)));
    assert_eq!(lru.back(), Some(("one".to_string(), 1)));
    assert_eq!(lru.len(), 3);
  }

  #[test]
  fn test_add_to_full_cache_evicts_oldest() {
    let lru = cache(3);
    lru.add("one", 1);
    lru.add("two", 2);
    lru.add("three", 3);

    assert!(lru.add("four", 4));
    assert_eq!(lru.len(), 3);
    assert_eq!(lru.get("one"), Err(CacheMiss("one".to_string())));
    assert_eq!(lru.back(), Some(("two".to_string(), 2)));
  }

  #[test]
  fn test_add_existing_key_updates_without_eviction() {
    let lru = cache(3);
    lru.add("one", 1);
    lru.add("two", 2);
    lru.add("three", 3);

    assert!(!lru.add("one", 10));
    assert_eq!(lru.len(), 3);
    assert_eq!(lru.front(), Some(("one".to_string(), 10)));
    assert_eq!(lru.back(), Some(("two".to_string(), 2)));
  }

  #[test]
  fn test_get_after_add_returns_value() {
    let lru = cache(2);
    assert!(!lru.add("k", 7));
    assert_eq!(lru.get("k"), Ok(7));
  }

  #[test]
  fn test_get_miss_leaves_order_alone() {
    let lru = cache(2);
    lru.add("a", 1);
    lru.add("b", 2);
    assert!(lru.get("zzz").is_err());
    assert_eq!(lru.front(), Some(("b".to_string(), 2)));
    assert_eq!(lru.back(), Some(("a".to_string(), 1)));
  }

  #[test]
  fn test_get_refreshes_recency() {
    // capacity 3; A, B, C; touch A; add D => B goes, not A
    let lru = cache(3);
    lru.add("A", 1);
    lru.add("B", 2);
    lru.add("C", 3);
    assert_eq!(lru.get("A"), Ok(1));

    assert!(lru.add("D", 4));
    assert!(lru.get("B").is_err());
    assert_eq!(lru.get("A"), Ok(1));
    assert_eq!(lru.get("C"), Ok(3));
    assert_eq!(lru.get("D"), Ok(4));
  }

  #[test]
  fn test_overflow_reports_exactly_one_eviction() {
    let capacity = 5;
    let lru = cache(capacity);
    let mut evictions = Vec::new();
    for i in 0..=capacity {
      evictions.push(lru.add(&format!("k{}", i), i as i32));
    }
    assert_eq!(evictions.iter().filter(|e| **e).count(), 1);
    assert!(evictions[capacity]);
    assert!(lru.get("k0").is_err());
    assert_eq!(lru.len(), capacity);
  }

  #[test]
  fn test_len_never_exceeds_capacity_and_victim_is_lru() {
    let lru = cache(4);
    // Reference model: most recent at the end.
    let mut model: Vec<String> = Vec::new();
    for step in 0..200u32 {
      let key = format!("k{}", (step * 7 + step / 3) % 11);
      if step % 3 == 0 {
        if lru.get(&key).is_ok() {
          model.retain(|k| k != &key);
          model.push(key);
        }
      } else {
        let expected_victim = if !model.contains(&key) && model.len() == 4 {
          Some(model.remove(0))
        } else {
          None
        };
        model.retain(|k| k != &key);
        model.push(key.clone());

        let evicted = lru.add(&key, step as i32);
        assert_eq!(evicted, expected_victim.is_some());
        if let Some(victim) = expected_victim {
          assert!(lru.get(&victim).is_err());
          // The probe above missed, so recency is unchanged.
        }
      }
      assert!(lru.len() <= 4);
      assert_eq!(lru.len(), model.len());
    }
  }

  #[test]
  fn test_delete() {
    let lru = cache(2);
    lru.add("a", 1);
    assert!(lru.delete("a"));
    assert!(!lru.delete("a"));
    assert!(lru.is_empty());
    assert!(lru.front().is_none());

    lru.add("b", 2);
    lru.add("c", 3);
    assert!(lru.add("d", 4));
    assert_eq!(lru.back(), Some(("c".to_string(), 3)));
  }

  #[test]
  fn test_delete_middle_keeps_links() {
    let lru = cache(3);
    lru.add("a", 1);
    lru.add("b", 2);
    lru.add("c", 3);
    assert!(lru.delete("b"));
    assert_eq!(lru.front(), Some(("c".to_string(), 3)));
    assert_eq!(lru.back(), Some(("a".to_string(), 1)));
    assert!(!lru.add("d", 4));
    assert!(lru.add("e", 5));
    assert!(lru.get("a").is_err());
  }

  #[test]
  fn test_concurrent_access() {
    let lru = Arc::new(cache(16));
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let lru = Arc::clone(&lru);
        std::thread::spawn(move || {
          for i in 0..500 {
            let key = format!("{}-{}", t, i % 20);
            lru.add(&key, i);
            let _ = lru.get(&key);
            if i % 7 == 0 {
              lru.delete(&key);
            }
            assert!(lru.len() <= 16);
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert!(lru.len() <= 16);
  }
}

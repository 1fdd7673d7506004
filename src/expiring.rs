use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Map with per-entry TTL. Expired entries are reaped lazily on every
/// mutating call, so no background task is needed. Not internally
/// synchronized; callers wrap it in a mutex.
pub struct ExpiringMap<K, V> {
    ttl: Duration,
    map: HashMap<K, Entry<V>>,
    // Insertion-ordered expiry markers. An entry that was re-inserted or
    // touched has stale markers in here; reap checks the live expiry in
    // `map` before evicting.
    order: VecDeque<(Instant, K)>,
}

impl<K: Eq + Hash + Clone, V> ExpiringMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.reap();
        let expires_at = Instant::now() + self.ttl;
        self.order.push_back((expires_at, key.clone()));
        self.map.insert(key, Entry { value, expires_at });
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let entry = self.map.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(&entry.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let entry = self.map.get_mut(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(&mut entry.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.reap();
        let entry = self.map.remove(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value)
    }

    /// Extend an entry's lifetime by a full TTL from now.
    pub fn touch(&mut self, key: &K) {
        let now = Instant::now();
        if let Some(entry) = self.map.get_mut(key) {
            if entry.expires_at > now {
                entry.expires_at = now + self.ttl;
                self.order.push_back((entry.expires_at, key.clone()));
            }
        }
    }

    fn reap(&mut self) {
        let now = Instant::now();
        while let Some((marker_expiry, _)) = self.order.front() {
            if *marker_expiry > now {
                break;
            }
            let (_, key) = self.order.pop_front().unwrap();
            if let Some(entry) = self.map.get(&key) {
                if entry.expires_at <= now {
                    self.map.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut map: ExpiringMap<u32, &str> = ExpiringMap::new(Duration::from_secs(60));
        map.insert(1, "one");
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.remove(&1), Some("one"));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.remove(&1), None);
    }

    #[test]
    fn test_expiry() {
        let mut map: ExpiringMap<u32, &str> = ExpiringMap::new(Duration::from_millis(0));
        map.insert(1, "one");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(map.get(&1), None);
        // A later insert reaps the dead entry.
        map.insert(2, "two");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let mut map: ExpiringMap<u32, &str> = ExpiringMap::new(Duration::from_secs(60));
        map.insert(1, "one");
        map.insert(1, "uno");
        assert_eq!(map.get(&1), Some(&"uno"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_touch_extends() {
        let mut map: ExpiringMap<u32, &str> = ExpiringMap::new(Duration::from_millis(50));
        map.insert(1, "one");
        std::thread::sleep(Duration::from_millis(30));
        map.touch(&1);
        std::thread::sleep(Duration::from_millis(30));
        // 60ms since insert but only 30ms since touch.
        assert_eq!(map.get(&1), Some(&"one"));
    }
}

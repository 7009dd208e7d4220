use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Resident instances ordered by last access, then creation sequence.
#[derive(Debug, Default)]
pub struct LruIndex {
    order: BTreeSet<(Instant, u64, String)>,
    positions: HashMap<String, (Instant, u64)>,
}

impl LruIndex {
    pub fn touch(&mut self, key: &str, seq: u64, at: Instant) {
        self.remove(key);
        self.order.insert((at, seq, key.to_string()));
        self.positions.insert(key.to_string(), (at, seq));
    }

    pub fn remove(&mut self, key: &str) {
        if let Some((at, seq)) = self.positions.remove(key) {
            self.order.remove(&(at, seq, key.to_string()));
        }
    }

    /// Least recently used key accepted by `pred`
    pub fn oldest_matching(&self, mut pred: impl FnMut(&str) -> bool) -> Option<&str> {
        self.order
            .iter()
            .map(|(_, _, key)| key.as_str())
            .find(|key| pred(key))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_orders_by_access_then_sequence() {
        let t = Instant::now();
        let mut lru = LruIndex::default();
        lru.touch("b", 2, t);
        lru.touch("a", 1, t);
        lru.touch("c", 3, t + Duration::from_millis(1));
        assert_eq!(lru.oldest_matching(|_| true), Some("a"));

        lru.touch("a", 1, t + Duration::from_millis(2));
        assert_eq!(lru.oldest_matching(|_| true), Some("b"));
        assert_eq!(lru.oldest_matching(|k| k != "b"), Some("c"));

        lru.remove("b");
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.oldest_matching(|_| true), Some("c"));
    }

    #[test]
    fn test_retouch_and_remove_leave_no_stale_entries() {
        let t = Instant::now();
        let mut lru = LruIndex::default();
        lru.touch("a", 1, t);
        lru.touch("a", 1, t + Duration::from_millis(1));
        assert_eq!(lru.len(), 1);

        lru.remove("a");
        lru.remove("a");
        assert!(lru.is_empty());
        assert_eq!(lru.oldest_matching(|_| true), None);
    }
}

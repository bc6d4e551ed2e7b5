//! Suspended-flow pools
//!
//! A flow waiting on crypto is parked in a fixed-capacity slab. The slot
//! index plus a per-slot generation form the op's [`OpTag`]; a completion
//! carrying a tag whose generation no longer matches is stale and ignored.

use p4dp_common::LcoreId;

/// Identity of an in-flight op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpTag {
    /// Submitting lcore
    pub lcore: LcoreId,
    /// Slot in the lcore's pool
    pub slot: u32,
    /// Slot generation at submission
    pub generation: u32,
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Bounded pool of parked flows
pub struct ContextPool<T> {
    lcore: LcoreId,
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> ContextPool<T> {
    /// Create pool with `capacity` slots
    pub fn new(lcore: LcoreId, capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Entry {
                generation: 0,
                value: None,
            })
            .collect();
        // Pop order hands out slot 0 first.
        let free = (0..capacity as u32).rev().collect();
        Self { lcore, entries, free }
    }

    /// Park `value`; gives it back when the pool is exhausted
    #[inline]
    pub fn insert(&mut self, value: T) -> Result<OpTag, T> {
        let Some(slot) = self.free.pop() else {
            return Err(value);
        };
        let entry = &mut self.entries[slot as usize];
        entry.value = Some(value);
        Ok(OpTag {
            lcore: self.lcore,
            slot,
            generation: entry.generation,
        })
    }

    /// Take back the flow parked under `tag`
    #[inline]
    pub fn remove(&mut self, tag: OpTag) -> Option<T> {
        if tag.lcore != self.lcore {
            return None;
        }
        let entry = self.entries.get_mut(tag.slot as usize)?;
        if entry.generation != tag.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(tag.slot);
        Some(value)
    }

    /// Parked flows
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Check if nothing is parked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

impl<T> std::fmt::Debug for ContextPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("lcore", &self.lcore)
            .field("in_use", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_exhausted() {
        let mut pool = ContextPool::new(0, 2);
        let a = pool.insert("a").unwrap();
        let _b = pool.insert("b").unwrap();
        assert_eq!(pool.insert("c"), Err("c"));
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.remove(a), Some("a"));
        assert!(pool.insert("c").is_ok());
    }

    #[test]
    fn test_stale_tag_rejected() {
        let mut pool = ContextPool::new(7, 1);
        let first = pool.insert(1).unwrap();
        assert_eq!(pool.remove(first), Some(1));

        let second = pool.insert(2).unwrap();
        assert_eq!(second.slot, first.slot);
        assert_ne!(second.generation, first.generation);
        assert_eq!(pool.remove(first), None);
        assert_eq!(pool.remove(second), Some(2));
    }

    #[test]
    fn test_foreign_lcore_tag_rejected() {
        let mut pool = ContextPool::new(1, 1);
        let mut tag = pool.insert(()).unwrap();
        tag.lcore = 2;
        assert_eq!(pool.remove(tag), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_zero_capacity() {
        let mut pool: ContextPool<u8> = ContextPool::new(0, 0);
        assert!(pool.insert(1).is_err());
        assert!(pool.is_empty());
    }
}

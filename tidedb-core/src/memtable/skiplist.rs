//! Skip list implementation for the memtable
//!
//! A probabilistic ordered structure keyed by timestamp, providing expected
//! O(log n) insert and lookup. Row payloads live in the cache arena; the list
//! stores index-typed node handles and [`RowSlot`] values only, so freezing a
//! memtable never touches the list itself.

use crate::cache::RowSlot;
use crate::TsKey;
use rand::Rng;

/// Maximum tower height
pub const MAX_LEVEL: usize = 5;
const BRANCHING_FACTOR: u32 = 4;

/// Bytes of node link area accounted per tower level
pub const LINK_WIDTH: usize = 8;

/// An ordered map from timestamp to row slot
pub struct SkipList {
    nodes: Vec<Node>,
    head: [Option<u32>; MAX_LEVEL],
    level: usize,
    len: usize,
}

struct Node {
    key: TsKey,
    slot: RowSlot,
    forward: Vec<Option<u32>>,
}

impl SkipList {
    /// Create an empty skip list
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: [None; MAX_LEVEL],
            level: 1,
            len: 0,
        }
    }

    /// Draw a tower height for the next insert
    pub fn random_level(&self) -> usize {
        let mut lvl = 1;
        let mut rng = rand::thread_rng();
        while rng.gen_ratio(1, BRANCHING_FACTOR) && lvl < MAX_LEVEL {
            lvl += 1;
        }
        lvl
    }

    /// Insert a key with its row slot.
    ///
    /// An existing key is updated, never duplicated; the replaced slot is
    /// returned so the caller can account for it. `level` must come from
    /// [`SkipList::random_level`], drawn before the row allocation so the
    /// allocation can include the link-area reserve.
    pub fn insert(&mut self, key: TsKey, slot: RowSlot, level: usize) -> Option<RowSlot> {
        debug_assert!((1..=MAX_LEVEL).contains(&level));
        let mut update: [Option<u32>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut current: Option<u32> = None;

        // Find the splice position and collect the update chain
        for i in (0..self.level).rev() {
            while let Some(next) = self.next(current, i) {
                if self.nodes[next as usize].key < key {
                    current = Some(next);
                } else {
                    break;
                }
            }
            update[i] = current;
        }

        // Equal keys are an update, never an insert
        if let Some(next) = self.next(current, 0) {
            let node = &mut self.nodes[next as usize];
            if node.key == key {
                return Some(std::mem::replace(&mut node.slot, slot));
            }
        }

        if level > self.level {
            for entry in update.iter_mut().take(level).skip(self.level) {
                *entry = None;
            }
            self.level = level;
        }

        let id = self.nodes.len() as u32;
        let mut forward = vec![None; level];
        for (i, link) in forward.iter_mut().enumerate() {
            *link = self.next(update[i], i);
        }
        self.nodes.push(Node { key, slot, forward });
        for (i, prev) in update.iter().enumerate().take(level) {
            self.set_next(*prev, i, Some(id));
        }

        self.len += 1;
        None
    }

    /// Look up the slot stored for a key
    pub fn get(&self, key: TsKey) -> Option<RowSlot> {
        let mut current: Option<u32> = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.next(current, i) {
                let node = &self.nodes[next as usize];
                match node.key.cmp(&key) {
                    std::cmp::Ordering::Less => current = Some(next),
                    std::cmp::Ordering::Equal => return Some(node.slot),
                    std::cmp::Ordering::Greater => break,
                }
            }
        }
        None
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            next: self.head[0],
        }
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First node handle in key order
    pub(crate) fn first(&self) -> Option<u32> {
        self.head[0]
    }

    /// Node handle following `id` in key order
    pub(crate) fn next_of(&self, id: u32) -> Option<u32> {
        self.nodes[id as usize].forward[0]
    }

    /// Key and slot stored at a node handle
    pub(crate) fn entry(&self, id: u32) -> (TsKey, RowSlot) {
        let node = &self.nodes[id as usize];
        (node.key, node.slot)
    }

    fn next(&self, node: Option<u32>, lvl: usize) -> Option<u32> {
        match node {
            None => self.head[lvl],
            Some(id) => self.nodes[id as usize].forward[lvl],
        }
    }

    fn set_next(&mut self, node: Option<u32>, lvl: usize, target: Option<u32>) {
        match node {
            None => self.head[lvl] = target,
            Some(id) => self.nodes[id as usize].forward[lvl] = target,
        }
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered iterator over a skip list
pub struct Iter<'a> {
    list: &'a SkipList,
    next: Option<u32>,
}

impl Iterator for Iter<'_> {
    type Item = (TsKey, RowSlot);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = &self.list.nodes[id as usize];
        self.next = node.forward[0];
        Some((node.key, node.slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(tag: u32) -> RowSlot {
        RowSlot {
            block: 0,
            offset: tag,
            len: 1,
        }
    }

    #[test]
    fn test_insert_get() {
        let mut list = SkipList::new();
        for i in 0..100 {
            let level = list.random_level();
            assert!(list.insert(i, slot(i as u32), level).is_none());
        }

        assert_eq!(list.len(), 100);
        for i in 0..100 {
            assert_eq!(list.get(i), Some(slot(i as u32)));
        }
        assert_eq!(list.get(200), None);
    }

    #[test]
    fn test_iter_is_sorted() {
        let mut list = SkipList::new();
        for key in [30i64, 10, 50, 20, 40] {
            let level = list.random_level();
            list.insert(key, slot(key as u32), level);
        }

        let keys: Vec<_> = list.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_duplicate_key_updates() {
        let mut list = SkipList::new();
        let level = list.random_level();
        list.insert(1, slot(10), level);

        let level = list.random_level();
        let replaced = list.insert(1, slot(20), level);
        assert_eq!(replaced, Some(slot(10)));
        assert_eq!(list.get(1), Some(slot(20)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_random_level_bounded() {
        let list = SkipList::new();
        for _ in 0..1000 {
            let level = list.random_level();
            assert!((1..=MAX_LEVEL).contains(&level));
        }
    }
}

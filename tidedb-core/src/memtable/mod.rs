//! Per-table memtable
//!
//! An ordered-by-timestamp set of rows for exactly one table, pending durable
//! write. Row bytes live in the shared cache arena; the memtable owns only
//! index-typed handles, so freezing a table is a handle swap performed by the
//! registry and the structure itself never changes.

mod skiplist;

pub use skiplist::{SkipList, LINK_WIDTH, MAX_LEVEL};

use crate::cache::{Cache, MemGeneration, RowSlot};
use crate::schema::{row_key, Schema};
use crate::{Result, TsKey};
use std::sync::Arc;

/// In-memory ordered row set for one table
pub struct MemTable {
    arena: Arc<MemGeneration>,
    schema: Arc<Schema>,
    list: SkipList,
    key_first: TsKey,
    key_last: TsKey,
}

impl MemTable {
    /// Create an empty memtable drawing from the given arena generation.
    ///
    /// The schema is pinned for the memtable's lifetime; every block written
    /// from it carries this schema's version.
    pub fn new(arena: Arc<MemGeneration>, schema: Arc<Schema>) -> Self {
        Self {
            arena,
            schema,
            list: SkipList::new(),
            key_first: TsKey::MAX,
            key_last: TsKey::MIN,
        }
    }

    /// The pinned schema
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Insert one serialized row, overwriting any row with the same key
    pub fn insert(&mut self, cache: &Cache, row: &[u8]) -> Result<()> {
        self.schema.check_row(row)?;
        let key = row_key(row);

        // Tower height is drawn first so the allocation covers the link area
        let level = self.list.random_level();
        let slot = cache.allocate(key, row, level * LINK_WIDTH)?;
        debug_assert!(Arc::ptr_eq(&cache.current(), &self.arena));

        // A replaced slot stays in the arena until the generation is
        // reclaimed; last-writer-wins is what callers observe.
        self.list.insert(key, slot, level);
        if key < self.key_first {
            self.key_first = key;
        }
        if key > self.key_last {
            self.key_last = key;
        }
        Ok(())
    }

    /// Smallest key present
    pub fn key_first(&self) -> TsKey {
        self.key_first
    }

    /// Largest key present
    pub fn key_last(&self) -> TsKey {
        self.key_last
    }

    /// Number of distinct keys
    pub fn num_points(&self) -> usize {
        self.list.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Look up the row stored for a key
    pub fn get(&self, key: TsKey) -> Option<Vec<u8>> {
        self.list.get(key).map(|slot| self.arena.row_to_vec(slot))
    }

    /// Iterate `(key, slot)` entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (TsKey, RowSlot)> + '_ {
        self.list.iter()
    }

    /// Read the row behind a slot
    pub fn with_row<R>(&self, slot: RowSlot, f: impl FnOnce(&[u8]) -> R) -> R {
        self.arena.with_row(slot, f)
    }

    fn first_node(&self) -> Option<u32> {
        self.list.first()
    }
}

/// Forward-only cursor over a frozen memtable.
///
/// Owns its memtable reference so the commit pipeline can hold one cursor per
/// table across the whole partition loop.
pub struct MemCursor {
    table: Arc<MemTable>,
    node: Option<u32>,
}

impl MemCursor {
    /// Open a cursor positioned on the first row
    pub fn new(table: Arc<MemTable>) -> Self {
        let node = table.first_node();
        Self { table, node }
    }

    /// Key of the current row, `None` once exhausted
    pub fn key(&self) -> Option<TsKey> {
        self.node.map(|id| self.table.list.entry(id).0)
    }

    /// Read the current row
    pub fn with_row<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.node.map(|id| {
            let (_, slot) = self.table.list.entry(id);
            self.table.arena.with_row(slot, f)
        })
    }

    /// The memtable this cursor reads
    pub fn table(&self) -> &Arc<MemTable> {
        &self.table
    }

    /// Advance to the next row; returns whether a row is available
    pub fn advance(&mut self) -> bool {
        if let Some(id) = self.node {
            self.node = self.table.list.next_of(id);
        }
        self.node.is_some()
    }
}

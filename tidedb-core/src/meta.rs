//! Table registry
//!
//! Maps `(uid, tid)` to a table handle carrying the schema and the table's
//! active and frozen memtables. The registry is persisted to `<root>/META`
//! so a reopened repository knows its tables again.

use crate::memtable::MemTable;
use crate::schema::Schema;
use crate::{Result, TableId, TideError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Name of the registry file under the repository root
pub const META_FILE_NAME: &str = "META";

/// The two table variants; they share the whole write path and differ only
/// in tag metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableKind {
    /// A standalone table
    Normal,
    /// A table belonging to a super table, carrying its tag values
    Child {
        /// Uid of the super table
        super_uid: u64,
        /// Encoded tag row (opaque to the engine)
        tags: Vec<u8>,
    },
}

/// Everything needed to (re)install a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table identity
    pub id: TableId,
    /// Variant and tag metadata
    pub kind: TableKind,
    /// Row schema
    pub schema: Schema,
}

/// A registered table
pub struct Table {
    /// Table identity
    pub id: TableId,
    /// Variant and tag metadata
    pub kind: TableKind,
    /// Current row schema
    pub schema: Arc<Schema>,
    /// Active memtable, lazily created on first insert
    pub(crate) mem: Option<MemTable>,
    /// Frozen memtable being committed
    pub(crate) imem: Option<Arc<MemTable>>,
}

impl Table {
    fn new(config: TableConfig) -> Self {
        Self {
            id: config.id,
            kind: config.kind,
            schema: Arc::new(config.schema),
            mem: None,
            imem: None,
        }
    }

    /// Snapshot the table's configuration
    pub fn config(&self) -> TableConfig {
        TableConfig {
            id: self.id,
            kind: self.kind.clone(),
            schema: (*self.schema).clone(),
        }
    }
}

/// The table registry
pub struct Meta {
    tables: Vec<Option<Table>>,
    path: PathBuf,
    num_tables: usize,
}

impl Meta {
    /// Create an empty registry for `max_tables` dense slots
    pub fn new(root_dir: &Path, max_tables: usize) -> Self {
        let mut tables = Vec::with_capacity(max_tables);
        tables.resize_with(max_tables, || None);
        Self {
            tables,
            path: root_dir.join(META_FILE_NAME),
            num_tables: 0,
        }
    }

    /// Rebuild the registry from the META file, if one exists
    pub fn restore(root_dir: &Path, max_tables: usize) -> Result<Self> {
        let mut meta = Self::new(root_dir, max_tables);
        if !meta.path.exists() {
            return Ok(meta);
        }
        let data = fs::read(&meta.path)?;
        let configs: Vec<TableConfig> = bincode::deserialize(&data)
            .map_err(|e| TideError::CorruptOnDisk(format!("META file: {e}")))?;
        for config in configs {
            meta.install(config)?;
        }
        Ok(meta)
    }

    /// Number of registered tables
    pub fn num_tables(&self) -> usize {
        self.num_tables
    }

    /// Dense slot capacity
    pub fn capacity(&self) -> usize {
        self.tables.len()
    }

    /// Register a new table
    pub fn create(&mut self, config: TableConfig) -> Result<()> {
        let tid = config.id.tid;
        self.check_tid(tid)?;
        if self.tables[tid as usize].is_some() {
            return Err(TideError::InvalidFormat(format!(
                "table slot {tid} is already occupied"
            )));
        }
        let id = config.id;
        self.install(config)?;
        self.save()?;
        info!(uid = id.uid, tid = id.tid, "created table");
        Ok(())
    }

    /// Replace a table's schema with a strictly newer version
    pub fn alter(&mut self, config: TableConfig) -> Result<()> {
        let table = self.validate_for_insert(config.id)?;
        if config.schema.version() <= table.schema.version() {
            return Err(TideError::InvalidFormat(format!(
                "alter requires a newer schema version than {}",
                table.schema.version()
            )));
        }
        table.schema = Arc::new(config.schema);
        table.kind = config.kind;
        self.save()?;
        Ok(())
    }

    /// Drop a table, tombstoning its slot
    pub fn drop_table(&mut self, id: TableId) -> Result<()> {
        self.validate_for_insert(id)?;
        self.tables[id.tid as usize] = None;
        self.num_tables -= 1;
        self.save()?;
        info!(uid = id.uid, tid = id.tid, "dropped table");
        Ok(())
    }

    /// Resolve a table for insert: slot in range, occupied, and uid matching
    pub fn validate_for_insert(&mut self, id: TableId) -> Result<&mut Table> {
        self.check_tid(id.tid)?;
        let table = self.tables[id.tid as usize]
            .as_mut()
            .ok_or(TideError::TableUnknown { tid: id.tid })?;
        if table.id.uid != id.uid {
            return Err(TideError::TableUidMismatch {
                tid: id.tid,
                expected: table.id.uid,
                actual: id.uid,
            });
        }
        Ok(table)
    }

    /// Look up a table by dense id
    pub fn table(&self, tid: i32) -> Option<&Table> {
        self.tables.get(tid as usize).and_then(|slot| slot.as_ref())
    }

    /// Mutable access to a slot by dense id
    pub fn table_mut(&mut self, tid: i32) -> Option<&mut Table> {
        self.tables.get_mut(tid as usize).and_then(|slot| slot.as_mut())
    }

    /// Iterate occupied slots mutably (the freeze path)
    pub fn tables_mut(&mut self) -> impl Iterator<Item = &mut Table> {
        self.tables.iter_mut().filter_map(|slot| slot.as_mut())
    }

    /// Iterate occupied slots
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter_map(|slot| slot.as_ref())
    }

    fn install(&mut self, config: TableConfig) -> Result<()> {
        let tid = config.id.tid;
        self.check_tid(tid)?;
        self.tables[tid as usize] = Some(Table::new(config));
        self.num_tables += 1;
        Ok(())
    }

    fn check_tid(&self, tid: i32) -> Result<()> {
        if tid < 0 || tid as usize >= self.tables.len() {
            return Err(TideError::OutOfBounds(format!(
                "tid {tid} outside [0, {})",
                self.tables.len()
            )));
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let configs: Vec<TableConfig> = self.tables().map(|t| t.config()).collect();
        let data = bincode::serialize(&configs)
            .map_err(|e| TideError::InvalidFormat(format!("META encode: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};
    use tempfile::TempDir;

    fn table_config(uid: u64, tid: i32, version: u32) -> TableConfig {
        TableConfig {
            id: TableId::new(uid, tid),
            kind: TableKind::Normal,
            schema: Schema::new(
                version,
                vec![
                    ColumnSchema::new(0, ColumnType::Timestamp),
                    ColumnSchema::new(1, ColumnType::Double),
                ],
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_create_and_validate() {
        let temp_dir = TempDir::new().unwrap();
        let mut meta = Meta::new(temp_dir.path(), 10);

        meta.create(table_config(42, 0, 1)).unwrap();
        assert_eq!(meta.num_tables(), 1);

        let table = meta.validate_for_insert(TableId::new(42, 0)).unwrap();
        assert_eq!(table.schema.version(), 1);
    }

    #[test]
    fn test_validate_errors() {
        let temp_dir = TempDir::new().unwrap();
        let mut meta = Meta::new(temp_dir.path(), 10);
        meta.create(table_config(42, 0, 1)).unwrap();

        assert!(matches!(
            meta.validate_for_insert(TableId::new(42, 20)),
            Err(TideError::OutOfBounds(_))
        ));
        assert!(matches!(
            meta.validate_for_insert(TableId::new(42, 1)),
            Err(TideError::TableUnknown { tid: 1 })
        ));
        assert!(matches!(
            meta.validate_for_insert(TableId::new(7, 0)),
            Err(TideError::TableUidMismatch {
                tid: 0,
                expected: 42,
                actual: 7
            })
        ));
    }

    #[test]
    fn test_occupied_slot_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut meta = Meta::new(temp_dir.path(), 10);
        meta.create(table_config(42, 0, 1)).unwrap();
        assert!(meta.create(table_config(43, 0, 1)).is_err());
    }

    #[test]
    fn test_drop_tombstones_slot() {
        let temp_dir = TempDir::new().unwrap();
        let mut meta = Meta::new(temp_dir.path(), 10);
        meta.create(table_config(42, 0, 1)).unwrap();

        meta.drop_table(TableId::new(42, 0)).unwrap();
        assert_eq!(meta.num_tables(), 0);
        assert!(meta.table(0).is_none());

        // The slot is reusable afterwards
        meta.create(table_config(50, 0, 1)).unwrap();
        assert_eq!(meta.table(0).unwrap().id.uid, 50);
    }

    #[test]
    fn test_alter_requires_newer_version() {
        let temp_dir = TempDir::new().unwrap();
        let mut meta = Meta::new(temp_dir.path(), 10);
        meta.create(table_config(42, 0, 1)).unwrap();

        assert!(meta.alter(table_config(42, 0, 1)).is_err());
        meta.alter(table_config(42, 0, 2)).unwrap();
        assert_eq!(meta.table(0).unwrap().schema.version(), 2);
    }

    #[test]
    fn test_restore_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut meta = Meta::new(temp_dir.path(), 10);
            meta.create(table_config(42, 0, 1)).unwrap();
            let child = TableConfig {
                kind: TableKind::Child {
                    super_uid: 99,
                    tags: vec![1, 2, 3],
                },
                ..table_config(43, 5, 2)
            };
            meta.create(child).unwrap();
        }

        let mut restored = Meta::restore(temp_dir.path(), 10).unwrap();
        assert_eq!(restored.num_tables(), 2);
        assert!(restored.validate_for_insert(TableId::new(43, 5)).is_ok());
        match &restored.table(5).unwrap().kind {
            TableKind::Child { super_uid, tags } => {
                assert_eq!(*super_uid, 99);
                assert_eq!(tags, &vec![1, 2, 3]);
            }
            TableKind::Normal => panic!("expected child table"),
        }
    }
}

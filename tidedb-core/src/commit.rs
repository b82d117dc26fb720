//! Background commit pipeline
//!
//! Promotes the frozen generation into the on-disk file groups. The pipeline
//! reads only frozen state: the caller hands it one cursor per table plus the
//! frozen cache generation, all captured under the repository mutex at
//! trigger time. File groups are rewritten copy-then-rename: new index
//! content goes to `f<fid>.h` (and `f<fid>.l` when the last file is being
//! compacted) and the renames land `.l` before `.h`, so a torn commit leaves
//! the old head still pointing at the files it was written against.

use crate::fgroup::blockio::{
    copy_block_data, load_block_cols, load_idx, load_info, read_info_bytes,
    write_block, write_idx,
};
use crate::fgroup::format::{
    encode_file_header, BlockIdx, BlockInfo, SuperBlock, FILE_HEAD_SIZE,
    IDX_ENTRY_SIZE,
};
use crate::fgroup::{file_path, DataFile, FileDir, FileGroup, MAX_LAST_FILE_SIZE};
use crate::memtable::MemCursor;
use crate::schema::{DataCols, Schema};
use crate::types::{file_id_of, file_key_range, TimeRange};
use crate::{MemGeneration, RepoConfig, Result, TideError, TsKey};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Frozen state of one table, captured at trigger time
pub(crate) struct TableCommit {
    pub tid: i32,
    pub uid: u64,
    pub cursor: MemCursor,
}

impl TableCommit {
    fn schema(&self) -> Arc<Schema> {
        self.cursor.table().schema().clone()
    }
}

/// Run phases 1 and 2: plan the partition range and rewrite every partition
/// that has data. Publication (phase 3) stays with the caller, which owns the
/// repository mutex.
pub(crate) fn run(
    cfg: &RepoConfig,
    data_dir: &Path,
    files: &Mutex<FileDir>,
    frozen: &MemGeneration,
    tables: &mut [TableCommit],
) -> Result<()> {
    if frozen.is_empty() {
        return Ok(());
    }

    let sfid = file_id_of(frozen.key_first(), cfg.days_per_file, cfg.precision);
    let efid = file_id_of(frozen.key_last(), cfg.days_per_file, cfg.precision);
    debug!(sfid, efid, rows = frozen.num_rows(), "committing frozen generation");

    for fid in sfid..=efid {
        commit_to_file(cfg, data_dir, files, tables, fid)?;
    }
    info!(sfid, efid, rows = frozen.num_rows(), "commit finished");
    Ok(())
}

fn commit_to_file(
    cfg: &RepoConfig,
    data_dir: &Path,
    files: &Mutex<FileDir>,
    tables: &mut [TableCommit],
    fid: i32,
) -> Result<()> {
    let window = file_key_range(fid, cfg.days_per_file, cfg.precision);
    let has_data = tables
        .iter()
        .any(|t| t.cursor.key().is_some_and(|k| window.contains(k)));
    if !has_data {
        return Ok(());
    }

    let group = {
        let mut dir = files.lock();
        dir.create(data_dir, fid, cfg.max_tables as usize)?.clone()
    };

    let mut partition = PartitionCommit::open(cfg, data_dir, &group, window)?;
    if let Err(err) = partition.commit_tables(tables) {
        partition.abandon();
        return Err(err);
    }
    let new_group = partition.publish(&group)?;
    files.lock().update(new_group);
    debug!(fid, "partition rewritten");
    Ok(())
}

/// A super-block in the working set, tagged with where its tail bytes live.
///
/// Tail blocks written during this commit sit in the new last file whenever
/// that file is being rewritten; tail blocks inherited from the old info
/// region still live in the old one.
struct WorkingSuper {
    sup: SuperBlock,
    fresh: bool,
}

/// In-flight rewrite of one partition
struct PartitionCommit<'a> {
    cfg: &'a RepoConfig,
    window: TimeRange,
    old_head: File,
    data_file: File,
    last_file: File,
    new_head: File,
    new_last: Option<File>,
    head_tmp: PathBuf,
    last_tmp: PathBuf,
    info_offset: u64,
    new_idx: Vec<BlockIdx>,
    old_idx: Vec<BlockIdx>,
}

impl<'a> PartitionCommit<'a> {
    fn open(
        cfg: &'a RepoConfig,
        data_dir: &Path,
        group: &FileGroup,
        window: TimeRange,
    ) -> Result<Self> {
        let max_tables = cfg.max_tables as usize;
        let mut old_head = group.head.open_read()?;
        let old_idx = load_idx(&mut old_head, max_tables)?;

        let head_tmp = file_path(data_dir, group.file_id, ".h");
        let mut new_head = create_temp(&head_tmp)?;
        new_head.write_all(&vec![0u8; max_tables * IDX_ENTRY_SIZE])?;

        // An oversized last file is compacted by rewriting it alongside the
        // head; otherwise new tail blocks append to the existing one.
        let rewrite_last = group.last.size > MAX_LAST_FILE_SIZE;
        let last_tmp = file_path(data_dir, group.file_id, ".l");
        let new_last = if rewrite_last {
            Some(create_temp(&last_tmp)?)
        } else {
            None
        };

        Ok(Self {
            cfg,
            window,
            old_head,
            data_file: group.data.open_rw()?,
            last_file: group.last.open_rw()?,
            new_head,
            new_last,
            head_tmp,
            last_tmp,
            info_offset: FILE_HEAD_SIZE + (max_tables * IDX_ENTRY_SIZE) as u64,
            new_idx: vec![BlockIdx::default(); max_tables],
            old_idx,
        })
    }

    fn commit_tables(&mut self, tables: &mut [TableCommit]) -> Result<()> {
        for tid in 0..self.cfg.max_tables {
            let old = self.old_idx[tid as usize];
            let pos = tables.binary_search_by_key(&tid, |t| t.tid).ok();
            let has_new = pos.is_some_and(|p| {
                tables[p]
                    .cursor
                    .key()
                    .is_some_and(|k| self.window.contains(k))
            });

            if !has_new {
                if !old.is_none() {
                    self.carry_forward(tid, &old)?;
                }
                continue;
            }
            let table = &mut tables[pos.expect("has_new implies a slot")];
            self.commit_table(table, &old)?;
        }
        write_idx(&mut self.new_head, &self.new_idx)?;

        self.new_head.sync_all()?;
        self.data_file.sync_all()?;
        match &self.new_last {
            Some(file) => file.sync_all()?,
            None => self.last_file.sync_all()?,
        }
        Ok(())
    }

    /// The table has no rows in this window; keep its on-disk state
    fn carry_forward(&mut self, tid: i32, old: &BlockIdx) -> Result<()> {
        if self.new_last.is_none() || !old.has_last {
            // Identical bytes, new location
            let bytes = read_info_bytes(&mut self.old_head, old)?;
            self.new_head.seek(SeekFrom::Start(self.info_offset))?;
            self.new_head.write_all(&bytes)?;
            self.new_idx[tid as usize] = BlockIdx {
                offset: self.info_offset as u32,
                ..*old
            };
            self.info_offset += bytes.len() as u64;
            return Ok(());
        }

        // The last file is being rewritten: relocate the tail block,
        // coalescing any sub-block run into a single block
        let info = load_info(&mut self.old_head, old)?;
        let mut supers = info.supers;
        for sup in &mut supers {
            if sup.meta.last {
                let meta = copy_block_data(
                    self.new_last.as_mut().expect("rewrite in progress"),
                    &mut self.data_file,
                    &mut self.last_file,
                    sup,
                    true,
                )?;
                *sup = SuperBlock::plain(meta);
            }
        }
        let rewritten = BlockInfo {
            uid: info.uid,
            supers,
        };
        self.new_idx[tid as usize] = self.append_info(&rewritten)?;
        Ok(())
    }

    /// Drain the table's cursor for this window, merging with existing
    /// blocks where their ranges overlap or a tail block exists
    fn commit_table(&mut self, table: &mut TableCommit, old: &BlockIdx) -> Result<()> {
        let schema = table.schema();
        let mut supers: Vec<WorkingSuper> = if old.is_none() {
            Vec::new()
        } else {
            let info = load_info(&mut self.old_head, old)?;
            if info.uid == table.uid {
                info.supers
                    .into_iter()
                    .map(|sup| WorkingSuper { sup, fresh: false })
                    .collect()
            } else {
                // The slot was reused by a different table; the previous
                // occupant's blocks are dropped from the new head
                Vec::new()
            }
        };

        let max_batch = self.cfg.max_rows_per_block as usize * 4 / 5;
        let mut cols = DataCols::for_schema(&schema);
        loop {
            cols.reset();
            if read_rows(&mut table.cursor, self.window.end, max_batch, &mut cols)? == 0 {
                break;
            }

            let batch_first = cols.first_key().expect("batch is non-empty");
            let merge_start = supers
                .iter()
                .position(|w| w.sup.meta.last || w.sup.meta.key_last >= batch_first);

            match merge_start {
                None => self.write_run(table.uid, &schema, &cols, &mut supers)?,
                Some(start) => {
                    let old_rows = self.load_merge_set(&supers[start..], &schema)?;
                    supers.truncate(start);
                    let merged = DataCols::merge(&old_rows, &cols)?;
                    self.write_run(table.uid, &schema, &merged, &mut supers)?;
                }
            }
        }

        let info = BlockInfo {
            uid: table.uid,
            supers: supers.into_iter().map(|w| w.sup).collect(),
        };
        self.new_idx[table.tid as usize] = self.append_info(&info)?;
        Ok(())
    }

    /// Load every row covered by a run of super-blocks, in key order.
    ///
    /// Data blocks are disjoint and sorted, so their rows concatenate
    /// sorted; tail rows were written later, so they win ties.
    fn load_merge_set(
        &mut self,
        merge_set: &[WorkingSuper],
        schema: &Schema,
    ) -> Result<DataCols> {
        let mut data_rows = DataCols::for_schema(schema);
        let mut tail_rows = DataCols::for_schema(schema);
        for entry in merge_set {
            for block in entry.sup.physical() {
                if block.sversion != schema.version() {
                    return Err(TideError::InvalidFormat(format!(
                        "block schema version {} does not match table version {}",
                        block.sversion,
                        schema.version()
                    )));
                }
                if block.last {
                    let file = match (&mut self.new_last, entry.fresh) {
                        (Some(new_last), true) => new_last,
                        _ => &mut self.last_file,
                    };
                    load_block_cols(file, block, &mut tail_rows)?;
                } else {
                    load_block_cols(&mut self.data_file, block, &mut data_rows)?;
                }
            }
        }
        DataCols::merge(&data_rows, &tail_rows)
    }

    /// Write one merged run of rows out as blocks and record its
    /// super-block(s). Chunks holding at least `min_rows_per_block` rows go
    /// to the data file; a smaller final residue becomes the tail block.
    fn write_run(
        &mut self,
        uid: u64,
        schema: &Schema,
        rows: &DataCols,
        supers: &mut Vec<WorkingSuper>,
    ) -> Result<()> {
        let min_rows = self.cfg.min_rows_per_block as usize;
        let max_rows = self.cfg.max_rows_per_block as usize;
        let sversion = schema.version();

        let mut data_blocks = Vec::new();
        let mut tail_block = None;
        let mut start = 0;
        while start < rows.num_rows() {
            let chunk = (rows.num_rows() - start).min(max_rows);
            if chunk < min_rows {
                let file = match &mut self.new_last {
                    Some(new_last) => new_last,
                    None => &mut self.last_file,
                };
                tail_block =
                    Some(write_block(file, uid, rows, start, chunk, true, sversion)?);
            } else {
                data_blocks.push(write_block(
                    &mut self.data_file,
                    uid,
                    rows,
                    start,
                    chunk,
                    false,
                    sversion,
                )?);
            }
            start += chunk;
        }

        match data_blocks.len() {
            0 => {}
            1 => supers.push(WorkingSuper {
                sup: SuperBlock::plain(data_blocks[0]),
                fresh: true,
            }),
            _ => {
                // One logical run over several physical blocks
                for block in &mut data_blocks {
                    block.num_sub_blocks = 0;
                }
                supers.push(WorkingSuper {
                    sup: SuperBlock::with_subs(data_blocks),
                    fresh: true,
                });
            }
        }
        if let Some(block) = tail_block {
            supers.push(WorkingSuper {
                sup: SuperBlock::plain(block),
                fresh: true,
            });
        }
        Ok(())
    }

    /// Append an encoded info region to the new head, returning its index
    /// entry
    fn append_info(&mut self, info: &BlockInfo) -> Result<BlockIdx> {
        let encoded = info.encode();
        self.new_head.seek(SeekFrom::Start(self.info_offset))?;
        self.new_head.write_all(&encoded)?;
        let idx = BlockIdx {
            offset: self.info_offset as u32,
            len: encoded.len() as u32,
            num_super_blocks: info.supers.len() as u32,
            has_last: info.has_last(),
            max_key: info.max_key().unwrap_or(TsKey::MIN),
            checksum: crc32fast::hash(&encoded),
        };
        self.info_offset += encoded.len() as u64;
        Ok(idx)
    }

    /// Rename the temporaries over the old files: the last file first, the
    /// head last, so a torn publish leaves the old head self-consistent
    fn publish(self, group: &FileGroup) -> Result<FileGroup> {
        if self.new_last.is_some() {
            std::fs::rename(&self.last_tmp, &group.last.path)?;
        }
        std::fs::rename(&self.head_tmp, &group.head.path)?;

        Ok(FileGroup {
            file_id: group.file_id,
            head: stat_file(group.head.path.clone())?,
            data: stat_file(group.data.path.clone())?,
            last: stat_file(group.last.path.clone())?,
        })
    }

    /// Drop the temporaries, leaving the original files untouched
    fn abandon(self) {
        let _ = std::fs::remove_file(&self.head_tmp);
        if self.new_last.is_some() {
            let _ = std::fs::remove_file(&self.last_tmp);
        }
    }
}

fn stat_file(path: PathBuf) -> Result<DataFile> {
    let size = std::fs::metadata(&path)?.len();
    Ok(DataFile { path, size })
}

fn create_temp(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&encode_file_header())?;
    Ok(file)
}

/// Read up to `limit` rows with keys `<= max_key` from a cursor
fn read_rows(
    cursor: &mut MemCursor,
    max_key: TsKey,
    limit: usize,
    cols: &mut DataCols,
) -> Result<usize> {
    let mut rows = 0;
    while rows < limit {
        match cursor.key() {
            Some(key) if key <= max_key => {}
            _ => break,
        }
        if let Some(push) = cursor.with_row(|row| cols.push_row(row)) {
            push?;
        }
        cursor.advance();
        rows += 1;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::memtable::MemTable;
    use crate::schema::{ColumnSchema, ColumnType, Value};

    fn test_schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                1,
                vec![
                    ColumnSchema::new(0, ColumnType::Timestamp),
                    ColumnSchema::new(1, ColumnType::Double),
                ],
            )
            .unwrap(),
        )
    }

    fn cursor_over(cache: &Cache, keys: &[TsKey]) -> MemCursor {
        let schema = test_schema();
        let mut mem = MemTable::new(cache.current(), schema.clone());
        for &key in keys {
            let row = schema
                .encode_row(&[Value::Timestamp(key), Value::Double(0.0)])
                .unwrap();
            mem.insert(cache, &row).unwrap();
        }
        MemCursor::new(Arc::new(mem))
    }

    #[test]
    fn test_read_rows_honors_window_and_limit() {
        let cache = Cache::new(4 * 1024 * 1024);
        let mut cursor = cursor_over(&cache, &[1, 2, 3, 4, 10]);
        let schema = test_schema();

        let mut cols = DataCols::for_schema(&schema);
        assert_eq!(read_rows(&mut cursor, 4, 2, &mut cols).unwrap(), 2);
        assert_eq!(cols.last_key(), Some(2));

        cols.reset();
        assert_eq!(read_rows(&mut cursor, 4, 100, &mut cols).unwrap(), 2);
        assert_eq!(cols.last_key(), Some(4));

        // Key 10 is beyond the window; the cursor holds position
        cols.reset();
        assert_eq!(read_rows(&mut cursor, 4, 100, &mut cols).unwrap(), 0);
        assert_eq!(cursor.key(), Some(10));
    }
}

//! Block-level file I/O
//!
//! Primitives shared by the commit pipeline and any external reader: loading
//! the index array and info regions from a head file, loading block columns,
//! appending blocks, and coalescing a super-block's sub-blocks into a single
//! block. All offsets inside a block are relative to the block start, so a
//! block is relocatable between the data and last files.

use super::format::{
    decode_block_data_head, encode_block_data_head, BlockIdx, BlockInfo, BlockMeta,
    ColMeta, SuperBlock, ALGO_NONE, BLOCK_DATA_HEAD_SIZE, COL_ENTRY_SIZE,
    FILE_HEAD_SIZE, IDX_ENTRY_SIZE,
};
use crate::schema::DataCols;
use crate::{Result, TideError};
use bytes::BytesMut;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Read the dense index array from a head file
pub fn load_idx(head: &mut File, max_tables: usize) -> Result<Vec<BlockIdx>> {
    head.seek(SeekFrom::Start(FILE_HEAD_SIZE))?;
    let mut buf = vec![0u8; max_tables * IDX_ENTRY_SIZE];
    head.read_exact(&mut buf)?;
    (0..max_tables)
        .map(|i| BlockIdx::decode(&buf[i * IDX_ENTRY_SIZE..]))
        .collect()
}

/// Write the dense index array at its fixed offset in a head file
pub fn write_idx(head: &mut File, idx: &[BlockIdx]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(idx.len() * IDX_ENTRY_SIZE);
    for entry in idx {
        entry.encode(&mut buf);
    }
    head.seek(SeekFrom::Start(FILE_HEAD_SIZE))?;
    head.write_all(&buf)?;
    Ok(())
}

/// Read the raw bytes of a table's info region (carry-forward path)
pub fn read_info_bytes(head: &mut File, idx: &BlockIdx) -> Result<Vec<u8>> {
    head.seek(SeekFrom::Start(idx.offset as u64))?;
    let mut buf = vec![0u8; idx.len as usize];
    head.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read and verify a table's info region
pub fn load_info(head: &mut File, idx: &BlockIdx) -> Result<BlockInfo> {
    let buf = read_info_bytes(head, idx)?;
    let actual = crc32fast::hash(&buf);
    if actual != idx.checksum {
        return Err(TideError::ChecksumMismatch {
            expected: idx.checksum,
            actual,
        });
    }
    BlockInfo::decode(&buf, idx.num_super_blocks as usize)
}

/// Read a block's data header and column metas
pub fn read_block_header(file: &mut File, block: &BlockMeta) -> Result<(u64, Vec<ColMeta>)> {
    debug_assert!(block.num_sub_blocks <= 1);
    file.seek(SeekFrom::Start(block.offset as u64))?;
    let head_len = BLOCK_DATA_HEAD_SIZE + block.num_cols as usize * COL_ENTRY_SIZE;
    let mut buf = vec![0u8; head_len];
    file.read_exact(&mut buf)?;

    let uid = decode_block_data_head(&buf)?;
    let mut cols = Vec::with_capacity(block.num_cols as usize);
    for i in 0..block.num_cols as usize {
        cols.push(ColMeta::decode(
            &buf[BLOCK_DATA_HEAD_SIZE + i * COL_ENTRY_SIZE..],
        )?);
    }
    Ok((uid, cols))
}

/// Read one column payload, appending it to `buf`
pub fn load_col(file: &mut File, col: &ColMeta, block_offset: i64, buf: &mut Vec<u8>) -> Result<()> {
    file.seek(SeekFrom::Start(block_offset as u64 + col.offset as u64))?;
    let start = buf.len();
    buf.resize(start + col.len as usize, 0);
    file.read_exact(&mut buf[start..])?;
    Ok(())
}

/// Load one physical block's columns into a matching buffer.
///
/// The buffer's column layout must equal the block's; rows are appended.
pub fn load_block_cols(file: &mut File, block: &BlockMeta, cols: &mut DataCols) -> Result<()> {
    let (_, col_metas) = read_block_header(file, block)?;
    if col_metas.len() != cols.num_cols() {
        return Err(TideError::CorruptOnDisk(format!(
            "block has {} columns, buffer expects {}",
            col_metas.len(),
            cols.num_cols()
        )));
    }
    for (i, col) in col_metas.iter().enumerate() {
        let want = cols.col(i);
        if col.id != want.id || col.ty != want.ty {
            return Err(TideError::CorruptOnDisk(format!(
                "block column {}:{:?} does not match buffer column {}:{:?}",
                col.id, col.ty, want.id, want.ty
            )));
        }
        if col.len as usize != block.num_rows as usize * col.ty.width() {
            return Err(TideError::CorruptOnDisk(format!(
                "column {} payload length {} does not cover {} rows",
                col.id, col.len, block.num_rows
            )));
        }
        let mut payload = Vec::new();
        load_col(file, col, block.offset, &mut payload)?;
        cols.extend_col(i, &payload);
    }
    cols.add_rows(block.num_rows as usize);
    Ok(())
}

/// Load one physical block, shaping the buffer from the block itself
pub fn block_to_cols(file: &mut File, block: &BlockMeta) -> Result<DataCols> {
    let (_, col_metas) = read_block_header(file, block)?;
    let mut cols =
        DataCols::with_columns(col_metas.iter().map(|c| (c.id, c.ty)).collect());
    load_block_cols(file, block, &mut cols)?;
    Ok(cols)
}

/// Load a super-block including its sub-block run, in key order.
///
/// Physical blocks are pulled from the data or last file according to their
/// own placement flag.
pub fn load_super_block(
    data_file: &mut File,
    last_file: &mut File,
    sup: &SuperBlock,
    cols: &mut DataCols,
) -> Result<()> {
    for block in sup.physical() {
        let file = if block.last {
            &mut *last_file
        } else {
            &mut *data_file
        };
        load_block_cols(file, block, cols)?;
    }
    Ok(())
}

/// Append one block of rows `[start, start + rows)` and return its metadata
pub fn write_block(
    file: &mut File,
    uid: u64,
    cols: &DataCols,
    start: usize,
    rows: usize,
    last: bool,
    sversion: u32,
) -> Result<BlockMeta> {
    debug_assert!(rows > 0 && start + rows <= cols.num_rows());
    let offset = file.seek(SeekFrom::End(0))?;

    let head_len = BLOCK_DATA_HEAD_SIZE + cols.num_cols() * COL_ENTRY_SIZE;
    let mut buf = BytesMut::with_capacity(head_len);
    encode_block_data_head(uid, &mut buf);

    let mut payload_offset = head_len;
    for i in 0..cols.num_cols() {
        let col = cols.col(i);
        let payload_len = rows * col.ty.width();
        ColMeta {
            id: col.id,
            ty: col.ty,
            offset: payload_offset as u32,
            len: payload_len as u32,
        }
        .encode(&mut buf);
        payload_offset += payload_len;
    }
    for i in 0..cols.num_cols() {
        buf.extend_from_slice(cols.col_slice(i, start, rows));
    }
    file.write_all(&buf)?;

    Ok(BlockMeta {
        offset: offset as i64,
        len: buf.len() as u32,
        key_first: cols.key_at(start),
        key_last: cols.key_at(start + rows - 1),
        num_rows: rows as u32,
        num_cols: cols.num_cols() as u16,
        num_sub_blocks: 1,
        last,
        algorithm: ALGO_NONE,
        sversion,
    })
}

/// Coalesce a super-block into a single block appended to `out`.
///
/// Used when the last file is rewritten: a tail super-block (possibly a run
/// of sub-blocks) collapses into one physical block in the new file.
pub fn copy_block_data(
    out: &mut File,
    data_file: &mut File,
    last_file: &mut File,
    sup: &SuperBlock,
    out_last: bool,
) -> Result<BlockMeta> {
    let first = sup.physical()[0];
    let source = if first.last {
        &mut *last_file
    } else {
        &mut *data_file
    };
    let (uid, col_metas) = read_block_header(source, &first)?;

    let mut cols =
        DataCols::with_columns(col_metas.iter().map(|c| (c.id, c.ty)).collect());
    load_super_block(data_file, last_file, sup, &mut cols)?;
    write_block(out, uid, &cols, 0, cols.num_rows(), out_last, first.sversion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, Schema, Value};
    use tempfile::TempDir;

    fn test_schema() -> Schema {
        Schema::new(
            3,
            vec![
                ColumnSchema::new(0, ColumnType::Timestamp),
                ColumnSchema::new(1, ColumnType::Int32),
            ],
        )
        .unwrap()
    }

    fn cols_with_keys(schema: &Schema, keys: &[i64]) -> DataCols {
        let mut cols = DataCols::for_schema(schema);
        for &key in keys {
            let row = schema
                .encode_row(&[Value::Timestamp(key), Value::Int32(key as i32)])
                .unwrap();
            cols.push_row(&row).unwrap();
        }
        cols
    }

    fn scratch_file(dir: &TempDir, name: &str) -> File {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join(name))
            .unwrap()
    }

    #[test]
    fn test_write_then_load_block() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = scratch_file(&temp_dir, "blocks");
        let schema = test_schema();
        let cols = cols_with_keys(&schema, &[10, 20, 30]);

        let block = write_block(&mut file, 42, &cols, 0, 3, false, 3).unwrap();
        assert_eq!(block.key_first, 10);
        assert_eq!(block.key_last, 30);
        assert_eq!(block.num_rows, 3);
        assert_eq!(block.sversion, 3);
        assert!(!block.last);

        let (uid, col_metas) = read_block_header(&mut file, &block).unwrap();
        assert_eq!(uid, 42);
        assert_eq!(col_metas.len(), 2);

        let loaded = block_to_cols(&mut file, &block).unwrap();
        assert_eq!(loaded.num_rows(), 3);
        assert_eq!(loaded.key_at(1), 20);
        assert_eq!(loaded.col_slice(1, 2, 1), 30i32.to_le_bytes());
    }

    #[test]
    fn test_write_block_range() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = scratch_file(&temp_dir, "blocks");
        let schema = test_schema();
        let cols = cols_with_keys(&schema, &[1, 2, 3, 4, 5]);

        let block = write_block(&mut file, 1, &cols, 2, 2, true, 3).unwrap();
        assert_eq!(block.key_first, 3);
        assert_eq!(block.key_last, 4);
        assert!(block.last);

        let loaded = block_to_cols(&mut file, &block).unwrap();
        assert_eq!(loaded.num_rows(), 2);
        assert_eq!(loaded.key_at(0), 3);
    }

    #[test]
    fn test_idx_array_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mut head = scratch_file(&temp_dir, "head");
        head.write_all(&super::super::format::encode_file_header())
            .unwrap();

        let mut idx = vec![BlockIdx::default(); 4];
        idx[2] = BlockIdx {
            offset: 700,
            len: 54,
            num_super_blocks: 1,
            has_last: true,
            max_key: 99,
            checksum: 5,
        };
        write_idx(&mut head, &idx).unwrap();

        let loaded = load_idx(&mut head, 4).unwrap();
        assert_eq!(loaded, idx);
        assert!(loaded[0].is_none());
    }

    #[test]
    fn test_info_region_checksum_enforced() {
        let temp_dir = TempDir::new().unwrap();
        let mut head = scratch_file(&temp_dir, "head");
        head.write_all(&super::super::format::encode_file_header())
            .unwrap();

        let mut info = BlockInfo::new(7);
        info.supers.push(SuperBlock::plain(BlockMeta {
            offset: 512,
            len: 100,
            key_first: 1,
            key_last: 9,
            num_rows: 3,
            num_cols: 2,
            num_sub_blocks: 1,
            last: true,
            algorithm: ALGO_NONE,
            sversion: 1,
        }));
        let encoded = info.encode();
        let offset = head.seek(SeekFrom::End(0)).unwrap();
        head.write_all(&encoded).unwrap();

        let idx = BlockIdx {
            offset: offset as u32,
            len: encoded.len() as u32,
            num_super_blocks: 1,
            has_last: true,
            max_key: 9,
            checksum: crc32fast::hash(&encoded),
        };
        assert_eq!(load_info(&mut head, &idx).unwrap(), info);

        let bad = BlockIdx {
            checksum: idx.checksum ^ 1,
            ..idx
        };
        assert!(matches!(
            load_info(&mut head, &bad),
            Err(TideError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_copy_block_data_coalesces_run() {
        let temp_dir = TempDir::new().unwrap();
        let mut data_file = scratch_file(&temp_dir, "data");
        let mut last_file = scratch_file(&temp_dir, "last");
        let mut out = scratch_file(&temp_dir, "out");
        let schema = test_schema();

        // A run of two data blocks plus a tail residue
        let cols_a = cols_with_keys(&schema, &[1, 2, 3]);
        let cols_b = cols_with_keys(&schema, &[4, 5]);
        let block_a = write_block(&mut data_file, 9, &cols_a, 0, 3, false, 3).unwrap();
        let block_b = write_block(&mut last_file, 9, &cols_b, 0, 2, true, 3).unwrap();
        let sup = SuperBlock::with_subs(vec![
            BlockMeta {
                num_sub_blocks: 0,
                ..block_a
            },
            BlockMeta {
                num_sub_blocks: 0,
                ..block_b
            },
        ]);

        let merged =
            copy_block_data(&mut out, &mut data_file, &mut last_file, &sup, true).unwrap();
        assert_eq!(merged.num_rows, 5);
        assert_eq!(merged.key_first, 1);
        assert_eq!(merged.key_last, 5);
        assert_eq!(merged.num_sub_blocks, 1);
        assert!(merged.last);

        let loaded = block_to_cols(&mut out, &merged).unwrap();
        let keys: Vec<_> = (0..5).map(|i| loaded.key_at(i)).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }
}

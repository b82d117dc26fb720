//! On-disk records of a file group
//!
//! Every file starts with a fixed-size header (version + CRC, zero-padded to
//! [`FILE_HEAD_SIZE`]). The head file then carries the dense
//! `BlockIdx[max_tables]` array followed by packed per-table info regions;
//! data and last files carry block payloads, each introduced by a block data
//! header and its column metas.
//!
//! All records are little-endian. An info region's integrity is covered by a
//! CRC32 over its encoded bytes, stored in the owning [`BlockIdx`] entry.

use crate::schema::ColumnType;
use crate::{Result, TideError, TsKey};
use bytes::{Buf, BufMut, BytesMut};

/// Delimiter guarding info regions and block data headers
pub const FILE_DELIMITER: u32 = 0xF00A_FA0F;

/// Reserved bytes at the start of every file
pub const FILE_HEAD_SIZE: u64 = 512;

/// On-disk format version stamped into file headers
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Serialized size of one [`BlockIdx`] entry
pub const IDX_ENTRY_SIZE: usize = 28;

/// Serialized size of the info region header (delimiter + uid)
pub const INFO_HEAD_SIZE: usize = 12;

/// Serialized size of one [`BlockMeta`] entry
pub const BLOCK_ENTRY_SIZE: usize = 42;

/// Serialized size of the block data header (delimiter + uid)
pub const BLOCK_DATA_HEAD_SIZE: usize = 12;

/// Serialized size of one [`ColMeta`] entry
pub const COL_ENTRY_SIZE: usize = 11;

/// Column payloads stored uncompressed
pub const ALGO_NONE: u8 = 0;

/// Encode the fixed-size file header
pub fn encode_file_header() -> [u8; FILE_HEAD_SIZE as usize] {
    let mut head = [0u8; FILE_HEAD_SIZE as usize];
    head[0..4].copy_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
    let crc = crc32fast::hash(&head[0..4]);
    head[4..8].copy_from_slice(&crc.to_le_bytes());
    head
}

/// Validate a file header read from disk
pub fn check_file_header(head: &[u8]) -> Result<()> {
    if head.len() < 8 {
        return Err(TideError::CorruptOnDisk("file header truncated".into()));
    }
    let expected = crc32fast::hash(&head[0..4]);
    let actual = u32::from_le_bytes(head[4..8].try_into().expect("4 bytes"));
    if expected != actual {
        return Err(TideError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Per-table entry of the dense index array in the head file.
///
/// `offset == 0` means the table has no data in this partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockIdx {
    /// Offset of the table's info region within the head file
    pub offset: u32,
    /// Length of the info region in bytes
    pub len: u32,
    /// Number of super-blocks in the info region
    pub num_super_blocks: u32,
    /// Whether one of the super-blocks lives in the last file
    pub has_last: bool,
    /// `key_last` of the table's final super-block
    pub max_key: TsKey,
    /// CRC32 over the encoded info region
    pub checksum: u32,
}

impl BlockIdx {
    /// Check if the table has no data in this partition
    pub fn is_none(&self) -> bool {
        self.offset == 0
    }

    /// Append the encoded entry to a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.num_super_blocks);
        buf.put_u32_le(self.has_last as u32);
        buf.put_i64_le(self.max_key);
        buf.put_u32_le(self.checksum);
    }

    /// Decode one entry
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < IDX_ENTRY_SIZE {
            return Err(TideError::CorruptOnDisk("index entry truncated".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        Ok(Self {
            offset: cursor.get_u32_le(),
            len: cursor.get_u32_le(),
            num_super_blocks: cursor.get_u32_le(),
            has_last: cursor.get_u32_le() & 1 != 0,
            max_key: cursor.get_i64_le(),
            checksum: cursor.get_u32_le(),
        })
    }
}

/// Metadata of one block entry in an info region.
///
/// A super-block with `num_sub_blocks > 1` does not address file bytes
/// itself: its `offset` is the index of its first sub-block entry within the
/// info region's entry array, and its `len` is the byte sum of the run. Sub
/// entries carry `num_sub_blocks == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// File offset of the block, or entry index of the sub-block run
    pub offset: i64,
    /// Byte length of the block (or of the whole run)
    pub len: u32,
    /// Smallest key in the block
    pub key_first: TsKey,
    /// Largest key in the block
    pub key_last: TsKey,
    /// Rows in the block
    pub num_rows: u32,
    /// Columns stored in the block
    pub num_cols: u16,
    /// 1 for a plain block, >1 for a sub-block run, 0 for a sub entry
    pub num_sub_blocks: u16,
    /// Block lives in the last file
    pub last: bool,
    /// Column payload codec
    pub algorithm: u8,
    /// Schema version the block was written under
    pub sversion: u32,
}

impl BlockMeta {
    /// Append the encoded entry to a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.offset);
        buf.put_u32_le(self.len);
        buf.put_i64_le(self.key_first);
        buf.put_i64_le(self.key_last);
        buf.put_u32_le(self.num_rows);
        buf.put_u16_le(self.num_cols);
        buf.put_u16_le(self.num_sub_blocks);
        buf.put_u8(self.last as u8);
        buf.put_u8(self.algorithm);
        buf.put_u32_le(self.sversion);
    }

    /// Decode one entry
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_ENTRY_SIZE {
            return Err(TideError::CorruptOnDisk("block entry truncated".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        Ok(Self {
            offset: cursor.get_i64_le(),
            len: cursor.get_u32_le(),
            key_first: cursor.get_i64_le(),
            key_last: cursor.get_i64_le(),
            num_rows: cursor.get_u32_le(),
            num_cols: cursor.get_u16_le(),
            num_sub_blocks: cursor.get_u16_le(),
            last: cursor.get_u8() != 0,
            algorithm: cursor.get_u8(),
            sversion: cursor.get_u32_le(),
        })
    }
}

/// One super-block with its sub-block run (empty for a plain block)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// The super entry
    pub meta: BlockMeta,
    /// Physical blocks of the run when `meta.num_sub_blocks > 1`
    pub subs: Vec<BlockMeta>,
}

impl SuperBlock {
    /// A super-block over a single physical block
    pub fn plain(meta: BlockMeta) -> Self {
        Self {
            meta,
            subs: Vec::new(),
        }
    }

    /// A super-block over a run of physical blocks
    pub fn with_subs(subs: Vec<BlockMeta>) -> Self {
        debug_assert!(subs.len() > 1);
        let meta = BlockMeta {
            offset: 0, // fixed up at encode time
            len: subs.iter().map(|b| b.len).sum(),
            key_first: subs.first().map(|b| b.key_first).unwrap_or(0),
            key_last: subs.last().map(|b| b.key_last).unwrap_or(0),
            num_rows: subs.iter().map(|b| b.num_rows).sum(),
            num_cols: subs.first().map(|b| b.num_cols).unwrap_or(0),
            num_sub_blocks: subs.len() as u16,
            last: subs.iter().any(|b| b.last),
            algorithm: subs.first().map(|b| b.algorithm).unwrap_or(ALGO_NONE),
            sversion: subs.first().map(|b| b.sversion).unwrap_or(0),
        };
        Self { meta, subs }
    }

    /// The physical blocks behind this super-block, in key order
    pub fn physical(&self) -> &[BlockMeta] {
        if self.subs.is_empty() {
            std::slice::from_ref(&self.meta)
        } else {
            &self.subs
        }
    }
}

/// A table's decoded info region: its super-blocks in key order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Table uid the region belongs to
    pub uid: u64,
    /// Super-blocks sorted by `key_first`
    pub supers: Vec<SuperBlock>,
}

impl BlockInfo {
    /// An empty region for a table
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            supers: Vec::new(),
        }
    }

    /// Largest key across all super-blocks
    pub fn max_key(&self) -> Option<TsKey> {
        self.supers.last().map(|s| s.meta.key_last)
    }

    /// Whether any super-block lives in the last file
    pub fn has_last(&self) -> bool {
        self.supers.iter().any(|s| s.meta.last)
    }

    /// Serialized byte length of the region
    pub fn encoded_len(&self) -> usize {
        let entries =
            self.supers.len() + self.supers.iter().map(|s| s.subs.len()).sum::<usize>();
        INFO_HEAD_SIZE + entries * BLOCK_ENTRY_SIZE
    }

    /// Encode the region: header, super entries, then the sub-block runs
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(FILE_DELIMITER);
        buf.put_u64_le(self.uid);

        let mut run_start = self.supers.len() as i64;
        for sup in &self.supers {
            let mut meta = sup.meta;
            if !sup.subs.is_empty() {
                meta.offset = run_start;
                meta.num_sub_blocks = sup.subs.len() as u16;
                run_start += sup.subs.len() as i64;
            }
            meta.encode(&mut buf);
        }
        for sup in &self.supers {
            for sub in &sup.subs {
                sub.encode(&mut buf);
            }
        }
        buf
    }

    /// Decode a region of `num_supers` super-blocks
    pub fn decode(data: &[u8], num_supers: usize) -> Result<Self> {
        if data.len() < INFO_HEAD_SIZE {
            return Err(TideError::CorruptOnDisk("info region truncated".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        let delimiter = cursor.get_u32_le();
        if delimiter != FILE_DELIMITER {
            return Err(TideError::CorruptOnDisk(format!(
                "bad info delimiter {delimiter:#010x}"
            )));
        }
        let uid = cursor.get_u64_le();

        let body = &data[INFO_HEAD_SIZE..];
        if body.len() % BLOCK_ENTRY_SIZE != 0 {
            return Err(TideError::CorruptOnDisk(
                "info region length is not a whole number of entries".into(),
            ));
        }
        let total = body.len() / BLOCK_ENTRY_SIZE;
        if num_supers > total {
            return Err(TideError::CorruptOnDisk(format!(
                "info region has {total} entries but the index claims {num_supers} super-blocks"
            )));
        }
        let mut entries = Vec::with_capacity(total);
        for i in 0..total {
            entries.push(BlockMeta::decode(&body[i * BLOCK_ENTRY_SIZE..])?);
        }

        let mut supers = Vec::with_capacity(num_supers);
        for meta in entries.iter().take(num_supers) {
            if meta.num_sub_blocks > 1 {
                let start = meta.offset as usize;
                let end = start + meta.num_sub_blocks as usize;
                if start < num_supers || end > total {
                    return Err(TideError::CorruptOnDisk(format!(
                        "sub-block run [{start}, {end}) outside entry array of {total}"
                    )));
                }
                supers.push(SuperBlock {
                    meta: *meta,
                    subs: entries[start..end].to_vec(),
                });
            } else {
                supers.push(SuperBlock::plain(*meta));
            }
        }
        Ok(Self { uid, supers })
    }
}

/// Column descriptor inside a block's data header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColMeta {
    /// Column id
    pub id: i16,
    /// Cell type
    pub ty: ColumnType,
    /// Payload offset relative to the block start
    pub offset: u32,
    /// Payload length in bytes
    pub len: u32,
}

impl ColMeta {
    /// Append the encoded entry to a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16_le(self.id);
        buf.put_u8(self.ty as u8);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.len);
    }

    /// Decode one entry
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < COL_ENTRY_SIZE {
            return Err(TideError::CorruptOnDisk("column entry truncated".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        let id = cursor.get_i16_le();
        let raw_ty = cursor.get_u8();
        let ty = ColumnType::from_u8(raw_ty).ok_or_else(|| {
            TideError::CorruptOnDisk(format!("unknown column type {raw_ty}"))
        })?;
        Ok(Self {
            id,
            ty,
            offset: cursor.get_u32_le(),
            len: cursor.get_u32_le(),
        })
    }
}

/// Encode the block data header (delimiter + uid)
pub fn encode_block_data_head(uid: u64, buf: &mut BytesMut) {
    buf.put_u32_le(FILE_DELIMITER);
    buf.put_u64_le(uid);
}

/// Decode and validate a block data header, returning the uid
pub fn decode_block_data_head(data: &[u8]) -> Result<u64> {
    if data.len() < BLOCK_DATA_HEAD_SIZE {
        return Err(TideError::CorruptOnDisk("block data header truncated".into()));
    }
    let mut cursor = std::io::Cursor::new(data);
    let delimiter = cursor.get_u32_le();
    if delimiter != FILE_DELIMITER {
        return Err(TideError::CorruptOnDisk(format!(
            "bad block delimiter {delimiter:#010x}"
        )));
    }
    Ok(cursor.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key_first: TsKey, key_last: TsKey, rows: u32, last: bool) -> BlockMeta {
        BlockMeta {
            offset: 4096,
            len: 1000,
            key_first,
            key_last,
            num_rows: rows,
            num_cols: 2,
            num_sub_blocks: 1,
            last,
            algorithm: ALGO_NONE,
            sversion: 1,
        }
    }

    #[test]
    fn test_file_header_round_trip() {
        let head = encode_file_header();
        assert_eq!(head.len(), FILE_HEAD_SIZE as usize);
        check_file_header(&head).unwrap();

        let mut corrupted = head;
        corrupted[0] ^= 0xFF;
        assert!(check_file_header(&corrupted).is_err());
    }

    #[test]
    fn test_idx_entry_round_trip() {
        let idx = BlockIdx {
            offset: 540,
            len: 96,
            num_super_blocks: 2,
            has_last: true,
            max_key: 86_400_000,
            checksum: 0xDEAD_BEEF,
        };

        let mut buf = BytesMut::new();
        idx.encode(&mut buf);
        assert_eq!(buf.len(), IDX_ENTRY_SIZE);
        assert_eq!(BlockIdx::decode(&buf).unwrap(), idx);
    }

    #[test]
    fn test_block_entry_round_trip() {
        let block = meta(10, 30, 3, true);
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        assert_eq!(buf.len(), BLOCK_ENTRY_SIZE);
        assert_eq!(BlockMeta::decode(&buf).unwrap(), block);
    }

    #[test]
    fn test_info_round_trip_plain() {
        let mut info = BlockInfo::new(42);
        info.supers.push(SuperBlock::plain(meta(10, 30, 3, false)));
        info.supers.push(SuperBlock::plain(meta(40, 50, 2, true)));

        let encoded = info.encode();
        assert_eq!(encoded.len(), info.encoded_len());

        let decoded = BlockInfo::decode(&encoded, 2).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.max_key(), Some(50));
        assert!(decoded.has_last());
    }

    #[test]
    fn test_info_round_trip_with_sub_run() {
        let subs = vec![
            BlockMeta {
                num_sub_blocks: 0,
                ..meta(10, 20, 100, false)
            },
            BlockMeta {
                num_sub_blocks: 0,
                offset: 8192,
                ..meta(21, 40, 100, false)
            },
        ];
        let mut info = BlockInfo::new(7);
        info.supers.push(SuperBlock::with_subs(subs.clone()));
        info.supers.push(SuperBlock::plain(meta(41, 45, 5, true)));

        let decoded = BlockInfo::decode(&info.encode(), 2).unwrap();
        assert_eq!(decoded.supers.len(), 2);
        assert_eq!(decoded.supers[0].subs, subs);
        assert_eq!(decoded.supers[0].meta.num_rows, 200);
        assert_eq!(decoded.supers[0].meta.key_last, 40);
        // The run is addressed by entry index, stored after the super array
        assert_eq!(decoded.supers[0].meta.offset, 2);
        assert_eq!(decoded.supers[0].physical().len(), 2);
    }

    #[test]
    fn test_info_rejects_bad_delimiter() {
        let info = BlockInfo::new(1);
        let mut encoded = info.encode();
        encoded[0] ^= 0xFF;
        assert!(BlockInfo::decode(&encoded, 0).is_err());
    }

    #[test]
    fn test_col_entry_round_trip() {
        let col = ColMeta {
            id: 3,
            ty: ColumnType::Double,
            offset: 35,
            len: 800,
        };
        let mut buf = BytesMut::new();
        col.encode(&mut buf);
        assert_eq!(buf.len(), COL_ENTRY_SIZE);
        assert_eq!(ColMeta::decode(&buf).unwrap(), col);
    }

    #[test]
    fn test_block_data_head() {
        let mut buf = BytesMut::new();
        encode_block_data_head(99, &mut buf);
        assert_eq!(buf.len(), BLOCK_DATA_HEAD_SIZE);
        assert_eq!(decode_block_data_head(&buf).unwrap(), 99);
    }
}

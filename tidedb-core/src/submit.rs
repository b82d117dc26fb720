//! Submit message wire codec
//!
//! The insert entry point consumes a big-endian framed message: a fixed
//! header followed by one submit block per target table, each carrying a
//! dense run of self-describing rows. Framing is big-endian; the row payloads
//! inside a block use the engine's row codec.

use crate::schema::ROW_HEAD_SIZE;
use crate::{Result, TableId, TideError};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the message header: length, block count, compressed flag
pub const SUBMIT_MSG_HEAD_SIZE: usize = 12;

/// Size of one submit block header
pub const SUBMIT_BLK_HEAD_SIZE: usize = 26;

/// A parsed submit message borrowing the caller's buffer
pub struct SubmitMsg<'a> {
    num_blocks: u32,
    body: &'a [u8],
}

impl<'a> SubmitMsg<'a> {
    /// Parse and validate the message framing
    pub fn parse(msg: &'a [u8]) -> Result<Self> {
        if msg.len() < SUBMIT_MSG_HEAD_SIZE {
            return Err(TideError::InvalidFormat(
                "submit message shorter than its header".into(),
            ));
        }
        let mut cursor = std::io::Cursor::new(msg);
        let length = cursor.get_u32() as usize;
        let num_blocks = cursor.get_u32();
        let compressed = cursor.get_u32();

        if length != msg.len() {
            return Err(TideError::InvalidFormat(format!(
                "submit message claims {length} bytes, got {}",
                msg.len()
            )));
        }
        if compressed != 0 {
            return Err(TideError::InvalidFormat(
                "compressed submit messages are not supported".into(),
            ));
        }
        Ok(Self {
            num_blocks,
            body: &msg[SUBMIT_MSG_HEAD_SIZE..],
        })
    }

    /// Number of submit blocks in the message
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Iterate the submit blocks
    pub fn blocks(&self) -> BlockIter<'a> {
        BlockIter {
            body: self.body,
            remaining: self.num_blocks,
        }
    }
}

/// One submit block addressed to a single table
pub struct SubmitBlock<'a> {
    /// Declared row count
    pub num_rows: u16,
    /// Target table uid
    pub uid: u64,
    /// Target dense table id
    pub tid: i32,
    /// Schema version the rows were encoded under
    pub sversion: u32,
    data: &'a [u8],
}

impl<'a> SubmitBlock<'a> {
    /// Identity of the target table
    pub fn table_id(&self) -> TableId {
        TableId::new(self.uid, self.tid)
    }

    /// Iterate the block's rows
    pub fn rows(&self) -> RowIter<'a> {
        RowIter { data: self.data }
    }
}

/// Iterator over the submit blocks of a message
pub struct BlockIter<'a> {
    body: &'a [u8],
    remaining: u32,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = Result<SubmitBlock<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.body.len() < SUBMIT_BLK_HEAD_SIZE {
            self.remaining = 0;
            return Some(Err(TideError::InvalidFormat(
                "submit block header truncated".into(),
            )));
        }
        let mut cursor = std::io::Cursor::new(self.body);
        let len = cursor.get_u32() as usize;
        let num_rows = cursor.get_u16();
        let uid = cursor.get_u64();
        let tid = cursor.get_i32();
        let sversion = cursor.get_u32();
        let _padding = cursor.get_u32();

        let end = SUBMIT_BLK_HEAD_SIZE + len;
        if self.body.len() < end {
            self.remaining = 0;
            return Some(Err(TideError::InvalidFormat(format!(
                "submit block claims {len} data bytes, {} available",
                self.body.len() - SUBMIT_BLK_HEAD_SIZE
            ))));
        }
        let data = &self.body[SUBMIT_BLK_HEAD_SIZE..end];
        self.body = &self.body[end..];

        Some(Ok(SubmitBlock {
            num_rows,
            uid,
            tid,
            sversion,
            data,
        }))
    }
}

/// Iterator over the rows of a submit block
pub struct RowIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < ROW_HEAD_SIZE {
            self.data = &[];
            return Some(Err(TideError::InvalidFormat(
                "row header truncated".into(),
            )));
        }
        let len = u16::from_le_bytes([self.data[0], self.data[1]]) as usize;
        if len < ROW_HEAD_SIZE || len > self.data.len() {
            self.data = &[];
            return Some(Err(TideError::InvalidFormat(format!(
                "row claims {len} bytes, {} available",
                self.data.len()
            ))));
        }
        let row = &self.data[..len];
        self.data = &self.data[len..];
        Some(Ok(row))
    }
}

/// Builder composing well-formed submit messages
#[derive(Default)]
pub struct SubmitMsgBuilder {
    blocks: Vec<(TableId, u32, Vec<u8>, u16)>,
}

impl SubmitMsgBuilder {
    /// Start an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one submit block for a table
    pub fn add_block<R: AsRef<[u8]>>(
        mut self,
        id: TableId,
        sversion: u32,
        rows: &[R],
    ) -> Self {
        let mut data = Vec::new();
        for row in rows {
            data.extend_from_slice(row.as_ref());
        }
        self.blocks.push((id, sversion, data, rows.len() as u16));
        self
    }

    /// Serialize the message with big-endian framing
    pub fn finish(self) -> Vec<u8> {
        let body_len: usize = self
            .blocks
            .iter()
            .map(|(_, _, data, _)| SUBMIT_BLK_HEAD_SIZE + data.len())
            .sum();
        let total = SUBMIT_MSG_HEAD_SIZE + body_len;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u32(self.blocks.len() as u32);
        buf.put_u32(0); // not compressed
        for (id, sversion, data, num_rows) in &self.blocks {
            buf.put_u32(data.len() as u32);
            buf.put_u16(*num_rows);
            buf.put_u64(id.uid);
            buf.put_i32(id.tid);
            buf.put_u32(*sversion);
            buf.put_u32(0); // padding
            buf.put_slice(data);
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, Schema, Value};

    fn test_schema() -> Schema {
        Schema::new(
            1,
            vec![
                ColumnSchema::new(0, ColumnType::Timestamp),
                ColumnSchema::new(1, ColumnType::Int64),
            ],
        )
        .unwrap()
    }

    fn row(schema: &Schema, key: i64) -> Vec<u8> {
        schema
            .encode_row(&[Value::Timestamp(key), Value::Int64(key * 2)])
            .unwrap()
    }

    #[test]
    fn test_build_parse_round_trip() {
        let schema = test_schema();
        let rows_a = vec![row(&schema, 1), row(&schema, 2)];
        let rows_b = vec![row(&schema, 10)];

        let msg = SubmitMsgBuilder::new()
            .add_block(TableId::new(42, 0), 1, &rows_a)
            .add_block(TableId::new(43, 7), 1, &rows_b)
            .finish();

        let parsed = SubmitMsg::parse(&msg).unwrap();
        assert_eq!(parsed.num_blocks(), 2);

        let blocks: Vec<_> = parsed.blocks().collect::<Result<_>>().unwrap();
        assert_eq!(blocks[0].uid, 42);
        assert_eq!(blocks[0].tid, 0);
        assert_eq!(blocks[0].num_rows, 2);
        assert_eq!(blocks[1].table_id(), TableId::new(43, 7));

        let parsed_rows: Vec<_> = blocks[0].rows().collect::<Result<_>>().unwrap();
        assert_eq!(parsed_rows, vec![&rows_a[0][..], &rows_a[1][..]]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let msg = SubmitMsgBuilder::new().finish();
        let mut bad = msg.clone();
        bad.push(0);
        assert!(SubmitMsg::parse(&bad).is_err());
        assert!(SubmitMsg::parse(&msg[..4]).is_err());
    }

    #[test]
    fn test_compressed_flag_rejected() {
        let mut msg = SubmitMsgBuilder::new().finish();
        msg[11] = 1;
        assert!(SubmitMsg::parse(&msg).is_err());
    }

    #[test]
    fn test_truncated_block_is_error() {
        let schema = test_schema();
        let msg = SubmitMsgBuilder::new()
            .add_block(TableId::new(1, 0), 1, &[row(&schema, 5)])
            .finish();

        // Shrink the message but fix the declared length so the block
        // framing is what fails
        let cut = msg.len() - 4;
        let mut bad = msg[..cut].to_vec();
        bad[0..4].copy_from_slice(&(cut as u32).to_be_bytes());

        let parsed = SubmitMsg::parse(&bad).unwrap();
        let result: Result<Vec<_>> = parsed.blocks().collect();
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_row_framing_is_error() {
        let msg = SubmitMsgBuilder::new()
            .add_block(TableId::new(1, 0), 1, &[vec![0xFFu8, 0xFF, 1, 2]])
            .finish();

        let parsed = SubmitMsg::parse(&msg).unwrap();
        let block = parsed.blocks().next().unwrap().unwrap();
        let rows: Result<Vec<_>> = block.rows().collect();
        assert!(rows.is_err());
    }
}

//! Table schemas, the row codec, and the columnar commit buffer
//!
//! Rows are fixed-schema, fixed-width records: a `u16` total length followed
//! by one cell per column in schema order, little-endian. The first column of
//! every schema is the timestamp (column id 0), so the key of a row is always
//! readable without consulting the schema.

use crate::{Result, TideError, TsKey};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Byte width of the row length header
pub const ROW_HEAD_SIZE: usize = 2;

/// Column id reserved for the timestamp column
pub const TIMESTAMP_COL_ID: i16 = 0;

/// Supported fixed-width column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Float = 6,
    Double = 7,
    Timestamp = 8,
}

impl ColumnType {
    /// Cell width in bytes
    pub fn width(self) -> usize {
        match self {
            ColumnType::Bool | ColumnType::Int8 => 1,
            ColumnType::Int16 => 2,
            ColumnType::Int32 | ColumnType::Float => 4,
            ColumnType::Int64 | ColumnType::Double | ColumnType::Timestamp => 8,
        }
    }

    /// Decode from the on-disk u8 representation
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ColumnType::Bool),
            2 => Some(ColumnType::Int8),
            3 => Some(ColumnType::Int16),
            4 => Some(ColumnType::Int32),
            5 => Some(ColumnType::Int64),
            6 => Some(ColumnType::Float),
            7 => Some(ColumnType::Double),
            8 => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

/// One column of a table schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column id, unique and ascending within a schema
    pub id: i16,
    /// Cell type
    pub ty: ColumnType,
}

impl ColumnSchema {
    /// Create a new column
    pub fn new(id: i16, ty: ColumnType) -> Self {
        Self { id, ty }
    }
}

/// Immutable per-table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    version: u32,
    cols: Vec<ColumnSchema>,
    row_len: usize,
}

impl Schema {
    /// Build a schema from an ordered column list.
    ///
    /// The first column must be the timestamp with id 0; ids must be strictly
    /// ascending.
    pub fn new(version: u32, cols: Vec<ColumnSchema>) -> Result<Self> {
        let first = cols.first().ok_or_else(|| {
            TideError::InvalidFormat("schema must have at least one column".into())
        })?;
        if first.id != TIMESTAMP_COL_ID || first.ty != ColumnType::Timestamp {
            return Err(TideError::InvalidFormat(
                "first schema column must be the timestamp with id 0".into(),
            ));
        }
        for pair in cols.windows(2) {
            if pair[1].id <= pair[0].id {
                return Err(TideError::InvalidFormat(format!(
                    "column ids must be strictly ascending: {} after {}",
                    pair[1].id, pair[0].id
                )));
            }
        }
        let row_len = ROW_HEAD_SIZE + cols.iter().map(|c| c.ty.width()).sum::<usize>();
        Ok(Self {
            version,
            cols,
            row_len,
        })
    }

    /// Schema version (sversion)
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Ordered columns
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.cols
    }

    /// Number of columns
    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    /// Serialized length of one row of this schema
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Encode one row from typed values (one per column, in schema order)
    pub fn encode_row(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.cols.len() {
            return Err(TideError::InvalidFormat(format!(
                "row has {} values, schema has {} columns",
                values.len(),
                self.cols.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(self.row_len);
        buf.put_u16_le(self.row_len as u16);
        for (value, col) in values.iter().zip(&self.cols) {
            if value.column_type() != col.ty {
                return Err(TideError::InvalidFormat(format!(
                    "value type {:?} does not match column {} type {:?}",
                    value.column_type(),
                    col.id,
                    col.ty
                )));
            }
            value.put(&mut buf);
        }
        Ok(buf.to_vec())
    }

    /// Validate a row's framing against this schema
    pub fn check_row(&self, row: &[u8]) -> Result<()> {
        if row.len() != self.row_len || row_len(row) != self.row_len {
            return Err(TideError::InvalidFormat(format!(
                "row length {} does not match schema row length {}",
                row.len(),
                self.row_len
            )));
        }
        Ok(())
    }
}

/// A typed cell value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Timestamp(TsKey),
}

impl Value {
    /// The column type this value belongs to
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Bool(_) => ColumnType::Bool,
            Value::Int8(_) => ColumnType::Int8,
            Value::Int16(_) => ColumnType::Int16,
            Value::Int32(_) => ColumnType::Int32,
            Value::Int64(_) => ColumnType::Int64,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match *self {
            Value::Bool(v) => buf.put_u8(v as u8),
            Value::Int8(v) => buf.put_i8(v),
            Value::Int16(v) => buf.put_i16_le(v),
            Value::Int32(v) => buf.put_i32_le(v),
            Value::Int64(v) => buf.put_i64_le(v),
            Value::Float(v) => buf.put_f32_le(v),
            Value::Double(v) => buf.put_f64_le(v),
            Value::Timestamp(v) => buf.put_i64_le(v),
        }
    }
}

/// Total length of a row, read from its self-describing header
pub fn row_len(row: &[u8]) -> usize {
    let mut cursor = std::io::Cursor::new(row);
    cursor.get_u16_le() as usize
}

/// Timestamp key of a row (the first cell, right after the length header)
pub fn row_key(row: &[u8]) -> TsKey {
    let mut cursor = std::io::Cursor::new(&row[ROW_HEAD_SIZE..]);
    cursor.get_i64_le()
}

/// Columnar buffer used by the commit pipeline.
///
/// Cells of each column are stored contiguously, so a run of rows can be
/// written to a block file as one slice per column. The buffer can be shaped
/// from a schema (for memtable reads) or from a block's column metas (for
/// block loads), and two buffers with the same layout can be merged by key.
#[derive(Debug, Clone)]
pub struct DataCols {
    cols: Vec<ColData>,
    num_rows: usize,
}

/// One column of a `DataCols` buffer
#[derive(Debug, Clone)]
pub struct ColData {
    /// Column id
    pub id: i16,
    /// Cell type
    pub ty: ColumnType,
    /// Packed cells, `num_rows * ty.width()` bytes
    pub data: Vec<u8>,
}

impl DataCols {
    /// Shape a buffer after a schema
    pub fn for_schema(schema: &Schema) -> Self {
        Self {
            cols: schema
                .columns()
                .iter()
                .map(|c| ColData {
                    id: c.id,
                    ty: c.ty,
                    data: Vec::new(),
                })
                .collect(),
            num_rows: 0,
        }
    }

    /// Shape a buffer from explicit columns (used when loading blocks)
    pub fn with_columns(cols: Vec<(i16, ColumnType)>) -> Self {
        Self {
            cols: cols
                .into_iter()
                .map(|(id, ty)| ColData {
                    id,
                    ty,
                    data: Vec::new(),
                })
                .collect(),
            num_rows: 0,
        }
    }

    /// Number of buffered rows
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Number of columns
    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    /// Check if the buffer holds no rows
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Column accessor
    pub fn col(&self, idx: usize) -> &ColData {
        &self.cols[idx]
    }

    /// Drop all rows, keeping the column shape and capacity
    pub fn reset(&mut self) {
        for col in &mut self.cols {
            col.data.clear();
        }
        self.num_rows = 0;
    }

    /// Two buffers can exchange rows iff their column layouts match
    pub fn same_layout(&self, other: &DataCols) -> bool {
        self.cols.len() == other.cols.len()
            && self
                .cols
                .iter()
                .zip(&other.cols)
                .all(|(a, b)| a.id == b.id && a.ty == b.ty)
    }

    /// Append one serialized row, splitting its cells across the columns
    pub fn push_row(&mut self, row: &[u8]) -> Result<()> {
        let expected =
            ROW_HEAD_SIZE + self.cols.iter().map(|c| c.ty.width()).sum::<usize>();
        if row.len() != expected || row_len(row) != expected {
            return Err(TideError::InvalidFormat(format!(
                "row length {} does not match column layout length {}",
                row.len(),
                expected
            )));
        }
        let mut offset = ROW_HEAD_SIZE;
        for col in &mut self.cols {
            let width = col.ty.width();
            col.data.extend_from_slice(&row[offset..offset + width]);
            offset += width;
        }
        self.num_rows += 1;
        Ok(())
    }

    /// Copy row `idx` of `src` into this buffer; layouts must match
    pub fn push_row_from(&mut self, src: &DataCols, idx: usize) {
        debug_assert!(self.same_layout(src));
        for (dst, col) in self.cols.iter_mut().zip(&src.cols) {
            let width = col.ty.width();
            let start = idx * width;
            dst.data.extend_from_slice(&col.data[start..start + width]);
        }
        self.num_rows += 1;
    }

    /// Append raw cells to one column (used when loading a block payload)
    pub fn extend_col(&mut self, col_idx: usize, cells: &[u8]) {
        self.cols[col_idx].data.extend_from_slice(cells);
    }

    /// Record that `rows` complete rows were appended via `extend_col`
    pub fn add_rows(&mut self, rows: usize) {
        self.num_rows += rows;
    }

    /// Cells of rows `[start, start + rows)` of one column
    pub fn col_slice(&self, col_idx: usize, start: usize, rows: usize) -> &[u8] {
        let width = self.cols[col_idx].ty.width();
        &self.cols[col_idx].data[start * width..(start + rows) * width]
    }

    /// Key of row `idx`, read from the timestamp column
    pub fn key_at(&self, idx: usize) -> TsKey {
        let mut cursor = std::io::Cursor::new(self.col_slice(0, idx, 1));
        cursor.get_i64_le()
    }

    /// Key of the first buffered row
    pub fn first_key(&self) -> Option<TsKey> {
        (!self.is_empty()).then(|| self.key_at(0))
    }

    /// Key of the last buffered row
    pub fn last_key(&self) -> Option<TsKey> {
        (!self.is_empty()).then(|| self.key_at(self.num_rows - 1))
    }

    /// Merge two key-ordered buffers into a new one.
    ///
    /// On equal keys the row from `right` wins; `right` holds the newer data.
    pub fn merge(left: &DataCols, right: &DataCols) -> Result<DataCols> {
        if !left.same_layout(right) {
            return Err(TideError::InvalidFormat(
                "cannot merge column buffers with different layouts".into(),
            ));
        }
        let mut out = DataCols::with_columns(
            left.cols.iter().map(|c| (c.id, c.ty)).collect(),
        );
        let (mut i, mut j) = (0, 0);
        while i < left.num_rows && j < right.num_rows {
            let (lk, rk) = (left.key_at(i), right.key_at(j));
            if lk < rk {
                out.push_row_from(left, i);
                i += 1;
            } else if lk > rk {
                out.push_row_from(right, j);
                j += 1;
            } else {
                out.push_row_from(right, j);
                i += 1;
                j += 1;
            }
        }
        while i < left.num_rows {
            out.push_row_from(left, i);
            i += 1;
        }
        while j < right.num_rows {
            out.push_row_from(right, j);
            j += 1;
        }
        Ok(out)
    }
}

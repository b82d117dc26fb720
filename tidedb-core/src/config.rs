//! Repository configuration: bounds, validation, and the CONFIG file codec

use crate::{Precision, Result, TideError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Default dense table-id space
pub const DEFAULT_TABLES: i32 = 1000;
/// Bounds on the dense table-id space
pub const MIN_TABLES: i32 = 10;
pub const MAX_TABLES: i32 = 100_000;

/// Default width of one file partition, in days
pub const DEFAULT_DAYS_PER_FILE: i32 = 10;
pub const MIN_DAYS_PER_FILE: i32 = 1;
pub const MAX_DAYS_PER_FILE: i32 = 60;

/// Default threshold below which a block goes to the last file
pub const DEFAULT_MIN_ROWS_PER_BLOCK: i32 = 100;
pub const MIN_MIN_ROWS_PER_BLOCK: i32 = 10;
pub const MAX_MIN_ROWS_PER_BLOCK: i32 = 1000;

/// Default hard cap on rows in one block
pub const DEFAULT_MAX_ROWS_PER_BLOCK: i32 = 4096;
pub const MIN_MAX_ROWS_PER_BLOCK: i32 = 200;
pub const MAX_MAX_ROWS_PER_BLOCK: i32 = 10_000;

/// Default retention in days
pub const DEFAULT_KEEP_DAYS: i32 = 3650;
pub const MIN_KEEP_DAYS: i32 = 1;

/// Default cache arena capacity (16 MiB)
pub const DEFAULT_CACHE_SIZE: i64 = 16 * 1024 * 1024;
pub const MIN_CACHE_SIZE: i64 = 4 * 1024 * 1024;
pub const MAX_CACHE_SIZE: i64 = 1024 * 1024 * 1024;

/// Serialized size of the CONFIG record
pub const CONFIG_SIZE: usize = 33;

/// Name of the configuration file under the repository root
pub const CONFIG_FILE_NAME: &str = "CONFIG";

/// Repository configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Time unit of all keys in this repository
    pub precision: Precision,
    /// Opaque repository id
    pub repo_id: i32,
    /// Dense table-id space; fixed for the repository's lifetime
    pub max_tables: i32,
    /// Width of one file partition in days
    pub days_per_file: i32,
    /// Blocks below this row count go to the last file
    pub min_rows_per_block: i32,
    /// Hard cap on rows in one block
    pub max_rows_per_block: i32,
    /// Retention in days
    pub keep_days: i32,
    /// Cache arena capacity in bytes
    pub max_cache_size: i64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Milli,
            repo_id: 0,
            max_tables: DEFAULT_TABLES,
            days_per_file: DEFAULT_DAYS_PER_FILE,
            min_rows_per_block: DEFAULT_MIN_ROWS_PER_BLOCK,
            max_rows_per_block: DEFAULT_MAX_ROWS_PER_BLOCK,
            keep_days: DEFAULT_KEEP_DAYS,
            max_cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl RepoConfig {
    /// Set the time precision
    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Set the dense table-id space
    pub fn max_tables(mut self, max_tables: i32) -> Self {
        self.max_tables = max_tables;
        self
    }

    /// Set the file partition width in days
    pub fn days_per_file(mut self, days: i32) -> Self {
        self.days_per_file = days;
        self
    }

    /// Set the last-file threshold
    pub fn min_rows_per_block(mut self, rows: i32) -> Self {
        self.min_rows_per_block = rows;
        self
    }

    /// Set the block row cap
    pub fn max_rows_per_block(mut self, rows: i32) -> Self {
        self.max_rows_per_block = rows;
        self
    }

    /// Set the cache arena capacity in bytes
    pub fn max_cache_size(mut self, bytes: i64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Validate every field against its configured bounds
    pub fn validate(&self) -> Result<()> {
        if self.repo_id < 0 {
            return Err(TideError::Config(format!(
                "repo_id must be non-negative, got {}",
                self.repo_id
            )));
        }
        check_range("max_tables", self.max_tables, MIN_TABLES, MAX_TABLES)?;
        check_range(
            "days_per_file",
            self.days_per_file,
            MIN_DAYS_PER_FILE,
            MAX_DAYS_PER_FILE,
        )?;
        check_range(
            "min_rows_per_block",
            self.min_rows_per_block,
            MIN_MIN_ROWS_PER_BLOCK,
            MAX_MIN_ROWS_PER_BLOCK,
        )?;
        check_range(
            "max_rows_per_block",
            self.max_rows_per_block,
            MIN_MAX_ROWS_PER_BLOCK,
            MAX_MAX_ROWS_PER_BLOCK,
        )?;
        if self.min_rows_per_block > self.max_rows_per_block {
            return Err(TideError::Config(format!(
                "min_rows_per_block {} exceeds max_rows_per_block {}",
                self.min_rows_per_block, self.max_rows_per_block
            )));
        }
        check_range("keep_days", self.keep_days, MIN_KEEP_DAYS, i32::MAX)?;
        if self.max_cache_size < MIN_CACHE_SIZE || self.max_cache_size > MAX_CACHE_SIZE {
            return Err(TideError::Config(format!(
                "max_cache_size {} outside [{}, {}]",
                self.max_cache_size, MIN_CACHE_SIZE, MAX_CACHE_SIZE
            )));
        }
        Ok(())
    }

    /// Serialize to the fixed-size on-disk record
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(CONFIG_SIZE);
        buf.put_i8(self.precision as i8);
        buf.put_i32_le(self.repo_id);
        buf.put_i32_le(self.max_tables);
        buf.put_i32_le(self.days_per_file);
        buf.put_i32_le(self.min_rows_per_block);
        buf.put_i32_le(self.max_rows_per_block);
        buf.put_i32_le(self.keep_days);
        buf.put_i64_le(self.max_cache_size);
        buf
    }

    /// Deserialize from the fixed-size on-disk record
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CONFIG_SIZE {
            return Err(TideError::CorruptOnDisk(format!(
                "CONFIG record truncated: {} bytes",
                data.len()
            )));
        }
        let mut cursor = std::io::Cursor::new(data);
        let precision = Precision::from_i8(cursor.get_i8()).ok_or_else(|| {
            TideError::CorruptOnDisk("CONFIG record has unknown precision".into())
        })?;
        Ok(Self {
            precision,
            repo_id: cursor.get_i32_le(),
            max_tables: cursor.get_i32_le(),
            days_per_file: cursor.get_i32_le(),
            min_rows_per_block: cursor.get_i32_le(),
            max_rows_per_block: cursor.get_i32_le(),
            keep_days: cursor.get_i32_le(),
            max_cache_size: cursor.get_i64_le(),
        })
    }

    /// Write the CONFIG file atomically under the repository root
    pub fn save(&self, root_dir: &Path) -> Result<()> {
        let path = root_dir.join(CONFIG_FILE_NAME);
        let tmp = root_dir.join(format!("{}.tmp", CONFIG_FILE_NAME));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read the CONFIG file from the repository root
    pub fn load(root_dir: &Path) -> Result<Self> {
        let data = fs::read(root_dir.join(CONFIG_FILE_NAME))?;
        let config = Self::decode(&data)?;
        config.validate()?;
        Ok(config)
    }
}

fn check_range(name: &str, value: i32, min: i32, max: i32) -> Result<()> {
    if value < min || value > max {
        return Err(TideError::Config(format!(
            "{} {} outside [{}, {}]",
            name, value, min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        RepoConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bounds_rejected() {
        assert!(RepoConfig::default().max_tables(5).validate().is_err());
        assert!(RepoConfig::default().days_per_file(61).validate().is_err());
        assert!(RepoConfig::default()
            .max_cache_size(1024)
            .validate()
            .is_err());

        // min_rows must not exceed max_rows
        let config = RepoConfig::default()
            .min_rows_per_block(1000)
            .max_rows_per_block(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let config = RepoConfig::default()
            .precision(Precision::Micro)
            .days_per_file(1)
            .min_rows_per_block(10)
            .max_rows_per_block(200);

        let encoded = config.encode();
        assert_eq!(encoded.len(), CONFIG_SIZE);
        assert_eq!(RepoConfig::decode(&encoded).unwrap(), config);
    }

    #[test]
    fn test_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = RepoConfig::default().days_per_file(2);

        config.save(temp_dir.path()).unwrap();
        let loaded = RepoConfig::load(temp_dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let config = RepoConfig::default();
        let encoded = config.encode();
        assert!(RepoConfig::decode(&encoded[..10]).is_err());
    }
}

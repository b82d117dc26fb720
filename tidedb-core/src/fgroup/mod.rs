//! Time-partitioned file groups and their registry
//!
//! One file group holds everything a partition owns on disk: `f<fid>.head`
//! (block index), `f<fid>.data` (full blocks), `f<fid>.last` (under-full tail
//! blocks). The [`FileDir`] keeps the groups sorted by partition id and is
//! the only place groups are created, found, or removed.

pub mod blockio;
pub mod format;

use crate::{Result, TideError};
use format::{encode_file_header, FILE_HEAD_SIZE, IDX_ENTRY_SIZE};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A last file larger than this is rewritten at the next commit
pub const MAX_LAST_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// The three files of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Head,
    Data,
    Last,
}

impl FileKind {
    /// File name suffix for this kind
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Head => ".head",
            FileKind::Data => ".data",
            FileKind::Last => ".last",
        }
    }
}

/// Path of a group file, `<data_dir>/f<fid><suffix>`
pub fn file_path(data_dir: &Path, fid: i32, suffix: &str) -> PathBuf {
    data_dir.join(format!("f{fid}{suffix}"))
}

/// Descriptor of one on-disk file of a group
#[derive(Debug, Clone)]
pub struct DataFile {
    /// Location on disk
    pub path: PathBuf,
    /// Current size in bytes
    pub size: u64,
}

impl DataFile {
    fn stat(path: PathBuf) -> Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        Ok(Self { path, size })
    }

    /// Open for reading
    pub fn open_read(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }

    /// Open for reading and writing
    pub fn open_rw(&self) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }
}

/// One time partition on disk
#[derive(Debug, Clone)]
pub struct FileGroup {
    /// Partition id
    pub file_id: i32,
    /// Block index file
    pub head: DataFile,
    /// Full blocks
    pub data: DataFile,
    /// Tail blocks
    pub last: DataFile,
}

impl FileGroup {
    /// Create the three files of a new partition.
    ///
    /// Only the head file gets the pre-zeroed `BlockIdx[max_tables]` region,
    /// so a table's entry is always a constant-offset read.
    pub fn create(data_dir: &Path, fid: i32, max_tables: usize) -> Result<Self> {
        let result = (|| -> Result<Self> {
            let head = Self::create_file(data_dir, fid, FileKind::Head, max_tables)?;
            let data = Self::create_file(data_dir, fid, FileKind::Data, max_tables)?;
            let last = Self::create_file(data_dir, fid, FileKind::Last, max_tables)?;
            Ok(Self {
                file_id: fid,
                head,
                data,
                last,
            })
        })();
        if result.is_err() {
            for kind in [FileKind::Head, FileKind::Data, FileKind::Last] {
                let _ = std::fs::remove_file(file_path(data_dir, fid, kind.suffix()));
            }
        } else {
            debug!(fid, "created file group");
        }
        result
    }

    fn create_file(
        data_dir: &Path,
        fid: i32,
        kind: FileKind,
        max_tables: usize,
    ) -> Result<DataFile> {
        let path = file_path(data_dir, fid, kind.suffix());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&encode_file_header())?;
        let mut size = FILE_HEAD_SIZE;
        if kind == FileKind::Head {
            let idx_region = vec![0u8; max_tables * IDX_ENTRY_SIZE];
            file.write_all(&idx_region)?;
            size += idx_region.len() as u64;
        }
        file.sync_all()?;
        Ok(DataFile { path, size })
    }

    /// Rebuild a group descriptor from existing files
    fn restore(data_dir: &Path, fid: i32) -> Result<Self> {
        let head = DataFile::stat(file_path(data_dir, fid, FileKind::Head.suffix()))?;
        let mut header = [0u8; 8];
        {
            use std::io::Read;
            head.open_read()?.read_exact(&mut header)?;
        }
        format::check_file_header(&header)?;
        Ok(Self {
            file_id: fid,
            head,
            data: DataFile::stat(file_path(data_dir, fid, FileKind::Data.suffix()))?,
            last: DataFile::stat(file_path(data_dir, fid, FileKind::Last.suffix()))?,
        })
    }

    /// Descriptor of one of the group's files
    pub fn file(&self, kind: FileKind) -> &DataFile {
        match kind {
            FileKind::Head => &self.head,
            FileKind::Data => &self.data,
            FileKind::Last => &self.last,
        }
    }
}

/// Sorted registry of file groups, keyed by partition id
pub struct FileDir {
    groups: Vec<FileGroup>,
    max_groups: usize,
}

impl FileDir {
    /// Create an empty registry holding at most `max_groups` partitions
    pub fn new(max_groups: usize) -> Self {
        Self {
            groups: Vec::new(),
            max_groups,
        }
    }

    /// Scan a data directory and register every complete group found.
    ///
    /// Stray commit temporaries (`f<fid>.h`, `f<fid>.l`) are removed; a head
    /// file without its data or last sibling is reported as corruption.
    pub fn restore(data_dir: &Path, max_groups: usize) -> Result<Self> {
        let mut dir = Self::new(max_groups);
        for entry in std::fs::read_dir(data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".h") || name.ends_with(".l") {
                warn!(file = name, "removing stale commit temporary");
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            let Some(fid) = name
                .strip_prefix('f')
                .and_then(|rest| rest.strip_suffix(".head"))
                .and_then(|fid| fid.parse::<i32>().ok())
            else {
                continue;
            };
            let group = FileGroup::restore(data_dir, fid).map_err(|err| match err {
                TideError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                    TideError::CorruptOnDisk(format!("file group {fid} is missing files"))
                }
                other => other,
            })?;
            dir.insert(group)?;
        }
        Ok(dir)
    }

    /// Number of registered groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Check if no group is registered
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Iterate groups in partition order
    pub fn iter(&self) -> impl Iterator<Item = &FileGroup> {
        self.groups.iter()
    }

    /// Create a partition if absent; existing partitions are returned as-is
    pub fn create(
        &mut self,
        data_dir: &Path,
        fid: i32,
        max_tables: usize,
    ) -> Result<&FileGroup> {
        if self.position(fid).is_none() {
            let group = FileGroup::create(data_dir, fid, max_tables)?;
            self.insert(group)?;
        }
        let pos = self.position(fid).expect("group just ensured");
        Ok(&self.groups[pos])
    }

    /// Find a partition by id
    pub fn find(&self, fid: i32) -> Option<&FileGroup> {
        self.position(fid).map(|pos| &self.groups[pos])
    }

    /// Replace a partition's descriptor after a commit rewrote its files
    pub fn update(&mut self, group: FileGroup) {
        if let Some(pos) = self.position(group.file_id) {
            self.groups[pos] = group;
        }
    }

    /// Remove a partition, deleting its files from disk
    pub fn remove(&mut self, fid: i32) -> Result<()> {
        let pos = self.position(fid).ok_or_else(|| {
            TideError::OutOfBounds(format!("no file group for fid {fid}"))
        })?;
        let group = self.groups.remove(pos);
        for kind in [FileKind::Head, FileKind::Data, FileKind::Last] {
            std::fs::remove_file(&group.file(kind).path)?;
        }
        Ok(())
    }

    fn insert(&mut self, group: FileGroup) -> Result<()> {
        if self.groups.len() >= self.max_groups {
            return Err(TideError::OutOfBounds(format!(
                "file group limit {} reached",
                self.max_groups
            )));
        }
        // Inserts are rare; keep the vector sorted in place
        let pos = self
            .groups
            .iter()
            .position(|g| g.file_id > group.file_id)
            .unwrap_or(self.groups.len());
        self.groups.insert(pos, group);
        Ok(())
    }

    fn position(&self, fid: i32) -> Option<usize> {
        let first = self.groups.first()?.file_id;
        let last = self.groups.last()?.file_id;
        if fid < first || fid > last {
            return None;
        }
        self.groups.binary_search_by_key(&fid, |g| g.file_id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_group_layout() {
        let temp_dir = TempDir::new().unwrap();
        let group = FileGroup::create(temp_dir.path(), 0, 10).unwrap();

        assert_eq!(
            group.head.size,
            FILE_HEAD_SIZE + 10 * IDX_ENTRY_SIZE as u64
        );
        assert_eq!(group.data.size, FILE_HEAD_SIZE);
        assert_eq!(group.last.size, FILE_HEAD_SIZE);
        for kind in [FileKind::Head, FileKind::Data, FileKind::Last] {
            assert!(group.file(kind).path.exists());
        }
    }

    #[test]
    fn test_create_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = FileDir::new(8);

        dir.create(temp_dir.path(), 3, 10).unwrap();
        dir.create(temp_dir.path(), 3, 10).unwrap();
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_groups_stay_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = FileDir::new(8);

        for fid in [5, 1, 3] {
            dir.create(temp_dir.path(), fid, 10).unwrap();
        }

        let ids: Vec<_> = dir.iter().map(|g| g.file_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(dir.find(3).unwrap().file_id, 3);
        assert!(dir.find(2).is_none());
        assert!(dir.find(9).is_none());
    }

    #[test]
    fn test_group_cap() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = FileDir::new(2);

        dir.create(temp_dir.path(), 0, 10).unwrap();
        dir.create(temp_dir.path(), 1, 10).unwrap();
        assert!(dir.create(temp_dir.path(), 2, 10).is_err());
    }

    #[test]
    fn test_remove_deletes_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = FileDir::new(8);
        dir.create(temp_dir.path(), 0, 10).unwrap();

        let head = file_path(temp_dir.path(), 0, ".head");
        assert!(head.exists());
        dir.remove(0).unwrap();
        assert!(!head.exists());
        assert!(dir.find(0).is_none());
        assert!(dir.remove(0).is_err());
    }

    #[test]
    fn test_restore_scans_directory() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut dir = FileDir::new(8);
            for fid in [2, 0, -1] {
                dir.create(temp_dir.path(), fid, 10).unwrap();
            }
        }
        // Stray commit temporary must be swept
        std::fs::write(file_path(temp_dir.path(), 0, ".h"), b"junk").unwrap();

        let dir = FileDir::restore(temp_dir.path(), 8).unwrap();
        let ids: Vec<_> = dir.iter().map(|g| g.file_id).collect();
        assert_eq!(ids, vec![-1, 0, 2]);
        assert!(!file_path(temp_dir.path(), 0, ".h").exists());
    }
}

//! Per-unit line-table file and directory tables
//!
//! DWARF version decides numbering: before v5, directory 0 is the
//! compilation directory and files are 1-based; from v5 on, directory 0 and
//! file 0 are explicit entries describing the unit's root file.

use crate::core::FileEntry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTableEntry {
    /// Index into the directory table, in the table's own numbering
    pub directory_index: u64,
    pub filename: Arc<str>,
    pub checksum: Option<[u8; 16]>,
    pub source: Option<Arc<str>>,
}

#[derive(Debug, Clone)]
pub struct LineFileTable {
    comp_dir: Arc<str>,
    directories: Vec<Arc<str>>,
    files: Vec<FileTableEntry>,
    lookup: HashMap<(String, String), u64>,
    dwarf_version: u16,
}

impl LineFileTable {
    /// `root` is the unit's primary file; it becomes file 0 in v5 tables
    pub fn new(comp_dir: &str, root: &FileEntry, dwarf_version: u16) -> Self {
        let mut table = Self {
            comp_dir: Arc::from(comp_dir),
            directories: Vec::new(),
            files: Vec::new(),
            lookup: HashMap::new(),
            dwarf_version,
        };
        if dwarf_version >= 5 {
            table.directories.push(Arc::from(comp_dir));
            table.push_file(root);
        }
        table
    }

    pub fn dwarf_version(&self) -> u16 {
        self.dwarf_version
    }

    pub fn comp_dir(&self) -> &str {
        &self.comp_dir
    }

    /// Directory entries as written to the header (v4 omits the implicit
    /// compilation directory)
    pub fn directories(&self) -> &[Arc<str>] {
        &self.directories
    }

    pub fn files(&self) -> &[FileTableEntry] {
        &self.files
    }

    /// Every file carries an MD5 digest
    pub fn has_all_md5(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.checksum.is_some())
    }

    pub fn has_source(&self) -> bool {
        self.files.iter().any(|f| f.source.is_some())
    }

    /// File number for `file`, adding it on first use
    pub fn file_index(&mut self, file: &FileEntry) -> u64 {
        let key = (file.directory.clone(), file.name.clone());
        if let Some(idx) = self.lookup.get(&key) {
            return *idx;
        }
        self.push_file(file)
    }

    fn push_file(&mut self, file: &FileEntry) -> u64 {
        let directory_index = self.directory_index(&file.directory);
        self.files.push(FileTableEntry {
            directory_index,
            filename: Arc::from(file.name.as_str()),
            checksum: file.checksum,
            source: file.source.as_deref().map(Arc::from),
        });
        let index = if self.dwarf_version >= 5 {
            self.files.len() as u64 - 1
        } else {
            self.files.len() as u64
        };
        self.lookup
            .insert((file.directory.clone(), file.name.clone()), index);
        trace!(
            "Line table file {} -> '{}' (dir {})",
            index,
            file.name,
            directory_index
        );
        index
    }

    fn directory_index(&mut self, directory: &str) -> u64 {
        if self.dwarf_version < 5 && (directory.is_empty() || directory == &*self.comp_dir) {
            return 0;
        }
        if let Some(pos) = self.directories.iter().position(|d| &**d == directory) {
            return if self.dwarf_version >= 5 {
                pos as u64
            } else {
                pos as u64 + 1
            };
        }
        self.directories.push(Arc::from(directory));
        if self.dwarf_version >= 5 {
            self.directories.len() as u64 - 1
        } else {
            self.directories.len() as u64
        }
    }

    /// Full path of a file number, resolved the way a consumer would
    pub fn full_path(&self, file_index: u64) -> Option<String> {
        let array_index = if self.dwarf_version >= 5 {
            file_index as usize
        } else {
            if file_index == 0 {
                return None;
            }
            (file_index - 1) as usize
        };
        let entry = self.files.get(array_index)?;
        if entry.filename.starts_with('/') {
            return Some(entry.filename.to_string());
        }
        let directory: &str = if self.dwarf_version >= 5 {
            self.directories
                .get(entry.directory_index as usize)
                .map(|d| &**d)?
        } else if entry.directory_index == 0 {
            &*self.comp_dir
        } else {
            self.directories
                .get(entry.directory_index as usize - 1)
                .map(|d| &**d)?
        };
        if directory.is_empty() || directory == "." {
            Some(entry.filename.to_string())
        } else {
            Some(format!("{}/{}", directory, entry.filename))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_is_one_based() {
        let root = FileEntry::new("main.c", "/work");
        let mut table = LineFileTable::new("/work", &root, 4);
        assert_eq!(table.file_index(&root), 1);
        assert_eq!(table.file_index(&FileEntry::new("util.h", "/usr/include")), 2);
        assert_eq!(table.file_index(&root), 1);
        assert!(table.directories().len() == 1);
        assert_eq!(table.full_path(1).unwrap(), "/work/main.c");
        assert_eq!(table.full_path(2).unwrap(), "/usr/include/util.h");
        assert_eq!(table.full_path(0), None);
    }

    #[test]
    fn test_v5_root_file_is_zero() {
        let mut root = FileEntry::new("main.c", "/work");
        root.checksum = Some([1; 16]);
        let mut table = LineFileTable::new("/work", &root, 5);
        assert_eq!(table.file_index(&root), 0);
        assert!(table.has_all_md5());
        let other = FileEntry::new("b.c", "/work/sub");
        assert_eq!(table.file_index(&other), 1);
        assert!(!table.has_all_md5());
        assert_eq!(table.directories().len(), 2);
        assert_eq!(table.full_path(1).unwrap(), "/work/sub/b.c");
    }
}

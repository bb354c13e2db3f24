use std::path::{Path, PathBuf};

use relative_path::RelativePathBuf;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resolve::LineMapEntry;

/// One `LineMap` entry as persisted to `.entangled/filedb.json`, matching
/// the `{"line", "src", "src_line", "block"}` schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLineMapEntry {
    pub line: usize,
    pub src: RelativePathBuf,
    pub src_line: usize,
    pub block: String,
}

impl From<&LineMapEntry> for StoredLineMapEntry {
    fn from(entry: &LineMapEntry) -> Self {
        Self {
            line: entry.line,
            src: entry.source_file.clone(),
            src_line: entry.source_line,
            block: entry.block_id.clone(),
        }
    }
}

/// A single tracked file: either a source Markdown document or a tangled
/// target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: RelativePathBuf,
    pub hash: String,
    #[serde(default)]
    pub owner: Vec<RelativePathBuf>,
    #[serde(default)]
    pub line_map: Vec<StoredLineMapEntry>,
}

/// The persisted content-hash database. Tracks every file the engine
/// owns so tangle/stitch can tell unchanged, externally-modified, and
/// missing files apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDb {
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// The classification of a tracked or candidate file against the DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    ModifiedExternally,
    Missing,
    Untracked,
}

impl FileDb {
    /// Load `.entangled/filedb.json` at `path`. A missing file loads as
    /// empty, matching the FileDB semantics in §4.F.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("{}: no file database yet, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let db: Self = serde_json::from_str(&content)?;
        log::debug!("{}: loaded {} tracked file(s)", path.display(), db.files.len());
        Ok(db)
    }

    /// Write the database to `path` via stage-then-rename so a crash
    /// mid-write never leaves a truncated file in place.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".entangled.tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        log::debug!("{}: saved {} tracked file(s)", path.display(), self.files.len());
        Ok(())
    }

    /// Drop all in-memory entries. Nothing is persisted until the next
    /// `save`.
    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn entry(&self, path: &RelativePathBuf) -> Option<&FileEntry> {
        self.files.iter().find(|f| &f.path == path)
    }

    /// Insert or replace the entry for `entry.path`.
    pub fn upsert(&mut self, entry: FileEntry) {
        self.files.retain(|f| f.path != entry.path);
        self.files.push(entry);
    }

    pub fn remove(&mut self, path: &RelativePathBuf) {
        self.files.retain(|f| &f.path != path);
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &RelativePathBuf> {
        self.files.iter().map(|f| &f.path)
    }

    /// Compare the on-disk content at `base_dir / path` against this DB.
    pub fn classify(&self, base_dir: &Path, path: &RelativePathBuf) -> Result<FileStatus> {
        let abs = path.to_path(base_dir);
        if !abs.exists() {
            return Ok(FileStatus::Missing);
        }
        let disk_hash = hash_content(&std::fs::read_to_string(&abs)?);
        Ok(match self.entry(path) {
            None => FileStatus::Untracked,
            Some(e) if e.hash == disk_hash => FileStatus::Unchanged,
            Some(_) => FileStatus::ModifiedExternally,
        })
    }
}

/// Normalize to LF line endings and exactly one trailing newline, then
/// take a 256-bit blake3 digest of the resulting bytes.
pub fn hash_content(content: &str) -> String {
    blake3::hash(normalize_content(content).as_bytes())
        .to_hex()
        .to_string()
}

pub fn normalize_content(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let trimmed = normalized.trim_end_matches('\n');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hash_is_stable_across_trailing_newline_variants() {
        assert_eq!(hash_content("print(1)\n"), hash_content("print(1)"));
        assert_eq!(hash_content("print(1)\n"), hash_content("print(1)\n\n\n"));
        assert_eq!(hash_content("a\r\nb\n"), hash_content("a\nb\n"));
    }

    #[test]
    fn load_missing_file_yields_empty_db() {
        let dir = TempDir::new().unwrap();
        let db = FileDb::load(&dir.path().join("filedb.json")).unwrap();
        assert!(db.files.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".entangled/filedb.json");
        let mut db = FileDb::default();
        db.upsert(FileEntry {
            path: RelativePathBuf::from("hello.py"),
            hash: hash_content("print(1)\n"),
            owner: vec![RelativePathBuf::from("test.md")],
            line_map: vec![StoredLineMapEntry {
                line: 2,
                src: RelativePathBuf::from("test.md"),
                src_line: 2,
                block: "main".to_string(),
            }],
        });
        db.save(&path).unwrap();

        let loaded = FileDb::load(&path).unwrap();
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.entry(&RelativePathBuf::from("hello.py")).unwrap().hash, hash_content("print(1)\n"));
    }

    #[test]
    fn classify_reports_missing_unchanged_and_modified() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("hello.py");
        let rel = RelativePathBuf::from("hello.py");

        let mut db = FileDb::default();
        assert_eq!(db.classify(dir.path(), &rel).unwrap(), FileStatus::Missing);

        std::fs::write(&target, "print(1)\n").unwrap();
        assert_eq!(db.classify(dir.path(), &rel).unwrap(), FileStatus::Untracked);

        db.upsert(FileEntry {
            path: rel.clone(),
            hash: hash_content("print(1)\n"),
            owner: vec![],
            line_map: vec![],
        });
        assert_eq!(db.classify(dir.path(), &rel).unwrap(), FileStatus::Unchanged);

        std::fs::write(&target, "print(2)\n").unwrap();
        assert_eq!(db.classify(dir.path(), &rel).unwrap(), FileStatus::ModifiedExternally);
    }

    #[test]
    fn clear_empties_in_memory_state_only() {
        let mut db = FileDb::default();
        db.upsert(FileEntry {
            path: RelativePathBuf::from("a.py"),
            hash: "x".to_string(),
            owner: vec![],
            line_map: vec![],
        });
        db.clear();
        assert!(db.files.is_empty());
    }
}

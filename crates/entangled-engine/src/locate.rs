use relative_path::RelativePathBuf;

use crate::filedb::FileDb;

/// Where a line in a tangled target came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub source_file: RelativePathBuf,
    pub source_line: usize,
    pub block_id: String,
}

/// Resolve `(target_path, line)` to its originating Markdown location
/// using the `LineMap` persisted for `target_path` in the FileDB. Lines
/// that fall on an annotation marker (or outside any recorded mapping)
/// return `None`.
pub fn locate(db: &FileDb, target_path: &RelativePathBuf, line: usize) -> Option<Location> {
    let entry = db.entry(target_path)?;
    entry
        .line_map
        .iter()
        .find(|e| e.line == line)
        .map(|e| Location {
            source_file: e.src.clone(),
            source_line: e.src_line,
            block_id: e.block.clone(),
        })
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use relative_path::RelativePathBuf;

use crate::error::{EngineError, Result};
use crate::filedb::{hash_content, FileDb};
use crate::resolve::TangleOutput;
use crate::stitch::BlockDiff;

/// One line-range replacement inside a Markdown source file, 1-based and
/// inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEdit {
    pub start_line: usize,
    pub end_line: usize,
    pub replacement: Vec<String>,
}

/// A single filesystem or document mutation. `Transaction::actions` is a
/// deterministically ordered list of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateFile {
        path: RelativePathBuf,
        content: String,
    },
    WriteFile {
        path: RelativePathBuf,
        old_hash: Option<String>,
        new_content: String,
    },
    DeleteFile {
        path: RelativePathBuf,
        old_hash: String,
    },
    PatchDocument {
        source_path: RelativePathBuf,
        edits: Vec<DocEdit>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub actions: Vec<Action>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// One human-readable line per action, in apply order.
    pub fn describe(&self) -> Vec<String> {
        self.actions.iter().map(describe_one).collect()
    }

    /// A unified-style diff per action, comparing live on-disk content
    /// against what this transaction would write.
    pub fn diffs(&self, base_dir: &Path) -> Result<Vec<String>> {
        self.actions.iter().map(|a| diff_one(a, base_dir)).collect()
    }
}

fn describe_one(action: &Action) -> String {
    match action {
        Action::CreateFile { path, .. } => format!("create {path}"),
        Action::WriteFile { path, .. } => format!("write {path}"),
        Action::DeleteFile { path, .. } => format!("delete {path}"),
        Action::PatchDocument { source_path, edits } => format!(
            "patch {source_path} ({} block{})",
            edits.len(),
            if edits.len() == 1 { "" } else { "s" }
        ),
    }
}

fn diff_one(action: &Action, base_dir: &Path) -> Result<String> {
    match action {
        Action::CreateFile { path, content } => Ok(unified_diff(path, "", content)),
        Action::WriteFile { path, new_content, .. } => {
            let old = std::fs::read_to_string(path.to_path(base_dir)).unwrap_or_default();
            Ok(unified_diff(path, &old, new_content))
        }
        Action::DeleteFile { path, .. } => {
            let old = std::fs::read_to_string(path.to_path(base_dir)).unwrap_or_default();
            Ok(unified_diff(path, &old, ""))
        }
        Action::PatchDocument { source_path, edits } => {
            let old = std::fs::read_to_string(source_path.to_path(base_dir))?;
            let mut lines: Vec<String> = old.lines().map(str::to_string).collect();
            let mut sorted = edits.clone();
            sorted.sort_by(|a, b| b.start_line.cmp(&a.start_line));
            for edit in &sorted {
                let start = edit.start_line.saturating_sub(1).min(lines.len());
                let end = edit.end_line.min(lines.len());
                if start <= end {
                    lines.splice(start..end, edit.replacement.iter().cloned());
                }
            }
            let new = format!("{}\n", lines.join("\n"));
            Ok(unified_diff(source_path, &old, &new))
        }
    }
}

/// A minimal line-oriented diff: not an LCS-based algorithm, just a
/// readable before/after listing good enough for a preview.
fn unified_diff(path: &RelativePathBuf, old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let mut out = format!("--- {path}\n+++ {path}\n");
    let max = old_lines.len().max(new_lines.len());
    for i in 0..max {
        match (old_lines.get(i), new_lines.get(i)) {
            (Some(o), Some(n)) if o == n => out.push_str(&format!(" {o}\n")),
            (Some(o), Some(n)) => {
                out.push_str(&format!("-{o}\n"));
                out.push_str(&format!("+{n}\n"));
            }
            (Some(o), None) => out.push_str(&format!("-{o}\n")),
            (None, Some(n)) => out.push_str(&format!("+{n}\n")),
            (None, None) => {}
        }
    }
    out
}

fn action_rank(action: &Action) -> (u8, String) {
    match action {
        Action::CreateFile { path, .. } => (0, path.as_str().to_string()),
        Action::WriteFile { path, .. } => (1, path.as_str().to_string()),
        Action::DeleteFile { path, .. } => (2, path.as_str().to_string()),
        Action::PatchDocument { source_path, .. } => (3, source_path.as_str().to_string()),
    }
}

fn sort_actions(actions: &mut [Action]) {
    actions.sort_by(|a, b| action_rank(a).cmp(&action_rank(b)));
}

/// Plan the set of filesystem actions needed to bring `outputs` onto
/// disk, comparing against `db`'s last-known hashes per §4.E.
pub fn plan_tangle(
    outputs: &[TangleOutput],
    db: &FileDb,
    base_dir: &Path,
    force: bool,
) -> Result<Transaction> {
    let mut actions = Vec::new();
    let mut current_targets: BTreeSet<RelativePathBuf> = BTreeSet::new();

    for out in outputs {
        current_targets.insert(out.path.clone());
        let new_hash = hash_content(&out.content);
        let abs = out.path.to_path(base_dir);

        if !abs.exists() {
            actions.push(Action::CreateFile {
                path: out.path.clone(),
                content: out.content.clone(),
            });
            continue;
        }

        let disk_hash = hash_content(&std::fs::read_to_string(&abs)?);
        if disk_hash == new_hash {
            continue;
        }

        let db_hash = db.entry(&out.path).map(|e| e.hash.clone());
        let clean = db_hash.as_deref() == Some(disk_hash.as_str());
        if clean || force {
            actions.push(Action::WriteFile {
                path: out.path.clone(),
                old_hash: Some(disk_hash),
                new_content: out.content.clone(),
            });
        } else {
            return Err(EngineError::Conflict {
                path: PathBuf::from(out.path.as_str()),
            });
        }
    }

    for entry in db.files.iter().filter(|e| !e.owner.is_empty()) {
        if current_targets.contains(&entry.path) {
            continue;
        }
        let abs = entry.path.to_path(base_dir);
        if !abs.exists() {
            continue;
        }
        let disk_hash = hash_content(&std::fs::read_to_string(&abs)?);
        if disk_hash == entry.hash || force {
            actions.push(Action::DeleteFile {
                path: entry.path.clone(),
                old_hash: disk_hash,
            });
        } else {
            return Err(EngineError::Conflict {
                path: PathBuf::from(entry.path.as_str()),
            });
        }
    }

    sort_actions(&mut actions);
    Ok(Transaction { actions })
}

/// Plan `PatchDocument` actions from recovered block diffs, grouping by
/// source file and ordering each file's edits highest-line-first.
pub fn plan_stitch(diffs: &[BlockDiff]) -> Transaction {
    use std::collections::BTreeMap;
    let mut by_source: BTreeMap<RelativePathBuf, Vec<DocEdit>> = BTreeMap::new();
    for diff in diffs {
        by_source.entry(diff.source_path.clone()).or_default().push(DocEdit {
            start_line: diff.start_line + 1,
            end_line: diff.end_line.saturating_sub(1),
            replacement: diff.new_source.clone(),
        });
    }
    let mut actions: Vec<Action> = by_source
        .into_iter()
        .map(|(source_path, mut edits)| {
            edits.sort_by(|a, b| b.start_line.cmp(&a.start_line));
            Action::PatchDocument { source_path, edits }
        })
        .collect();
    sort_actions(&mut actions);
    Transaction { actions }
}

/// The outcome of `apply`: which actions committed, which never ran, and
/// (on a mid-apply failure) the error that stopped it.
#[derive(Debug)]
pub struct ApplyReport {
    pub completed: Vec<Action>,
    pub pending: Vec<Action>,
    pub error: Option<EngineError>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Two-phase commit: validate every action's guard against the live
/// filesystem, then apply in order. A failure partway through an apply
/// is reported in `ApplyReport`, not as an `Err` — already-committed
/// writes are not rolled back.
pub fn apply(transaction: &Transaction, base_dir: &Path, force: bool) -> Result<ApplyReport> {
    for action in &transaction.actions {
        validate_guard(action, base_dir, force)?;
    }

    let mut completed = Vec::new();
    for (i, action) in transaction.actions.iter().enumerate() {
        if let Err(err) = apply_one(action, base_dir) {
            log::warn!("apply failed on `{}`: {err}", describe_one(action));
            let pending = transaction.actions[i + 1..].to_vec();
            return Ok(ApplyReport {
                completed,
                pending,
                error: Some(err),
            });
        }
        log::debug!("applied `{}`", describe_one(action));
        completed.push(action.clone());
    }
    Ok(ApplyReport {
        completed,
        pending: Vec::new(),
        error: None,
    })
}

fn validate_guard(action: &Action, base_dir: &Path, force: bool) -> Result<()> {
    match action {
        Action::CreateFile { path, .. } => {
            let abs = path.to_path(base_dir);
            if abs.exists() && !force {
                return Err(EngineError::Conflict {
                    path: PathBuf::from(path.as_str()),
                });
            }
            Ok(())
        }
        Action::WriteFile { path, old_hash, .. } => {
            check_hash_guard(path, old_hash.as_deref(), base_dir, force)
        }
        Action::DeleteFile { path, old_hash } => {
            check_hash_guard(path, Some(old_hash.as_str()), base_dir, force)
        }
        Action::PatchDocument { .. } => Ok(()),
    }
}

fn check_hash_guard(
    path: &RelativePathBuf,
    expected: Option<&str>,
    base_dir: &Path,
    force: bool,
) -> Result<()> {
    let abs = path.to_path(base_dir);
    if !abs.exists() {
        return Ok(());
    }
    let Some(expected) = expected else {
        return Ok(());
    };
    let disk_hash = hash_content(&std::fs::read_to_string(&abs)?);
    if disk_hash != expected && !force {
        return Err(EngineError::Conflict {
            path: PathBuf::from(path.as_str()),
        });
    }
    Ok(())
}

fn apply_one(action: &Action, base_dir: &Path) -> Result<()> {
    match action {
        Action::CreateFile { path, content } => atomic_write(&path.to_path(base_dir), content),
        Action::WriteFile { path, new_content, .. } => {
            atomic_write(&path.to_path(base_dir), new_content)
        }
        Action::DeleteFile { path, .. } => {
            let abs = path.to_path(base_dir);
            if abs.exists() {
                std::fs::remove_file(abs)?;
            }
            Ok(())
        }
        Action::PatchDocument { source_path, edits } => {
            let abs = source_path.to_path(base_dir);
            let content = std::fs::read_to_string(&abs)?;
            let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
            for edit in edits {
                let start = edit.start_line.saturating_sub(1).min(lines.len());
                let end = edit.end_line.min(lines.len());
                if start <= end {
                    lines.splice(start..end, edit.replacement.iter().cloned());
                }
            }
            let new_content = format!("{}\n", lines.join("\n"));
            atomic_write(&abs, &new_content)
        }
    }
}

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".entangled.tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

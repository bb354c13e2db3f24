use std::collections::BTreeSet;
use std::path::PathBuf;

use entangled_config::Config;
use relative_path::RelativePathBuf;

use crate::discover::discover_source_files;
use crate::error::{EngineError, Result};
use crate::filedb::{hash_content, FileDb, FileEntry, FileStatus, StoredLineMapEntry};
use crate::model::Document;
use crate::parsing::parse_document;
use crate::resolve::{root_name_for_target, tangle, TangleOutput};
use crate::stitch::{stitch, BlockDiff};
use crate::transaction::{apply, plan_stitch, plan_tangle, Action, ApplyReport};

/// Binds a loaded `Config` and `FileDb` to a base directory, giving a
/// single entry point for the engine's read-modify-write operations. A
/// `Context` is single-threaded and synchronous: one invocation holds
/// exclusive use of it, matching the engine's concurrency model.
pub struct Context {
    pub config: Config,
    pub base_dir: PathBuf,
    pub db: FileDb,
}

impl Context {
    /// Load `entangled.toml` and `.entangled/filedb.json` from `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let config = Config::load(&base_dir)?;
        Self::with_config(base_dir, config)
    }

    /// Load from `base_dir`, reading the config from `config_path`
    /// instead of `base_dir/entangled.toml`.
    pub fn with_config_path(base_dir: impl Into<PathBuf>, config_path: &std::path::Path) -> Result<Self> {
        let base_dir = base_dir.into();
        let config = Config::load_from_path(config_path)?;
        Self::with_config(base_dir, config)
    }

    fn with_config(base_dir: PathBuf, config: Config) -> Result<Self> {
        let db = FileDb::load(&base_dir.join(&config.filedb_path))?;
        Ok(Self {
            config,
            base_dir,
            db,
        })
    }

    pub fn resolve_path(&self, path: &RelativePathBuf) -> PathBuf {
        path.to_path(&self.base_dir)
    }

    /// Markdown files matching `config.source_patterns`, deduplicated.
    pub fn source_files(&self) -> Result<Vec<RelativePathBuf>> {
        discover_source_files(&self.base_dir, &self.config)
    }

    /// Parse every discovered source file into a `Document`.
    pub fn load_documents(&self) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        for path in self.source_files()? {
            let abs = self.resolve_path(&path);
            let text = std::fs::read_to_string(&abs)?;
            docs.push(parse_document(path, &text, &self.config)?);
        }
        Ok(docs)
    }

    pub fn tangle_documents(&self, documents: &[Document]) -> Result<Vec<TangleOutput>> {
        tangle(documents, &self.config)
    }

    /// Plan and apply a tangle transaction, updating the in-memory FileDB
    /// for every action that committed. Call `save_filedb` afterward to
    /// persist — nothing here advances the on-disk database.
    pub fn execute_tangle(&mut self, documents: &[Document], force: bool) -> Result<ApplyReport> {
        let outputs = self.tangle_documents(documents)?;
        let txn = plan_tangle(&outputs, &self.db, &self.base_dir, force)?;
        log::info!("tangle: {} action(s) planned", txn.actions.len());
        let report = apply(&txn, &self.base_dir, force)?;
        self.record_tangle_report(documents, &outputs, &report);
        Ok(report)
    }

    /// Recover edits from a tangled target and plan/apply the resulting
    /// Markdown patches.
    pub fn execute_stitch(
        &mut self,
        target: &RelativePathBuf,
        documents: &[Document],
        force: bool,
    ) -> Result<ApplyReport> {
        let diffs = self.stitch_target(target, documents)?;
        self.apply_stitch_diffs(&diffs, force)
    }

    pub fn stitch_target(
        &self,
        target: &RelativePathBuf,
        documents: &[Document],
    ) -> Result<Vec<BlockDiff>> {
        let root_name = root_name_for_target(documents, target).ok_or_else(|| {
            EngineError::UnknownRef {
                name: target.as_str().to_string(),
            }
        })?;
        let content = std::fs::read_to_string(self.resolve_path(target))?;
        stitch(target, &content, documents, &self.config, &root_name)
    }

    fn apply_stitch_diffs(&mut self, diffs: &[BlockDiff], force: bool) -> Result<ApplyReport> {
        let txn = plan_stitch(diffs);
        let report = apply(&txn, &self.base_dir, force)?;
        for action in &report.completed {
            if let Action::PatchDocument { source_path, .. } = action {
                self.record_source_file(source_path);
            }
        }
        Ok(report)
    }

    /// Stitch every externally-modified target back into its Markdown,
    /// then tangle from the (possibly now-updated) sources. Returns the
    /// stitch transaction's report followed by the tangle transaction's.
    pub fn sync(&mut self, force: bool) -> Result<(ApplyReport, ApplyReport)> {
        log::info!("sync: starting in {}", self.base_dir.display());
        let documents = self.load_documents()?;
        let outputs = self.tangle_documents(&documents)?;

        let mut diffs = Vec::new();
        for out in &outputs {
            if self.db.classify(&self.base_dir, &out.path)? == FileStatus::ModifiedExternally {
                diffs.extend(self.stitch_target(&out.path, &documents)?);
            }
        }

        let stitch_report = if diffs.is_empty() {
            ApplyReport {
                completed: Vec::new(),
                pending: Vec::new(),
                error: None,
            }
        } else {
            self.apply_stitch_diffs(&diffs, force)?
        };

        let documents = self.load_documents()?;
        let tangle_report = self.execute_tangle(&documents, force)?;
        Ok((stitch_report, tangle_report))
    }

    pub fn save_filedb(&self) -> Result<()> {
        self.db.save(&self.base_dir.join(&self.config.filedb_path))
    }

    pub fn clear_filedb(&mut self) {
        self.db.clear();
    }

    pub fn tracked_files(&self) -> impl Iterator<Item = &RelativePathBuf> {
        self.db.tracked_paths()
    }

    pub fn tracked_file_count(&self) -> usize {
        self.db.files.len()
    }

    fn record_tangle_report(
        &mut self,
        documents: &[Document],
        outputs: &[TangleOutput],
        report: &ApplyReport,
    ) {
        let written: BTreeSet<RelativePathBuf> = report
            .completed
            .iter()
            .filter_map(|a| match a {
                Action::CreateFile { path, .. } | Action::WriteFile { path, .. } => {
                    Some(path.clone())
                }
                _ => None,
            })
            .collect();

        for out in outputs {
            if !written.contains(&out.path) {
                continue;
            }
            let mut owners: Vec<RelativePathBuf> =
                out.line_map.iter().map(|e| e.source_file.clone()).collect();
            owners.sort();
            owners.dedup();
            self.db.upsert(FileEntry {
                path: out.path.clone(),
                hash: hash_content(&out.content),
                owner: owners,
                line_map: out.line_map.iter().map(StoredLineMapEntry::from).collect(),
            });
        }

        for action in &report.completed {
            if let Action::DeleteFile { path, .. } = action {
                self.db.remove(path);
            }
        }

        for doc in documents {
            self.record_source_file(&doc.path);
        }
    }

    fn record_source_file(&mut self, path: &RelativePathBuf) {
        let Ok(content) = std::fs::read_to_string(self.resolve_path(path)) else {
            return;
        };
        self.db.upsert(FileEntry {
            path: path.clone(),
            hash: hash_content(&content),
            owner: Vec::new(),
            line_map: Vec::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, path: &str, content: &str) {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }

    #[test]
    fn tangle_then_idempotent_second_run_is_empty() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
        );
        let mut ctx = Context::new(dir.path()).unwrap();
        let documents = ctx.load_documents().unwrap();
        let report = ctx.execute_tangle(&documents, false).unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 1);

        let report2 = ctx.execute_tangle(&documents, false).unwrap();
        assert!(report2.is_success());
        assert!(report2.completed.is_empty());
    }

    #[test]
    fn stitch_tangle_fixed_point() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
        );
        let mut ctx = Context::new(dir.path()).unwrap();
        let documents = ctx.load_documents().unwrap();
        ctx.execute_tangle(&documents, false).unwrap();

        // No external edits: stitching finds nothing to patch.
        let diffs = ctx
            .stitch_target(&RelativePathBuf::from("hello.py"), &documents)
            .unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn tracked_file_count_reflects_tangle_and_source() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
        );
        let mut ctx = Context::new(dir.path()).unwrap();
        let documents = ctx.load_documents().unwrap();
        ctx.execute_tangle(&documents, false).unwrap();
        assert_eq!(ctx.tracked_file_count(), 2); // test.md + hello.py
    }

    #[test]
    fn save_and_reload_filedb_round_trips() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
        );
        let mut ctx = Context::new(dir.path()).unwrap();
        let documents = ctx.load_documents().unwrap();
        ctx.execute_tangle(&documents, false).unwrap();
        ctx.save_filedb().unwrap();

        let reloaded = Context::new(dir.path()).unwrap();
        assert_eq!(reloaded.tracked_file_count(), 2);
    }
}

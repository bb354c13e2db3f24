use std::collections::BTreeSet;
use std::path::Path;

use entangled_config::Config;
use relative_path::RelativePathBuf;

use crate::error::{EngineError, Result};

/// Resolve `config.source_patterns` against `base_dir` into a
/// deterministically ordered, deduplicated list of Markdown files.
/// Patterns matched by more than one glob contribute the same file only
/// once.
pub fn discover_source_files(base_dir: &Path, config: &Config) -> Result<Vec<RelativePathBuf>> {
    let mut seen = BTreeSet::new();
    for pattern in &config.source_patterns {
        let full_pattern = base_dir.join(pattern);
        let pattern_str = full_pattern.to_string_lossy().into_owned();
        let paths = glob::glob(&pattern_str).map_err(|source| EngineError::Glob {
            pattern: pattern.clone(),
            source,
        })?;
        for entry in paths {
            let path = entry.map_err(|e| EngineError::Io(e.into_error()))?;
            if !path.is_file() {
                continue;
            }
            let Ok(rel) = path.strip_prefix(base_dir) else {
                continue;
            };
            seen.insert(RelativePathBuf::from(rel.to_string_lossy().replace('\\', "/")));
        }
    }
    let files: Vec<RelativePathBuf> = seen.into_iter().collect();
    log::debug!("discovered {} source file(s) under {}", files.len(), base_dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovers_markdown_files_and_dedupes_overlapping_patterns() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.md"), "# a\n").unwrap();
        std::fs::write(dir.path().join("docs/b.md"), "# b\n").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "not markdown\n").unwrap();

        let mut config = Config::default();
        config.source_patterns = vec!["**/*.md".to_string(), "docs/*.md".to_string()];

        let files = discover_source_files(dir.path(), &config).unwrap();
        let names: Vec<String> = files.iter().map(|p| p.as_str().to_string()).collect();
        assert_eq!(names, vec!["docs/a.md".to_string(), "docs/b.md".to_string()]);
    }

    #[test]
    fn empty_directory_yields_no_files() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let files = discover_source_files(dir.path(), &config).unwrap();
        assert!(files.is_empty());
    }
}

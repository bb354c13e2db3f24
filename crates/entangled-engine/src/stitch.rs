use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use entangled_config::{Annotation, Config};
use regex::Regex;
use relative_path::RelativePathBuf;

use crate::error::{EngineError, Result};
use crate::model::{BlockIndex, CodeBlock, Document, Reference};

/// A recovered source body for one block, ready to compare against the
/// block's current `source` and, if different, patch back into the
/// originating Markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDiff {
    pub block_id: String,
    pub source_path: RelativePathBuf,
    pub start_line: usize,
    pub end_line: usize,
    pub new_source: Vec<String>,
}

struct BlockCapture {
    block_id: String,
    new_source: Vec<String>,
}

/// Recover block edits from a tangled `target_content`, comparing against
/// the blocks currently in `documents` that feed `root_name`'s tangle
/// chain.
///
/// `root_name` is the bare name of the root block(s) that produced this
/// target (i.e. the same name `tangle` used to compose it).
pub fn stitch(
    target_path: &RelativePathBuf,
    target_content: &str,
    documents: &[Document],
    config: &Config,
    root_name: &str,
) -> Result<Vec<BlockDiff>> {
    match config.annotation {
        Annotation::Standard => {}
        Annotation::Naked => {
            return Err(EngineError::Stitch {
                path: PathBuf::from(target_path.as_str()),
                message: "cannot stitch a target tangled with annotation = naked".to_string(),
            });
        }
        Annotation::Supplemental => {
            return Err(EngineError::SupplementalNotSupported {
                path: PathBuf::from(target_path.as_str()),
            });
        }
    }

    let mut sorted_docs = documents.to_vec();
    sorted_docs.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
    let index = BlockIndex::build(&sorted_docs);

    let mut id_to_name: BTreeMap<String, String> = BTreeMap::new();
    let mut id_index: BTreeMap<String, &CodeBlock> = BTreeMap::new();
    for doc in &sorted_docs {
        for block in doc.code_blocks() {
            if let Some(name) = &block.name {
                id_to_name.insert(block.id.clone(), name.clone());
            }
            id_index.insert(block.id.clone(), block);
        }
    }

    let captures = parse_markers(target_content, &id_to_name, target_path)?;
    log::debug!("{target_path}: recovered {} block capture(s)", captures.len());

    let mut diffs = Vec::new();
    let mut seen_ids = HashSet::new();
    for capture in captures {
        let block = id_index.get(&capture.block_id).ok_or_else(|| EngineError::Stitch {
            path: PathBuf::from(target_path.as_str()),
            message: format!("marker references unknown block id `{}`", capture.block_id),
        })?;
        seen_ids.insert(capture.block_id.clone());
        if block.source != capture.new_source {
            log::info!("{target_path}: block `{}` changed, stitching back into {}", block.id, block.origin.source_path);
            diffs.push(BlockDiff {
                block_id: capture.block_id,
                source_path: block.origin.source_path.clone(),
                start_line: block.origin.start_line,
                end_line: block.origin.end_line,
                new_source: capture.new_source,
            });
        }
    }

    let mut visited_names = HashSet::new();
    let mut expected_ids = HashSet::new();
    collect_reachable(root_name, &index, &mut visited_names, &mut expected_ids)?;
    let mut missing: Vec<&String> = expected_ids.difference(&seen_ids).collect();
    missing.sort();
    if let Some(id) = missing.first() {
        return Err(EngineError::MissingBlock { id: (*id).clone() });
    }

    Ok(diffs)
}

/// Scan `content` for `~/~ begin ID[LINE]` / `~/~ end` marker pairs,
/// honoring nesting (a referenced block's markers appear inside the
/// referencing block's span). Reconstructs the referencing block's
/// `<<name>>` placeholder line at the point a nested pair begins, so the
/// recovered body matches what the author actually wrote.
fn parse_markers(
    content: &str,
    id_to_name: &BTreeMap<String, String>,
    target_path: &RelativePathBuf,
) -> Result<Vec<BlockCapture>> {
    let begin_re = Regex::new(r"~/~ begin (\S+)\[(\d+)\]").expect("valid regex");
    let end_re = Regex::new(r"~/~ end\b").expect("valid regex");

    struct Frame {
        id: String,
        indent: usize,
        body: Vec<String>,
    }
    let mut stack: Vec<Frame> = Vec::new();
    let mut captures = Vec::new();

    for line in content.lines() {
        if let Some(caps) = begin_re.captures(line) {
            let id = caps[1].to_string();
            let indent = line.len() - line.trim_start().len();
            if let Some(parent) = stack.last_mut() {
                let bare_name = id_to_name.get(&id).cloned().unwrap_or_else(|| id.clone());
                parent
                    .body
                    .push(format!("{}<<{}>>", " ".repeat(indent), bare_name));
            }
            stack.push(Frame {
                id,
                indent,
                body: Vec::new(),
            });
        } else if end_re.is_match(line) {
            let frame = stack.pop().ok_or_else(|| EngineError::Stitch {
                path: PathBuf::from(target_path.as_str()),
                message: "`~/~ end` without a matching `~/~ begin`".to_string(),
            })?;
            captures.push(BlockCapture {
                block_id: frame.id,
                new_source: frame.body,
            });
        } else if let Some(frame) = stack.last_mut() {
            frame.body.push(strip_indent(line, frame.indent));
        }
    }
    if let Some(frame) = stack.last() {
        return Err(EngineError::Stitch {
            path: PathBuf::from(target_path.as_str()),
            message: format!("`~/~ begin {}` without a matching `~/~ end`", frame.id),
        });
    }
    Ok(captures)
}

fn strip_indent(line: &str, indent: usize) -> String {
    let mut stripped = 0;
    let mut rest = line;
    while stripped < indent {
        match rest.strip_prefix(' ') {
            Some(r) => {
                rest = r;
                stripped += 1;
            }
            None => break,
        }
    }
    rest.to_string()
}

fn collect_reachable(
    name: &str,
    index: &BlockIndex,
    visited_names: &mut HashSet<String>,
    ids: &mut HashSet<String>,
) -> Result<()> {
    if visited_names.contains(name) {
        return Ok(());
    }
    visited_names.insert(name.to_string());
    let blocks = index.get(name).ok_or_else(|| EngineError::UnknownRef {
        name: name.to_string(),
    })?;
    for block in blocks {
        ids.insert(block.id.clone());
        for line in &block.source {
            if let Some(r) = Reference::parse_line(line) {
                collect_reachable(&r.name, index, visited_names, ids)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse_document;
    use crate::resolve::tangle;
    use entangled_config::Style;

    fn cfg() -> Config {
        Config {
            style: Style::EntangledRs,
            ..Config::default()
        }
    }

    fn doc(path: &str, text: &str, config: &Config) -> Document {
        parse_document(RelativePathBuf::from(path), text, config).unwrap()
    }

    #[test]
    fn stitch_recovers_edited_block_body() {
        let config = cfg();
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
            &config,
        );
        let tangled = tangle(std::slice::from_ref(&d), &config).unwrap();
        let edited = tangled[0].content.replace("print('hello')", "print('world')");

        let diffs = stitch(
            &RelativePathBuf::from("hello.py"),
            &edited,
            std::slice::from_ref(&d),
            &config,
            "main",
        )
        .unwrap();

        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].new_source, vec!["print('world')".to_string()]);
        assert_eq!(diffs[0].source_path, RelativePathBuf::from("test.md"));
    }

    #[test]
    fn stitch_is_noop_when_nothing_changed() {
        let config = cfg();
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
            &config,
        );
        let tangled = tangle(std::slice::from_ref(&d), &config).unwrap();

        let diffs = stitch(
            &RelativePathBuf::from("hello.py"),
            &tangled[0].content,
            std::slice::from_ref(&d),
            &config,
            "main",
        )
        .unwrap();

        assert!(diffs.is_empty());
    }

    #[test]
    fn stitch_reconstructs_nested_reference_placeholder() {
        let config = cfg();
        let text = "```python #main file=hello.py\ndef f():\n    <<body>>\n```\n\n```python #body\nx = 1\n```\n";
        let d = doc("test.md", text, &config);
        let tangled = tangle(std::slice::from_ref(&d), &config).unwrap();

        let diffs = stitch(
            &RelativePathBuf::from("hello.py"),
            &tangled[0].content,
            std::slice::from_ref(&d),
            &config,
            "main",
        )
        .unwrap();

        assert!(diffs.is_empty());
    }

    #[test]
    fn orphan_end_marker_is_stitch_error() {
        let config = cfg();
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint(1)\n```\n",
            &config,
        );
        let content = "# ~/~ end\n";
        let result = stitch(
            &RelativePathBuf::from("hello.py"),
            content,
            std::slice::from_ref(&d),
            &config,
            "main",
        );
        assert!(matches!(result, Err(EngineError::Stitch { .. })));
    }

    #[test]
    fn unterminated_begin_marker_is_stitch_error() {
        let config = cfg();
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint(1)\n```\n",
            &config,
        );
        let content = "# ~/~ begin test:main[1]\nprint(1)\n";
        let result = stitch(
            &RelativePathBuf::from("hello.py"),
            content,
            std::slice::from_ref(&d),
            &config,
            "main",
        );
        assert!(matches!(result, Err(EngineError::Stitch { .. })));
    }

    #[test]
    fn truncated_target_missing_a_block_is_missing_block_error() {
        let config = cfg();
        let text = "```python #main file=hello.py\n<<body>>\n```\n\n```python #body\nx = 1\n```\n";
        let d = doc("test.md", text, &config);
        let content = "# ~/~ begin test:main[1]\n# ~/~ end\n";
        let result = stitch(
            &RelativePathBuf::from("hello.py"),
            content,
            std::slice::from_ref(&d),
            &config,
            "main",
        );
        assert!(matches!(result, Err(EngineError::MissingBlock { .. })));
    }

    #[test]
    fn naked_target_cannot_be_stitched() {
        let mut config = cfg();
        config.annotation = Annotation::Naked;
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint(1)\n```\n",
            &config,
        );
        let result = stitch(
            &RelativePathBuf::from("hello.py"),
            "print(1)\n",
            std::slice::from_ref(&d),
            &config,
            "main",
        );
        assert!(matches!(result, Err(EngineError::Stitch { .. })));
    }

    #[test]
    fn supplemental_target_cannot_be_stitched() {
        let mut config = cfg();
        config.annotation = Annotation::Supplemental;
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint(1)\n```\n",
            &config,
        );
        let result = stitch(
            &RelativePathBuf::from("hello.py"),
            "print(1)\n",
            std::slice::from_ref(&d),
            &config,
            "main",
        );
        assert!(matches!(result, Err(EngineError::SupplementalNotSupported { .. })));
    }
}

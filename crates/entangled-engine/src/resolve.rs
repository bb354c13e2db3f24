use std::collections::{BTreeMap, BTreeSet};

use entangled_config::{Annotation, Config};
use relative_path::RelativePathBuf;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::model::{BlockIndex, CodeBlock, Document, Reference};

/// One mapped output line: `None` for annotation marker lines.
#[derive(Debug, Clone)]
struct ExpandedLine {
    text: String,
    source: Option<(RelativePathBuf, usize, String)>,
}

/// A single `(line, source_file, source_line, block_id)` entry. Stored
/// sparsely — annotation marker lines have no entry, matching the
/// `.entangled/filedb.json` schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMapEntry {
    pub line: usize,
    pub source_file: RelativePathBuf,
    pub source_line: usize,
    pub block_id: String,
}

/// A begin/end span recorded for `annotation = supplemental` targets,
/// written to a sidecar file instead of the tangled body.
#[derive(Debug, Clone, Serialize)]
pub struct SupplementalSpan {
    pub block_id: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// The composed text, line map, and (for supplemental targets) sidecar
/// JSON for one tangle target.
#[derive(Debug, Clone)]
pub struct TangleOutput {
    pub path: RelativePathBuf,
    pub content: String,
    pub line_map: Vec<LineMapEntry>,
    pub sidecar: Option<String>,
}

/// Tangle every root block across `documents` into its target file.
///
/// Documents are sorted lexicographically by path before block
/// concatenation and indexing, per the engine's ordering invariant.
pub fn tangle(documents: &[Document], config: &Config) -> Result<Vec<TangleOutput>> {
    let mut sorted_docs = documents.to_vec();
    sorted_docs.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
    let index = BlockIndex::build(&sorted_docs);
    let lang_table = config.language_table();

    let mut targets: BTreeMap<RelativePathBuf, Vec<&CodeBlock>> = BTreeMap::new();
    for doc in &sorted_docs {
        for block in doc.root_blocks() {
            targets
                .entry(block.target.clone().expect("root_blocks() guarantees target"))
                .or_default()
                .push(block);
        }
    }

    let mut outputs = Vec::new();
    for (target, roots) in &targets {
        let names: BTreeSet<&str> = roots.iter().filter_map(|b| b.name.as_deref()).collect();
        if names.len() > 1 {
            return Err(EngineError::DuplicateTarget {
                path: target.clone(),
                sources: roots.iter().map(|b| b.id.clone()).collect(),
            });
        }
        let name = *names.iter().next().ok_or_else(|| EngineError::Parse {
            path: roots[0].origin.source_path.clone(),
            line: roots[0].origin.start_line,
            message: "a root block (file=...) must also carry a #name".to_string(),
        })?;

        let mut stack = Vec::new();
        let lines = expand_name(name, &index, config, &lang_table, &mut stack)?;
        let lines = apply_hooks(lines, config);

        let sidecar = (config.annotation == Annotation::Supplemental)
            .then(|| serde_json::to_string_pretty(&supplemental_spans(&lines)))
            .transpose()
            .expect("Vec<SupplementalSpan> always serializes");

        let (content, line_map) = render(&lines);
        log::info!("tangled {target} from `{name}` ({} lines)", line_map.len());
        outputs.push(TangleOutput {
            path: target.clone(),
            content,
            line_map,
            sidecar,
        });
    }
    Ok(outputs)
}

/// The bare name of the root block(s) that tangle `target`, if any root
/// in `documents` claims it. Used by `sync`/`stitch` to know which name
/// to re-derive a target's expected block set from.
pub fn root_name_for_target(documents: &[Document], target: &RelativePathBuf) -> Option<String> {
    documents
        .iter()
        .flat_map(|doc| doc.root_blocks())
        .find(|block| block.target.as_ref() == Some(target))
        .and_then(|block| block.name.clone())
}

fn expand_name(
    name: &str,
    index: &BlockIndex,
    config: &Config,
    lang_table: &BTreeMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<Vec<ExpandedLine>> {
    let blocks = index.get(name).ok_or_else(|| EngineError::UnknownRef {
        name: name.to_string(),
    })?;
    if stack.iter().any(|n| n == name) {
        return Err(EngineError::Cycle {
            name: name.to_string(),
            path: blocks[0].origin.source_path.clone(),
        });
    }
    stack.push(name.to_string());

    let mut out = Vec::new();
    for block in blocks {
        let body = expand_block_body(block, index, config, lang_table, stack)?;
        if body.is_empty() {
            log::warn!("block `{}` ({}) expands to nothing", name, block.id);
            continue;
        }
        if config.annotation == Annotation::Standard {
            let comment = lang_table
                .get(block.language.as_deref().unwrap_or(""))
                .cloned()
                .unwrap_or_else(|| "#".to_string());
            out.push(ExpandedLine {
                text: format!("{comment} ~/~ begin {}[{}]", block.id, block.origin.start_line),
                source: None,
            });
            out.extend(body);
            out.push(ExpandedLine {
                text: format!("{comment} ~/~ end"),
                source: None,
            });
        } else {
            out.extend(body);
        }
    }

    stack.pop();
    Ok(out)
}

fn expand_block_body(
    block: &CodeBlock,
    index: &BlockIndex,
    config: &Config,
    lang_table: &BTreeMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<Vec<ExpandedLine>> {
    let mut out = Vec::new();
    for (i, line) in block.source.iter().enumerate() {
        let source_line = block.origin.start_line + 1 + i;
        match Reference::parse_line(line) {
            Some(reference) => {
                let nested = expand_name(&reference.name, index, config, lang_table, stack)?;
                for nested_line in nested {
                    let text = if nested_line.text.is_empty() {
                        nested_line.text
                    } else {
                        format!("{}{}", reference.indent, nested_line.text)
                    };
                    out.push(ExpandedLine {
                        text,
                        source: nested_line.source,
                    });
                }
            }
            None => out.push(ExpandedLine {
                text: line.clone(),
                source: Some((block.origin.source_path.clone(), source_line, block.id.clone())),
            }),
        }
    }
    Ok(out)
}

/// Move a leading `#!` shebang, then a leading SPDX license comment, to
/// the top of the composed body. Rewrites the line list in place so
/// the eventual LineMap stays attached to its original source line.
fn apply_hooks(mut lines: Vec<ExpandedLine>, config: &Config) -> Vec<ExpandedLine> {
    let mut insert_at = 0;
    if config.hooks.shebang {
        if let Some(pos) = lines.iter().position(|l| l.text.starts_with("#!")) {
            if pos != 0 {
                let line = lines.remove(pos);
                lines.insert(0, line);
            }
            insert_at = 1;
        }
    }
    if config.hooks.spdx_license {
        if let Some(pos) = lines
            .iter()
            .position(|l| l.text.contains("SPDX-License-Identifier:"))
        {
            if pos != insert_at {
                let line = lines.remove(pos);
                lines.insert(insert_at, line);
            }
        }
    }
    lines
}

fn supplemental_spans(lines: &[ExpandedLine]) -> Vec<SupplementalSpan> {
    let mut spans = Vec::new();
    let mut current: Option<(String, usize, usize)> = None;
    for (i, line) in lines.iter().enumerate() {
        let target_line = i + 1;
        match &line.source {
            Some((_, _, block_id)) if current.as_ref().is_some_and(|(id, ..)| id == block_id) => {
                current.as_mut().unwrap().2 = target_line;
            }
            Some((_, _, block_id)) => {
                if let Some((id, start, end)) = current.take() {
                    spans.push(SupplementalSpan {
                        block_id: id,
                        start_line: start,
                        end_line: end,
                    });
                }
                current = Some((block_id.clone(), target_line, target_line));
            }
            None => {
                if let Some((id, start, end)) = current.take() {
                    spans.push(SupplementalSpan {
                        block_id: id,
                        start_line: start,
                        end_line: end,
                    });
                }
            }
        }
    }
    if let Some((id, start, end)) = current.take() {
        spans.push(SupplementalSpan {
            block_id: id,
            start_line: start,
            end_line: end,
        });
    }
    spans
}

fn render(lines: &[ExpandedLine]) -> (String, Vec<LineMapEntry>) {
    let mut content = String::new();
    let mut line_map = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        content.push_str(&line.text);
        content.push('\n');
        if let Some((source_file, source_line, block_id)) = &line.source {
            line_map.push(LineMapEntry {
                line: i + 1,
                source_file: source_file.clone(),
                source_line: *source_line,
                block_id: block_id.clone(),
            });
        }
    }
    (content, line_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse_document;
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
    fn simple_tangle_wraps_with_annotation_markers() {
        let config = cfg();
        let d = doc(
            "test.md",
            "```python #main file=hello.py\nprint('hello')\n```\n",
            &config,
        );
        let outputs = tangle(&[d], &config).unwrap();
        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(out.path, RelativePathBuf::from("hello.py"));
        assert_eq!(
            out.content,
            "# ~/~ begin test:main[1]\nprint('hello')\n# ~/~ end\n"
        );
        assert_eq!(out.line_map.len(), 1);
        assert_eq!(out.line_map[0].line, 2);
        assert_eq!(out.line_map[0].source_line, 2);
    }

    #[test]
    fn reference_expansion_applies_indentation() {
        let config = cfg();
        let text = "```python #main file=hello.py\ndef f():\n    <<body>>\n```\n\n```python #body\nx = 1\ny = 2\n```\n";
        let d = doc("test.md", text, &config);
        let outputs = tangle(&[d], &config).unwrap();
        let lines: Vec<&str> = outputs[0].content.lines().collect();
        assert!(lines.contains(&"    x = 1"));
        assert!(lines.contains(&"    y = 2"));
    }

    #[test]
    fn cyclic_reference_is_an_error() {
        let config = cfg();
        let text = "```python #a file=out.py\n<<b>>\n```\n\n```python #b\n<<a>>\n```\n";
        let d = doc("test.md", text, &config);
        let result = tangle(&[d], &config);
        assert!(matches!(result, Err(EngineError::Cycle { .. })));
    }

    #[test]
    fn unknown_reference_is_an_error() {
        let config = cfg();
        let text = "```python #main file=out.py\n<<missing>>\n```\n";
        let d = doc("test.md", text, &config);
        let result = tangle(&[d], &config);
        assert!(matches!(result, Err(EngineError::UnknownRef { .. })));
    }

    #[test]
    fn duplicate_target_is_an_error() {
        let config = cfg();
        let text = "```python #a file=out.py\nx = 1\n```\n\n```python #b file=out.py\ny = 2\n```\n";
        let d = doc("test.md", text, &config);
        let result = tangle(&[d], &config);
        assert!(matches!(result, Err(EngineError::DuplicateTarget { .. })));
    }

    #[test]
    fn naked_annotation_emits_no_markers() {
        let mut config = cfg();
        config.annotation = Annotation::Naked;
        let text = "```python #main file=hello.py\nprint('hello')\n```\n";
        let d = doc("test.md", text, &config);
        let outputs = tangle(&[d], &config).unwrap();
        assert_eq!(outputs[0].content, "print('hello')\n");
        assert!(outputs[0].sidecar.is_none());
    }

    #[test]
    fn supplemental_annotation_writes_sidecar_spans_instead_of_markers() {
        let mut config = cfg();
        config.annotation = Annotation::Supplemental;
        let text = "```python #main file=hello.py\nprint('hello')\n```\n";
        let d = doc("test.md", text, &config);
        let outputs = tangle(&[d], &config).unwrap();
        assert_eq!(outputs[0].content, "print('hello')\n");
        let sidecar = outputs[0].sidecar.as_ref().unwrap();
        assert!(sidecar.contains("test:main"));
    }

    #[test]
    fn shebang_hook_moves_leading_marker_to_top() {
        let mut config = cfg();
        config.hooks.shebang = true;
        config.annotation = Annotation::Naked;
        let text = "```python #main file=run.py\nx = 1\n#!/usr/bin/env python\n```\n";
        let d = doc("test.md", text, &config);
        let outputs = tangle(&[d], &config).unwrap();
        assert_eq!(outputs[0].content, "#!/usr/bin/env python\nx = 1\n");
    }

    #[test]
    fn empty_block_contributes_no_lines_or_markers() {
        let config = cfg();
        let text = "```python #main file=out.py\n<<empty>>\n```\n\n```python #empty\n```\n";
        let d = doc("test.md", text, &config);
        let outputs = tangle(&[d], &config).unwrap();
        assert_eq!(outputs[0].content, "");
    }
}

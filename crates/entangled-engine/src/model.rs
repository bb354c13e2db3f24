use std::collections::BTreeMap;
use relative_path::RelativePathBuf;

/// A location in a source Markdown file: the file and a 1-based line range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub source_path: RelativePathBuf,
    pub start_line: usize,
    pub end_line: usize,
}

/// A named fenced code block extracted from a Markdown document.
///
/// `id` is the block's fully-qualified, namespace-resolved identifier;
/// `name` is the bare header id as written, before namespacing is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub id: String,
    pub name: Option<String>,
    pub language: Option<String>,
    pub source: Vec<String>,
    pub target: Option<RelativePathBuf>,
    pub attributes: BTreeMap<String, String>,
    pub origin: Origin,
}

impl CodeBlock {
    /// Whether this block is a root of a tangle chain (has a `file=` target).
    pub fn is_root(&self) -> bool {
        self.target.is_some()
    }

    /// Whether `<<name>>` can resolve to this block at all.
    pub fn is_referenceable(&self) -> bool {
        self.name.is_some()
    }
}

/// A `<<name>>` placeholder occupying a full, indented line inside a
/// block's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub indent: String,
}

impl Reference {
    /// Recognize a reference line, returning its target name and the
    /// leading indentation if the line is *only* a `<<name>>` placeholder
    /// (optionally surrounded by whitespace).
    pub fn parse_line(line: &str) -> Option<Reference> {
        let trimmed = line.trim_start();
        let indent_len = line.len() - trimmed.len();
        let rest = trimmed.strip_prefix("<<")?;
        let name = rest.strip_suffix(">>")?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        Some(Reference {
            name: name.to_string(),
            indent: line[..indent_len].to_string(),
        })
    }
}

/// Verbatim text between fences, preserved so the document round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prose {
    pub text: String,
}

/// One element of a `Document`'s ordered segment list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Prose(Prose),
    Code(CodeBlock),
}

/// A parsed Markdown file: prose and code blocks interleaved in document
/// order. Reassembling the segments reproduces the source text modulo
/// trailing-newline normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: RelativePathBuf,
    pub segments: Vec<Segment>,
}

impl Document {
    pub fn new(path: RelativePathBuf) -> Self {
        Self {
            path,
            segments: Vec::new(),
        }
    }

    /// Iterate over this document's code blocks in document order.
    pub fn code_blocks(&self) -> impl Iterator<Item = &CodeBlock> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Code(block) => Some(block),
            Segment::Prose(_) => None,
        })
    }

    pub fn code_blocks_mut(&mut self) -> impl Iterator<Item = &mut CodeBlock> {
        self.segments.iter_mut().filter_map(|s| match s {
            Segment::Code(block) => Some(block),
            Segment::Prose(_) => None,
        })
    }

    /// Root blocks (those with a `target`), in document order.
    pub fn root_blocks(&self) -> impl Iterator<Item = &CodeBlock> {
        self.code_blocks().filter(|b| b.is_root())
    }

    /// Reassemble prose and code fences back into the original text,
    /// exercising the round-trip identity invariant.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Prose(p) => out.push_str(&p.text),
                Segment::Code(block) => {
                    for line in &block.source {
                        out.push_str(line);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }
}

/// A mapping from block name to every block sharing that name, in global
/// document order. Referencing a name concatenates all of its blocks.
#[derive(Debug, Default)]
pub struct BlockIndex<'a> {
    by_name: BTreeMap<String, Vec<&'a CodeBlock>>,
}

impl<'a> BlockIndex<'a> {
    /// Build an index over every code block across `documents`, which must
    /// already be sorted by `(source_path, starting_line)` — the caller
    /// (the resolver) is responsible for presenting documents and their
    /// blocks in deterministic order.
    pub fn build(documents: &'a [Document]) -> Self {
        let mut by_name: BTreeMap<String, Vec<&CodeBlock>> = BTreeMap::new();
        for doc in documents {
            for block in doc.code_blocks() {
                if let Some(name) = &block.name {
                    by_name.entry(name.clone()).or_default().push(block);
                }
            }
        }
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&[&'a CodeBlock]> {
        self.by_name.get(name).map(|v| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reference_line_with_indent() {
        let r = Reference::parse_line("    <<body>>").unwrap();
        assert_eq!(r.name, "body");
        assert_eq!(r.indent, "    ");
    }

    #[test]
    fn parse_reference_line_rejects_trailing_text() {
        assert!(Reference::parse_line("x = <<body>>").is_none());
        assert!(Reference::parse_line("<<body>> # trailing").is_none());
    }

    #[test]
    fn parse_reference_line_rejects_non_reference() {
        assert!(Reference::parse_line("print('hello')").is_none());
        assert!(Reference::parse_line("<<>>").is_none());
    }

    #[test]
    fn document_to_text_reassembles_prose_and_code() {
        let mut doc = Document::new(RelativePathBuf::from("test.md"));
        doc.segments.push(Segment::Prose(Prose {
            text: "# Title\n\n".to_string(),
        }));
        doc.segments.push(Segment::Code(CodeBlock {
            id: "test.md:main".to_string(),
            name: Some("main".to_string()),
            language: Some("python".to_string()),
            source: vec!["print('hi')".to_string()],
            target: Some(RelativePathBuf::from("hello.py")),
            attributes: BTreeMap::new(),
            origin: Origin {
                source_path: RelativePathBuf::from("test.md"),
                start_line: 3,
                end_line: 5,
            },
        }));
        assert_eq!(doc.to_text(), "# Title\n\nprint('hi')\n");
    }

    #[test]
    fn block_index_concatenates_same_name_blocks_in_order() {
        let make_doc = |path: &str, name: &str, line: &str| {
            let mut doc = Document::new(RelativePathBuf::from(path));
            doc.segments.push(Segment::Code(CodeBlock {
                id: format!("{path}:{name}"),
                name: Some(name.to_string()),
                language: None,
                source: vec![line.to_string()],
                target: None,
                attributes: BTreeMap::new(),
                origin: Origin {
                    source_path: RelativePathBuf::from(path),
                    start_line: 1,
                    end_line: 1,
                },
            }));
            doc
        };
        let docs = vec![make_doc("a.md", "body", "one"), make_doc("b.md", "body", "two")];
        let index = BlockIndex::build(&docs);
        let blocks = index.get("body").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].source, vec!["one".to_string()]);
        assert_eq!(blocks[1].source, vec!["two".to_string()]);
    }
}

use std::collections::BTreeMap;

use entangled_config::{Config, NamespaceDefault, Style};
use relative_path::RelativePathBuf;

use crate::error::{EngineError, Result};
use crate::model::{CodeBlock, Document, Origin, Prose, Segment};

/// Recognized header fields for a single fenced code block, before
/// namespacing or target resolution.
#[derive(Debug, Default)]
struct HeaderInfo {
    language: Option<String>,
    name: Option<String>,
    attributes: BTreeMap<String, String>,
}

/// Parse `text` (the contents of the Markdown file at `path`) into a
/// `Document`, using the block-header grammar selected by `config.style`.
pub fn parse_document(path: RelativePathBuf, text: &str, config: &Config) -> Result<Document> {
    log::debug!("parsing {path}");
    let mut doc = Document::new(path.clone());
    let mut prose = String::new();
    let mut lines = text.split_inclusive('\n').enumerate().peekable();

    while let Some((idx, line)) = lines.next() {
        let lineno = idx + 1;
        let trimmed_end = line.trim_end_matches('\n');
        match fence_open(trimmed_end) {
            Some((fence_char, fence_len, header_text)) => {
                if !prose.is_empty() {
                    doc.segments.push(Segment::Prose(Prose {
                        text: std::mem::take(&mut prose),
                    }));
                }
                let mut body_lines: Vec<String> = Vec::new();
                let mut close_line = None;
                for (body_idx, body_line) in lines.by_ref() {
                    let body_lineno = body_idx + 1;
                    let body_trimmed = body_line.trim_end_matches('\n');
                    if is_fence_close(body_trimmed, fence_char, fence_len) {
                        close_line = Some(body_lineno);
                        break;
                    }
                    body_lines.push(body_trimmed.to_string());
                }
                let end_line = close_line.ok_or_else(|| EngineError::Parse {
                    path: path.clone(),
                    line: lineno,
                    message: "unterminated fenced code block".to_string(),
                })?;

                let header = parse_header(config.style, header_text).map_err(|message| {
                    EngineError::Parse {
                        path: path.clone(),
                        line: lineno,
                        message,
                    }
                })?;

                if config.style == Style::Quarto && config.strip_quarto_options {
                    body_lines.retain(|l| !is_quarto_option_line(l));
                }

                let block = build_block(&path, lineno, end_line, header, body_lines, config);
                log::debug!(
                    "{}:{lineno}: parsed block `{}`{}",
                    path,
                    block.name.as_deref().unwrap_or("<anon>"),
                    block
                        .target
                        .as_ref()
                        .map(|t| format!(" -> {t}"))
                        .unwrap_or_default()
                );
                doc.segments.push(Segment::Code(block));
            }
            None => prose.push_str(line),
        }
    }
    if !prose.is_empty() {
        doc.segments.push(Segment::Prose(Prose { text: prose }));
    }
    Ok(doc)
}

fn build_block(
    path: &RelativePathBuf,
    start_line: usize,
    end_line: usize,
    header: HeaderInfo,
    source: Vec<String>,
    config: &Config,
) -> CodeBlock {
    let target = header
        .attributes
        .get("file")
        .map(|f| RelativePathBuf::from(f.as_str()));

    let id = match &header.name {
        None => format!("{}:anon:{start_line}", path.as_str()),
        Some(name) => match config.namespace_default {
            NamespaceDefault::File => format!("{}:{name}", basename_without_ext(path)),
            NamespaceDefault::None => name.clone(),
        },
    };

    CodeBlock {
        id,
        name: header.name,
        language: header.language,
        source,
        target,
        attributes: header.attributes,
        origin: Origin {
            source_path: path.clone(),
            start_line,
            end_line,
        },
    }
}

fn basename_without_ext(path: &RelativePathBuf) -> String {
    let file_name = path.file_name().unwrap_or(path.as_str());
    file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_string()
}

/// Detect a fence-opening line: 3+ identical backticks at column 0,
/// followed by header text. Returns `(fence_char, fence_len, header)`.
fn fence_open(line: &str) -> Option<(char, usize, &str)> {
    let fence_char = line.chars().next()?;
    if fence_char != '`' && fence_char != '~' {
        return None;
    }
    let fence_len = line.chars().take_while(|&c| c == fence_char).count();
    if fence_len < 3 {
        return None;
    }
    Some((fence_char, fence_len, line[fence_len..].trim()))
}

fn is_fence_close(line: &str, fence_char: char, fence_len: usize) -> bool {
    let actual_len = line.chars().take_while(|&c| c == fence_char).count();
    actual_len == fence_len && line.trim_start_matches(fence_char).trim().is_empty()
}

fn is_quarto_option_line(line: &str) -> bool {
    line.trim_start().starts_with("#|")
}

fn parse_header(style: Style, header: &str) -> std::result::Result<HeaderInfo, String> {
    match style {
        Style::EntangledRs => parse_entangled_rs_header(header),
        Style::Pandoc | Style::Quarto => parse_braced_header(header),
        Style::Knitr => parse_knitr_header(header),
    }
}

/// `LANG #id [key=value ...]`
fn parse_entangled_rs_header(header: &str) -> std::result::Result<HeaderInfo, String> {
    let mut info = HeaderInfo::default();
    let mut tokens = header.split_whitespace();
    if let Some(first) = tokens.next() {
        if let Some(id) = first.strip_prefix('#') {
            info.name = Some(id.to_string());
        } else {
            info.language = Some(first.to_string());
        }
    }
    for token in tokens {
        if let Some(id) = token.strip_prefix('#') {
            info.name = Some(id.to_string());
        } else if let Some((k, v)) = token.split_once('=') {
            info.attributes.insert(k.to_string(), unquote(v));
        } else if !token.is_empty() {
            return Err(format!("malformed header token `{token}`"));
        }
    }
    Ok(info)
}

/// `{.LANG #id key=value}`
fn parse_braced_header(header: &str) -> std::result::Result<HeaderInfo, String> {
    let inner = header
        .strip_prefix('{')
        .and_then(|h| h.strip_suffix('}'))
        .ok_or_else(|| format!("expected `{{...}}` header, got `{header}`"))?;
    let mut info = HeaderInfo::default();
    for token in inner.split_whitespace() {
        if let Some(lang) = token.strip_prefix('.') {
            info.language = Some(lang.to_string());
        } else if let Some(id) = token.strip_prefix('#') {
            info.name = Some(id.to_string());
        } else if let Some((k, v)) = token.split_once('=') {
            info.attributes.insert(k.to_string(), unquote(v));
        } else if !token.is_empty() {
            return Err(format!("malformed header token `{token}`"));
        }
    }
    Ok(info)
}

/// `{LANG, id, key=value, ...}`
fn parse_knitr_header(header: &str) -> std::result::Result<HeaderInfo, String> {
    let inner = header
        .strip_prefix('{')
        .and_then(|h| h.strip_suffix('}'))
        .ok_or_else(|| format!("expected `{{...}}` header, got `{header}`"))?;
    let mut info = HeaderInfo::default();
    let mut parts = inner.split(',').map(str::trim);
    if let Some(lang) = parts.next().filter(|s| !s.is_empty()) {
        info.language = Some(lang.to_string());
    }
    if let Some(id) = parts.next().filter(|s| !s.is_empty()) {
        info.name = Some(id.to_string());
    }
    for part in parts {
        if part.is_empty() {
            continue;
        }
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| format!("malformed knitr option `{part}`"))?;
        info.attributes.insert(k.trim().to_string(), unquote(v.trim()));
    }
    Ok(info)
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') || s.starts_with('\'') && s.ends_with('\''))
        && s.len() >= 2
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

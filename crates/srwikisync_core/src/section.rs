use std::ops::Range;

use crate::error::SyncError;

/// A declared row: its label and, when a qualifying run exists, the new line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRow {
    pub label: String,
    pub line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub text: String,
    pub changed: bool,
    /// Labels whose template call was rewritten with a new line.
    pub replaced: Vec<String>,
    /// Declared labels with no template call in the section.
    pub missing: Vec<String>,
}

/// Byte offsets of one section block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBounds {
    /// Start of the begin marker.
    pub start: usize,
    pub content_start: usize,
    pub content_end: usize,
    /// End of the end marker.
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplateSpan {
    range: Range<usize>,
    label: String,
}

pub fn locate(page: &str, section: &str) -> Result<SectionBounds, SyncError> {
    let begins = find_markers(page, "begin", section);
    let ends = find_markers(page, "end", section);

    let begin = match begins.as_slice() {
        [] => return Err(SyncError::section_not_found(section, "missing begin marker")),
        [only] => only.clone(),
        _ => {
            return Err(SyncError::section_not_found(
                section,
                format!("begin marker appears {} times", begins.len()),
            ));
        }
    };
    let end = match ends.as_slice() {
        [] => return Err(SyncError::section_not_found(section, "missing end marker")),
        [only] => only.clone(),
        _ => {
            return Err(SyncError::section_not_found(
                section,
                format!("end marker appears {} times", ends.len()),
            ));
        }
    };
    if end.start < begin.end {
        return Err(SyncError::section_not_found(
            section,
            "end marker comes before begin marker",
        ));
    }

    Ok(SectionBounds {
        start: begin.start,
        content_start: begin.end,
        content_end: end.start,
        end: end.end,
    })
}

/// The block from the begin marker through the end marker, inclusive.
pub fn section_block<'a>(page: &'a str, section: &str) -> Result<&'a str, SyncError> {
    let bounds = locate(page, section)?;
    Ok(&page[bounds.start..bounds.end])
}

/// Fails when the blocks of any two `sections` overlap or interleave.
pub fn ensure_disjoint(page: &str, sections: &[String]) -> Result<(), SyncError> {
    let mut spans = Vec::with_capacity(sections.len());
    for section in sections {
        spans.push((section.as_str(), locate(page, section)?));
    }
    spans.sort_by_key(|(_, bounds)| bounds.start);
    for pair in spans.windows(2) {
        let (first, first_bounds) = pair[0];
        let (second, second_bounds) = pair[1];
        if second_bounds.start < first_bounds.end {
            return Err(SyncError::section_not_found(
                first,
                format!("overlaps section \"{second}\""),
            ));
        }
    }
    Ok(())
}

pub fn patch(
    page: &str,
    section: &str,
    template: &str,
    rows: &[PlannedRow],
) -> Result<PatchOutcome, SyncError> {
    let bounds = locate(page, section)?;
    let content = &page[bounds.content_start..bounds.content_end];
    let spans = scan_templates(content, template);

    let mut used = vec![false; spans.len()];
    let mut replacements: Vec<(Range<usize>, &str)> = Vec::new();
    let mut replaced = Vec::new();
    let mut missing = Vec::new();

    for row in rows {
        let label = row.label.trim();
        let found = spans
            .iter()
            .enumerate()
            .find(|(index, span)| !used[*index] && span.label == label);
        let Some((index, span)) = found else {
            missing.push(row.label.clone());
            continue;
        };
        used[index] = true;
        if let Some(line) = &row.line {
            let absolute = bounds.content_start + span.range.start
                ..bounds.content_start + span.range.end;
            replacements.push((absolute, line.as_str()));
            replaced.push(row.label.clone());
        }
    }

    replacements.sort_by_key(|(range, _)| range.start);
    let mut text = String::with_capacity(page.len());
    let mut changed = false;
    let mut cursor = 0usize;
    for (range, line) in replacements {
        text.push_str(&page[cursor..range.start]);
        if &page[range.clone()] != line {
            changed = true;
        }
        text.push_str(line);
        cursor = range.end;
    }
    text.push_str(&page[cursor..]);

    Ok(PatchOutcome {
        text,
        changed,
        replaced,
        missing,
    })
}

/// Markers like `<section begin="PH"/>`, tolerating whitespace between tokens,
/// single or missing quotes and an absent slash.
fn find_markers(text: &str, kind: &str, name: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find('<') {
        let start = cursor + offset;
        match parse_marker(text, start + 1, kind) {
            Some((value, end)) if value == name => {
                out.push(start..end);
                cursor = end;
            }
            _ => cursor = start + 1,
        }
        if cursor >= bytes.len() {
            break;
        }
    }
    out
}

fn parse_marker<'a>(text: &'a str, from: usize, kind: &str) -> Option<(&'a str, usize)> {
    let bytes = text.as_bytes();
    let mut i = skip_whitespace(bytes, from);
    i = expect_word(bytes, i, "section")?;
    let after = skip_whitespace(bytes, i);
    if after == i {
        return None;
    }
    i = expect_word(bytes, after, kind)?;
    i = skip_whitespace(bytes, i);
    if bytes.get(i) != Some(&b'=') {
        return None;
    }
    i = skip_whitespace(bytes, i + 1);

    let quote = match bytes.get(i) {
        Some(&q @ (b'"' | b'\'')) => {
            i += 1;
            Some(q)
        }
        _ => None,
    };
    let value_start = i;
    while let Some(&byte) = bytes.get(i) {
        let stop = match quote {
            Some(q) => byte == q,
            None => byte.is_ascii_whitespace() || byte == b'/' || byte == b'>',
        };
        if stop {
            break;
        }
        i += 1;
    }
    let value = text.get(value_start..i)?.trim();
    if quote.is_some() {
        if i >= bytes.len() {
            return None;
        }
        i += 1;
    }

    i = skip_whitespace(bytes, i);
    if bytes.get(i) == Some(&b'/') {
        i = skip_whitespace(bytes, i + 1);
    }
    if bytes.get(i) != Some(&b'>') {
        return None;
    }
    Some((value, i + 1))
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    i
}

fn expect_word(bytes: &[u8], i: usize, word: &str) -> Option<usize> {
    let end = i + word.len();
    let candidate = bytes.get(i..end)?;
    candidate
        .eq_ignore_ascii_case(word.as_bytes())
        .then_some(end)
}

/// Calls of `template` in `content`, with their first positional parameter.
///
/// Calls of other templates are descended into, so a record row wrapped in a
/// layout template is still found.
fn scan_templates(content: &str, template: &str) -> Vec<TemplateSpan> {
    let bytes = content.as_bytes();
    let wanted = normalize_template_name(template);
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'{' && bytes[cursor + 1] == b'{' {
            let Some(end) = template_end(bytes, cursor) else {
                break;
            };
            let inner = &content[cursor + 2..end - 2];
            let params = split_top_level(inner);
            let name = params.first().copied().unwrap_or_default();
            if normalize_template_name(name) == wanted {
                out.push(TemplateSpan {
                    range: cursor..end,
                    label: params.get(1).map(|label| label.trim()).unwrap_or_default().to_string(),
                });
                cursor = end;
            } else {
                cursor += 2;
            }
            continue;
        }
        cursor += 1;
    }
    out
}

/// Offset just past the `}}` closing the call that opens at `start`.
fn template_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'{', b'{') => {
                depth += 1;
                i += 2;
            }
            (b'}', b'}') => {
                depth = depth.saturating_sub(1);
                i += 2;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }
    None
}

/// Split on `|` outside nested `{{…}}` and `[[…]]`.
fn split_top_level(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut parts = Vec::new();
    let mut braces = 0usize;
    let mut links = 0usize;
    let mut part_start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let pair = bytes.get(i..i + 2);
        match pair {
            Some(b"{{") => {
                braces += 1;
                i += 2;
                continue;
            }
            Some(b"}}") => {
                braces = braces.saturating_sub(1);
                i += 2;
                continue;
            }
            Some(b"[[") => {
                links += 1;
                i += 2;
                continue;
            }
            Some(b"]]") => {
                links = links.saturating_sub(1);
                i += 2;
                continue;
            }
            _ => {}
        }
        if bytes[i] == b'|' && braces == 0 && links == 0 {
            parts.push(&inner[part_start..i]);
            part_start = i + 1;
        }
        i += 1;
    }
    parts.push(&inner[part_start..]);
    parts
}

/// MediaWiki treats `_` as a space and ignores the case of the first letter.
fn normalize_template_name(name: &str) -> String {
    let name = name.trim().replace('_', " ");
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

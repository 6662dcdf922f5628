use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::error::SyncError;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TermTable {
    /// Leaderboard category id -> category name as shown on the leaderboard.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
    /// Variable id -> value id -> value label.
    #[serde(default)]
    pub variables: BTreeMap<String, BTreeMap<String, String>>,
    /// Phrase -> wiki replacement, optionally scoped per section.
    #[serde(default)]
    pub terms: BTreeMap<String, TermReplacement>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TermReplacement {
    Flat(String),
    Scoped {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        sections: BTreeMap<String, String>,
    },
}

impl TermReplacement {
    fn for_section(&self, section: &str) -> Option<&str> {
        match self {
            Self::Flat(value) => Some(value.as_str()),
            Self::Scoped { default, sections } => sections
                .get(section)
                .map(String::as_str)
                .filter(|value| !value.is_empty())
                .or(default.as_deref().filter(|value| !value.is_empty())),
        }
    }
}

pub fn load_term_table(path: Option<&Path>) -> Result<TermTable> {
    let Some(path) = path else {
        return Ok(TermTable::default());
    };
    if !path.exists() {
        bail!("term table not found: {}", path.display());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

impl TermTable {
    /// Build the wiki label for a category plus its displayed variable values.
    ///
    /// Produces `<category>` or `<category> {{Small|(<value> / <value>)}}`.
    pub fn resolve(
        &self,
        section: &str,
        category_id: &str,
        label_variables: &[(String, String)],
    ) -> Result<String, SyncError> {
        let name = self
            .categories
            .get(category_id)
            .ok_or_else(|| SyncError::TranslationMissing {
                category_id: category_id.to_string(),
                key: format!("category {category_id}"),
            })?;
        let base = self.apply_terms(name, section);

        let mut fragments = Vec::with_capacity(label_variables.len());
        for (variable_id, value_id) in label_variables {
            let label = self
                .variables
                .get(variable_id)
                .and_then(|values| values.get(value_id))
                .ok_or_else(|| SyncError::TranslationMissing {
                    category_id: category_id.to_string(),
                    key: format!("variable {variable_id}={value_id}"),
                })?;
            fragments.push(self.apply_terms(label, section));
        }

        if fragments.is_empty() {
            return Ok(base);
        }
        Ok(format!("{base} {{{{Small|({})}}}}", fragments.join(" / ")))
    }

    /// Apply wiki substitutions outside existing links and templates.
    ///
    /// Matching is case-sensitive and longest phrase first. Replacement text is
    /// emitted as-is and never scanned again, so substitutions cannot nest.
    pub fn apply_terms(&self, text: &str, section: &str) -> String {
        let substitutions = self.substitutions(section);
        if text.is_empty() || substitutions.is_empty() {
            return text.to_string();
        }

        let mut output = String::with_capacity(text.len());
        for segment in split_protected(text) {
            match segment {
                Segment::Protected(raw) => output.push_str(raw),
                Segment::Plain(raw) => substitute_plain(raw, &substitutions, &mut output),
            }
        }
        output
    }

    fn substitutions(&self, section: &str) -> Vec<(&str, &str)> {
        let mut out = self
            .terms
            .iter()
            .filter(|(phrase, _)| !phrase.is_empty())
            .filter_map(|(phrase, replacement)| {
                replacement
                    .for_section(section)
                    .map(|value| (phrase.as_str(), value))
            })
            .collect::<Vec<_>>();
        out.sort_by(|left, right| right.0.len().cmp(&left.0.len()).then(left.0.cmp(right.0)));
        out
    }
}

fn substitute_plain(raw: &str, substitutions: &[(&str, &str)], output: &mut String) {
    let mut cursor = 0usize;
    while cursor < raw.len() {
        let rest = &raw[cursor..];
        if let Some((phrase, replacement)) = substitutions
            .iter()
            .find(|(phrase, _)| rest.starts_with(phrase))
        {
            output.push_str(replacement);
            cursor += phrase.len();
            continue;
        }
        let ch = rest.chars().next().unwrap_or_default();
        output.push(ch);
        cursor += ch.len_utf8().max(1);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Plain(&'a str),
    Protected(&'a str),
}

/// Split text into plain runs and `[[...]]` / `{{...}}` spans (shortest close).
fn split_protected(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut plain_start = 0usize;
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        let close = match (bytes[cursor], bytes[cursor + 1]) {
            (b'[', b'[') => "]]",
            (b'{', b'{') => "}}",
            _ => {
                cursor += 1;
                continue;
            }
        };
        let Some(offset) = text[cursor + 2..].find(close) else {
            break;
        };
        let end = cursor + 2 + offset + 2;
        if plain_start < cursor {
            out.push(Segment::Plain(&text[plain_start..cursor]));
        }
        out.push(Segment::Protected(&text[cursor..end]));
        cursor = end;
        plain_start = end;
    }

    if plain_start < text.len() {
        out.push(Segment::Plain(&text[plain_start..]));
    }
    out
}

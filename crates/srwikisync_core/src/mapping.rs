use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::curation::{CurationOutcome, CurationRule, apply_curation};
use crate::error::SyncError;
use crate::terms::TermTable;

/// One row as written in a mapping file, before curation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredEntry {
    pub ordinal: usize,
    pub section: String,
    pub wiki_category_label: Option<String>,
    pub game_id: String,
    pub category_id: String,
    pub level_id: Option<String>,
    /// Variable id -> value id. An empty value pins nothing in the query.
    pub variables: BTreeMap<String, String>,
    pub label_variable_ids: Option<Vec<String>>,
}

impl DeclaredEntry {
    /// Label variables with their declared values. Without an explicit list,
    /// every variable that has a value.
    pub fn label_variables(&self, keep: impl Fn(&str) -> bool) -> Vec<(String, String)> {
        let ids = match &self.label_variable_ids {
            Some(ids) => ids.clone(),
            None => self
                .variables
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(id, _)| id.clone())
                .collect(),
        };
        ids.into_iter()
            .filter(|id| keep(id))
            .map(|id| {
                let value = self.variables.get(&id).cloned().unwrap_or_default();
                (id, value)
            })
            .collect()
    }
}

/// One curated row: label resolved, query variables in their effective form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub ordinal: usize,
    pub section: String,
    pub wiki_category_label: String,
    pub game_id: String,
    pub category_id: String,
    pub level_id: Option<String>,
    /// Variables as declared, kept for reporting.
    pub declared_variables: BTreeMap<String, String>,
    /// Variables after `query_vars_keep`/`query_vars_drop`; sent to the leaderboard.
    pub query_variables: BTreeMap<String, String>,
    pub label_variable_ids: Vec<String>,
}

impl MappingEntry {
    /// Variables that constrain the query (non-empty value).
    pub fn pinned_variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query_variables
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(id, value)| (id.as_str(), value.as_str()))
    }

    fn dedup_key(&self) -> DedupKey<'_> {
        (
            self.section.as_str(),
            self.wiki_category_label.as_str(),
            self.game_id.as_str(),
            self.category_id.as_str(),
            self.level_id.as_deref(),
            &self.query_variables,
        )
    }
}

type DedupKey<'a> = (
    &'a str,
    &'a str,
    &'a str,
    &'a str,
    Option<&'a str>,
    &'a BTreeMap<String, String>,
);

/// A mapping file after curation and dedup, ready for matching.
#[derive(Debug, Clone)]
pub struct PreparedMapping {
    pub path: PathBuf,
    pub stem: String,
    pub entries: Vec<MappingEntry>,
    pub excluded: Vec<String>,
    pub untranslated: Vec<SyncError>,
    pub collapsed: usize,
}

impl PreparedMapping {
    /// Sections in order of first appearance.
    pub fn sections(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.entries
            .iter()
            .filter(|entry| seen.insert(entry.section.as_str()))
            .map(|entry| entry.section.clone())
            .collect()
    }

    pub fn entries_for<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a MappingEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.section == section)
    }

    pub fn game_ids(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .map(|entry| entry.game_id.as_str())
            .collect()
    }
}

pub fn mapping_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn load_mapping_file(path: &Path) -> Result<Vec<DeclaredEntry>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_mapping(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_mapping(content: &str) -> Result<Vec<DeclaredEntry>> {
    let records: Vec<MappingRecord> = serde_json::from_str(content)?;
    let mut out = Vec::with_capacity(records.len());
    for (ordinal, record) in records.into_iter().enumerate() {
        let entry = record.into_declared(ordinal);
        if entry.section.trim().is_empty() {
            bail!("entry #{ordinal} has an empty section");
        }
        if entry.game_id.trim().is_empty() || entry.category_id.trim().is_empty() {
            bail!("entry #{ordinal} needs both game_id and category_id");
        }
        out.push(entry);
    }
    Ok(out)
}

/// Load, curate and dedup one mapping file.
///
/// `section_filter` restricts the result to a single section.
pub fn prepare_mapping(
    path: &Path,
    curation: Option<&CurationRule>,
    terms: &TermTable,
    section_filter: Option<&str>,
) -> Result<PreparedMapping> {
    let mut declared = load_mapping_file(path)?;
    if let Some(section) = section_filter {
        declared.retain(|entry| entry.section == section);
    }

    let default_rule = CurationRule::default();
    let CurationOutcome {
        entries,
        excluded,
        untranslated,
    } = apply_curation(declared, curation.unwrap_or(&default_rule), terms);

    let before = entries.len();
    let entries = dedup(entries);
    let collapsed = before - entries.len();
    ensure_unique_rows(&entries)?;

    Ok(PreparedMapping {
        path: path.to_path_buf(),
        stem: mapping_stem(path),
        entries,
        excluded,
        untranslated,
        collapsed,
    })
}

/// Keep the first entry (by ordinal) of every group sharing the full row key.
pub fn dedup(mut entries: Vec<MappingEntry>) -> Vec<MappingEntry> {
    entries.sort_by_key(|entry| entry.ordinal);
    let keep = {
        let mut seen = BTreeSet::new();
        entries
            .iter()
            .map(|entry| {
                let first = seen.insert(entry.dedup_key());
                if !first {
                    debug!(
                        section = %entry.section,
                        label = %entry.wiki_category_label,
                        ordinal = entry.ordinal,
                        "dropping duplicate mapping entry"
                    );
                }
                first
            })
            .collect::<Vec<_>>()
    };
    let mut flags = keep.into_iter();
    entries.retain(|_| flags.next().unwrap_or(false));
    entries
}

/// At most one entry per (section, label) may survive dedup.
pub fn ensure_unique_rows(entries: &[MappingEntry]) -> Result<(), SyncError> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if !seen.insert((entry.section.as_str(), entry.wiki_category_label.as_str())) {
            return Err(SyncError::MappingConflict {
                section: entry.section.clone(),
                label: entry.wiki_category_label.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingRecord {
    Legacy(LegacyRecord),
    Flat(FlatRecord),
}

impl MappingRecord {
    fn into_declared(self, ordinal: usize) -> DeclaredEntry {
        match self {
            Self::Flat(record) => DeclaredEntry {
                ordinal,
                section: record.section.trim().to_string(),
                wiki_category_label: non_empty(record.wiki_category_label),
                game_id: record.game_id.trim().to_string(),
                category_id: record.category_id.trim().to_string(),
                level_id: non_empty(record.level_id),
                variables: record
                    .query_variable_ids
                    .map(VariablesField::into_map)
                    .unwrap_or_default(),
                label_variable_ids: record.label_variable_ids,
            },
            Self::Legacy(record) => DeclaredEntry {
                ordinal,
                section: record.section.trim().to_string(),
                wiki_category_label: non_empty(record.wiki_category_wikitext),
                game_id: record.sr.game.trim().to_string(),
                category_id: record.sr.category_id.trim().to_string(),
                level_id: non_empty(record.sr.level_id),
                variables: record.sr.variables,
                label_variable_ids: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlatRecord {
    section: String,
    #[serde(default, alias = "wiki_category_wikitext")]
    wiki_category_label: Option<String>,
    game_id: String,
    category_id: String,
    #[serde(default)]
    level_id: Option<String>,
    #[serde(default)]
    query_variable_ids: Option<VariablesField>,
    #[serde(default)]
    label_variable_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    section: String,
    #[serde(default, alias = "wiki_category_label")]
    wiki_category_wikitext: Option<String>,
    sr: LegacyQuery,
}

#[derive(Debug, Deserialize)]
struct LegacyQuery {
    game: String,
    category_id: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    level_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VariablesField {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl VariablesField {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            Self::Map(map) => map,
            Self::List(items) => items
                .into_iter()
                .filter_map(|item| {
                    let item = item.trim();
                    if item.is_empty() {
                        return None;
                    }
                    Some(match item.split_once('=') {
                        Some((id, value)) => (id.trim().to_string(), value.trim().to_string()),
                        None => (item.to_string(), String::new()),
                    })
                })
                .collect(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

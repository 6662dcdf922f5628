use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::mapping::{DeclaredEntry, MappingEntry, mapping_stem};
use crate::terms::TermTable;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CurationRule {
    /// Label substrings that exclude an entry (case-insensitive).
    #[serde(default)]
    pub contains: Vec<String>,
    /// Label substrings that keep an entry despite a `contains` match.
    #[serde(default)]
    pub contains_exceptions: Vec<String>,
    #[serde(default)]
    pub label_vars_keep: Vec<String>,
    #[serde(default)]
    pub label_vars_drop: Vec<String>,
    #[serde(default)]
    pub query_vars_keep: Vec<String>,
    #[serde(default)]
    pub query_vars_drop: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurationVerdict {
    Keep,
    Drop,
    /// Matched both a deny and an exception pattern; the exception wins.
    KeepByException,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CurationFile {
    Legacy(Vec<String>),
    Rules(CurationRule),
}

#[derive(Debug, Clone, Default)]
pub struct CurationOutcome {
    pub entries: Vec<MappingEntry>,
    /// Labels removed by the deny list.
    pub excluded: Vec<String>,
    /// Entries skipped because no label could be resolved.
    pub untranslated: Vec<SyncError>,
}

pub fn curation_path(curation_dir: &Path, mapping_path: &Path) -> PathBuf {
    curation_dir.join(format!("{}.json", mapping_stem(mapping_path)))
}

/// Load the curation rule for a mapping file, if one exists.
pub fn load_curation(curation_dir: &Path, mapping_path: &Path) -> Result<Option<CurationRule>> {
    let path = curation_path(curation_dir, mapping_path);
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_curation(&content)
        .map(Some)
        .with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_curation(content: &str) -> Result<CurationRule> {
    let parsed: CurationFile = serde_json::from_str(content)?;
    let rule = match parsed {
        CurationFile::Legacy(contains) => CurationRule {
            contains,
            ..CurationRule::default()
        },
        CurationFile::Rules(rule) => rule,
    };
    Ok(rule.normalized())
}

impl CurationRule {
    fn normalized(self) -> Self {
        Self {
            contains: normalize_patterns(self.contains),
            contains_exceptions: normalize_patterns(self.contains_exceptions),
            label_vars_keep: normalize_ids(self.label_vars_keep),
            label_vars_drop: normalize_ids(self.label_vars_drop),
            query_vars_keep: normalize_ids(self.query_vars_keep),
            query_vars_drop: normalize_ids(self.query_vars_drop),
        }
    }

    pub fn verdict(&self, label: &str) -> CurationVerdict {
        let lowered = label.to_lowercase();
        let denied = self
            .contains
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()));
        if !denied {
            return CurationVerdict::Keep;
        }
        let excepted = self
            .contains_exceptions
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()));
        if excepted {
            CurationVerdict::KeepByException
        } else {
            CurationVerdict::Drop
        }
    }

    pub fn keeps_label_variable(&self, id: &str) -> bool {
        keeps(id, &self.label_vars_keep, &self.label_vars_drop)
    }

    pub fn query_variables(&self, declared: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        declared
            .iter()
            .filter(|(id, _)| keeps(id, &self.query_vars_keep, &self.query_vars_drop))
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect()
    }
}

/// Turn declared entries into curated ones, preserving file order.
///
/// Per entry: label variables are filtered, the label is resolved when the file
/// did not spell it out, the deny list is checked against that label, and
/// finally the query variables are filtered. Dedup runs afterwards on the
/// effective query variables.
pub fn apply_curation(
    declared: Vec<DeclaredEntry>,
    rule: &CurationRule,
    terms: &TermTable,
) -> CurationOutcome {
    let mut outcome = CurationOutcome::default();

    for entry in declared {
        let label_variables = entry.label_variables(|id| rule.keeps_label_variable(id));
        let label = match &entry.wiki_category_label {
            Some(label) => label.clone(),
            None => match terms.resolve(&entry.section, &entry.category_id, &label_variables) {
                Ok(label) => label,
                Err(error) => {
                    warn!(
                        section = %entry.section,
                        ordinal = entry.ordinal,
                        "skipping mapping entry: {error}"
                    );
                    outcome.untranslated.push(error);
                    continue;
                }
            },
        };

        match rule.verdict(&label) {
            CurationVerdict::Keep => {}
            CurationVerdict::KeepByException => {
                debug!(label = %label, "kept by contains_exceptions");
            }
            CurationVerdict::Drop => {
                debug!(label = %label, "excluded by contains");
                outcome.excluded.push(label);
                continue;
            }
        }

        outcome.entries.push(MappingEntry {
            ordinal: entry.ordinal,
            query_variables: rule.query_variables(&entry.variables),
            label_variable_ids: label_variables.into_iter().map(|(id, _)| id).collect(),
            section: entry.section,
            wiki_category_label: label,
            game_id: entry.game_id,
            category_id: entry.category_id,
            level_id: entry.level_id,
            declared_variables: entry.variables,
        });
    }

    outcome
}

fn keeps(id: &str, keep: &[String], drop: &[String]) -> bool {
    if !keep.is_empty() && !keep.iter().any(|item| item == id) {
        return false;
    }
    !drop.iter().any(|item| item == id)
}

fn normalize_patterns(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_ids(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

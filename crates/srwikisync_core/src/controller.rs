use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use similar::TextDiff;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::curation::load_curation;
use crate::error::SyncError;
use crate::leaderboard::{LeaderboardApi, LeaderboardQuery, Run};
use crate::mapping::{PreparedMapping, load_mapping_file, mapping_stem, prepare_mapping};
use crate::matcher::{ResolvedRow, match_entry};
use crate::render::RowRenderer;
use crate::section::{PlannedRow, ensure_disjoint, patch, section_block};
use crate::terms::TermTable;
use crate::wiki::WikiApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    DryRun,
    Write,
    /// Write the new text to `path` instead of the wiki. In batch mode `path`
    /// is a directory receiving `<stem>.wiki` per mapping file.
    Emit { path: PathBuf, section_only: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: Mode,
    /// Only entries of this section are processed.
    pub section: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepared,
    Fetched,
    Matched,
    Rendered,
    Patched,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepared => "prepared",
            Self::Fetched => "fetched",
            Self::Matched => "matched",
            Self::Rendered => "rendered",
            Self::Patched => "patched",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Dry run; `None` when the page would not change.
    Diffed { diff: Option<String> },
    Written { saved: bool },
    Emitted { path: PathBuf },
    /// Declared rows are absent from the page. Nothing was saved; a dry run
    /// still carries the diff and an emit still wrote its file.
    Aborted {
        missing: Vec<SyncError>,
        scaffold: String,
        diff: Option<String>,
        emitted: Option<PathBuf>,
    },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingReport {
    pub mapping: String,
    pub page_title: String,
    pub entries: usize,
    pub excluded: Vec<String>,
    pub skipped: Vec<SyncError>,
    pub collapsed: usize,
    /// Labels without a qualifying run; their rows were left as they were.
    pub unmatched: Vec<String>,
    pub replaced: usize,
    pub changed: bool,
    pub requests: usize,
    pub outcome: Outcome,
}

/// Shared, read-only inputs of one invocation.
pub struct SyncContext<'a> {
    pub config: &'a SyncConfig,
    pub terms: &'a TermTable,
    pub renderer: RowRenderer,
    pub page_title: String,
}

impl<'a> SyncContext<'a> {
    pub fn new(config: &'a SyncConfig, terms: &'a TermTable) -> Result<Self> {
        Ok(Self {
            config,
            terms,
            renderer: RowRenderer::new(config.template(), config.time_format()),
            page_title: config.page_title()?,
        })
    }
}

pub fn run_mapping<L: LeaderboardApi, W: WikiApi>(
    mapping_path: &Path,
    context: &SyncContext<'_>,
    options: &RunOptions,
    leaderboard: &mut L,
    wiki: &mut W,
) -> Result<MappingReport> {
    let stem = mapping_stem(mapping_path);
    let section_filter = options
        .section
        .as_deref()
        .or(context.config.behavior.section_name.as_deref());

    let curation = load_curation(&context.config.curation_dir(), mapping_path)?;
    let prepared = prepare_mapping(mapping_path, curation.as_ref(), context.terms, section_filter)?;
    if prepared.entries.is_empty() {
        match section_filter {
            Some(section) => bail!("{stem}: no usable entries for section {section}"),
            None => bail!("{stem}: no usable entries"),
        }
    }
    log_stage(&stem, Stage::Prepared, prepared.entries.len());

    let runs = fetch_runs(&prepared, leaderboard)?;
    log_stage(&stem, Stage::Fetched, runs.len());

    let resolved = prepared
        .entries
        .iter()
        .map(|entry| {
            let query = LeaderboardQuery::for_entry(entry);
            let runs = runs.get(&query).map(Vec::as_slice).unwrap_or_default();
            match_entry(entry, runs)
        })
        .collect::<Vec<_>>();
    let unmatched = resolved
        .iter()
        .filter(|row| row.record().is_none())
        .map(|row| row.entry.wiki_category_label.clone())
        .collect::<Vec<_>>();
    log_stage(&stem, Stage::Matched, resolved.len() - unmatched.len());

    let planned = plan_rows(&prepared, &resolved, &context.renderer);
    log_stage(&stem, Stage::Rendered, planned.len());

    let old_text = wiki
        .read(&context.page_title)
        .with_context(|| format!("failed to read page {}", context.page_title))?;
    let sections = planned
        .iter()
        .map(|(section, _)| section.clone())
        .collect::<Vec<_>>();
    ensure_disjoint(&old_text, &sections)?;

    let mut new_text = old_text.clone();
    let mut replaced = 0usize;
    let mut changed_sections = Vec::new();
    let mut missing = Vec::new();
    for (section, rows) in &planned {
        let outcome = patch(&new_text, section, context.renderer.template(), rows)?;
        replaced += outcome.replaced.len();
        if outcome.changed {
            changed_sections.push(section.clone());
        }
        if !outcome.missing.is_empty() {
            missing.push(SyncError::MissingDeclaredRow {
                section: section.clone(),
                labels: outcome.missing,
            });
        }
        new_text = outcome.text;
    }
    let changed = new_text != old_text;
    log_stage(&stem, Stage::Patched, replaced);

    let outcome = if missing.is_empty() {
        finish(
            context,
            &options.mode,
            &planned,
            &old_text,
            &new_text,
            &changed_sections,
            wiki,
        )?
    } else {
        let scaffold = scaffold_text(&missing, &context.renderer);
        let (diff, emitted) = match &options.mode {
            Mode::Write => (None, None),
            preview => match finish(
                context,
                preview,
                &planned,
                &old_text,
                &new_text,
                &changed_sections,
                wiki,
            )? {
                Outcome::Diffed { diff } => (diff, None),
                Outcome::Emitted { path } => (None, Some(path)),
                _ => (None, None),
            },
        };
        Outcome::Aborted {
            missing,
            scaffold,
            diff,
            emitted,
        }
    };

    Ok(MappingReport {
        mapping: stem,
        page_title: context.page_title.clone(),
        entries: prepared.entries.len(),
        excluded: prepared.excluded,
        skipped: prepared.untranslated,
        collapsed: prepared.collapsed,
        unmatched,
        replaced,
        changed,
        requests: leaderboard.request_count(),
        outcome,
    })
}

/// One query per distinct leaderboard request. Any failure aborts the file.
fn fetch_runs<L: LeaderboardApi>(
    prepared: &PreparedMapping,
    leaderboard: &mut L,
) -> Result<BTreeMap<LeaderboardQuery, Vec<Run>>> {
    let mut runs = BTreeMap::new();
    for entry in &prepared.entries {
        let query = LeaderboardQuery::for_entry(entry);
        if runs.contains_key(&query) {
            continue;
        }
        let fetched = leaderboard.query(&query).map_err(|error| {
            SyncError::ExternalFetchFailure {
                game_id: entry.game_id.clone(),
                category_id: entry.category_id.clone(),
                message: format!("{error:#}"),
            }
        })?;
        runs.insert(query, fetched);
    }
    Ok(runs)
}

fn plan_rows(
    prepared: &PreparedMapping,
    resolved: &[ResolvedRow<'_>],
    renderer: &RowRenderer,
) -> Vec<(String, Vec<PlannedRow>)> {
    prepared
        .sections()
        .into_iter()
        .map(|section| {
            let rows = resolved
                .iter()
                .filter(|row| row.entry.section == section)
                .map(|row| PlannedRow {
                    label: row.entry.wiki_category_label.clone(),
                    line: renderer.render(row),
                })
                .collect();
            (section, rows)
        })
        .collect()
}

fn finish<W: WikiApi>(
    context: &SyncContext<'_>,
    mode: &Mode,
    planned: &[(String, Vec<PlannedRow>)],
    old_text: &str,
    new_text: &str,
    changed_sections: &[String],
    wiki: &mut W,
) -> Result<Outcome> {
    let title = &context.page_title;
    match mode {
        Mode::DryRun => Ok(Outcome::Diffed {
            diff: (old_text != new_text).then(|| unified_diff(title, old_text, new_text)),
        }),
        Mode::Write => {
            if old_text == new_text {
                return Ok(Outcome::Written { saved: false });
            }
            let summary = context.config.edit_summary(changed_sections);
            wiki.save(title, new_text, &summary)?;
            info!(page = %title, "saved");
            Ok(Outcome::Written { saved: true })
        }
        Mode::Emit { path, section_only } => {
            let content = if *section_only {
                let mut blocks = Vec::with_capacity(planned.len());
                for (section, _) in planned {
                    blocks.push(section_block(new_text, section)?);
                }
                let mut joined = blocks.join("\n");
                joined.push('\n');
                joined
            } else {
                new_text.to_string()
            };
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(Outcome::Emitted { path: path.clone() })
        }
    }
}

pub fn unified_diff(title: &str, old_text: &str, new_text: &str) -> String {
    TextDiff::from_lines(old_text, new_text)
        .unified_diff()
        .header(&format!("a/{title}"), &format!("b/{title}"))
        .to_string()
}

/// Placeholder rows for every missing label, grouped by section.
fn scaffold_text(missing: &[SyncError], renderer: &RowRenderer) -> String {
    let mut out = String::new();
    for error in missing {
        if let SyncError::MissingDeclaredRow { section, labels } = error {
            out.push_str(&format!("<!-- {section} -->\n"));
            for label in labels {
                out.push_str(&renderer.scaffold(label));
                out.push('\n');
            }
        }
    }
    out
}

fn log_stage(mapping: &str, stage: Stage, count: usize) {
    info!(mapping, %stage, count, "stage complete");
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub reports: Vec<MappingReport>,
    pub failures: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.reports.iter().any(|report| report.outcome.is_failure())
    }
}

/// Excludes may be repeated or comma separated.
pub fn split_excludes(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// `*.json` directly inside `dir`, sorted by file name.
pub fn discover_mappings(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("mappings directory not found: {}", dir.display());
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if entry.file_type().is_file() && is_json {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort_by(|left, right| left.file_name().cmp(&right.file_name()));
    Ok(paths)
}

/// A file is excluded when its stem, or any section or game id in it, is listed.
fn is_excluded(path: &Path, excludes: &[String]) -> bool {
    if excludes.is_empty() {
        return false;
    }
    if excludes.contains(&mapping_stem(path)) {
        return true;
    }
    match load_mapping_file(path) {
        Ok(entries) => entries.iter().any(|entry| {
            excludes.contains(&entry.section) || excludes.contains(&entry.game_id)
        }),
        Err(_) => false,
    }
}

pub fn run_batch<L: LeaderboardApi, W: WikiApi>(
    context: &SyncContext<'_>,
    options: &RunOptions,
    excludes: &[String],
    leaderboard: &mut L,
    wiki: &mut W,
) -> Result<BatchReport> {
    let dir = context.config.mappings_dir();
    let paths = discover_mappings(&dir)?;
    if paths.is_empty() {
        bail!("no mapping files found in {}", dir.display());
    }

    let mut batch = BatchReport::default();
    for path in paths {
        let stem = mapping_stem(&path);
        if is_excluded(&path, excludes) {
            info!(mapping = %stem, "excluded");
            batch.skipped.push(stem);
            continue;
        }

        let file_options = match &options.mode {
            Mode::Emit {
                path: out_dir,
                section_only,
            } => RunOptions {
                mode: Mode::Emit {
                    path: out_dir.join(format!("{stem}.wiki")),
                    section_only: *section_only,
                },
                section: options.section.clone(),
            },
            _ => options.clone(),
        };

        match run_mapping(&path, context, &file_options, leaderboard, wiki) {
            Ok(report) => batch.reports.push(report),
            Err(error) => {
                warn!(mapping = %stem, "failed: {error:#}");
                batch.failures.push((stem, format!("{error:#}")));
            }
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use anyhow::{Result, bail};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::{
        Mode, Outcome, RunOptions, SyncContext, discover_mappings, run_batch, run_mapping,
        split_excludes, unified_diff,
    };
    use crate::config::SyncConfig;
    use crate::error::SyncError;
    use crate::leaderboard::{LeaderboardApi, LeaderboardQuery, Run};
    use crate::terms::TermTable;
    use crate::wiki::WikiApi;

    struct MockLeaderboard {
        runs: BTreeMap<String, Vec<Run>>,
        fail: bool,
        queries: Vec<LeaderboardQuery>,
    }

    impl MockLeaderboard {
        fn new() -> Self {
            Self {
                runs: BTreeMap::new(),
                fail: false,
                queries: Vec::new(),
            }
        }

        fn with_runs(mut self, category_id: &str, runs: Vec<Run>) -> Self {
            self.runs.insert(category_id.to_string(), runs);
            self
        }
    }

    impl LeaderboardApi for MockLeaderboard {
        fn query(&mut self, query: &LeaderboardQuery) -> Result<Vec<Run>> {
            self.queries.push(query.clone());
            if self.fail {
                bail!("leaderboard API request failed with HTTP 503 Service Unavailable");
            }
            Ok(self.runs.get(&query.category_id).cloned().unwrap_or_default())
        }

        fn request_count(&self) -> usize {
            self.queries.len()
        }
    }

    struct MockWiki {
        page: String,
        saves: Vec<(String, String, String)>,
        reject: Option<String>,
        reads: usize,
    }

    impl MockWiki {
        fn new(page: &str) -> Self {
            Self {
                page: page.to_string(),
                saves: Vec::new(),
                reject: None,
                reads: 0,
            }
        }
    }

    impl WikiApi for MockWiki {
        fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, _title: &str) -> Result<String> {
            self.reads += 1;
            Ok(self.page.clone())
        }

        fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()> {
            self.saves
                .push((title.to_string(), text.to_string(), summary.to_string()));
            if let Some(message) = &self.reject {
                return Err(SyncError::SaveRejected {
                    title: title.to_string(),
                    message: message.clone(),
                }
                .into());
            }
            self.page = text.to_string();
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.reads + self.saves.len()
        }
    }

    fn run(id: &str, player: &str, time: f64, date: &str, vars: &[(&str, &str)]) -> Run {
        Run {
            id: id.to_string(),
            player: player.to_string(),
            time_seconds: time,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
            variable_values: vars
                .iter()
                .map(|(id, value)| (id.to_string(), value.to_string()))
                .collect(),
        }
    }

    const PAGE: &str = "== Records ==\n<section begin=\"PH\"/>\n{| class=\"wikitable\"\n{{Speedrun Record|Any%|A|2:03.400|January 1, 2020}}\n|}\n<section end=\"PH\"/>\nFooter\n";

    fn config(root: &Path) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.wiki.page_title = Some("Speedruns".to_string());
        config.behavior.mappings_dir = Some(root.join("mappings"));
        config
    }

    fn write_mapping(root: &Path, stem: &str, body: &str) -> std::path::PathBuf {
        let dir = root.join("mappings");
        fs::create_dir_all(&dir).expect("create mappings dir");
        let path = dir.join(format!("{stem}.json"));
        fs::write(&path, body).expect("write mapping");
        path
    }

    fn options(mode: Mode) -> RunOptions {
        RunOptions {
            mode,
            section: None,
        }
    }

    const ANY_PERCENT: &str = r#"[{"section": "PH", "wiki_category_label": "Any%", "game_id": "g1", "category_id": "c1", "query_variable_ids": []}]"#;

    #[test]
    fn dry_run_diffs_the_single_changed_row() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(temp.path(), "tlozph", ANY_PERCENT);
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard = MockLeaderboard::new().with_runs(
            "c1",
            vec![
                run("r1", "A", 123.4, "2020-01-01", &[]),
                run("r2", "B", 99.0, "2022-11-30", &[]),
            ],
        );
        let mut wiki = MockWiki::new(PAGE);

        let report = run_mapping(&path, &context, &options(Mode::DryRun), &mut leaderboard, &mut wiki)
            .expect("run");

        assert!(report.changed);
        assert_eq!(report.replaced, 1);
        let Outcome::Diffed { diff: Some(diff) } = &report.outcome else {
            panic!("expected a diff, got {:?}", report.outcome);
        };
        assert!(diff.contains("--- a/Speedruns"));
        assert!(diff.contains("+++ b/Speedruns"));
        assert!(diff.contains("-{{Speedrun Record|Any%|A|2:03.400|January 1, 2020}}"));
        assert!(diff.contains("+{{Speedrun Record|Any%|B|1:39.000|November 30, 2022}}"));
        assert!(wiki.saves.is_empty());
    }

    #[test]
    fn curation_collapses_variable_split_entries_into_one_query() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(
            temp.path(),
            "tlozph",
            r#"[
  {"section": "PH", "wiki_category_label": "Any%", "game_id": "g1", "category_id": "c1", "query_variable_ids": ["v1"]},
  {"section": "PH", "wiki_category_label": "Any%", "game_id": "g1", "category_id": "c1", "query_variable_ids": []}
]"#,
        );
        let curation_dir = temp.path().join("mappings").join("curation");
        fs::create_dir_all(&curation_dir).expect("create curation dir");
        fs::write(curation_dir.join("tlozph.json"), r#"{"query_vars_drop": ["v1"]}"#)
            .expect("write curation");

        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard =
            MockLeaderboard::new().with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])]);
        let mut wiki = MockWiki::new(PAGE);

        let report = run_mapping(&path, &context, &options(Mode::DryRun), &mut leaderboard, &mut wiki)
            .expect("run");

        assert_eq!(report.entries, 1);
        assert_eq!(report.collapsed, 1);
        assert_eq!(leaderboard.queries.len(), 1);
        assert!(leaderboard.queries[0].variables.is_empty());
    }

    #[test]
    fn missing_row_aborts_without_saving() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(
            temp.path(),
            "tlozph",
            r#"[
  {"section": "PH", "wiki_category_label": "Any%", "game_id": "g1", "category_id": "c1"},
  {"section": "PH", "wiki_category_label": "100%", "game_id": "g1", "category_id": "c2"}
]"#,
        );
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard = MockLeaderboard::new()
            .with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])])
            .with_runs("c2", vec![run("r3", "C", 300.0, "2021-05-05", &[])]);
        let mut wiki = MockWiki::new(PAGE);

        let report = run_mapping(&path, &context, &options(Mode::Write), &mut leaderboard, &mut wiki)
            .expect("run");

        let Outcome::Aborted {
            missing,
            scaffold,
            diff,
            emitted,
        } = &report.outcome
        else {
            panic!("expected abort, got {:?}", report.outcome);
        };
        assert!(diff.is_none());
        assert!(emitted.is_none());
        assert_eq!(
            missing,
            &vec![SyncError::MissingDeclaredRow {
                section: "PH".to_string(),
                labels: vec!["100%".to_string()],
            }]
        );
        assert!(scaffold.contains("{{Speedrun Record|100%|<player>|<time>|<date>}}"));
        assert!(report.outcome.is_failure());
        assert!(wiki.saves.is_empty());
        assert_eq!(wiki.page, PAGE);
    }

    #[test]
    fn missing_row_still_previews_existing_rows_in_dry_run_and_emit() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(
            temp.path(),
            "tlozph",
            r#"[
  {"section": "PH", "wiki_category_label": "Any%", "game_id": "g1", "category_id": "c1"},
  {"section": "PH", "wiki_category_label": "100%", "game_id": "g1", "category_id": "c2"}
]"#,
        );
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard = MockLeaderboard::new()
            .with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])])
            .with_runs("c2", vec![run("r3", "C", 300.0, "2021-05-05", &[])]);
        let mut wiki = MockWiki::new(PAGE);

        let dry = run_mapping(&path, &context, &options(Mode::DryRun), &mut leaderboard, &mut wiki)
            .expect("dry run");
        assert!(dry.outcome.is_failure());
        let Outcome::Aborted { diff: Some(diff), .. } = &dry.outcome else {
            panic!("expected abort with a diff, got {:?}", dry.outcome);
        };
        assert!(diff.contains("+{{Speedrun Record|Any%|B|1:39.000|November 30, 2022}}"));
        assert!(!diff.contains("100%"));

        let out = temp.path().join("out").join("ph.wiki");
        let emit = run_mapping(
            &path,
            &context,
            &options(Mode::Emit {
                path: out.clone(),
                section_only: false,
            }),
            &mut leaderboard,
            &mut wiki,
        )
        .expect("emit");
        assert!(emit.outcome.is_failure());
        let Outcome::Aborted { emitted, scaffold, .. } = &emit.outcome else {
            panic!("expected abort, got {:?}", emit.outcome);
        };
        assert_eq!(emitted.as_ref(), Some(&out));
        assert!(scaffold.contains("|100%|"));
        let emitted_text = fs::read_to_string(&out).expect("read emitted");
        assert!(emitted_text.contains("{{Speedrun Record|Any%|B|1:39.000|November 30, 2022}}"));
        assert!(emitted_text.ends_with("Footer\n"));

        assert!(wiki.saves.is_empty());
        assert_eq!(wiki.page, PAGE);
    }

    #[test]
    fn write_saves_once_and_second_run_is_a_no_op() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(temp.path(), "tlozph", ANY_PERCENT);
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard =
            MockLeaderboard::new().with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])]);
        let mut wiki = MockWiki::new(PAGE);

        let first = run_mapping(&path, &context, &options(Mode::Write), &mut leaderboard, &mut wiki)
            .expect("first run");
        assert_eq!(first.outcome, Outcome::Written { saved: true });
        assert_eq!(wiki.saves.len(), 1);
        assert_eq!(wiki.saves[0].0, "Speedruns");
        assert_eq!(wiki.saves[0].2, "Update speedrun.com WRs for PH (automated)");
        assert!(wiki.page.starts_with("== Records ==\n<section begin=\"PH\"/>\n"));
        assert!(wiki.page.ends_with("<section end=\"PH\"/>\nFooter\n"));

        let second = run_mapping(&path, &context, &options(Mode::Write), &mut leaderboard, &mut wiki)
            .expect("second run");
        assert_eq!(second.outcome, Outcome::Written { saved: false });
        assert!(!second.changed);
        assert_eq!(wiki.saves.len(), 1);

        let dry = run_mapping(&path, &context, &options(Mode::DryRun), &mut leaderboard, &mut wiki)
            .expect("dry run");
        assert_eq!(dry.outcome, Outcome::Diffed { diff: None });
    }

    #[test]
    fn rejected_save_is_reported_verbatim_and_not_retried() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(temp.path(), "tlozph", ANY_PERCENT);
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard =
            MockLeaderboard::new().with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])]);
        let mut wiki = MockWiki::new(PAGE);
        wiki.reject = Some("{\"captcha\":{\"type\":\"image\"},\"result\":\"Failure\"}".to_string());

        let error = run_mapping(&path, &context, &options(Mode::Write), &mut leaderboard, &mut wiki)
            .expect_err("rejected");

        assert_eq!(wiki.saves.len(), 1);
        match error.downcast_ref::<SyncError>() {
            Some(SyncError::SaveRejected { message, .. }) => assert!(message.contains("captcha")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn fetch_failure_stops_before_reading_the_page() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(temp.path(), "tlozph", ANY_PERCENT);
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard = MockLeaderboard::new();
        leaderboard.fail = true;
        let mut wiki = MockWiki::new(PAGE);

        let error = run_mapping(&path, &context, &options(Mode::Write), &mut leaderboard, &mut wiki)
            .expect_err("fetch failure");

        assert!(matches!(
            error.downcast_ref::<SyncError>(),
            Some(SyncError::ExternalFetchFailure { .. })
        ));
        assert_eq!(wiki.reads, 0);
        assert!(wiki.saves.is_empty());
    }

    #[test]
    fn interleaved_sections_fail_before_saving() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(
            temp.path(),
            "tloz",
            r#"[
  {"section": "PH", "wiki_category_label": "Any%", "game_id": "g1", "category_id": "c1"},
  {"section": "ST", "wiki_category_label": "Any%", "game_id": "g2", "category_id": "c2"}
]"#,
        );
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard = MockLeaderboard::new()
            .with_runs("c1", vec![run("r1", "B", 99.0, "2022-11-30", &[])])
            .with_runs("c2", vec![run("r2", "E", 150.0, "2021-01-01", &[])]);
        let page = "<section begin=\"PH\"/>\n{{Speedrun Record|Any%|A|2:03.400|January 1, 2020}}\n<section begin=\"ST\"/>\n{{Speedrun Record|Any%|D|3:00.000|June 3, 2018}}\n<section end=\"PH\"/>\n<section end=\"ST\"/>\n";
        let mut wiki = MockWiki::new(page);

        let error = run_mapping(&path, &context, &options(Mode::Write), &mut leaderboard, &mut wiki)
            .expect_err("overlap");

        assert!(matches!(
            error.downcast_ref::<SyncError>(),
            Some(SyncError::SectionNotFound { .. })
        ));
        assert!(wiki.saves.is_empty());
    }

    #[test]
    fn unmatched_rows_stay_untouched() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(temp.path(), "tlozph", ANY_PERCENT);
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard = MockLeaderboard::new();
        let mut wiki = MockWiki::new(PAGE);

        let report = run_mapping(&path, &context, &options(Mode::DryRun), &mut leaderboard, &mut wiki)
            .expect("run");
        assert_eq!(report.unmatched, vec!["Any%".to_string()]);
        assert_eq!(report.outcome, Outcome::Diffed { diff: None });
    }

    #[test]
    fn emit_section_only_writes_the_block() {
        let temp = tempdir().expect("tempdir");
        let path = write_mapping(temp.path(), "tlozph", ANY_PERCENT);
        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard =
            MockLeaderboard::new().with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])]);
        let mut wiki = MockWiki::new(PAGE);
        let out = temp.path().join("out").join("ph.wiki");

        let report = run_mapping(
            &path,
            &context,
            &options(Mode::Emit {
                path: out.clone(),
                section_only: true,
            }),
            &mut leaderboard,
            &mut wiki,
        )
        .expect("run");

        assert_eq!(report.outcome, Outcome::Emitted { path: out.clone() });
        let emitted = fs::read_to_string(&out).expect("read emitted");
        assert!(emitted.starts_with("<section begin=\"PH\"/>"));
        assert!(emitted.contains("{{Speedrun Record|Any%|B|1:39.000|November 30, 2022}}"));
        assert!(emitted.ends_with("<section end=\"PH\"/>\n"));
        assert!(!emitted.contains("Footer"));
        assert!(wiki.saves.is_empty());
    }

    #[test]
    fn batch_runs_sorted_files_and_honors_excludes() {
        let temp = tempdir().expect("tempdir");
        write_mapping(temp.path(), "b_game", ANY_PERCENT);
        write_mapping(
            temp.path(),
            "a_game",
            r#"[{"section": "ST", "wiki_category_label": "Any%", "game_id": "g2", "category_id": "c9"}]"#,
        );
        write_mapping(
            temp.path(),
            "c_game",
            r#"[{"section": "PH", "wiki_category_label": "Any%", "game_id": "skipme", "category_id": "c1"}]"#,
        );
        fs::write(temp.path().join("mappings").join("notes.txt"), "ignored").expect("write notes");

        let found = discover_mappings(&temp.path().join("mappings")).expect("discover");
        assert_eq!(
            found
                .iter()
                .map(|path| path.file_name().and_then(|n| n.to_str()).unwrap_or_default())
                .collect::<Vec<_>>(),
            vec!["a_game.json", "b_game.json", "c_game.json"]
        );

        let config = config(temp.path());
        let terms = TermTable::default();
        let context = SyncContext::new(&config, &terms).expect("context");
        let mut leaderboard =
            MockLeaderboard::new().with_runs("c1", vec![run("r2", "B", 99.0, "2022-11-30", &[])]);
        let mut wiki = MockWiki::new(PAGE);

        let excludes = split_excludes(&["skipme, unused".to_string()]);
        let batch = run_batch(&context, &options(Mode::DryRun), &excludes, &mut leaderboard, &mut wiki)
            .expect("batch");

        assert_eq!(batch.skipped, vec!["c_game".to_string()]);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, "a_game");
        assert!(batch.failures[0].1.contains("section \"ST\" not usable"));
        assert_eq!(batch.reports.len(), 1);
        assert_eq!(batch.reports[0].mapping, "b_game");
        assert!(!batch.is_success());
    }

    #[test]
    fn unified_diff_has_page_headers() {
        let diff = unified_diff("Page", "a\nb\n", "a\nc\n");
        assert!(diff.starts_with("--- a/Page\n+++ b/Page\n"));
        assert!(diff.contains("-b\n+c\n"));
    }
}

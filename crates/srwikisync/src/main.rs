use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::{ArgGroup, Parser};
use srwikisync_core::config::{SyncConfig, load_config};
use srwikisync_core::controller::{
    BatchReport, MappingReport, Mode, Outcome, RunOptions, SyncContext, run_batch, run_mapping,
    split_excludes,
};
use srwikisync_core::leaderboard::{LeaderboardClient, LeaderboardClientConfig};
use srwikisync_core::terms::load_term_table;
use srwikisync_core::wiki::{MediaWikiClient, MediaWikiClientConfig, WikiApi, credentials_from_env};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "srwikisync",
    version,
    about = "Sync speedrun.com world records into labeled sections of a wiki page"
)]
#[command(group(ArgGroup::new("target").required(true).args(["mapping", "all"])))]
#[command(group(ArgGroup::new("mode").required(true).args(["dry_run", "write", "emit"])))]
struct Cli {
    #[arg(long, value_name = "PATH", help = "Config file (TOML, or YAML by extension)")]
    config: PathBuf,
    #[arg(long, value_name = "PATH", help = "Process a single mapping file")]
    mapping: Option<PathBuf>,
    #[arg(long, help = "Process every mapping file in the mappings directory")]
    all: bool,
    #[arg(
        long,
        value_name = "LIST",
        requires = "all",
        help = "Skip mapping files by stem, section or game id (repeatable, comma separated)"
    )]
    exclude: Vec<String>,
    #[arg(long, help = "Print a unified diff and save nothing")]
    dry_run: bool,
    #[arg(long, help = "Save the page (one edit per mapping file)")]
    write: bool,
    #[arg(long, value_name = "PATH", help = "Write the new text to a file (a directory with --all)")]
    emit: Option<PathBuf>,
    #[arg(long, requires = "emit", help = "Emit only the section block(s)")]
    section_only: bool,
    #[arg(long, value_name = "NAME", help = "Only process entries of this section")]
    section: Option<String>,
}

impl Cli {
    fn mode(&self) -> Mode {
        match &self.emit {
            Some(path) => Mode::Emit {
                path: path.clone(),
                section_only: self.section_only,
            },
            None if self.write => Mode::Write,
            None => Mode::DryRun,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// `Ok(false)` when a mapping file failed or aborted.
fn run(cli: &Cli) -> Result<bool> {
    load_env(&cli.config);

    let config = load_config(&cli.config)?;
    let terms = load_term_table(config.terms_path().as_deref())?;
    let context = SyncContext::new(&config, &terms)?;
    let options = RunOptions {
        mode: cli.mode(),
        section: cli.section.clone(),
    };

    let mut leaderboard = LeaderboardClient::new(LeaderboardClientConfig::from_config(&config))?;
    let mut wiki = connect_wiki(&config, &options.mode)?;

    if cli.all {
        let excludes = split_excludes(&cli.exclude);
        let batch = run_batch(&context, &options, &excludes, &mut leaderboard, &mut wiki)?;
        print_batch(&batch);
        return Ok(batch.is_success());
    }

    let Some(mapping) = &cli.mapping else {
        bail!("either --mapping or --all is required");
    };
    let report = run_mapping(mapping, &context, &options, &mut leaderboard, &mut wiki)?;
    print_report(&report);
    Ok(!report.outcome.is_failure())
}

/// `.env` from the working directory first, then next to the config file.
fn load_env(config_path: &Path) {
    dotenvy::dotenv().ok();
    if let Some(parent) = config_path.parent() {
        let config_env = parent.join(".env");
        if config_env.exists() {
            let _ = dotenvy::from_path(&config_env);
        }
    }
}

fn connect_wiki(config: &SyncConfig, mode: &Mode) -> Result<MediaWikiClient> {
    let mut wiki = MediaWikiClient::new(MediaWikiClientConfig::from_config(config)?)?;
    if *mode == Mode::Write {
        let Some((user, pass)) = credentials_from_env() else {
            bail!("--write requires WIKI_BOT_USER and WIKI_BOT_PASS");
        };
        wiki.login(&user, &pass)?;
    }
    Ok(wiki)
}

fn print_report(report: &MappingReport) {
    println!("mapping: {}", report.mapping);
    println!("page: {}", report.page_title);
    println!("entries: {}", report.entries);
    if !report.excluded.is_empty() {
        println!("excluded: {}", report.excluded.join(", "));
    }
    for skipped in &report.skipped {
        println!("skipped: {skipped}");
    }
    if report.collapsed > 0 {
        println!("collapsed: {}", report.collapsed);
    }
    if !report.unmatched.is_empty() {
        println!("no_qualifying_run: {}", report.unmatched.join(", "));
    }
    println!("replaced: {}", report.replaced);
    println!("changed: {}", format_flag(report.changed));
    println!("leaderboard_requests: {}", report.requests);

    match &report.outcome {
        Outcome::Diffed { diff: Some(diff) } => print!("{diff}"),
        Outcome::Diffed { diff: None } | Outcome::Written { saved: false } => {
            println!("No changes.")
        }
        Outcome::Written { saved: true } => println!("saved: yes"),
        Outcome::Emitted { path } => println!("emitted: {}", normalize_path(path)),
        Outcome::Aborted {
            missing,
            scaffold,
            diff,
            emitted,
        } => {
            for error in missing {
                eprintln!("error: {error}");
            }
            if let Some(diff) = diff {
                print!("{diff}");
            }
            if let Some(path) = emitted {
                println!("emitted: {}", normalize_path(path));
            }
            println!("aborted: missing declared rows, nothing saved");
            println!("scaffold:");
            print!("{scaffold}");
        }
    }
}

fn print_batch(batch: &BatchReport) {
    for report in &batch.reports {
        print_report(report);
        println!();
    }
    for (mapping, error) in &batch.failures {
        eprintln!("error: {mapping}: {error}");
    }
    let aborted = batch
        .reports
        .iter()
        .filter(|report| report.outcome.is_failure())
        .count();
    println!("mappings_processed: {}", batch.reports.len());
    println!("mappings_excluded: {}", batch.skipped.len());
    println!("mappings_aborted: {aborted}");
    println!("mappings_failed: {}", batch.failures.len());
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pezzottify_catalog_merge::catalog_store::{EntityType, SqliteCatalogStore};
use pezzottify_catalog_merge::cli_style::{self, TableBuilder};
use pezzottify_catalog_merge::config::{CliConfig, EntityJob, FileConfig, MergeConfig};
use pezzottify_catalog_merge::merge::{
    CsvIngestor, MergeDecision, MergeEngine, MergeOutcome, MergePlan, MergePlanner, MergeStats,
    StagingError, StagingIngestor, StagingTable,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

fn parse_entity(s: &str) -> Result<EntityType> {
    EntityType::from_table_name(s)
        .with_context(|| format!("Unknown entity '{}', expected artists, albums or tracks", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {}", s))?
        .with_timezone(&Utc))
}

#[derive(Parser, Debug)]
#[command(styles = cli_style::get_styles())]
struct CliArgs {
    /// Path to the dataset manifest (TOML).
    #[clap(value_parser = parse_path)]
    pub manifest: PathBuf,

    /// Path to the SQLite catalog database file. Created when missing.
    #[clap(long = "db", value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Name recorded as the source of every merged row.
    #[clap(long)]
    pub source_name: Option<String>,

    /// Ingestion time recorded on every merged row. Defaults to now.
    #[clap(long, value_parser = parse_timestamp)]
    pub ingested_at: Option<DateTime<Utc>>,

    /// Directory holding the entity CSV files. Defaults to the manifest's directory.
    #[clap(long, value_parser = parse_path)]
    pub data_dir: Option<PathBuf>,

    /// Only merge these entities.
    #[clap(long, value_parser = parse_entity, value_delimiter = ',')]
    pub only: Vec<EntityType>,

    /// Commit every merge without asking.
    #[clap(short, long)]
    pub yes: bool,

    /// Execute every merge, report, then roll back.
    #[clap(long, conflicts_with = "yes")]
    pub dry_run: bool,

    /// Only predict the statistics; nothing is executed.
    #[clap(long, conflicts_with_all = ["yes", "dry_run"])]
    pub preview: bool,

    /// Print machine-readable JSON instead of the styled report.
    #[clap(long)]
    pub json: bool,
}

// =============================================================================
// Staging progress
// =============================================================================

/// Shows a spinner while a CSV batch loads into staging.
struct SpinnerIngestor {
    inner: CsvIngestor,
    spinner: ProgressBar,
}

impl SpinnerIngestor {
    fn new(inner: CsvIngestor, job: &EntityJob, quiet: bool) -> Result<Self> {
        let spinner = if quiet {
            ProgressBar::hidden()
        } else {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner().template("{msg} {spinner} [{elapsed_precise}]")?,
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        };
        spinner.set_message(format!("Staging {} from {:?}", job.entity, job.file));
        Ok(SpinnerIngestor { inner, spinner })
    }
}

impl StagingIngestor for SpinnerIngestor {
    fn load(&mut self, staging: &StagingTable<'_>) -> Result<usize, StagingError> {
        let result = self.inner.load(staging);
        match &result {
            Ok(rows) => self
                .spinner
                .finish_with_message(format!("Staged {} rows into {}", rows, staging.name())),
            Err(_) => self.spinner.abandon(),
        }
        result
    }
}

// =============================================================================
// Decision
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Confirm {
    Prompt,
    Commit,
    Rollback,
}

/// Prints the dry-run report and commits or rolls back per the CLI flags.
struct CliDecision {
    confirm: Confirm,
    json: bool,
}

impl CliDecision {
    fn prompt(&self, stats: &MergeStats) -> bool {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                warn!("Cannot open prompt, rolling back: {}", e);
                return false;
            }
        };
        let question = format!("Commit the {} merge?", stats.entity);
        loop {
            match editor.readline(&cli_style::get_prompt(&question)) {
                Ok(line) => match line.trim().to_lowercase().as_str() {
                    "y" | "yes" => return true,
                    "" | "n" | "no" => return false,
                    _ => cli_style::print_warning("Please answer y or n"),
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return false,
                Err(e) => {
                    warn!("Prompt failed, rolling back: {}", e);
                    return false;
                }
            }
        }
    }
}

impl MergeDecision for CliDecision {
    fn confirm(&self, stats: &MergeStats) -> bool {
        if !self.json {
            print_stats(stats);
        }
        match self.confirm {
            Confirm::Commit => true,
            Confirm::Rollback => false,
            Confirm::Prompt => self.prompt(stats),
        }
    }
}

// =============================================================================
// Report
// =============================================================================

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn print_stats(stats: &MergeStats) {
    cli_style::print_section_header(&format!("{} merge", stats.entity));
    cli_style::print_count("staging rows", stats.staging_rows, None);
    cli_style::print_count("excluded (no identifier)", stats.excluded_rows, None);
    cli_style::print_count("collapsed duplicates", stats.collapsed_rows, None);
    cli_style::print_count("new rows", stats.new_rows, Some(stats.share(stats.new_rows)));
    cli_style::print_count(
        "existing rows",
        stats.existing_rows,
        Some(stats.share(stats.existing_rows)),
    );
    cli_style::print_count(
        "  updated",
        stats.updated_rows,
        Some(stats.share(stats.updated_rows)),
    );
    cli_style::print_count(
        "  unchanged",
        stats.unchanged_rows,
        Some(stats.share(stats.unchanged_rows)),
    );
    cli_style::print_key_value_highlight(
        stats.entity.table_name(),
        &format!("{} -> {}", stats.main_rows_before, stats.main_rows_after),
    );

    if !stats.column_changes.is_empty() {
        let mut table = TableBuilder::new(&["column", "changed", "% of existing"]);
        for (column, changed) in &stats.column_changes {
            table.add_row(vec![
                column.clone(),
                changed.to_string(),
                format!("{:.1}", percent(*changed, stats.existing_rows)),
            ]);
        }
        table.print();
    }

    if let Some(assoc) = &stats.associations {
        let mut table = TableBuilder::new(&[assoc.table, "pairs"]);
        for (label, value) in [
            ("current", assoc.current_total),
            ("new", assoc.new),
            ("recreated", assoc.recreated),
            ("deleted", assoc.deleted),
            ("repositioned", assoc.repositioned),
            ("after", assoc.total_after),
            ("owners changed", assoc.entities_with_changes),
        ] {
            table.add_row(vec![label.to_string(), value.to_string()]);
        }
        table.print();
    }

    for effect in &stats.side_effects {
        cli_style::print_list_item(
            &format!(
                "{} placeholder {} from {}",
                effect.placeholders_created, effect.table, effect.source_column
            ),
            1,
        );
    }
    cli_style::print_section_footer();
}

fn print_plan(plan: &MergePlan) {
    cli_style::print_section_header(&format!("{} plan", plan.entity));
    let keys: Vec<&str> = plan.conflict_keys.iter().map(|k| k.column_name()).collect();
    cli_style::print_key_value("conflict keys", &keys.join(", "));
    for operation in &plan.operations {
        cli_style::print_list_item(&operation.to_string(), 1);
    }
    cli_style::print_section_footer();
}

fn print_outcome(outcome: &MergeOutcome) {
    let message = format!(
        "{} {} (run {})",
        outcome.state.as_str(),
        outcome.stats.entity,
        outcome.run_id
    );
    if outcome.committed() {
        cli_style::print_success(&message);
    } else {
        cli_style::print_warning(&message);
    }
    let mut table = TableBuilder::new(&["table", "before", "after", "delta"]);
    for delta in &outcome.deltas.tables {
        table.add_row(vec![
            delta.table.to_string(),
            delta.before.to_string(),
            delta.after.to_string(),
            delta.delta().to_string(),
        ]);
    }
    table.print();
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    if cli_args.json && !(cli_args.yes || cli_args.dry_run || cli_args.preview) {
        bail!("--json needs one of --yes, --dry-run or --preview");
    }

    let file_config = FileConfig::load(&cli_args.manifest)?;
    let cli = CliConfig {
        db_path: cli_args.db_path.clone(),
        source_name: cli_args.source_name.clone(),
        ingested_at: cli_args.ingested_at,
        data_dir: cli_args
            .data_dir
            .clone()
            .or_else(|| cli_args.manifest.parent().map(|p| p.to_path_buf())),
        only: cli_args.only.clone(),
    };
    let config = MergeConfig::resolve(&cli, Some(file_config))?;
    let resolver = config.policy_resolver()?;

    info!("Opening SQLite catalog database at {:?}...", config.db_path);
    let store = SqliteCatalogStore::open(&config.db_path)?;
    let engine = MergeEngine::new(store.connection(), resolver);

    if !cli_args.json {
        cli_style::print_key_value_highlight("source", &config.provenance.source_name);
        if let Some(url) = &config.source_url {
            cli_style::print_key_value("source url", url);
        }
        cli_style::print_key_value("ingested at", &config.provenance.ingested_at_str());
    }

    let decision = CliDecision {
        confirm: if cli_args.yes {
            Confirm::Commit
        } else if cli_args.dry_run {
            Confirm::Rollback
        } else {
            Confirm::Prompt
        },
        json: cli_args.json,
    };

    let mut previews = Vec::new();
    let mut outcomes = Vec::new();
    for job in &config.jobs {
        let csv = job.ingestor();
        let columns = job.batch_columns(&csv)?;
        let mut ingestor = SpinnerIngestor::new(csv, job, cli_args.json)?;

        if cli_args.preview {
            let policy = engine.resolver().resolve(job.entity, &columns)?;
            let stats = engine.preview(
                job.entity,
                &columns,
                &mut ingestor,
                config.provenance.clone(),
            )?;
            if !cli_args.json {
                print_plan(&MergePlanner::plan(
                    &policy,
                    &format!("staging_{}", job.entity.table_name()),
                ));
                print_stats(&stats);
            }
            previews.push(stats);
            continue;
        }

        let outcome = engine.run(
            job.entity,
            &columns,
            &mut ingestor,
            config.provenance.clone(),
            &decision,
        )?;
        if !cli_args.json {
            print_outcome(&outcome);
        }
        outcomes.push(outcome);
    }

    if cli_args.json {
        let json = if cli_args.preview {
            serde_json::to_string_pretty(&previews)?
        } else {
            serde_json::to_string_pretty(&outcomes)?
        };
        println!("{}", json);
    } else {
        let counts = store.counts()?;
        cli_style::print_section_header("catalog");
        cli_style::print_count("artists", counts.artists as u64, None);
        cli_style::print_count("albums", counts.albums as u64, None);
        cli_style::print_count("tracks", counts.tracks as u64, None);
        cli_style::print_count("album artists", counts.album_artists as u64, None);
        cli_style::print_count("track artists", counts.track_artists as u64, None);
        cli_style::print_section_footer();
        cli_style::flush();
    }

    Ok(())
}

mod apply_engine;
mod assist;
mod config;
mod config_persistence;
mod db_manager;
mod error;
mod library;
mod lookup;
mod matching;
mod name_store;
mod protocol;
mod request_pacer;
mod resolution_coordinator;
mod snapshot_store;

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use apply_engine::{ApplyEngine, ApplyOutcome};
use config::Config;
use config_persistence::{default_config_path, load_or_create_config, resolve_data_paths, DataPaths};
use library::tag_library::TagFileLibrary;
use library::LibraryReader;
use lookup::musicbrainz::MusicBrainzLookup;
use lookup::LookupCandidate;
use name_store::NameStore;
use protocol::ResolutionRecord;
use resolution_coordinator::{ManualResolver, ResolutionCoordinator};
use snapshot_store::SnapshotStore;

#[derive(Parser)]
#[command(name = "artist-deloc")]
#[command(about = "Rewrite storefront-localized artist names to their canonical registry names", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Library folder, overrides the configured folders (repeatable)
    #[arg(long = "library", global = true)]
    library_folders: Vec<PathBuf>,

    /// Stop lookups and writes after this many seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    /// Answer yes to every confirmation prompt
    #[arg(short, long, global = true)]
    yes: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Without a subcommand: scan, fetch without prompts, export unresolved, apply
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List library artists and whether they are already resolved
    Scan {
        /// Show every artist, not just the unresolved ones
        #[arg(short, long)]
        all: bool,
    },

    /// Look up canonical names for artists not yet in the cache
    Fetch {
        /// Only these artists (repeatable) instead of the whole library
        #[arg(long)]
        artist: Vec<String>,
        /// Never prompt for a manual name
        #[arg(long)]
        non_interactive: bool,
    },

    /// Show the renames that apply would perform
    Review,

    /// Rename reviewed artists in the library behind a backup snapshot
    Apply {
        /// Plan and print without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Write back the artist names captured in a snapshot
    Restore {
        /// Snapshot ID
        snapshot_id: String,
    },

    /// List backup snapshots
    Snapshots {
        /// Show the failed writes of one snapshot
        #[arg(long, value_name = "ID")]
        failures: Option<String>,
    },

    /// Inspect or edit the resolution cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Write unresolved names to a file, one per line
    ExportUnresolved {
        /// Output path (defaults to the configured unresolved file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import localized-to-canonical mappings (TSV or JSON)
    ImportMappings {
        /// Mappings file (defaults to the configured mappings file)
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print every cached record
    List,
    /// Delete every cached record
    Clear,
    /// Delete the record for one localized name
    Remove { name: String },
    /// Import a JSON cache from the earlier script-based tool
    ImportLegacy { path: PathBuf },
}

/// Shared state built once per invocation.
struct AppContext {
    config: Config,
    paths: DataPaths,
    library_folders: Vec<PathBuf>,
    deadline: Option<Instant>,
    assume_yes: bool,
}

impl AppContext {
    fn load(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let config = load_or_create_config(&config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        let paths = resolve_data_paths(&config)?;
        let library_folders = if cli.library_folders.is_empty() {
            config.library.folders.iter().map(PathBuf::from).collect()
        } else {
            cli.library_folders.clone()
        };
        info!(
            "Config loaded from {} data_dir={}",
            config_path.display(),
            paths.data_dir.display()
        );
        Ok(Self {
            config,
            paths,
            library_folders,
            deadline: cli
                .deadline_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
            assume_yes: cli.yes,
        })
    }

    fn name_store(&self) -> Result<NameStore> {
        NameStore::open(&self.paths.database)
            .with_context(|| format!("failed to open {}", self.paths.database.display()))
    }

    fn apply_engine(&self) -> Result<ApplyEngine> {
        let snapshots = SnapshotStore::open(&self.paths.database)
            .with_context(|| format!("failed to open {}", self.paths.database.display()))?;
        let engine = ApplyEngine::new(snapshots);
        Ok(match self.deadline {
            Some(deadline) => engine.with_deadline(deadline),
            None => engine,
        })
    }

    fn library(&self) -> Result<TagFileLibrary> {
        TagFileLibrary::open(&self.library_folders).context(
            "library unavailable; configure [library] folders or pass --library",
        )
    }
}

/// Prompts on the terminal when a lookup found nothing usable.
struct StdinManualResolver;

impl ManualResolver for StdinManualResolver {
    fn resolve_manually(
        &mut self,
        localized_name: &str,
        candidates: &[LookupCandidate],
    ) -> Option<String> {
        println!();
        println!("No confident match for '{}'.", localized_name);
        for candidate in candidates.iter().take(5) {
            println!(
                "  {:>3}  {}{}",
                candidate.score,
                candidate.primary_name,
                if candidate.aliases.is_empty() {
                    String::new()
                } else {
                    format!("  (aliases: {})", candidate.aliases.join(", "))
                }
            );
        }
        let answer = prompt_line("Canonical name (empty to skip): ").ok()?;
        let answer = answer.trim();
        (!answer.is_empty()).then(|| answer.to_string())
    }
}

fn prompt_line(prompt: &str) -> std::io::Result<String> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

fn confirm(prompt: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{prompt} [y/N]: "))?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut clog = colog::default_builder();
    clog.filter(
        None,
        match cli.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        },
    );
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let context = AppContext::load(&cli)?;
    let Some(command) = cli.command else {
        return cmd_pipeline(&context);
    };
    match command {
        Commands::Scan { all } => cmd_scan(&context, all),
        Commands::Fetch {
            artist,
            non_interactive,
        } => cmd_fetch(&context, artist, non_interactive),
        Commands::Review => cmd_review(&context),
        Commands::Apply { dry_run } => cmd_apply(&context, dry_run),
        Commands::Restore { snapshot_id } => cmd_restore(&context, &snapshot_id),
        Commands::Snapshots { failures } => cmd_snapshots(&context, failures),
        Commands::Cache { action } => cmd_cache(&context, action),
        Commands::ExportUnresolved { output } => cmd_export_unresolved(&context, output),
        Commands::ImportMappings { path } => cmd_import_mappings(&context, path),
    }
}

fn cmd_pipeline(context: &AppContext) -> Result<()> {
    info!("Pipeline: scan, fetch, export, apply");
    cmd_scan(context, false)?;
    println!();
    cmd_fetch(context, Vec::new(), true)?;
    println!();
    cmd_export_unresolved(context, None)?;
    println!();
    cmd_apply(context, false)
}

fn cmd_scan(context: &AppContext, all: bool) -> Result<()> {
    let library = context.library()?;
    let store = context.name_store()?;
    let artists = library.list_artists()?;

    let mut discovered = 0usize;
    let mut awaiting_lookup = 0usize;
    println!("{:>6}  {:<18}  {}", "Tracks", "Status", "Artist");
    println!("{}", "-".repeat(60));
    for artist in &artists {
        let record = match store.get(&artist.name)? {
            Some(record) => record,
            None => {
                let record = ResolutionRecord::pending(artist.name.as_str());
                store.put(&record)?;
                discovered += 1;
                record
            }
        };
        let needs_lookup = record.needs_lookup();
        if needs_lookup {
            awaiting_lookup += 1;
        }
        if all || needs_lookup {
            let status = if record.transient_failure {
                "not_found (retry)"
            } else {
                record.status.as_str()
            };
            println!("{:>6}  {:<18}  {}", artist.track_count, status, artist.name);
        }
    }
    println!();
    println!(
        "{} artist(s) in library, {} newly discovered, {} awaiting lookup.",
        artists.len(),
        discovered,
        awaiting_lookup
    );
    Ok(())
}

fn cmd_fetch(context: &AppContext, artist: Vec<String>, non_interactive: bool) -> Result<()> {
    let names = if artist.is_empty() {
        context
            .library()?
            .list_artists()?
            .into_iter()
            .map(|summary| summary.name)
            .collect()
    } else {
        artist
    };

    let store = context.name_store()?;
    let lookup = MusicBrainzLookup::new(&context.config.lookup);
    let mut coordinator = ResolutionCoordinator::from_config(&store, &lookup, &context.config.lookup)?;
    if let Some(deadline) = context.deadline {
        coordinator = coordinator.with_deadline(deadline);
    }
    if !non_interactive {
        coordinator = coordinator.with_manual_resolver(Box::new(StdinManualResolver));
    }
    let summary = coordinator.run(names.as_slice())?;

    println!();
    println!("Fetch complete:");
    println!("  Resolved:    {}", summary.resolved.len());
    println!("  Cached:      {}", summary.skipped.len());
    println!("  Unresolved:  {}", summary.unresolved.len());
    println!("  Lookups:     {}", summary.lookups_issued);
    if summary.interrupted {
        println!(
            "  Stopped at deadline, {} name(s) left for the next run.",
            summary.remaining.len()
        );
    }
    Ok(())
}

fn live_counts(library: &TagFileLibrary) -> Result<HashMap<String, usize>> {
    Ok(library
        .list_artists()?
        .into_iter()
        .map(|artist| (artist.name, artist.track_count))
        .collect())
}

fn cmd_review(context: &AppContext) -> Result<()> {
    let library = context.library()?;
    let store = context.name_store()?;
    let candidates = store.apply_candidates(&live_counts(&library)?)?;
    let counts = store.counts_by_status()?;

    println!(
        "Cache: {} record(s): {} identical, {} to rename, {} not found ({} to retry), {} pending",
        counts.total(),
        counts.matched_identical,
        counts.matched_different,
        counts.not_found,
        counts.transient,
        counts.pending
    );
    println!();
    if candidates.is_empty() {
        println!("Nothing to rename.");
        return Ok(());
    }
    println!("{:>6}  {}", "Tracks", "Rename");
    println!("{}", "-".repeat(60));
    for candidate in &candidates {
        println!(
            "{:>6}  {} -> {}",
            candidate.track_count, candidate.localized_name, candidate.canonical_name
        );
    }
    Ok(())
}

fn cmd_apply(context: &AppContext, dry_run: bool) -> Result<()> {
    let mut library = context.library()?;
    let store = context.name_store()?;
    let candidates = store.apply_candidates(&live_counts(&library)?)?;
    if candidates.is_empty() {
        println!("Nothing to rename.");
        return Ok(());
    }

    let track_total: usize = candidates.iter().map(|candidate| candidate.track_count).sum();
    if !dry_run && !context.assume_yes {
        let prompt = format!(
            "Rename {} artist(s) across {} track(s)?",
            candidates.len(),
            track_total
        );
        if !confirm(&prompt)? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let mut engine = context.apply_engine()?;
    let report = engine.apply(&mut library, &candidates, dry_run)?;

    if report.dry_run {
        println!("Dry run, nothing was written.");
        if let Some(snapshot) = &report.snapshot {
            for entry in &snapshot.entries {
                println!(
                    "  {} [{}]: {} -> {}",
                    entry.track_external_id,
                    entry.field.as_str(),
                    entry.previous_artist_name,
                    entry.new_artist_name
                );
            }
        }
    } else {
        if let Some(snapshot) = &report.snapshot {
            println!("Snapshot: {}", snapshot.id);
        }
        println!("  Applied:  {}", report.applied.len());
        println!("  Failed:   {}", report.failed.len());
        for failure in &report.failed {
            println!(
                "    {} [{}] {}",
                failure.track_external_id,
                failure.error_kind.as_str(),
                failure.message
            );
        }
        if !report.failures_persisted {
            println!("  Warning: failure records could not be stored.");
        }
    }
    if !report.stale.is_empty() {
        println!("  No longer in library: {}", report.stale.join(", "));
    }
    if report.outcome == ApplyOutcome::CompletedWithFailures {
        if let Some(snapshot) = &report.snapshot {
            println!(
                "{} write(s) need attention; see `snapshots --failures {}`.",
                report.failed.len(),
                snapshot.id
            );
        }
    }
    Ok(())
}

fn cmd_restore(context: &AppContext, snapshot_id: &str) -> Result<()> {
    let mut engine = context.apply_engine()?;
    let snapshot = engine.load_snapshot(snapshot_id)?;
    if !context.assume_yes
        && !confirm(&format!(
            "Restore {} field(s) from snapshot {}?",
            snapshot.entries.len(),
            snapshot.id
        ))?
    {
        println!("Cancelled.");
        return Ok(());
    }

    let mut library = context.library()?;
    let report = engine.restore(&mut library, snapshot_id)?;
    println!("Restored {} track(s).", report.restored.len());
    for failure in &report.failed {
        println!(
            "  {} [{}] {}",
            failure.track_external_id,
            failure.error_kind.as_str(),
            failure.message
        );
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} track(s) could not be restored", report.failed.len());
    }
    Ok(())
}

fn cmd_snapshots(context: &AppContext, failures: Option<String>) -> Result<()> {
    let engine = context.apply_engine()?;
    if let Some(snapshot_id) = failures {
        let records = engine.failures_for(&snapshot_id)?;
        if records.is_empty() {
            println!("No failed writes in {}.", snapshot_id);
        }
        for failure in records {
            println!(
                "{}  {:<22}  {} ({})",
                failure.track_external_id,
                failure.error_kind.as_str(),
                failure.attempted_name,
                failure.message
            );
        }
        return Ok(());
    }

    let snapshots = engine.list_snapshots()?;
    if snapshots.is_empty() {
        println!("No snapshots.");
        return Ok(());
    }
    println!("{:<26}  {:>7}  {:>8}", "ID", "Entries", "Failures");
    println!("{}", "-".repeat(46));
    for summary in snapshots {
        println!(
            "{:<26}  {:>7}  {:>8}",
            summary.id, summary.entry_count, summary.failure_count
        );
    }
    Ok(())
}

fn cmd_cache(context: &AppContext, action: CacheAction) -> Result<()> {
    let store = context.name_store()?;
    match action {
        CacheAction::List => {
            for record in store.all()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.localized_name,
                    record.status.as_str(),
                    record.canonical_name.as_deref().unwrap_or("-"),
                    record.source.as_str()
                );
            }
        }
        CacheAction::Clear => {
            if !context.assume_yes && !confirm("Delete every cached resolution?")? {
                println!("Cancelled.");
                return Ok(());
            }
            println!("Removed {} record(s).", store.clear()?);
        }
        CacheAction::Remove { name } => {
            if store.remove(&name)? {
                println!("Removed '{}'.", name);
            } else {
                println!("'{}' is not cached.", name);
            }
        }
        CacheAction::ImportLegacy { path } => {
            let summary = store.import_legacy_cache(&path)?;
            println!(
                "Imported {} record(s), {} already cached, {} invalid.",
                summary.imported, summary.already_present, summary.invalid
            );
        }
    }
    Ok(())
}

fn cmd_export_unresolved(context: &AppContext, output: Option<PathBuf>) -> Result<()> {
    let store = context.name_store()?;
    let names = assist::export_unresolved(&store)?;
    if names.is_empty() {
        println!("No unresolved artists.");
        return Ok(());
    }
    let path = output.unwrap_or_else(|| context.paths.unresolved.clone());
    assist::write_unresolved_file(&path, &names)?;
    println!("Wrote {} name(s) to {}", names.len(), path.display());
    println!(
        "Fill in canonical names as 'localized<TAB>canonical' lines, then run import-mappings."
    );
    Ok(())
}

fn cmd_import_mappings(context: &AppContext, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(|| context.paths.mappings.clone());
    let mappings = assist::read_mappings_file(&path)?;
    let store = context.name_store()?;
    let imported = assist::import_assisted_mappings(&store, &mappings)?;
    println!("Imported {} mapping(s) from {}", imported, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_yes_flag_reaches_the_default_pipeline() {
        let cli = Cli::try_parse_from(["artist-deloc", "--yes"]).expect("args should parse");
        assert!(cli.yes);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["artist-deloc", "-y", "--library", "/music"])
            .expect("args should parse");
        assert!(cli.yes);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_yes_flag_is_accepted_after_a_subcommand() {
        let cli =
            Cli::try_parse_from(["artist-deloc", "apply", "--yes"]).expect("args should parse");
        assert!(cli.yes);
        assert!(matches!(cli.command, Some(Commands::Apply { dry_run: false })));

        let cli = Cli::try_parse_from(["artist-deloc", "restore", "20260314T092653.000000Z"])
            .expect("args should parse");
        assert!(!cli.yes);
        assert!(matches!(cli.command, Some(Commands::Restore { .. })));
    }
}

//! Top-level CLI definition and dispatch.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use btrfs_dedup_helper::core::config::Config;
use btrfs_dedup_helper::core::errors::BdhError;
use btrfs_dedup_helper::dedup::orchestrator::{
    DedupOptions, Orchestrator, PassSummary, ShutdownFlag,
};
use btrfs_dedup_helper::registry;
use btrfs_dedup_helper::scanner::find_new;
use btrfs_dedup_helper::store::TrackingStore;

/// btrfs-dedup-helper — reclaims space by cloning identical files together.
#[derive(Debug, Parser)]
#[command(
    name = "bdh",
    author,
    version,
    about = "Btrfs deduplication with incremental change tracking",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Track changed files on the listed volumes; no locking, no cloning.
    Scan(ScanArgs),
    /// Scan, then deduplicate identical tracked files.
    Dedup(DedupArgs),
    /// Deduplicate an explicit file set, bypassing the index.
    DedupFiles(DedupFilesArgs),
    /// Forget tracking state for the listed volumes.
    Forget(ForgetArgs),
    /// List known volumes and their tracking watermarks.
    Show,
    /// List paths changed since a generation.
    FindNew(FindNewArgs),
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Volumes: mount path, /dev/... device, or filesystem UUID.
    #[arg(value_name = "VOLUME", required = true)]
    volumes: Vec<String>,
    /// Minimum size (bytes) of files to track on these volumes. Lowering
    /// the cutoff triggers a rescan of older files.
    #[arg(long, value_name = "BYTES")]
    size_cutoff: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct DedupArgs {
    /// Volumes: mount path, /dev/... device, or filesystem UUID.
    #[arg(value_name = "VOLUME", required = true)]
    volumes: Vec<String>,
    /// Minimum size (bytes) of files to track on these volumes.
    #[arg(long, value_name = "BYTES")]
    size_cutoff: Option<u64>,
    /// Never pair files from different subvolumes.
    #[arg(long)]
    no_crossvol: bool,
    /// Defragment both sides before comparison (ignored on kernels < 3.9).
    #[arg(long)]
    defrag: bool,
}

#[derive(Debug, Clone, Args)]
struct DedupFilesArgs {
    /// Files to deduplicate against each other.
    #[arg(value_name = "FILE", num_args = 2..)]
    files: Vec<PathBuf>,
    /// Defragment both sides before comparison (ignored on kernels < 3.9).
    #[arg(long)]
    defrag: bool,
}

#[derive(Debug, Clone, Args)]
struct ForgetArgs {
    /// Volumes to reset tracking for.
    #[arg(value_name = "VOLUME", required = true)]
    volumes: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct FindNewArgs {
    /// Volume to search.
    #[arg(value_name = "VOLUME")]
    volume: String,
    /// Only show items changed at this generation or newer.
    #[arg(value_name = "GEN", default_value_t = 0)]
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Operation completed with class-level failures.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<BdhError> for CliError {
    fn from(value: BdhError) -> Self {
        match value {
            BdhError::InvalidConfig { .. } | BdhError::VolumeResolve { .. } => {
                Self::User(value.to_string())
            }
            BdhError::Sql { .. } | BdhError::Serialization { .. } => {
                Self::Internal(value.to_string())
            }
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Scan(args) => run_scan(cli, args),
        Command::Dedup(args) => run_dedup(cli, args),
        Command::DedupFiles(args) => run_dedup_files(cli, args),
        Command::Forget(args) => run_forget(cli, args),
        Command::Show => run_show(cli),
        Command::FindNew(args) => run_find_new(cli, args),
    }
}

fn output_mode(cli: &Cli) -> OutputMode {
    if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn open_store(cli: &Cli) -> Result<TrackingStore, CliError> {
    let config = Config::load(cli.config.as_deref())?;
    Ok(TrackingStore::open(&config.store.db_path)?)
}

fn dedup_options(cli: &Cli, size_cutoff: Option<u64>, no_crossvol: bool, defrag: bool) -> Result<DedupOptions, CliError> {
    let config = Config::load(cli.config.as_deref())?;
    Ok(DedupOptions {
        crossvol: config.dedup.crossvol && !no_crossvol,
        defrag: defrag || config.dedup.defrag,
        compare_block: config.dedup.compare_block,
        size_cutoff,
        default_size_cutoff: config.dedup.size_cutoff,
        verbose: cli.verbose,
    })
}

fn registered_shutdown() -> ShutdownFlag {
    let flag = ShutdownFlag::new();
    flag.register_signals();
    flag
}

// ──────────────────── scan / dedup ────────────────────

fn run_scan(cli: &Cli, args: &ScanArgs) -> Result<(), CliError> {
    let mut store = open_store(cli)?;
    let options = dedup_options(cli, args.size_cutoff, false, false)?;
    let mut orchestrator = Orchestrator::new(&mut store, options, registered_shutdown());

    let volumes = orchestrator.scan_volumes(&args.volumes)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!("Scanned {} volume(s).", volumes.len());
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "scan",
                "volumes": volumes
                    .iter()
                    .map(|(vol, row)| {
                        json!({
                            "path": vol.path.to_string_lossy(),
                            "fs_uuid": vol.fs_uuid,
                            "root_id": vol.root_id,
                            "watermark": row.last_tracked_generation,
                        })
                    })
                    .collect::<Vec<_>>(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn summary_payload(command: &str, summary: &PassSummary) -> Value {
    json!({
        "command": command,
        "classes": summary.classes_seen,
        "cloned": summary.cloned,
        "already_shared": summary.already_shared,
        "mismatch": summary.mismatched,
        "busy": summary.busy,
        "changed": summary.changed,
        "vanished": summary.vanished,
        "locked": summary.locked,
        "io_errors": summary.io_errors,
        "bytes_reclaimed": summary.bytes_reclaimed,
        "interrupted": summary.interrupted,
    })
}

fn emit_summary(cli: &Cli, command: &str, summary: &PassSummary) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                let reclaimed = format_bytes(summary.bytes_reclaimed);
                println!(
                    "{}: {} file(s) cloned, ~{} reclaimed",
                    command,
                    summary.cloned.to_string().green(),
                    reclaimed
                );
                println!("  {summary}");
            }
        }
        OutputMode::Json => write_json_line(&summary_payload(command, summary))?,
    }

    if summary.has_failures() {
        return Err(CliError::Partial(format!(
            "{command} finished with skipped files: {summary}"
        )));
    }
    Ok(())
}

fn run_dedup(cli: &Cli, args: &DedupArgs) -> Result<(), CliError> {
    let mut store = open_store(cli)?;
    let options = dedup_options(cli, args.size_cutoff, args.no_crossvol, args.defrag)?;
    let mut orchestrator = Orchestrator::new(&mut store, options, registered_shutdown());

    let summary = orchestrator.run_dedup(&args.volumes)?;
    emit_summary(cli, "dedup", &summary)
}

fn run_dedup_files(cli: &Cli, args: &DedupFilesArgs) -> Result<(), CliError> {
    let mut store = open_store(cli)?;
    let options = dedup_options(cli, None, false, args.defrag)?;
    let mut orchestrator = Orchestrator::new(&mut store, options, registered_shutdown());

    let summary = orchestrator.run_files(&args.files)?;
    emit_summary(cli, "dedup-files", &summary)
}

// ──────────────────── forget / show / find-new ────────────────────

fn run_forget(cli: &Cli, args: &ForgetArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let mut store = TrackingStore::open(&config.store.db_path)?;

    for reference in &args.volumes {
        let volume = registry::resolve(reference)?;
        let row = store.get_or_create_volume(
            &volume.fs_uuid,
            volume.root_id,
            None,
            config.dedup.size_cutoff,
        )?;
        let removed = store.forget_volume(row.id)?;
        if !cli.quiet {
            println!(
                "Forgot {} tracked inode(s) on {}.",
                removed,
                volume.path.display()
            );
        }
    }
    Ok(())
}

fn run_show(cli: &Cli) -> Result<(), CliError> {
    let store = open_store(cli)?;
    let volumes = store.volumes()?;

    if output_mode(cli) == OutputMode::Json {
        let mut entries = Vec::new();
        for volume in &volumes {
            let (events, bytes) = store.event_totals(&volume.fs_uuid)?;
            entries.push(json!({
                "fs_uuid": volume.fs_uuid,
                "root_id": volume.root_id,
                "last_tracked_generation": volume.last_tracked_generation,
                "size_cutoff": volume.size_cutoff,
                "last_seen_path": volume.last_seen_path,
                "online": volume.online,
                "fs_dedup_events": events,
                "fs_bytes_reclaimed": bytes,
            }));
        }
        return write_json_line(&json!({"command": "show", "volumes": entries}));
    }

    if volumes.is_empty() {
        println!("No tracked volumes. Run `bdh scan <volume>` first.");
        return Ok(());
    }

    let mut last_fs: Option<String> = None;
    for volume in &volumes {
        if last_fs.as_deref() != Some(volume.fs_uuid.as_str()) {
            let (events, bytes) = store.event_totals(&volume.fs_uuid)?;
            println!("Filesystem {}", volume.fs_uuid.bold());
            println!(
                "  {} dedup event(s), ~{} reclaimed",
                events,
                format_bytes(bytes)
            );
            last_fs = Some(volume.fs_uuid.clone());
        }
        let status = if volume.online { "online" } else { "offline" };
        println!(
            "  Volume {:>6}  generation {:>8}  cutoff {:>10}  {}  {}",
            volume.root_id,
            volume.last_tracked_generation,
            format_bytes(volume.size_cutoff),
            status,
            volume.last_seen_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn run_find_new(cli: &Cli, args: &FindNewArgs) -> Result<(), CliError> {
    let volume = registry::resolve(&args.volume)?;
    let mut stdout = io::stdout().lock();
    let written = find_new::find_new(&volume, args.generation, &mut stdout)?;
    if cli.verbose {
        eprintln!("[BDH-SCAN] {written} changed path(s)");
    }
    Ok(())
}

// ──────────────────── formatting ────────────────────

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_codes_are_distinct_per_category() {
        assert_eq!(CliError::User(String::new()).exit_code(), 1);
        assert_eq!(CliError::Runtime(String::new()).exit_code(), 2);
        assert_eq!(CliError::Internal(String::new()).exit_code(), 3);
        assert_eq!(CliError::Partial(String::new()).exit_code(), 4);
    }

    #[test]
    fn bdh_errors_map_to_exit_categories() {
        let user: CliError = BdhError::InvalidConfig {
            details: "x".to_string(),
        }
        .into();
        assert_eq!(user.exit_code(), 1);

        let runtime: CliError = BdhError::NotBtrfs {
            path: PathBuf::from("/x"),
        }
        .into();
        assert_eq!(runtime.exit_code(), 2);

        let internal: CliError = BdhError::Sql {
            context: "rusqlite",
            details: "x".to_string(),
        }
        .into();
        assert_eq!(internal.exit_code(), 3);
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(8 << 20), "8.0 MiB");
        assert_eq!(format_bytes(1_572_864), "1.5 MiB");
    }

    #[test]
    fn dedup_files_requires_two_files() {
        let result = Cli::try_parse_from(["bdh", "dedup-files", "/only/one"]);
        assert!(result.is_err());
        let result = Cli::try_parse_from(["bdh", "dedup-files", "/a", "/b"]);
        assert!(result.is_ok());
    }

    #[test]
    fn find_new_generation_defaults_to_zero() {
        let cli = Cli::try_parse_from(["bdh", "find-new", "/mnt/vol"]).unwrap();
        match cli.command {
            Command::FindNew(args) => assert_eq!(args.generation, 0),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

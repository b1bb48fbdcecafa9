use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use rusty_folder_view::models::config::{setup_config, validate_config, Config};
use rusty_folder_view::models::file_row::{FileRow, FolderContents};
use rusty_folder_view::service::delay_fan_out::{
    CancelHandle, DelayFanOut, FanOutOptions, RowTable,
};
use rusty_folder_view::service::duplicate::{duplicate_file, preview_duplicate};
use rusty_folder_view::utils::directory::{folder_details, load_folder_contents};
use rusty_folder_view::utils::progress::{create_progress_bar, create_spinner, format_bytes};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Parser)]
#[command(name = "RustyFolderView")]
#[command(about = "Browse folders, duplicate files and run delayed batch processing", long_about = None)]
struct Cli {
    #[arg(short = 'c', long = "config", env = "RUSTYFOLDERVIEW_CONFIG")]
    config_file: Option<String>,

    #[arg(
        short = 'l',
        long = "log-level",
        default_value = "info",
        env = "LOG_LEVEL"
    )]
    log_level: String,

    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the subfolders and files of a folder
    List {
        folder: PathBuf,
        #[arg(long = "json")]
        json: bool,
    },
    /// Show name and last-modified time of a folder
    Details { folder: PathBuf },
    /// Duplicate a file next to itself under a free "- Copy" name
    Duplicate {
        file: PathBuf,
        #[arg(short = 'y', long = "yes")]
        yes: bool,
        #[arg(short = 'd', long = "dry-run")]
        dry_run: bool,
    },
    /// Give every file of a folder a random delay and wait them all out
    Process {
        folder: PathBuf,
        #[arg(short = 's', long = "seed")]
        seed: Option<u64>,
        #[arg(short = 'u', long = "unit-ms")]
        unit_ms: Option<u64>,
        #[arg(long = "json")]
        json: bool,
    },
    /// Print developer and version information
    About,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_secs()
        .init();

    let config = match &args.config_file {
        Some(path) => setup_config(path.trim_matches(|c| c == '"' || c == '\'').to_string())
            .context("Failed to load configuration")?,
        None => {
            debug!("No config file given, using defaults");
            Config::default()
        }
    };
    debug!("Loaded config: {:?}", &config);

    match args.command {
        Command::List { folder, json } => {
            let contents = load_folder(&folder, &config, args.quiet)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&contents)?);
            } else {
                print_contents(&contents);
            }
        }
        Command::Details { folder } => {
            let details = folder_details(&folder)
                .with_context(|| format!("Failed to read folder details: {}", folder.display()))?;
            println!("Name: {}", details.name);
            println!("Last Modified: {}", details.last_modified.format(TIMESTAMP_FORMAT));
        }
        Command::Duplicate { file, yes, dry_run } => {
            run_duplicate(&file, &config, yes, dry_run, args.quiet)?;
        }
        Command::Process {
            folder,
            seed,
            unit_ms,
            json,
        } => {
            let mut config = config;
            if let Some(seed) = seed {
                config.delay_seed = Some(seed);
            }
            if let Some(unit_ms) = unit_ms {
                config.delay_unit_ms = unit_ms;
            }
            validate_config(&config).context("Invalid processing options")?;
            run_process(&folder, &config, json, args.quiet).await?;
        }
        Command::About => {
            println!(
                "Developer: {}\nVersion: {}",
                env!("CARGO_PKG_AUTHORS"),
                env!("CARGO_PKG_VERSION")
            );
        }
    }

    Ok(())
}

fn load_folder(folder: &Path, config: &Config, quiet: bool) -> Result<FolderContents> {
    let spinner = (!quiet).then(|| create_spinner(&format!("Loading {}", folder.display())));

    let contents = load_folder_contents(folder, config.show_hidden)
        .with_context(|| format!("Failed to read directory: {}", folder.display()))?;

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    Ok(contents)
}

fn run_duplicate(file: &Path, config: &Config, yes: bool, dry_run: bool, quiet: bool) -> Result<()> {
    let file_name = match file.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => bail!("'{}' does not name a file", file.display()),
    };

    if dry_run {
        let target = preview_duplicate(file, config)
            .with_context(|| format!("Failed to resolve a copy name for {}", file.display()))?;
        info!("DRY RUN - no file will be copied");
        println!("{}", target.display());
        return Ok(());
    }

    if !yes && !confirm(&format!("Do you want to duplicate the file '{}'?", file_name))? {
        info!("Duplicate of {} cancelled", file_name);
        return Ok(());
    }

    let target = duplicate_file(file, config)
        .with_context(|| format!("Failed to duplicate {}", file.display()))?;
    println!("Created {}", target.display());

    let folder = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let contents = load_folder(&folder, config, quiet)?;
    print_contents(&contents);
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn run_process(folder: &Path, config: &Config, json: bool, quiet: bool) -> Result<()> {
    let contents = load_folder(folder, config, quiet)?;
    if contents.files.is_empty() {
        warn!("No files in {} to process", folder.display());
        return Ok(());
    }

    let progress = (!quiet).then(|| {
        create_progress_bar(
            contents.files.len() as u64,
            &format!("[process] {}", folder.display()),
        )
    });

    let mut table = RowTable::new(contents.files);
    if let Some(bar) = progress.clone() {
        table = table.with_observer(move |_, row| {
            bar.inc(1);
            bar.set_message(format!("{} -> {}", row.name, row.delay.unwrap_or_default()));
        });
    }
    let table = Arc::new(table);

    let fan_out = DelayFanOut::new(FanOutOptions::from(config));
    let cancel = CancelHandle::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Received interrupt, cancelling timers that have not fired yet...");
        interrupt.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let names = table.names();
    let report = fan_out.run_with_cancel(&names, table.clone(), &cancel).await;

    if let Some(bar) = progress {
        bar.finish_with_message(format!("batch {}", report.batch_id));
    }

    let rows = table.snapshot();
    if json {
        let output = serde_json::json!({ "report": report, "rows": rows });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_rows(&rows);
    }

    if !report.is_complete() {
        let missing = report.pending.len() + report.unapplied.len();
        bail!(
            "Processing incomplete: {} of {} rows never received a delay",
            missing,
            missing + report.completed.len()
        );
    }
    Ok(())
}

fn print_contents(contents: &FolderContents) {
    println!("{}", contents.folder.display());
    for folder in &contents.folders {
        println!("  [DIR] {}", folder.display());
    }
    print_rows(&contents.files);
}

fn print_rows(rows: &[FileRow]) {
    println!(
        "{:<40} {:<20} {:>12} {:>12}",
        "File Name", "Last Modified", "File Size", "Random Delay"
    );
    for row in rows {
        println!(
            "{:<40} {:<20} {:>12} {:>12}",
            row.name,
            row.last_modified.format(TIMESTAMP_FORMAT).to_string(),
            format_bytes(row.size),
            row.delay.map(|d| d.to_string()).unwrap_or_default()
        );
    }
}

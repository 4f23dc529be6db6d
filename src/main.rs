use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::info;

use rescache::config::{hours_to_duration, Config};
use rescache::CacheService;

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Offline-capable HTTP resource cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache root directory, overriding the config file
  #[arg(long)]
  root: Option<PathBuf>,

  /// Log debug output
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource, falling back to the cache when offline
  Fetch {
    url: String,
    /// Do not store the response (and do not fall back to the cache)
    #[arg(long)]
    no_cache: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Fetch a JSON document and pretty-print it
  Json { url: String },
  /// List cached entries
  List,
  /// Show what startup reconciliation removed
  Reconcile,
  /// Evict entries older than the given age
  Evict {
    #[arg(long)]
    older_than_hours: Option<u64>,
  },
  /// Prefetch resources from a file of URLs as a list view scrolling to `upto` would
  Prefetch {
    urls_file: PathBuf,
    #[arg(long)]
    upto: usize,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override root if specified on command line
  if let Some(root) = args.root {
    config.cache.root = Some(root);
  }

  let _guard = rescache::logging::init(config.log_dir.as_deref(), args.verbose)?;

  let token = Config::get_session_token();
  let service = CacheService::init(&config, token.as_deref()).await?;

  run(service, &config, args.command).await
}

async fn run(service: &CacheService, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Fetch {
      url,
      no_cache,
      output,
    } => {
      let bytes = service.layer().fetch(&url, !no_cache).await?;
      match output {
        Some(path) => tokio::fs::write(&path, &bytes)
          .await
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => {
          use tokio::io::AsyncWriteExt;
          let mut stdout = tokio::io::stdout();
          stdout.write_all(&bytes).await?;
          stdout.flush().await?;
        }
      }
    }
    Command::Json { url } => {
      let value: serde_json::Value = service.layer().fetch_json(&url).await?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::List => {
      for entry in service.index().entries().await {
        println!(
          "{}  {}  downloaded {}  accessed {}",
          entry.local_path,
          entry.source_id,
          entry.downloaded_at.to_rfc3339(),
          entry.last_accessed_at.to_rfc3339()
        );
      }
    }
    Command::Reconcile => {
      let report = service.reconcile_report();
      println!("index reset:      {}", report.index_reset);
      println!("orphans removed:  {}", report.orphans_removed.len());
      println!("delete failures:  {}", report.orphan_delete_failures.len());
      println!("dangling entries: {}", report.dangling_entries.len());
      println!("expired entries:  {}", report.expired.len());
    }
    Command::Evict { older_than_hours } => {
      let max_age = match older_than_hours {
        Some(hours) => hours_to_duration(hours)?,
        None => config.cache.max_age()?,
      };
      let evicted = service.index().evict_older_than(max_age).await?;
      for id in &evicted {
        println!("{}", id);
      }
      info!("Evicted {} entries", evicted.len());
    }
    Command::Prefetch { urls_file, upto } => {
      let contents = tokio::fs::read_to_string(&urls_file)
        .await
        .map_err(|e| eyre!("Failed to read {}: {}", urls_file.display(), e))?;
      let urls: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();

      let mut fetcher = service.incremental();
      let mut loaded = 0usize;
      let mut failed = 0usize;
      for requested in 0..=upto.min(urls.len().saturating_sub(1)) {
        if let Some(report) = fetcher
          .maybe_load(requested, &urls, |u| u.clone(), |_, _| {})
          .await
        {
          loaded += report.loaded.len();
          failed += report.failures.len();
        }
      }

      info!(
        "Prefetched {} of {} resources ({} failed)",
        loaded,
        urls.len(),
        failed
      );
    }
  }

  Ok(())
}

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

use jotline::cache::{CacheLimits, CachePersistence, SqliteStore};
use jotline::config::Config;
use jotline::records::Privacy;
use jotline::{DataContext, HttpRecordApi};

#[derive(Parser, Debug)]
#[command(name = "jotline")]
#[command(about = "Data-layer client for a journaling service")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/jotline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Author handle to use instead of the configured one
  #[arg(short, long)]
  author: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let author = args.author.unwrap_or_else(|| config.service.author.clone());

  let _log_guard = init_tracing()?;

  let base = Url::parse(&config.service.url)
    .map_err(|e| eyre!("Invalid service url {}: {}", config.service.url, e))?;
  let token = Config::get_api_token().ok();
  let api = HttpRecordApi::new(base, token).map_err(|e| eyre!("{}", e))?;

  let persistence = if config.cache.persist {
    let store = SqliteStore::open().map_err(|e| eyre!("{}", e))?;
    Some(CachePersistence::new(Box::new(store), None))
  } else {
    None
  };

  let ctx = DataContext::new(
    Arc::new(api),
    CacheLimits {
      max_size: config.cache.max_size_bytes,
      pressure_threshold: config.cache.pressure_threshold,
    },
    persistence,
  )
  .with_stale_time(chrono::Duration::seconds(config.cache.stale_secs as i64));

  let restored = ctx.init().map_err(|e| eyre!("{}", e))?;
  if restored > 0 {
    println!("restored {} cached queries", restored);
  }

  let page = ctx.read_list(&author, Default::default()).await?;
  println!("{}: {} entries cached", author, page.items.len());
  for entry in page.items.iter().take(10) {
    let marker = match entry.privacy {
      Privacy::Sensitive => "*",
      Privacy::Public => " ",
    };
    println!("{} [{}] {}", marker, entry.kind().as_str(), entry.payload.text());
  }

  let stats = ctx.stats(&author).await?;
  println!(
    "{} total, {} sensitive",
    stats.total, stats.sensitive
  );

  let report = ctx.validate(&author);
  if report.pages_removed > 0 || report.duplicates_removed > 0 {
    println!(
      "consistency pass: {} pages removed, {} duplicates repaired",
      report.pages_removed, report.duplicates_removed
    );
  }

  ctx.dispose().map_err(|e| eyre!("{}", e))?;
  Ok(())
}

/// Log to a rolling file in the data directory; stderr stays clean for
/// command output.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .map(|d| d.join("jotline").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "jotline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

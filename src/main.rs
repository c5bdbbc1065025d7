mod app;
mod commands;
mod event;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use offsync::{
  Config, HttpNetwork, MemoryQueueStore, NotificationBus, OfflineLayer, OfflineQueue,
  QueueStore, SqliteQueueStore, SwitchableNetwork, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "An offline-first request cache with a durable write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offsync.yaml, then $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin that relative URLs resolve against
  #[arg(short, long)]
  origin: Option<String>,

  /// Keep the queue in memory instead of the SQLite mirror
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Interactive session (default)
  Run,
  /// Show the durable queue
  Status,
  /// Replay the durable queue once
  Sync,
  /// Discard every queued operation
  ClearQueue,
}

/// Log to a daily file so output never mixes with the console.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("OFFSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn open_store(config: &Config, ephemeral: bool) -> Result<Arc<dyn QueueStore>> {
  if ephemeral {
    return Ok(Arc::new(MemoryQueueStore::new()));
  }
  Ok(Arc::new(SqliteQueueStore::open(&config.queue_path()?)?))
}

fn open_queue(config: &Config, ephemeral: bool) -> Result<OfflineQueue> {
  Ok(OfflineQueue::new(
    open_store(config, ephemeral)?,
    NotificationBus::new(),
    Arc::new(SystemClock),
    config.replay.drop_rejected,
  ))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config {
      origin: Some(origin),
      ..config
    }
  } else {
    config
  };
  config.validate()?;

  let http = Arc::new(HttpNetwork::new(&config.network)?);

  match args.command.unwrap_or(Cmd::Run) {
    Cmd::Run => {
      let network = Arc::new(SwitchableNetwork::new(http));
      let store = open_store(&config, args.ephemeral)?;
      let layer = OfflineLayer::new(config, network.clone(), store)?;

      let mut app = app::App::new(layer, network);
      app.run().await?;
    }
    Cmd::Status => {
      let queue = open_queue(&config, args.ephemeral)?;
      let pending = queue.snapshot().await;
      println!("{} pending operation(s)", pending.len());
      for op in pending {
        println!("#{} {} {} ({})", op.sequence, op.method, op.url, op.enqueued_at);
      }
    }
    Cmd::Sync => {
      let queue = open_queue(&config, args.ephemeral)?;
      let report = queue.replay(http.as_ref()).await;
      println!("{}", serde_json::to_string(&report)?);
    }
    Cmd::ClearQueue => {
      let queue = open_queue(&config, args.ephemeral)?;
      let cleared = queue.clear().await;
      println!("cleared {} operation(s)", cleared);
    }
  }

  Ok(())
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use newscache::cache::{CacheStorage, SqliteStorage};
use newscache::config::Config;
use newscache::db::Database;
use newscache::http::Request;
use newscache::lifecycle::Registration;
use newscache::net::HttpClient;
use newscache::sync::SyncOutcome;
use newscache::{EventOutcome, ServiceWorker, WorkerEvent, WorkerMessage};
use reqwest::Method;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "newscache")]
#[command(about = "Offline caching worker for the news dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./newscache.yaml or $XDG_CONFIG_HOME/newscache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend origin, overrides the config file and NEWSCACHE_ORIGIN
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version, activating it if nothing else is in control
  Install,
  /// Activate the waiting version and evict stale caches
  Activate,
  /// Post a skip-waiting message to the worker
  SkipWaiting,
  /// Report that every controlled page has closed
  ClientsClosed,
  /// Send a request through the worker and print the response
  Fetch {
    /// Path on the origin, e.g. /api/articles
    path: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Print only the status line and source, not the body
    #[arg(long)]
    head: bool,
  },
  /// Fire a background sync event
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show registration, cache generations and local record counts
  Status,
}

/// Initialize logging to stderr and a daily log file in the data directory.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "newscache.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin.or_else(Config::origin_from_env) {
    config.origin = origin;
  }
  let origin = config.origin_url()?;

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(data_dir.join("logs"))
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _guard = init_tracing(&data_dir.join("logs"));
  info!(origin = %origin, data_dir = %data_dir.display(), "newscache starting");

  let registration_path = data_dir.join("registration.json");
  let database_path = Database::path_in(&data_dir, &config.sync.database);

  let storage = Arc::new(SqliteStorage::open(&data_dir.join("cache.db"))?);
  let network = Arc::new(HttpClient::new(origin, config.request_timeout())?);
  let registration = Registration::load(&registration_path)?;
  let mut worker = ServiceWorker::new(
    &config,
    Arc::clone(&storage),
    Arc::clone(&network),
    registration,
    Some(database_path),
  )?;

  let result = run(&args.command, &config, &mut worker, &storage, &network).await;

  // Persist even when the command failed: a failed install is a state change too.
  worker.registration().save(&registration_path)?;
  result
}

async fn run(
  command: &Command,
  config: &Config,
  worker: &mut ServiceWorker<SqliteStorage, HttpClient>,
  storage: &SqliteStorage,
  network: &HttpClient,
) -> Result<()> {
  match command {
    Command::Install => {
      let (installed, activated) = worker.update().await?;
      println!("installed version {} ({} assets cached)", config.cache.version, installed.assets);
      match activated {
        Some(evicted) => print_activation(&evicted),
        None if installed.waiting => println!("waiting for the active version to release control"),
        None => {}
      }
    }
    Command::Activate => {
      if let EventOutcome::Activated { evicted } = worker.dispatch(WorkerEvent::Activate).await? {
        print_activation(&evicted);
      }
    }
    Command::SkipWaiting => {
      let message = WorkerEvent::Message(WorkerMessage::SkipWaiting);
      match worker.dispatch(message).await? {
        EventOutcome::Activated { evicted } => print_activation(&evicted),
        _ => println!("no version waiting"),
      }
    }
    Command::ClientsClosed => {
      worker.registration_mut().clients_closed();
      if worker.registration().should_activate() {
        if let EventOutcome::Activated { evicted } = worker.dispatch(WorkerEvent::Activate).await? {
          print_activation(&evicted);
        }
      } else {
        println!("no version waiting");
      }
    }
    Command::Fetch { path, method, head } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let request = Request::new(method, network.resolve(path)?);
      if let EventOutcome::Response(response) = worker.dispatch(WorkerEvent::Fetch(request)).await? {
        println!("{} ({:?})", response.status(), response.source());
        if !head {
          std::io::stdout().write_all(response.body())?;
          println!();
        }
      }
    }
    Command::Sync { tag } => {
      let tag = tag.clone().unwrap_or_else(|| worker.sync_agent().tag().to_string());
      if let EventOutcome::Synced(outcome) = worker.dispatch(WorkerEvent::Sync { tag }).await? {
        match outcome {
          SyncOutcome::Synced(count) => println!("synced {} records", count),
          SyncOutcome::Ignored => println!("no sync registered for that tag"),
          SyncOutcome::Failed(reason) => println!("sync failed: {}", reason),
        }
      }
    }
    Command::Status => print_status(config, worker, storage)?,
  }
  Ok(())
}

fn print_activation(evicted: &[String]) {
  if evicted.is_empty() {
    println!("activated");
  } else {
    println!("activated, evicted: {}", evicted.join(", "));
  }
}

fn print_status(
  config: &Config,
  worker: &ServiceWorker<SqliteStorage, HttpClient>,
  storage: &SqliteStorage,
) -> Result<()> {
  let registration = worker.registration();
  for (label, slot) in [
    ("installing", &registration.installing),
    ("waiting", &registration.waiting),
    ("active", &registration.active),
  ] {
    match slot {
      Some(v) => println!("{:<11} v{} {:?} since {}", label, v.version, v.state, v.state_changed_at),
      None => println!("{:<11} -", label),
    }
  }

  println!();
  for generation in storage.generations()? {
    println!("cache {:<32} {} entries", generation, storage.entry_count(&generation)?);
  }

  let db = worker.sync_agent().open_database()?;
  println!();
  println!(
    "local database v{}: {} records in '{}'",
    db.version(),
    db.count(&config.sync.store)?,
    config.sync.store
  );
  Ok(())
}

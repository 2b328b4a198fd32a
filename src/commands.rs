//! Subcommands of the command-line tool.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;
use url::Url;

use openings_cache::cache::{
  CacheEntry, MemoryStorage, PersistentStore, SqliteStorage, SweepWorker,
};
use openings_cache::config::{BackendKind, Config};
use openings_cache::http::HttpJsonClient;
use openings_cache::network::{HttpProbeSource, NetworkMonitor};
use openings_cache::sync::{ResourceOptions, ResourceState, SyncedResource};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
  /// Print one cached entry
  Get { partition: String, key: String },
  /// Store a value (JSON, or a plain string)
  Set {
    partition: String,
    key: String,
    value: String,
    /// Seconds until the entry expires
    #[arg(long)]
    ttl: Option<u64>,
  },
  /// Delete one cached entry
  Delete { partition: String, key: String },
  /// Remove every entry in a partition
  Clear { partition: String },
  /// List live entries in a partition
  List { partition: String },
  /// Evict expired entries from every partition
  Sweep,
  /// Show connectivity as the monitor classifies it
  Status {
    /// Keep printing transitions until interrupted
    #[arg(long)]
    watch: bool,
  },
  /// Load a JSON endpoint through a synced resource
  Fetch {
    url: Url,
    #[arg(long, default_value = "http")]
    partition: String,
    /// Seconds the fetched value stays fresh (default: resources.default_ttl_secs)
    #[arg(long)]
    ttl: Option<u64>,
    /// Go to the network even on a degraded link
    #[arg(long)]
    force: bool,
  },
}

/// Open the configured store, run `command`, print to stdout.
pub async fn run(command: Command, config: &Config) -> Result<()> {
  let store = open_store(config).await?;

  // Long-running commands keep the cache bounded while they run
  let sweeper = match (&command, config.storage.sweep_interval()) {
    (Command::Status { watch: true } | Command::Fetch { .. }, Some(interval)) => {
      Some(SweepWorker::new(store.clone(), interval).spawn())
    }
    _ => None,
  };

  let mut out = std::io::stdout().lock();
  let result = match command {
    Command::Status { watch } => status(config, watch, &mut out).await,
    Command::Fetch {
      url,
      partition,
      ttl,
      force,
    } => {
      let ttl = ttl
        .map(Duration::from_secs)
        .or(config.resources.default_ttl());
      let monitor = start_monitor(config).await?;
      fetch(&store, monitor, url, &partition, ttl, force, &mut out).await
    }
    other => execute(other, &store, &mut out).await,
  };

  if let Some(handle) = sweeper {
    handle.abort();
  }
  result
}

async fn open_store(config: &Config) -> Result<PersistentStore> {
  let schema = config.storage.schema();
  let store = match config.storage.backend {
    BackendKind::Sqlite => {
      let backend = match &config.storage.path {
        Some(path) => SqliteStorage::open(path)?,
        None => SqliteStorage::open_default()?,
      };
      PersistentStore::open(backend, schema).await?
    }
    BackendKind::Memory => PersistentStore::open(MemoryStorage::new(), schema).await?,
  };
  Ok(store)
}

async fn start_monitor(config: &Config) -> Result<NetworkMonitor> {
  let source = HttpProbeSource::new(
    config.network.probe_url()?,
    config.network.probe_interval(),
    config.network.probe_timeout(),
  )?;
  Ok(NetworkMonitor::start(source, config.network.thresholds()).await)
}

/// Commands that only touch the store.
async fn execute<W: Write>(command: Command, store: &PersistentStore, out: &mut W) -> Result<()> {
  match command {
    Command::Get { partition, key } => match store.entry::<Value>(&partition, &key).await? {
      Some(entry) => {
        print_entry(out, &entry)?;
        writeln!(out, "{}", serde_json::to_string_pretty(&entry.value)?)?;
      }
      None => writeln!(out, "{}/{}: not cached", partition, key)?,
    },
    Command::Set {
      partition,
      key,
      value,
      ttl,
    } => {
      let value = parse_value(&value);
      store
        .set(&partition, &key, &value, ttl.map(Duration::from_secs))
        .await?;
      writeln!(out, "Stored {}/{}", partition, key)?;
    }
    Command::Delete { partition, key } => {
      store.delete(&partition, &key).await?;
      writeln!(out, "Deleted {}/{}", partition, key)?;
    }
    Command::Clear { partition } => {
      store.clear(&partition).await?;
      writeln!(out, "Cleared {}", partition)?;
    }
    Command::List { partition } => {
      let entries = store.entries::<Value>(&partition).await?;
      for entry in &entries {
        print_entry(out, entry)?;
      }
      writeln!(out, "{} live entries in {}", entries.len(), partition)?;
    }
    Command::Sweep => {
      let mut total = 0;
      for partition in store.partitions() {
        let removed = store.sweep(partition).await?;
        if removed > 0 {
          writeln!(out, "{}: removed {}", partition, removed)?;
        }
        total += removed;
      }
      writeln!(out, "Removed {} expired entries", total)?;
    }
    Command::Status { .. } | Command::Fetch { .. } => {
      return Err(eyre!("{:?} needs the network monitor", command));
    }
  }
  Ok(())
}

async fn status<W: Write>(config: &Config, watch: bool, out: &mut W) -> Result<()> {
  let monitor = start_monitor(config).await?;
  writeln!(out, "{}", monitor.current_state())?;
  if !watch {
    return Ok(());
  }

  let mut rx = monitor.watch();
  loop {
    tokio::select! {
      changed = rx.changed() => {
        if changed.is_err() {
          break;
        }
        let state = *rx.borrow_and_update();
        writeln!(out, "{}", state)?;
        out.flush()?;
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }
  Ok(())
}

async fn fetch<W: Write>(
  store: &PersistentStore,
  monitor: NetworkMonitor,
  url: Url,
  partition: &str,
  ttl: Option<Duration>,
  force: bool,
  out: &mut W,
) -> Result<()> {
  writeln!(out, "Connectivity: {}", monitor.current_state())?;

  let client = HttpJsonClient::new(FETCH_TIMEOUT)?;
  let descriptor = client.descriptor(url, partition, ttl);

  // Show what a screen would render before the network answers
  match store
    .entry::<Value>(&descriptor.partition, &descriptor.key)
    .await
  {
    Ok(Some(entry)) => print_entry(out, &entry)?,
    Ok(None) => writeln!(out, "Nothing cached for {}", descriptor.key)?,
    Err(e) => tracing::warn!(error = %e, "Cache read failed"),
  }

  let resource = SyncedResource::new(
    descriptor,
    store.clone(),
    monitor,
    ResourceOptions { auto_fetch: false },
  );
  let outcome = resource.refresh(force).await;
  writeln!(out, "Refresh: {:?}", outcome)?;

  print_state(out, &resource.state())
}

fn print_entry<W: Write>(out: &mut W, entry: &CacheEntry<Value>) -> Result<()> {
  let expires = entry
    .expires_at()
    .map(|at| at.to_rfc3339())
    .unwrap_or_else(|| "never".to_string());
  writeln!(
    out,
    "{}  stored {}  expires {}",
    entry.key,
    entry.stored_at.to_rfc3339(),
    expires
  )?;
  Ok(())
}

fn print_state<W: Write>(out: &mut W, state: &ResourceState<Value>) -> Result<()> {
  writeln!(out, "Status: {:?}", state.status())?;
  if let Some(provenance) = state.provenance {
    writeln!(out, "Source: {:?}", provenance)?;
  }
  if let Some(error) = &state.last_error {
    writeln!(out, "Error: {}", error)?;
  }
  if let Some(value) = &state.value {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
  }
  Ok(())
}

/// JSON if it parses, otherwise the raw text as a JSON string.
fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use resilient_fetch::config::ttl_from_secs;
use resilient_fetch::{
  Config, ConnectivityState, FetchOptions, FetchOutcome, Method, RequestSpec, ResilientClient,
};

#[derive(Parser, Debug)]
#[command(name = "rfetch")]
#[command(about = "Offline-tolerant HTTP client with a response cache and a durable write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/resilient-fetch/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the network as unreachable (reads fail, writes are queued)
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a URL, served from the cache when fresh
  Get {
    url: String,
    /// Cache lifetime in seconds (config default when omitted)
    #[arg(long)]
    ttl: Option<u64>,
    /// Bypass the cache
    #[arg(long)]
    no_cache: bool,
  },
  /// Send a write; queued for later delivery if it cannot complete now
  Send {
    method: String,
    url: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
    /// Label shown in the queue listing
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
  },
  /// List queued writes
  Queue,
  /// Try to deliver queued writes now
  Drain,
  /// Remove a queued write
  Cancel { id: String },
  /// Remove every cached response
  ClearCache,
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("resilient-fetch")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "rfetch.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resilient_fetch=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if args.offline {
    config.probe = None;
  }

  let client = ResilientClient::from_config(&config)?;
  if args.offline {
    client.connectivity().update(ConnectivityState::offline());
  }

  match args.command {
    Command::Get { url, ttl, no_cache } => {
      let options = if no_cache {
        FetchOptions::default()
      } else {
        let ttl = ttl
          .map(ttl_from_secs)
          .unwrap_or(client.cache().config().default_ttl);
        FetchOptions::cached(ttl)
      };
      let outcome = client
        .fetch_with_retry(RequestSpec::get(url), options)
        .await
        .map_err(|e| eyre!("Request failed: {}", e))?;
      print_outcome(&outcome)?;
    }
    Command::Send {
      method,
      url,
      body,
      context,
      max_attempts,
    } => {
      let method: Method = method.parse().map_err(|e: String| eyre!(e))?;
      if method.is_read() {
        return Err(eyre!("{} is a read; use `rfetch get`", method));
      }

      let mut request = RequestSpec::new(method, url);
      if let Some(body) = body {
        let value = serde_json::from_str(&body).map_err(|e| eyre!("Invalid JSON body: {}", e))?;
        request = request.with_body(value);
      }

      let mut options = FetchOptions {
        queue_on_failure: true,
        context,
        ..FetchOptions::default()
      };
      if let Some(n) = max_attempts {
        options = options.with_max_attempts(n);
      }

      let outcome = client
        .fetch_with_retry(request, options)
        .await
        .map_err(|e| eyre!("Request failed: {}", e))?;
      print_outcome(&outcome)?;
    }
    Command::Queue => {
      let pending = client.queue().pending();
      if pending.is_empty() {
        println!("Queue is empty");
      }
      for item in pending {
        let last_error = item
          .last_error
          .map(|e| e.to_string())
          .unwrap_or_else(|| "-".to_string());
        println!(
          "{}  {} {}  attempts {}/{}  [{}]  last error: {}",
          item.id,
          item.target.method,
          item.target.url,
          item.attempts,
          item.max_attempts,
          item.context,
          last_error
        );
      }
    }
    Command::Drain => {
      let report = client.drain().await;
      if report.skipped {
        println!("Drain skipped (offline or already draining), {} pending", report.remaining);
      } else {
        println!(
          "Attempted {}, delivered {}, failed {}, remaining {}{}",
          report.attempted,
          report.delivered,
          report.failed,
          report.remaining,
          if report.interrupted { " (interrupted)" } else { "" }
        );
      }
    }
    Command::Cancel { id } => {
      if client.queue().cancel(&id) {
        println!("Cancelled {}", id);
      } else {
        return Err(eyre!("No queued request with id {}", id));
      }
    }
    Command::ClearCache => {
      let removed = client.cache().clear();
      println!("Removed {} cached responses", removed);
    }
  }

  Ok(())
}

fn print_outcome(outcome: &FetchOutcome) -> Result<()> {
  match outcome {
    FetchOutcome::Network(response) | FetchOutcome::Cached(response) => {
      let source = if matches!(outcome, FetchOutcome::Cached(_)) {
        "cache"
      } else {
        "network"
      };
      eprintln!("{} ({})", response.status, source);
      let body = serde_json::to_string_pretty(&response.body)
        .map_err(|e| eyre!("Failed to format response: {}", e))?;
      println!("{}", body);
    }
    FetchOutcome::Deferred { id } => {
      println!("Queued for later delivery: {}", id);
    }
  }
  Ok(())
}

//! `rapport` — operator CLI for the Rapport social graph.
//!
//! Reads `rapport.toml` (or the path given with `--config`), opens the
//! configured backend, runs one command as the user given with `--as`, and
//! prints the result as JSON.
//!
//! ```text
//! rapport --as 6f1c…  follow 0b9e…
//! rapport --as 0b9e…  pending
//! RAPPORT__BACKEND=memory rapport --as 6f1c… stats
//! ```

mod commands;
mod settings;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use commands::Command;
use settings::{AppConfig, Backend, expand_tilde};
use rapport_core::{
  SocialGraph, UserId, context::OpContext, memory::MemoryStore, store::GraphStore,
};
use rapport_store_sqlite::SqliteStore;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rapport", version, about = "Rapport social graph operator CLI")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "rapport.toml")]
  config: PathBuf,

  /// The user the command acts as. Assumed already authenticated.
  #[arg(long = "as", value_name = "UUID", global = true)]
  actor: Option<UserId>,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Logs go to stderr so stdout stays valid JSON.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = AppConfig::load(&cli.config)?;

  // Ctrl-C cancels whatever store call is in flight.
  let token = CancellationToken::new();
  tokio::spawn({
    let token = token.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        token.cancel();
      }
    }
  });
  let cx = match cfg.timeout() {
    Some(timeout) => OpContext::with_timeout(timeout),
    None => OpContext::new(),
  }
  .with_token(token);

  match cfg.backend {
    Backend::Sqlite => {
      let store_path = expand_tilde(&cfg.store_path);
      if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)
          .with_context(|| format!("failed to create {}", parent.display()))?;
      }
      let store = SqliteStore::open(&store_path)
        .await
        .with_context(|| format!("failed to open store at {store_path:?}"))?;
      execute(store, cfg, &cx, cli).await
    }
    Backend::Memory => {
      tracing::warn!("memory backend: nothing is persisted past this command");
      execute(MemoryStore::new(), cfg, &cx, cli).await
    }
  }
}

async fn execute<S: GraphStore>(
  store: S,
  cfg: AppConfig,
  cx: &OpContext,
  cli: Cli,
) -> anyhow::Result<()> {
  let graph = SocialGraph::new(Arc::new(store), cfg.graph);
  commands::run(&graph, cx, cli.actor, cli.command).await
}

//! Serve command implementation.
//!
//! Wires the filesystem-backed stores, the command executor and the
//! directory platform into an engine, then serves the HTTP API until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use lamina_lib::api;
use lamina_lib::build::FsStagingStore;
use lamina_lib::config::{Config, ConfigError};
use lamina_lib::engine::{Backends, Engine};
use lamina_lib::executor::CommandExecutor;
use lamina_lib::idempotency::MemoryIdempotencyStore;
use lamina_lib::provision::DirPlatform;
use lamina_lib::source::FsSourceStore;

use crate::output::{self, Tone};

pub async fn cmd_serve() -> Result<()> {
  let config = match Config::from_env().and_then(|c| c.validate().map(|_| c)) {
    Ok(config) => config,
    Err(e) => {
      output::line(Tone::Fail, &format!("Invalid configuration: {}", e));
      return Err(e.into());
    }
  };

  let backends = backends(&config)?;
  let engine = Arc::new(Engine::start(config.engine_config(), backends));

  let listener = tokio::net::TcpListener::bind(config.listen_addr)
    .await
    .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

  info!(
    workers = config.workers,
    queue_capacity = config.queue_capacity,
    registry = %config.registry,
    "lamina server starting"
  );

  let served = api::serve(listener, engine.clone(), shutdown_signal()).await;
  engine.shutdown().await;
  served.context("HTTP server failed")
}

fn backends(config: &Config) -> Result<Backends, ConfigError> {
  let missing = |name: &str| ConfigError::Missing(format!("{}{}", lamina_lib::config::ENV_PREFIX, name));
  let source_dir = config.source_dir.clone().ok_or_else(|| missing("SOURCE_DIR"))?;
  let staging_dir = config.staging_dir.clone().ok_or_else(|| missing("STAGING_DIR"))?;
  let platform_dir = config.platform_dir.clone().ok_or_else(|| missing("PLATFORM_DIR"))?;
  let build_command = config.build_command.as_deref().ok_or_else(|| missing("BUILD_COMMAND"))?;

  Ok(Backends {
    sources: Arc::new(FsSourceStore::new(source_dir)),
    staging: Arc::new(FsStagingStore::new(staging_dir)),
    executor: Arc::new(CommandExecutor::new(build_command)),
    platform: Arc::new(DirPlatform::new(platform_dir)),
    idempotency: Arc::new(MemoryIdempotencyStore::new()),
  })
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  info!("shutdown requested");
}

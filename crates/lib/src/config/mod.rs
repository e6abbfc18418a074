//! Runtime configuration read from `LAMINA_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::build::{RecipeSet, Runtime};
use crate::dispatch::{DispatchConfig, ImageNaming};
use crate::engine::EngineConfig;
use crate::registry::PageLimits;
use crate::util::retry::Backoff;

pub const ENV_PREFIX: &str = "LAMINA_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("invalid value for {var}: {value:?} ({reason})")]
  Invalid {
    var: String,
    value: String,
    reason: String,
  },

  #[error("{0} must be set")]
  Missing(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub listen_addr: SocketAddr,
  pub source_dir: Option<PathBuf>,
  pub staging_dir: Option<PathBuf>,
  pub platform_dir: Option<PathBuf>,
  pub build_command: Option<String>,
  pub registry: String,
  pub namespace: String,
  pub workers: usize,
  pub queue_capacity: usize,
  pub max_retries: u32,
  pub retry_delay: Duration,
  pub poll_interval: Duration,
  pub cancel_grace: Duration,
  pub build_timeout: Duration,
  pub idempotency_ttl: Duration,
  pub sweep_interval: Duration,
  pub log_tail_lines: usize,
  pub retained_jobs: usize,
  pub page_size_default: usize,
  pub page_size_max: usize,
  pub base_image_nodejs: Option<String>,
  pub base_image_python: Option<String>,
  pub base_image_go: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
      source_dir: None,
      staging_dir: None,
      platform_dir: None,
      build_command: None,
      registry: "localhost:5000".to_string(),
      namespace: "lambdas".to_string(),
      workers: 4,
      queue_capacity: 64,
      max_retries: 3,
      retry_delay: Duration::from_millis(500),
      poll_interval: Duration::from_millis(1000),
      cancel_grace: Duration::from_secs(30),
      build_timeout: Duration::from_secs(1800),
      idempotency_ttl: Duration::from_secs(86_400),
      sweep_interval: Duration::from_secs(300),
      log_tail_lines: 100,
      retained_jobs: 1000,
      page_size_default: 20,
      page_size_max: 100,
      base_image_nodejs: None,
      base_image_python: None,
      base_image_go: None,
    }
  }
}

/// Reads variables through a lookup function.
struct Vars<F> {
  lookup: F,
}

impl<F> Vars<F>
where
  F: Fn(&str) -> Option<String>,
{
  fn raw(&self, name: &str) -> Option<(String, String)> {
    let var = format!("{}{}", ENV_PREFIX, name);
    (self.lookup)(&var)
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
      .map(|v| (var, v))
  }

  fn string(&self, name: &str) -> Option<String> {
    self.raw(name).map(|(_, v)| v)
  }

  fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
  where
    T: FromStr,
    T::Err: std::fmt::Display,
  {
    match self.raw(name) {
      None => Ok(default),
      Some((var, value)) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value,
        reason: e.to_string(),
      }),
    }
  }

  /// A count that must be at least 1.
  fn size(&self, name: &str, default: usize) -> Result<usize, ConfigError> {
    let value = self.parse(name, default)?;
    if value == 0 {
      return Err(ConfigError::Invalid {
        var: format!("{}{}", ENV_PREFIX, name),
        value: "0".to_string(),
        reason: "must be greater than zero".to_string(),
      });
    }
    Ok(value)
  }

  fn millis(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let value = self.parse(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(value))
  }

  fn secs(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let value = self.parse(name, default.as_secs())?;
    Ok(Duration::from_secs(value))
  }
}

impl Config {
  /// Load from the process environment over the defaults.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Load using `lookup` to resolve variable names.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let vars = Vars { lookup };
    let defaults = Config::default();

    let config = Config {
      listen_addr: vars.parse("LISTEN_ADDR", defaults.listen_addr)?,
      source_dir: vars.string("SOURCE_DIR").map(PathBuf::from),
      staging_dir: vars.string("STAGING_DIR").map(PathBuf::from),
      platform_dir: vars.string("PLATFORM_DIR").map(PathBuf::from),
      build_command: vars.string("BUILD_COMMAND"),
      registry: vars.string("REGISTRY").unwrap_or(defaults.registry),
      namespace: vars.string("NAMESPACE").unwrap_or(defaults.namespace),
      workers: vars.size("WORKERS", defaults.workers)?,
      queue_capacity: vars.size("QUEUE_CAPACITY", defaults.queue_capacity)?,
      max_retries: vars.parse("MAX_RETRIES", defaults.max_retries)?,
      retry_delay: vars.millis("RETRY_DELAY_MS", defaults.retry_delay)?,
      poll_interval: vars.millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
      cancel_grace: vars.secs("CANCEL_GRACE_SECS", defaults.cancel_grace)?,
      build_timeout: vars.secs("BUILD_TIMEOUT_SECS", defaults.build_timeout)?,
      idempotency_ttl: vars.secs("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl)?,
      sweep_interval: vars.secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
      log_tail_lines: vars.parse("LOG_TAIL_LINES", defaults.log_tail_lines)?,
      retained_jobs: vars.size("RETAINED_JOBS", defaults.retained_jobs)?,
      page_size_default: vars.size("PAGE_SIZE_DEFAULT", defaults.page_size_default)?,
      page_size_max: vars.size("PAGE_SIZE_MAX", defaults.page_size_max)?,
      base_image_nodejs: vars.string("BASE_IMAGE_NODEJS"),
      base_image_python: vars.string("BASE_IMAGE_PYTHON"),
      base_image_go: vars.string("BASE_IMAGE_GO"),
    };

    if config.poll_interval.is_zero() {
      return Err(ConfigError::Invalid {
        var: format!("{}POLL_INTERVAL_MS", ENV_PREFIX),
        value: "0".to_string(),
        reason: "must be greater than zero".to_string(),
      });
    }
    if config.sweep_interval.is_zero() {
      return Err(ConfigError::Invalid {
        var: format!("{}SWEEP_INTERVAL_SECS", ENV_PREFIX),
        value: "0".to_string(),
        reason: "must be greater than zero".to_string(),
      });
    }
    if config.page_size_default > config.page_size_max {
      return Err(ConfigError::Invalid {
        var: format!("{}PAGE_SIZE_DEFAULT", ENV_PREFIX),
        value: config.page_size_default.to_string(),
        reason: format!("exceeds {}PAGE_SIZE_MAX ({})", ENV_PREFIX, config.page_size_max),
      });
    }
    Ok(config)
  }

  /// Check the values the server cannot start without.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let required = [
      ("SOURCE_DIR", self.source_dir.is_none()),
      ("STAGING_DIR", self.staging_dir.is_none()),
      ("PLATFORM_DIR", self.platform_dir.is_none()),
      ("BUILD_COMMAND", self.build_command.is_none()),
    ];
    match required.iter().find(|(_, missing)| *missing) {
      Some((name, _)) => Err(ConfigError::Missing(format!("{}{}", ENV_PREFIX, name))),
      None => Ok(()),
    }
  }

  pub fn recipes(&self) -> RecipeSet {
    let overrides = [
      (Runtime::NodeJs, &self.base_image_nodejs),
      (Runtime::Python, &self.base_image_python),
      (Runtime::Go, &self.base_image_go),
    ];
    overrides
      .into_iter()
      .fold(RecipeSet::default(), |recipes, (runtime, image)| match image {
        Some(image) => recipes.with_base_image(runtime, image),
        None => recipes,
      })
  }

  pub fn engine_config(&self) -> EngineConfig {
    let backoff = Backoff::new(self.max_retries, self.retry_delay);
    EngineConfig {
      dispatch: DispatchConfig {
        workers: self.workers,
        queue_capacity: self.queue_capacity,
        backoff,
        poll_interval: self.poll_interval,
        cancel_grace: self.cancel_grace,
        build_timeout: self.build_timeout,
        log_tail_lines: self.log_tail_lines,
        retained_jobs: self.retained_jobs,
      },
      naming: ImageNaming::new(&self.registry, &self.namespace),
      recipes: self.recipes(),
      page_limits: PageLimits {
        default_size: self.page_size_default,
        max_size: self.page_size_max,
      },
      idempotency_ttl: self.idempotency_ttl,
      sweep_interval: self.sweep_interval,
      provision_backoff: backoff,
    }
  }
}

use anyhow::Result;

use lamina_lib::config::Config;

use crate::output::{self, OutputFormat, Tone};

pub fn cmd_config(format: OutputFormat) -> Result<()> {
  let config = Config::from_env()?;
  let missing = config.validate().err();

  let path = |p: &Option<std::path::PathBuf>| p.as_ref().map(|p| p.display().to_string());

  if format.is_json() {
    output::json(&serde_json::json!({
      "listen_addr": config.listen_addr.to_string(),
      "source_dir": path(&config.source_dir),
      "staging_dir": path(&config.staging_dir),
      "platform_dir": path(&config.platform_dir),
      "build_command": config.build_command,
      "registry": config.registry,
      "namespace": config.namespace,
      "workers": config.workers,
      "queue_capacity": config.queue_capacity,
      "max_retries": config.max_retries,
      "retry_delay_ms": config.retry_delay.as_millis() as u64,
      "poll_interval_ms": config.poll_interval.as_millis() as u64,
      "cancel_grace_secs": config.cancel_grace.as_secs(),
      "build_timeout_secs": config.build_timeout.as_secs(),
      "idempotency_ttl_secs": config.idempotency_ttl.as_secs(),
      "sweep_interval_secs": config.sweep_interval.as_secs(),
      "log_tail_lines": config.log_tail_lines,
      "retained_jobs": config.retained_jobs,
      "page_size_default": config.page_size_default,
      "page_size_max": config.page_size_max,
      "base_image_nodejs": config.base_image_nodejs,
      "base_image_python": config.base_image_python,
      "base_image_go": config.base_image_go,
      "ready_to_serve": missing.is_none(),
    }))?;
    return Ok(());
  }

  let unset = "(unset)".to_string();
  output::line(Tone::Note, "Effective configuration");
  output::field("Listen address", config.listen_addr);
  output::field("Source dir", path(&config.source_dir).unwrap_or_else(|| unset.clone()));
  output::field("Staging dir", path(&config.staging_dir).unwrap_or_else(|| unset.clone()));
  output::field("Platform dir", path(&config.platform_dir).unwrap_or_else(|| unset.clone()));
  output::field("Build command", config.build_command.as_deref().unwrap_or("(unset)"));
  output::field("Registry", format!("{}/{}", config.registry, config.namespace));
  output::field("Workers", config.workers);
  output::field("Queue capacity", config.queue_capacity);
  output::field(
    "Retries",
    format!("{} (from {})", config.max_retries, humantime::format_duration(config.retry_delay)),
  );
  output::field("Poll interval", humantime::format_duration(config.poll_interval));
  output::field("Build timeout", humantime::format_duration(config.build_timeout));
  output::field("Cancel grace", humantime::format_duration(config.cancel_grace));
  output::field("Idempotency TTL", humantime::format_duration(config.idempotency_ttl));
  output::field("Retained jobs", config.retained_jobs);
  output::field("Page size", format!("{} (max {})", config.page_size_default, config.page_size_max));

  if let Some(e) = missing {
    println!();
    output::line(Tone::Warn, &format!("Not ready to serve: {}", e));
  }

  Ok(())
}

//! Builds commands: list, inspect and cancel builds on a running server.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use lamina_lib::dispatch::{BuildJob, JobStatus};
use lamina_lib::registry::{BuildDetail, Page};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat, Tone};

pub struct ListArgs {
  pub tenant: Option<String>,
  pub parser: Option<String>,
  pub status: Option<String>,
  pub page_size: Option<usize>,
  pub page_token: Option<String>,
}

impl ListArgs {
  fn query(&self) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    let fields = [
      ("tenant", self.tenant.clone()),
      ("parser", self.parser.clone()),
      ("status", self.status.clone()),
      ("page_size", self.page_size.map(|n| n.to_string())),
      ("page_token", self.page_token.clone()),
    ];
    for (key, value) in fields {
      if let Some(value) = value {
        query.push((key, value));
      }
    }
    query
  }
}

pub async fn cmd_builds_list(client: &ApiClient, args: &ListArgs, verbose: bool, format: OutputFormat) -> Result<()> {
  let page: Page = client.get("/v1/builds", &args.query()).await?;

  if format.is_json() {
    return output::json(&page);
  }

  if page.items.is_empty() {
    output::line(Tone::Note, "No builds found.");
    return Ok(());
  }

  for job in &page.items {
    println!("  {} {}", output::status_marker(job.status), summary(job));
    if verbose {
      println!("      image: {}", job.target_image);
      if let Some(error) = &job.error {
        println!("      error: {}", error);
      }
    }
  }
  if let Some(token) = &page.next_page_token {
    println!();
    output::line(Tone::Note, &format!("More results: --page-token {}", token));
  }

  Ok(())
}

pub async fn cmd_builds_get(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
  let detail: BuildDetail = client.get(&format!("/v1/builds/{}", id), &[]).await?;

  if format.is_json() {
    return output::json(&detail);
  }

  let job = &detail.job;
  output::line(Tone::Done, &summary(job));
  output::field("Service", job.resource_name.as_str());
  output::field("Runtime", job.runtime.as_str());
  output::field("Content hash", job.content_hash.as_str());
  output::field("Target image", &job.target_image);
  if !job.context.reused {
    output::field("Context size", format!("{} bytes", job.context.size));
  }
  output::field("Attempts", job.attempts);
  output::field("Created", &job.created_at.to_rfc3339());
  if let Some(started) = job.started_at {
    let end = job.completed_at.unwrap_or_else(Utc::now);
    let elapsed = (end - started).to_std().unwrap_or_default();
    output::field("Elapsed", humantime::format_duration(Duration::from_secs(elapsed.as_secs())));
  }
  if let Some(image) = &job.image_reference {
    output::field("Image", image);
  }
  if let Some(error) = &job.error {
    output::field("Error", error);
  }

  if !detail.logs.is_empty() {
    println!();
    println!("Logs:");
    for line in &detail.logs {
      println!("  {}", line);
    }
  }

  Ok(())
}

pub async fn cmd_builds_cancel(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
  let job: BuildJob = client.post(&format!("/v1/builds/{}/cancel", id), None).await?;

  if format.is_json() {
    return output::json(&job);
  }

  match job.status {
    JobStatus::Cancelled => output::line(Tone::Done, &format!("Cancelled {}", job.id)),
    _ => output::line(Tone::Note, &format!("Cancellation requested for {}", job.id)),
  }
  Ok(())
}

fn summary(job: &BuildJob) -> String {
  format!(
    "{} {}/{} {} {}",
    job.id,
    job.third_party_id,
    job.parser_id,
    job.status,
    job.content_hash.image_tag()
  )
}

use anyhow::Result;

use lamina_lib::dispatch::PoolStats;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat, Tone};

pub async fn cmd_stats(client: &ApiClient, format: OutputFormat) -> Result<()> {
  let stats: PoolStats = client.get("/v1/stats", &[]).await?;

  if format.is_json() {
    output::json(&stats)?;
  } else {
    output::line(Tone::Done, "Worker pool");
    output::field("Workers", stats.workers);
    output::field("Queued", format!("{} / {}", stats.queue_depth, stats.queue_capacity));
  }

  Ok(())
}

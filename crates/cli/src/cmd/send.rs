use std::path::Path;

use anyhow::{Context, Result};

use lamina_lib::event::Event;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat, Tone};

/// Post the event in `file` to the server's ingress endpoint.
pub async fn cmd_send(client: &ApiClient, file: &Path, format: OutputFormat) -> Result<()> {
  let content = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
  let event: Event = serde_json::from_str(&content).with_context(|| format!("Invalid event in {}", file.display()))?;
  // Reject locally what the server would reject.
  event.kind()?;

  let body = serde_json::to_value(&event)?;
  let response: serde_json::Value = client.post("/events", Some(&body)).await?;

  if format.is_json() {
    return output::json(&response);
  }

  match response.get("outcome").and_then(|o| o.as_str()) {
    Some("skipped-duplicate") => output::line(Tone::Note, &format!("Event {} was already processed", event.id)),
    _ => {
      output::line(Tone::Done, &format!("Event {} accepted", event.id));
      if let Some(result) = response.get("result") {
        println!("  {}", result);
      }
    }
  }
  Ok(())
}

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use lamina_lib::build::{BuildRequest, Runtime, fingerprint};
use lamina_lib::config::Config;
use lamina_lib::provision::ResourceName;

use crate::output::{self, OutputFormat, Tone};

/// Print the content hash a build of `file` would get, without contacting
/// any backend. Base image overrides come from the environment.
pub fn cmd_hash(file: &Path, tenant: &str, parser: &str, runtime: &str, format: OutputFormat) -> Result<()> {
  let runtime: Runtime = runtime.parse()?;
  let source = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
  let config = Config::from_env()?;

  let request = BuildRequest::new(tenant, parser, runtime);
  let recipe = config.recipes().render(&request).map_err(|e| anyhow!(e))?;
  let hash = fingerprint(&source, &recipe);
  let name = ResourceName::derive(tenant, parser);

  if format.is_json() {
    output::json(&serde_json::json!({
      "content_hash": hash.as_str(),
      "image_tag": hash.image_tag(),
      "resource_name": name.as_str(),
      "runtime": runtime.as_str(),
    }))?;
  } else {
    output::line(Tone::Done, name.as_str());
    output::field("Content hash", hash.as_str());
    output::field("Image tag", hash.image_tag());
    output::field("Runtime", runtime.as_str());
  }

  Ok(())
}

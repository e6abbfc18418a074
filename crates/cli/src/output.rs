//! Terminal output for lamina commands.
//!
//! Human output is a status [`line`] followed by indented [`field`]s.
//! With `--output json` commands print the server payload through [`json`]
//! instead, so scripts see exactly what the API returned.

use std::fmt::Display;

use anyhow::Context;
use clap::ValueEnum;
use lamina_lib::dispatch::JobStatus;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// What a status line reports. Warnings and failures go to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
  Done,
  Note,
  Warn,
  Fail,
}

impl Tone {
  fn marker(self) -> &'static str {
    match self {
      Tone::Done => "✓",
      Tone::Note => "•",
      Tone::Warn => "⚠",
      Tone::Fail => "✗",
    }
  }

  fn to_stderr(self) -> bool {
    matches!(self, Tone::Warn | Tone::Fail)
  }

  fn stream(self) -> Stream {
    if self.to_stderr() { Stream::Stderr } else { Stream::Stdout }
  }
}

pub fn line(tone: Tone, message: &str) {
  let marker_text = tone.marker();
  let marker = marker_text.if_supports_color(tone.stream(), |m| match tone {
    Tone::Done => m.green().to_string(),
    Tone::Note => m.blue().to_string(),
    Tone::Warn => m.yellow().to_string(),
    Tone::Fail => m.red().to_string(),
  });
  if tone.to_stderr() {
    eprintln!("{} {}", marker, message);
  } else {
    println!("{} {}", marker, message);
  }
}

/// An indented `label: value` line.
pub fn field(label: &str, value: impl Display) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |l| l.dimmed()), value);
}

pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  let text = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", text);
  Ok(())
}

/// Listing marker for a build in `status`.
pub fn status_marker(status: JobStatus) -> &'static str {
  match status {
    JobStatus::Succeeded => Tone::Done.marker(),
    JobStatus::Failed => Tone::Fail.marker(),
    JobStatus::Pending | JobStatus::Running => Tone::Note.marker(),
    JobStatus::Cancelled => "-",
  }
}

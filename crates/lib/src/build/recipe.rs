//! Per-runtime build recipe templates.
//!
//! Each supported runtime has one template, parameterized by a base image and
//! a dependency-install command. Rendering is a pure function of the template
//! and the request, so the recipe bytes can take part in the content hash.

use std::fmt::Write as _;

use crate::build::types::{BuildRequest, Runtime};

/// A recipe template for one runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeTemplate {
  pub base_image: String,
  /// File name the parser source is copied to inside the image.
  pub source_file: &'static str,
  /// Dependency-install command, run once after the source is copied.
  pub install: &'static str,
  /// Container entrypoint.
  pub command: &'static [&'static str],
}

impl RecipeTemplate {
  pub fn for_runtime(runtime: Runtime) -> Self {
    match runtime {
      Runtime::NodeJs => Self {
        base_image: "node:20-alpine".to_string(),
        source_file: "index.js",
        install: "npm init -y > /dev/null && npm install --omit=dev --no-audit --no-fund",
        command: &["node", "index.js"],
      },
      Runtime::Python => Self {
        base_image: "python:3.11-slim".to_string(),
        source_file: "main.py",
        install: "pip install --no-cache-dir --upgrade pip",
        command: &["python", "-u", "main.py"],
      },
      Runtime::Go => Self {
        base_image: "golang:1.21-alpine".to_string(),
        source_file: "main.go",
        install: "go mod init parser && go mod tidy && CGO_ENABLED=0 go build -o /app/parser .",
        command: &["/app/parser"],
      },
    }
  }
}

/// The set of templates, one per runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeSet {
  nodejs: RecipeTemplate,
  python: RecipeTemplate,
  go: RecipeTemplate,
}

impl Default for RecipeSet {
  fn default() -> Self {
    Self {
      nodejs: RecipeTemplate::for_runtime(Runtime::NodeJs),
      python: RecipeTemplate::for_runtime(Runtime::Python),
      go: RecipeTemplate::for_runtime(Runtime::Go),
    }
  }
}

impl RecipeSet {
  pub fn template(&self, runtime: Runtime) -> &RecipeTemplate {
    match runtime {
      Runtime::NodeJs => &self.nodejs,
      Runtime::Python => &self.python,
      Runtime::Go => &self.go,
    }
  }

  /// Override the base image for one runtime.
  pub fn with_base_image(mut self, runtime: Runtime, image: &str) -> Self {
    let template = match runtime {
      Runtime::NodeJs => &mut self.nodejs,
      Runtime::Python => &mut self.python,
      Runtime::Go => &mut self.go,
    };
    template.base_image = image.to_string();
    self
  }

  /// Render the recipe for a request.
  ///
  /// # Errors
  ///
  /// Returns a description of the first invalid input: an empty base image,
  /// a malformed variable name, or a value containing a line break.
  pub fn render(&self, request: &BuildRequest) -> Result<String, String> {
    let template = self.template(request.runtime);
    if template.base_image.trim().is_empty() {
      return Err(format!("no base image configured for runtime {}", request.runtime));
    }

    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "FROM {}", template.base_image);
    let _ = writeln!(out, "WORKDIR /app");

    for (key, value) in &request.build_args {
      check_variable(key, value)?;
      let _ = writeln!(out, "ARG {}={}", key, quote(value));
    }
    let _ = writeln!(out, "ENV THIRD_PARTY_ID={}", quote(&request.third_party_id));
    let _ = writeln!(out, "ENV PARSER_ID={}", quote(&request.parser_id));
    for (key, value) in &request.environment {
      check_variable(key, value)?;
      let _ = writeln!(out, "ENV {}={}", key, quote(value));
    }

    let _ = writeln!(out, "COPY {src} ./{src}", src = template.source_file);
    let _ = writeln!(out, "RUN {}", template.install);

    let command = template
      .command
      .iter()
      .map(|part| format!("\"{}\"", part))
      .collect::<Vec<_>>()
      .join(", ");
    let _ = writeln!(out, "CMD [{}]", command);

    Ok(out)
  }
}

fn check_variable(key: &str, value: &str) -> Result<(), String> {
  let mut chars = key.chars();
  let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
  if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(format!("invalid variable name: {:?}", key));
  }
  if value.contains('\n') || value.contains('\r') {
    return Err(format!("value for {} contains a line break", key));
  }
  Ok(())
}

fn quote(value: &str) -> String {
  format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

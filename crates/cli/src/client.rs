//! HTTP client for the operator API of a running server.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub struct ApiClient {
  base: String,
  http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  code: String,
  message: String,
}

impl ApiClient {
  pub fn new(base: &str) -> Self {
    Self {
      base: base.trim_end_matches('/').to_string(),
      http: reqwest::Client::new(),
    }
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base, path)
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
    let request = self.http.get(self.url(path)).query(query);
    self.send(request).await
  }

  pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<&serde_json::Value>) -> Result<T> {
    let mut request = self.http.post(self.url(path));
    if let Some(body) = body {
      request = request
        .header(reqwest::header::CONTENT_TYPE, "application/cloudevents+json")
        .json(body);
    }
    self.send(request).await
  }

  async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
    let response = request
      .send()
      .await
      .with_context(|| format!("Failed to reach lamina server at {}", self.base))?;

    let status = response.status();
    let bytes = response.bytes().await.context("Failed to read response body")?;
    if !status.is_success() {
      match serde_json::from_slice::<ErrorBody>(&bytes) {
        Ok(err) => bail!("{} ({}): {}", err.code, status.as_u16(), err.message),
        Err(_) => bail!("server returned {}", status),
      }
    }
    serde_json::from_slice(&bytes).context("Failed to decode server response")
  }
}

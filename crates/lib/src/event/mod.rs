//! Inbound CloudEvents and their payloads.
//!
//! An [`Event`] is immutable once received. [`Event::kind`] validates the
//! payload for the event type and yields a typed [`EventKind`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::{BuildRequest, Runtime};
use crate::consts::{EVENT_TYPE_BUILD_CANCEL, EVENT_TYPE_BUILD_START, EVENT_TYPE_SERVICE_DELETE, MAX_ID_LEN};
use crate::provision::{DescriptorError, ResourceName};

#[derive(Debug, Error)]
pub enum EventError {
  #[error("event id is required")]
  MissingId,

  #[error("{0} is required")]
  MissingField(&'static str),

  #[error("{field} must be {max} characters or less")]
  FieldTooLong { field: &'static str, max: usize },

  #[error("{field} contains invalid characters (allowed: A-Z a-z 0-9 . _ -)")]
  InvalidCharacters { field: &'static str },

  #[error("unsupported event type: {0}")]
  UnknownType(String),

  #[error("malformed event data: {0}")]
  MalformedData(#[from] serde_json::Error),

  #[error("invalid service name: {0}")]
  InvalidServiceName(#[from] DescriptorError),
}

fn default_spec_version() -> String {
  "1.0".to_string()
}

/// A CloudEvent in structured JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  #[serde(default = "default_spec_version")]
  pub specversion: String,
  pub id: String,
  #[serde(rename = "type")]
  pub event_type: String,
  pub source: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subject: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub data: serde_json::Value,
}

impl Event {
  pub fn new(id: &str, event_type: &str, source: &str, data: serde_json::Value) -> Self {
    Self {
      specversion: default_spec_version(),
      id: id.to_string(),
      event_type: event_type.to_string(),
      source: source.to_string(),
      subject: None,
      time: None,
      data,
    }
  }

  /// Validate the payload and classify the event.
  pub fn kind(&self) -> Result<EventKind, EventError> {
    if self.id.trim().is_empty() {
      return Err(EventError::MissingId);
    }

    match self.event_type.as_str() {
      EVENT_TYPE_BUILD_START => {
        let data: BuildStartData = serde_json::from_value(self.data.clone())?;
        data.validate()?;
        Ok(EventKind::BuildStart(data))
      }
      EVENT_TYPE_BUILD_CANCEL => {
        let data: TargetData = serde_json::from_value(self.data.clone())?;
        data.validate()?;
        Ok(EventKind::BuildCancel(data))
      }
      EVENT_TYPE_SERVICE_DELETE => {
        let data: TargetData = serde_json::from_value(self.data.clone())?;
        data.validate()?;
        Ok(EventKind::ServiceDelete(data))
      }
      other => Err(EventError::UnknownType(other.to_string())),
    }
  }
}

/// A validated event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
  BuildStart(BuildStartData),
  BuildCancel(TargetData),
  ServiceDelete(TargetData),
}

/// Payload of a build-start event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStartData {
  #[serde(default)]
  pub third_party_id: String,
  #[serde(default)]
  pub parser_id: String,
  #[serde(default)]
  pub runtime: Runtime,
  #[serde(default)]
  pub environment: BTreeMap<String, String>,
  #[serde(default)]
  pub build_args: BTreeMap<String, String>,
}

impl BuildStartData {
  pub fn validate(&self) -> Result<(), EventError> {
    validate_id("third_party_id", &self.third_party_id)?;
    validate_id("parser_id", &self.parser_id)
  }

  pub fn into_request(self) -> BuildRequest {
    BuildRequest {
      third_party_id: self.third_party_id,
      parser_id: self.parser_id,
      runtime: self.runtime,
      environment: self.environment,
      build_args: self.build_args,
      content_hash: None,
    }
  }
}

/// Payload naming an existing parser deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetData {
  #[serde(default)]
  pub third_party_id: String,
  #[serde(default)]
  pub parser_id: String,
  /// Explicit resource name; derived from the ids when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

impl TargetData {
  pub fn validate(&self) -> Result<(), EventError> {
    validate_id("third_party_id", &self.third_party_id)?;
    validate_id("parser_id", &self.parser_id)?;
    if let Some(name) = &self.service_name {
      ResourceName::parse(name)?;
    }
    Ok(())
  }

  pub fn resource_name(&self) -> Result<ResourceName, EventError> {
    match &self.service_name {
      Some(name) => Ok(ResourceName::parse(name)?),
      None => Ok(ResourceName::derive(&self.third_party_id, &self.parser_id)),
    }
  }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), EventError> {
  if value.is_empty() {
    return Err(EventError::MissingField(field));
  }
  if value.len() > MAX_ID_LEN {
    return Err(EventError::FieldTooLong { field, max: MAX_ID_LEN });
  }
  if !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
    return Err(EventError::InvalidCharacters { field });
  }
  Ok(())
}

//! Resource names and typed descriptors for the runtime platform.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
  APP_LABEL, EVENT_SOURCE_PREFIX, EVENT_TYPE_PARSER_START, LABEL_PREFIX, RESOURCE_NAME_MAX_LEN, RESOURCE_NAME_PREFIX,
};
use crate::dispatch::BuildJob;
use crate::util::hash::hash_bytes;

/// Length of the hash suffix appended to truncated names.
const NAME_SUFFIX_LEN: usize = 8;

/// Longest label value the platform accepts.
const LABEL_VALUE_MAX_LEN: usize = 63;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
  #[error("invalid resource name {name:?}: {reason}")]
  InvalidName { name: String, reason: &'static str },

  #[error("{kind} {name}: {field} is required")]
  MissingField {
    kind: ResourceKind,
    name: String,
    field: &'static str,
  },

  #[error("invalid label {key}={value:?}")]
  InvalidLabel { key: String, value: String },
}

/// Deterministic name shared by every resource of one parser deployment.
///
/// Always a valid DNS-1035 label: lowercase alphanumerics and `-`, starting
/// with a letter, at most 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
  /// `lambda-{third_party_id}-{parser_id}`, sanitized.
  ///
  /// Names longer than the limit are cut and given a hash suffix so that
  /// distinct long ids stay distinct.
  pub fn derive(third_party_id: &str, parser_id: &str) -> Self {
    let raw = format!("{}-{}-{}", RESOURCE_NAME_PREFIX, third_party_id, parser_id).to_ascii_lowercase();
    let sanitized: String = raw
      .chars()
      .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
      .collect();

    let name = if sanitized.len() > RESOURCE_NAME_MAX_LEN {
      let hash = hash_bytes(raw.as_bytes());
      let suffix = &hash.as_str()[..NAME_SUFFIX_LEN];
      let head = sanitized[..RESOURCE_NAME_MAX_LEN - NAME_SUFFIX_LEN - 1].trim_end_matches('-');
      format!("{}-{}", head, suffix)
    } else {
      sanitized.trim_end_matches('-').to_string()
    };
    ResourceName(name)
  }

  /// Validate an externally supplied name.
  pub fn parse(name: &str) -> Result<Self, DescriptorError> {
    let invalid = |reason| DescriptorError::InvalidName {
      name: name.to_string(),
      reason,
    };

    if name.is_empty() {
      return Err(invalid("must not be empty"));
    }
    if name.len() > RESOURCE_NAME_MAX_LEN {
      return Err(invalid("must be 63 characters or less"));
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
      return Err(invalid("may only contain lowercase letters, digits and '-'"));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
      return Err(invalid("must start with a letter"));
    }
    if name.ends_with('-') {
      return Err(invalid("must not end with '-'"));
    }
    Ok(ResourceName(name.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Name of the config object belonging to this deployment.
  pub fn config_name(&self) -> String {
    format!("{}-config", self.0)
  }

  /// Platform object name for a resource of `kind`.
  pub fn object_name(&self, kind: ResourceKind) -> String {
    match kind {
      ResourceKind::Config => self.config_name(),
      _ => self.0.clone(),
    }
  }
}

impl std::fmt::Display for ResourceName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl TryFrom<String> for ResourceName {
  type Error = DescriptorError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    ResourceName::parse(&value)
  }
}

impl From<ResourceName> for String {
  fn from(name: ResourceName) -> Self {
    name.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Identity,
  Config,
  Service,
  Route,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 4] = [
    ResourceKind::Identity,
    ResourceKind::Config,
    ResourceKind::Service,
    ResourceKind::Route,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      ResourceKind::Identity => "identity",
      ResourceKind::Config => "config",
      ResourceKind::Service => "service",
      ResourceKind::Route => "route",
    }
  }
}

impl std::fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

pub type Labels = BTreeMap<String, String>;

/// Service account the service runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDescriptor {
  pub name: ResourceName,
  pub labels: Labels,
}

/// Runtime configuration mounted into the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
  pub name: String,
  pub labels: Labels,
  pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
  pub name: ResourceName,
  pub image: String,
  pub identity: ResourceName,
  pub config: String,
  pub labels: Labels,
}

/// Attributes an event must carry to be delivered to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFilter {
  pub source: String,
  pub subject: String,
  #[serde(rename = "type")]
  pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
  pub retry: u32,
  pub backoff_policy: String,
  /// ISO-8601 duration of the first backoff step.
  pub backoff_delay: String,
}

impl Default for DeliveryPolicy {
  fn default() -> Self {
    Self {
      retry: 5,
      backoff_policy: "exponential".to_string(),
      backoff_delay: "PT1S".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
  pub name: ResourceName,
  pub filter: RouteFilter,
  /// Service receiving matching events.
  pub subscriber: ResourceName,
  pub delivery: DeliveryPolicy,
  pub labels: Labels,
}

/// Any resource the platform manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Descriptor {
  Identity(IdentityDescriptor),
  Config(ConfigDescriptor),
  Service(ServiceDescriptor),
  Route(RouteDescriptor),
}

impl Descriptor {
  pub fn kind(&self) -> ResourceKind {
    match self {
      Descriptor::Identity(_) => ResourceKind::Identity,
      Descriptor::Config(_) => ResourceKind::Config,
      Descriptor::Service(_) => ResourceKind::Service,
      Descriptor::Route(_) => ResourceKind::Route,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      Descriptor::Identity(d) => d.name.as_str(),
      Descriptor::Config(d) => &d.name,
      Descriptor::Service(d) => d.name.as_str(),
      Descriptor::Route(d) => d.name.as_str(),
    }
  }

  pub fn labels(&self) -> &Labels {
    match self {
      Descriptor::Identity(d) => &d.labels,
      Descriptor::Config(d) => &d.labels,
      Descriptor::Service(d) => &d.labels,
      Descriptor::Route(d) => &d.labels,
    }
  }

  /// Check required fields and labels before anything is sent to the platform.
  pub fn validate(&self) -> Result<(), DescriptorError> {
    let missing = |field| DescriptorError::MissingField {
      kind: self.kind(),
      name: self.name().to_string(),
      field,
    };

    match self {
      Descriptor::Identity(_) => {}
      Descriptor::Config(d) => {
        if d.name.is_empty() {
          return Err(missing("name"));
        }
      }
      Descriptor::Service(d) => {
        if d.image.is_empty() {
          return Err(missing("image"));
        }
        if d.config.is_empty() {
          return Err(missing("config"));
        }
      }
      Descriptor::Route(d) => {
        if d.filter.source.is_empty() {
          return Err(missing("filter.source"));
        }
        if d.filter.subject.is_empty() {
          return Err(missing("filter.subject"));
        }
        if d.filter.event_type.is_empty() {
          return Err(missing("filter.type"));
        }
      }
    }

    for (key, value) in self.labels() {
      let valid_value = value.len() <= LABEL_VALUE_MAX_LEN
        && value
          .chars()
          .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
      if key.is_empty() || !valid_value {
        return Err(DescriptorError::InvalidLabel {
          key: key.clone(),
          value: value.clone(),
        });
      }
    }
    Ok(())
  }
}

/// The four resources making one build reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
  pub identity: Descriptor,
  pub config: Descriptor,
  pub service: Descriptor,
  pub route: Descriptor,
}

/// Fit an id into a label value, cutting long ones and adding a hash
/// suffix the way [`ResourceName::derive`] does.
fn label_value(id: &str) -> String {
  if id.len() <= LABEL_VALUE_MAX_LEN {
    return id.to_string();
  }
  let hash = hash_bytes(id.as_bytes());
  let head: String = id.chars().take(LABEL_VALUE_MAX_LEN - NAME_SUFFIX_LEN - 1).collect();
  let head = head.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
  format!("{}-{}", head, &hash.as_str()[..NAME_SUFFIX_LEN])
}

impl ResourceSet {
  /// Descriptors for serving `image` as the deployment of `job`.
  pub fn for_job(job: &BuildJob, image: &str) -> Self {
    let name = &job.resource_name;
    let labels = Labels::from([
      ("app".to_string(), APP_LABEL.to_string()),
      (format!("{}/third-party-id", LABEL_PREFIX), label_value(&job.third_party_id)),
      (format!("{}/parser-id", LABEL_PREFIX), label_value(&job.parser_id)),
      (
        format!("{}/content-hash", LABEL_PREFIX),
        job.content_hash.image_tag().to_string(),
      ),
    ]);

    let identity = IdentityDescriptor {
      name: name.clone(),
      labels: labels.clone(),
    };
    let config = ConfigDescriptor {
      name: name.config_name(),
      labels: labels.clone(),
      data: BTreeMap::from([
        ("THIRD_PARTY_ID".to_string(), job.third_party_id.clone()),
        ("PARSER_ID".to_string(), job.parser_id.clone()),
        ("IMAGE_URI".to_string(), image.to_string()),
      ]),
    };
    let service = ServiceDescriptor {
      name: name.clone(),
      image: image.to_string(),
      identity: name.clone(),
      config: name.config_name(),
      labels: labels.clone(),
    };
    let route = RouteDescriptor {
      name: name.clone(),
      filter: RouteFilter {
        source: format!("{}.{}", EVENT_SOURCE_PREFIX, job.third_party_id),
        subject: job.parser_id.clone(),
        event_type: EVENT_TYPE_PARSER_START.to_string(),
      },
      subscriber: name.clone(),
      delivery: DeliveryPolicy::default(),
      labels,
    };

    Self {
      identity: Descriptor::Identity(identity),
      config: Descriptor::Config(config),
      service: Descriptor::Service(service),
      route: Descriptor::Route(route),
    }
  }

  pub fn validate(&self) -> Result<(), DescriptorError> {
    self.identity.validate()?;
    self.config.validate()?;
    self.service.validate()?;
    self.route.validate()
  }
}

//! Constants shared across the crate.

/// Application name, used as the label value on every provisioned resource.
pub const APP_LABEL: &str = "lamina-service";

/// Prefix for all `lamina.dev/*` resource labels.
pub const LABEL_PREFIX: &str = "lamina.dev";

/// Prefix for derived resource names.
pub const RESOURCE_NAME_PREFIX: &str = "lambda";

/// Maximum length of a derived resource name (DNS-1035 label).
pub const RESOURCE_NAME_MAX_LEN: usize = 63;

/// Length of the content hash prefix used as an image tag.
pub const IMAGE_TAG_LEN: usize = 12;

/// Maximum length of `third_party_id` and `parser_id`.
pub const MAX_ID_LEN: usize = 100;

/// Timestamp written into every archive entry (1980-01-01T00:00:00Z).
pub const ARCHIVE_MTIME: u64 = 315_532_800;

/// File name of the generated recipe inside a build context.
pub const RECIPE_FILE_NAME: &str = "Dockerfile";

/// File name of the published archive under its staging prefix.
pub const CONTEXT_ARCHIVE_NAME: &str = "context.tar.gz";

/// Event types understood by ingress.
pub const EVENT_TYPE_BUILD_START: &str = "network.notifi.lambda.build.start";
pub const EVENT_TYPE_BUILD_CANCEL: &str = "network.notifi.lambda.build.cancel";
pub const EVENT_TYPE_SERVICE_DELETE: &str = "network.notifi.lambda.service.delete";

/// Event type a provisioned route subscribes its service to.
pub const EVENT_TYPE_PARSER_START: &str = "network.notifi.lambda.parser.start";

/// Prefix of the event source a route filters on (`{prefix}.{third_party_id}`).
pub const EVENT_SOURCE_PREFIX: &str = "network.notifi";

mod builds;
mod config;
mod hash;
mod send;
mod serve;
mod stats;

pub use builds::{ListArgs, cmd_builds_cancel, cmd_builds_get, cmd_builds_list};
pub use config::cmd_config;
pub use hash::cmd_hash;
pub use send::cmd_send;
pub use serve::cmd_serve;
pub use stats::cmd_stats;

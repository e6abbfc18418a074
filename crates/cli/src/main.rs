mod client;
mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::OutputFormat;

/// lamina - build and deploy parser functions from events
#[derive(Parser)]
#[command(name = "lamina")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  /// Base URL of a running lamina server
  #[arg(long, global = true, env = "LAMINA_SERVER", default_value = "http://127.0.0.1:8080")]
  server: String,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the engine and HTTP server until interrupted
  Serve,

  /// Compute the content hash of a parser source without building it
  Hash {
    /// Path to the parser source
    file: PathBuf,

    /// Third-party tenant the parser belongs to
    #[arg(long)]
    tenant: String,

    /// Parser identifier
    #[arg(long)]
    parser: String,

    /// Language runtime (nodejs, python, go)
    #[arg(long, default_value = "nodejs")]
    runtime: String,
  },

  /// Print the effective configuration
  Config,

  /// Inspect and cancel builds on a running server
  Builds {
    #[command(subcommand)]
    command: BuildsCommand,
  },

  /// Show worker pool statistics of a running server
  Stats,

  /// Post a CloudEvent read from a JSON file to a running server
  Send {
    /// Path to the event JSON
    file: PathBuf,
  },
}

#[derive(Subcommand)]
enum BuildsCommand {
  /// List builds, newest first
  List {
    #[arg(long)]
    tenant: Option<String>,

    #[arg(long)]
    parser: Option<String>,

    /// pending, running, succeeded, failed or cancelled
    #[arg(long)]
    status: Option<String>,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long)]
    page_token: Option<String>,
  },

  /// Show one build with its log tail
  Get { id: String },

  /// Cancel a pending or running build
  Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();

  let client = client::ApiClient::new(&cli.server);

  match cli.command {
    Commands::Serve => cmd::cmd_serve().await,
    Commands::Hash {
      file,
      tenant,
      parser,
      runtime,
    } => cmd::cmd_hash(&file, &tenant, &parser, &runtime, cli.output),
    Commands::Config => cmd::cmd_config(cli.output),
    Commands::Builds { command } => match command {
      BuildsCommand::List {
        tenant,
        parser,
        status,
        page_size,
        page_token,
      } => {
        let query = cmd::ListArgs {
          tenant,
          parser,
          status,
          page_size,
          page_token,
        };
        cmd::cmd_builds_list(&client, &query, cli.verbose, cli.output).await
      }
      BuildsCommand::Get { id } => cmd::cmd_builds_get(&client, &id, cli.output).await,
      BuildsCommand::Cancel { id } => cmd::cmd_builds_cancel(&client, &id, cli.output).await,
    },
    Commands::Stats => cmd::cmd_stats(&client, cli.output).await,
    Commands::Send { file } => cmd::cmd_send(&client, &file, cli.output).await,
  }
}

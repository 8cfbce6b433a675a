use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::ratelimit::{Event, PolicyRegistry};
use floodgate::Context;

/// Administrative tool for Floodgate rate limits.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Configuration file (YAML); FLOODGATE__* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Policy definitions file (YAML); defaults to `policies_path` from the config
    #[arg(short, long)]
    policies: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record events for an identifier
    Record {
        scope: String,
        identifier: String,
        #[arg(long, default_value_t = 1)]
        count: u64,
        /// Unix seconds; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Check whether an identifier is allowed
    Status { scope: String, identifier: String },
    /// Show the violated check for an identifier, if any
    Analyze { scope: String, identifier: String },
    /// Clear history and block for an identifier
    Unblock { scope: String, identifier: String },
    /// Clear history and blocks for every identifier in a scope
    UnblockAll { scope: String },
    /// Clear the administrative disable flag of a scope
    Enable { scope: String },
    /// Set the administrative disable flag of a scope
    Disable { scope: String },
    /// List identifiers with recorded history
    Tracked { scope: String },
    /// List identifiers that are currently blocked
    Blocked { scope: String },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = cli.config.as_deref().unwrap_or("<environment>"),
        "Starting Floodgate"
    );

    let registry = match cli.policies.as_ref().or(config.policies_path.as_ref()) {
        Some(path) => PolicyRegistry::from_file(path)?,
        None => PolicyRegistry::new(),
    };

    let context = Context::connect(config, registry).await?;
    let output = run(&context, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn run(context: &Context, command: Command) -> anyhow::Result<serde_json::Value> {
    let output = match command {
        Command::Record {
            scope,
            identifier,
            count,
            timestamp,
        } => {
            let mut event = Event::new().count(count);
            if let Some(timestamp) = timestamp {
                event = event.at(timestamp);
            }
            context.action(&scope, identifier)?.record(event).await?;
            json!({ "recorded": count })
        }
        Command::Status { scope, identifier } => {
            let action = context.action(&scope, identifier)?;
            let allowed = action.is_allowed().await?;
            let block_ttl = action.block_ttl().await?;
            json!({ "allowed": allowed, "block_ttl": block_ttl })
        }
        Command::Analyze { scope, identifier } => {
            let violated = context.action(&scope, identifier)?.analyze().await?;
            json!({ "violated": violated })
        }
        Command::Unblock { scope, identifier } => {
            context.action(&scope, identifier)?.unblock().await?;
            json!({ "unblocked": true })
        }
        Command::UnblockAll { scope } => {
            context.policy(&scope)?.unblock_all().await?;
            json!({ "unblocked": true })
        }
        Command::Enable { scope } => {
            let policy = context.policy(&scope)?;
            policy.enable().await?;
            json!({ "enabled": policy.is_enabled().await? })
        }
        Command::Disable { scope } => {
            let policy = context.policy(&scope)?;
            policy.disable().await?;
            json!({ "enabled": policy.is_enabled().await? })
        }
        Command::Tracked { scope } => {
            json!({ "identifiers": context.policy(&scope)?.tracked_identifiers().await? })
        }
        Command::Blocked { scope } => {
            json!({ "identifiers": context.policy(&scope)?.rate_limited_identifiers().await? })
        }
    };
    Ok(output)
}

//! Gift commons command line tool.
//!
//! A thin wrapper around the gift-commons library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Opens the commons (creating it if absent)
//! 4. Runs one subcommand, printing results as JSON lines
//!
//! For library usage, see the gift-commons crate documentation.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gift_commons::{
    Commons, CommonsConfig, CompactionOutcome, DiscoveryQuery, GiftContent, GiftOptions,
};
use serde_json::json;

/// Leave and discover gifts in a shared commons file.
#[derive(Debug, Parser)]
#[command(name = "gift-commons", version)]
struct Cli {
    /// Path to the commons file
    #[arg(
        long,
        env = "GIFT_COMMONS_PATH",
        default_value = "./.commons/gifts.commons"
    )]
    path: PathBuf,

    /// JSON configuration file (geometry, TTL, blessing)
    #[arg(long, env = "GIFT_COMMONS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Leave a gift
    Leave {
        /// Who is leaving the gift
        giver: String,
        /// Content as JSON; anything that is not JSON is stored as text
        content: String,
        /// Gift type (insight, pattern, blessing, question, response, ...)
        #[arg(long = "type", default_value = "insight")]
        gift_type: String,
        /// Addressed recipient, repeatable; omit to broadcast
        #[arg(long = "to")]
        recipients: Vec<String>,
        /// Allow compaction to remove the gift once its TTL passes
        #[arg(long)]
        ephemeral: bool,
    },
    /// List gifts visible to a seeker, newest first
    Discover {
        /// Who is looking
        seeker: String,
        /// Only gifts of this type
        #[arg(long = "type")]
        gift_type: Option<String>,
        /// Only gifts newer than this epoch timestamp
        #[arg(long)]
        since: Option<f64>,
        /// Maximum number of gifts
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Reply to a gift
    Respond {
        /// Who is responding
        responder: String,
        /// Id of the gift being answered
        gift_id: String,
        /// Response content as JSON or text
        content: String,
    },
    /// Reclaim slots held by expired ephemeral gifts
    Compact,
    /// Show occupancy and header information
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CommonsConfig::from_file(path)?,
        None => CommonsConfig::default(),
    };

    let commons = Commons::open_with_config(&cli.path, config)
        .with_context(|| format!("failed to open commons at {}", cli.path.display()))?;

    let result = run(&commons, cli.command);
    commons.close();
    result
}

fn run(commons: &Commons, command: Command) -> Result<()> {
    let mut out = std::io::stdout().lock();

    match command {
        Command::Leave {
            giver,
            content,
            gift_type,
            recipients,
            ephemeral,
        } => {
            let options = GiftOptions::default()
                .with_type(gift_type)
                .with_recipients(recipients)
                .ephemeral(ephemeral);
            let id = commons.leave_gift(&giver, parse_content(&content), options)?;
            writeln!(out, "{}", json!({ "id": id }))?;
        }
        Command::Discover {
            seeker,
            gift_type,
            since,
            limit,
        } => {
            let mut query = DiscoveryQuery::default().limit(limit);
            if let Some(gift_type) = gift_type {
                query = query.of_type(gift_type);
            }
            if let Some(since) = since {
                query = query.since(since);
            }
            for gift in commons.discover_gifts(&seeker, &query)? {
                writeln!(out, "{}", serde_json::to_string(&gift)?)?;
            }
        }
        Command::Respond {
            responder,
            gift_id,
            content,
        } => {
            let id = commons.leave_response(&responder, &gift_id, parse_content(&content))?;
            writeln!(out, "{}", json!({ "id": id }))?;
        }
        Command::Compact => {
            let line = match commons.compact()? {
                CompactionOutcome::Skipped => json!({ "outcome": "skipped" }),
                CompactionOutcome::Completed { kept, removed } => {
                    json!({ "outcome": "completed", "kept": kept, "removed": removed })
                }
            };
            writeln!(out, "{line}")?;
        }
        Command::Info => {
            writeln!(out, "{}", serde_json::to_string(&commons.stats()?)?)?;
        }
    }

    Ok(())
}

/// JSON if it parses, otherwise the raw text.
fn parse_content(raw: &str) -> GiftContent {
    serde_json::from_str(raw).unwrap_or_else(|_| GiftContent::from(raw))
}

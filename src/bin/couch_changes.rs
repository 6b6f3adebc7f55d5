//! # couch-changes
//!
//! Follows a database's `_changes` feed and prints each change as one JSON
//! line on stdout. Exits when a one-shot feed is complete or when the tracker
//! gives up.

use anyhow::{bail, Context};
use clap::Parser;
use couch_rs::{
    ChangeEvent, ChangeTracker, ChannelClient, ClientConfig, CouchClient, Credential, FeedMode,
    LogLevel, TrackerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "couch-changes")]
#[command(about = "Print the change feed of a CouchDB database")]
struct Cli {
    /// Database URL, e.g. http://localhost:5984/recipes
    url: String,
    /// Feed mode: normal, longpoll or continuous
    #[arg(short, long, default_value = "continuous")]
    mode: FeedMode,
    /// Sequence number to start after
    #[arg(short, long, default_value_t = 0)]
    since: u64,
    /// Filter function, e.g. app/important
    #[arg(short, long)]
    filter: Option<String>,
    /// Filter parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param")]
    params: Vec<String>,
    /// Include full documents
    #[arg(long)]
    include_docs: bool,
    #[arg(short, long)]
    user: Option<String>,
    #[arg(long, env = "COUCH_PASSWORD")]
    password: Option<String>,
    /// Heartbeat interval in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    /// Consecutive failures before giving up
    #[arg(long, default_value_t = 6)]
    max_retries: u32,
    /// Log request URLs (-v) and headers (-vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_param(param: &str) -> anyhow::Result<(String, String)> {
    match param.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("filter parameter {:?} is not key=value", param),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LogLevel::Nothing,
        1 => LogLevel::RequestUrls,
        _ => LogLevel::RequestHeaders,
    };
    let client = CouchClient::with_config(ClientConfig {
        log_level,
        ..Default::default()
    });
    let db = client
        .resource(&cli.url)
        .with_context(|| format!("invalid database URL {}", cli.url))?;

    if let Some(user) = &cli.user {
        let password = cli.password.clone().unwrap_or_default();
        db.set_credential(Some(Credential::basic(user.clone(), password)));
    }

    let mut config = TrackerConfig::new(cli.mode)
        .with_since(cli.since)
        .with_include_docs(cli.include_docs)
        .with_max_retries(cli.max_retries)
        .with_heartbeat(match cli.heartbeat_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        });
    if let Some(filter) = cli.filter {
        config = config.with_filter(filter);
    }
    for param in &cli.params {
        let (key, value) = parse_param(param)?;
        config = config.with_filter_param(key, value);
    }

    let (changes, events) = ChannelClient::new();
    let tracker = ChangeTracker::new(db, Arc::new(changes), config);
    if !tracker.start() {
        bail!("cannot track changes of {}", cli.url);
    }

    while let Ok(event) = events.recv().await {
        match event {
            ChangeEvent::Change(change) => println!("{}", serde_json::to_string(&change)?),
            ChangeEvent::Stopped(None) => break,
            ChangeEvent::Stopped(Some(error)) => {
                bail!("change feed stopped at {}: {}", tracker.last_sequence_number(), error)
            }
        }
    }

    tracing::info!("Last sequence: {}", tracker.last_sequence_number());
    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::parse_duration;

/// Every setting is optional here so a config file can fill the gaps;
/// defaults are applied after merging.
#[derive(Parser, Debug, Default)]
#[command(
    name = "fluxrecv",
    version,
    about = "Relay Cloud Source Repositories push notifications to the Flux API"
)]
pub struct Cli {
    /// Google Cloud project (defaults to the environment or metadata server)
    #[arg(long, alias = "projectId")]
    pub project_id: Option<String>,

    /// Pub/Sub subscription to consume
    #[arg(long, alias = "subId")]
    pub sub_id: Option<String>,

    /// Topic to create the subscription on if it does not exist yet
    #[arg(long, alias = "topicId")]
    pub topic_id: Option<String>,

    /// Deadline for each Flux call, also the subscription ack deadline (e.g. 30s, 500ms, 2m)
    #[arg(long, alias = "syncTimeout", value_parser = parse_duration)]
    pub sync_timeout: Option<Duration>,

    /// Flux API base URL
    #[arg(long)]
    pub flux_url: Option<String>,

    /// Bearer token for the Flux API (falls back to FLUX_TOKEN)
    #[arg(long)]
    pub flux_token: Option<String>,

    /// Cap on messages pulled but not yet acked or nacked
    #[arg(long)]
    pub max_outstanding: Option<usize>,

    /// Only pull as many messages as there are free outstanding slots
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub synchronous: Option<bool>,

    /// Messages that may wait between receiving and dispatching (0 = hand over directly)
    #[arg(long)]
    pub handoff_capacity: Option<usize>,

    /// Pub/Sub REST endpoint override
    #[arg(long)]
    pub pubsub_endpoint: Option<String>,

    /// TOML config file with the same keys
    #[arg(long)]
    pub config: Option<PathBuf>,
}

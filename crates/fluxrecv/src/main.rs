use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fluxrecv_flux::{FluxApiClient, Forwarder};
use fluxrecv_pubsub::auth::{MetadataServer, TokenSource};
use fluxrecv_pubsub::{ReceiveSettings, SubscriptionManager};
use fluxrecv_relay::Relay;

mod cli;
mod config;
mod credentials;
mod signals;

use cli::Cli;
use config::{Settings, FLUX_TOKEN_ENV};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fluxrecv=info")),
        )
        .init();

    let cli = Cli::parse();
    run(cli).await.inspect_err(|e| error!(error = %format!("{e:#}"), "fluxrecv failed"))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = config::load(&cli)?;
    let settings = Settings::resolve(cli, file, std::env::var(FLUX_TOKEN_ENV).ok())?;

    let env = |var: &str| std::env::var(var).ok();
    let gcloud_dir = credentials::gcloud_config_dir(env);
    let adc = credentials::application_default_credentials(env, gcloud_dir.as_deref())?;
    let metadata = Arc::new(MetadataServer::default());
    let project = credentials::resolve_project_id(
        settings.project_id.clone(),
        env,
        adc.as_ref(),
        &metadata,
    )
    .await?;

    let tokens: Arc<dyn TokenSource> = match adc {
        Some(file) => file.into_token_source()?,
        None => metadata,
    };
    let transport = Arc::new(credentials::pubsub_client(
        settings.pubsub_endpoint.as_deref(),
        credentials::emulator_host(),
        tokens,
    ));
    info!(%project, endpoint = transport.base_url(), "Connecting to Pub/Sub");

    let manager = SubscriptionManager::new(transport, &project).with_settings(ReceiveSettings {
        synchronous: settings.synchronous,
        max_outstanding_messages: settings.max_outstanding,
        ..Default::default()
    });
    let subscription = manager
        .prepare(
            settings.topic_id.as_deref(),
            &settings.sub_id,
            settings.sync_timeout,
        )
        .await
        .with_context(|| format!("failed to prepare subscription {}", settings.sub_id))?;

    let flux = Arc::new(FluxApiClient::new(
        settings.flux_url.clone(),
        settings.flux_token.clone(),
    ));
    info!(flux_url = %settings.flux_url, sync_timeout_ms = settings.sync_timeout.as_millis() as u64, "Forwarding to Flux");
    let forwarder = Forwarder::new(flux, settings.sync_timeout);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signals::wait_for_shutdown_signal().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to install signal handlers"),
            }
            cancel.cancel();
        }
    });

    let stats = Relay::new(subscription, forwarder)
        .with_handoff_capacity(settings.handoff_capacity)
        .run(cancel)
        .await?;
    info!(
        acked = stats.acked,
        rejected = stats.rejected,
        drained = stats.drained,
        "Shut down cleanly"
    );
    Ok(())
}

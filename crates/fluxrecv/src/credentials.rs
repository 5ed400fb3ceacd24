use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use fluxrecv_pubsub::adc::{CredentialsFile, CREDENTIALS_ENV};
use fluxrecv_pubsub::auth::{MetadataServer, TokenSource};
use fluxrecv_pubsub::http_client::{HttpPubsubClient, DEFAULT_ENDPOINT, EMULATOR_HOST_ENV};

const PROJECT_ENV_VARS: [&str; 2] = ["GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"];
const GCLOUD_CONFIG_ENV: &str = "CLOUDSDK_CONFIG";
const ADC_FILE_NAME: &str = "application_default_credentials.json";

/// `$CLOUDSDK_CONFIG`, else gcloud's per-user configuration directory.
pub fn gcloud_config_dir(env: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(dir) = env(GCLOUD_CONFIG_ENV).filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    if cfg!(windows) {
        dirs::config_dir().map(|dir| dir.join("gcloud"))
    } else {
        dirs::home_dir().map(|home| home.join(".config").join("gcloud"))
    }
}

/// The file named by `GOOGLE_APPLICATION_CREDENTIALS`, else the one
/// `gcloud auth application-default login` leaves in `gcloud_dir`. A file
/// named by the variable must be usable; the gcloud one is optional.
/// `None` leaves authentication to the metadata server.
pub fn application_default_credentials(
    env: impl Fn(&str) -> Option<String>,
    gcloud_dir: Option<&Path>,
) -> anyhow::Result<Option<CredentialsFile>> {
    if let Some(path) = env(CREDENTIALS_ENV).filter(|p| !p.is_empty()) {
        let file = CredentialsFile::load(Path::new(&path))
            .with_context(|| format!("{CREDENTIALS_ENV} points at unusable credentials"))?;
        info!(%path, kind = file.kind(), "Using credentials file");
        return Ok(Some(file));
    }

    let Some(path) = gcloud_dir
        .map(|dir| dir.join(ADC_FILE_NAME))
        .filter(|path| path.is_file())
    else {
        return Ok(None);
    };
    let file = CredentialsFile::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(path = %path.display(), kind = file.kind(), "Using gcloud application default credentials");
    Ok(Some(file))
}

/// Configured value, then the usual environment variables, then the
/// credentials file, then the metadata server.
pub async fn resolve_project_id(
    configured: Option<String>,
    env: impl Fn(&str) -> Option<String>,
    credentials_file: Option<&CredentialsFile>,
    metadata: &MetadataServer,
) -> anyhow::Result<String> {
    if let Some(project) = configured {
        return Ok(project);
    }
    for var in PROJECT_ENV_VARS {
        if let Some(project) = env(var).filter(|p| !p.is_empty()) {
            info!(source = var, %project, "Using project id from environment");
            return Ok(project);
        }
    }
    if let Some(project) = credentials_file.and_then(CredentialsFile::project_id) {
        info!(%project, "Using project id from credentials file");
        return Ok(project.to_string());
    }
    let project = metadata
        .project_id()
        .await
        .context("no project id configured and the metadata server could not provide one")?;
    info!(%project, "Using project id from metadata server");
    Ok(project)
}

/// The emulator wins over an explicit endpoint, which wins over the
/// production endpoint. Only the latter two send `tokens`.
pub fn pubsub_client(
    endpoint: Option<&str>,
    emulator_host: Option<String>,
    tokens: Arc<dyn TokenSource>,
) -> HttpPubsubClient {
    if let Some(host) = emulator_host.filter(|h| !h.is_empty()) {
        info!(%host, "Using Pub/Sub emulator");
        return HttpPubsubClient::emulator(&host);
    }
    HttpPubsubClient::new(endpoint.unwrap_or(DEFAULT_ENDPOINT), tokens)
}

pub fn emulator_host() -> Option<String> {
    std::env::var(EMULATOR_HOST_ENV).ok()
}

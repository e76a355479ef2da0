use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::WarehouseError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// gcloud tokens live for an hour; refresh well before that.
const CLI_TOKEN_LIFETIME: Duration = Duration::from_secs(45 * 60);
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Where bearer tokens for the warehouse API come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// A token supplied up front. Never refreshed.
    Static(String),
    /// The managed identity of the VM or notebook runtime, via the metadata server
    MetadataServer,
    /// `gcloud auth print-access-token`
    GcloudCli,
}

impl Credentials {
    /// Picks a credential source. A static token wins, then managed auth, then the gcloud CLI
    /// if it is installed.
    pub fn detect(access_token: Option<&str>, use_managed_auth: bool) -> Result<Self, WarehouseError> {
        if let Some(token) = access_token.filter(|t| !t.is_empty()) {
            return Ok(Credentials::Static(token.to_string()));
        }
        if use_managed_auth {
            return Ok(Credentials::MetadataServer);
        }
        if which::which("gcloud").is_ok() {
            return Ok(Credentials::GcloudCli);
        }
        Err(WarehouseError::Credentials(
            "no access token configured, managed auth is off and gcloud is not installed"
                .to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .is_none_or(|at| Instant::now() + EXPIRY_MARGIN < at)
    }
}

/// Hands out bearer tokens, fetching a new one only when the cached one is about to expire.
#[derive(Debug)]
pub(crate) struct TokenProvider {
    credentials: Credentials,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub(crate) fn new(credentials: Credentials, http: reqwest::Client) -> Self {
        Self {
            credentials,
            http,
            cached: RwLock::new(None),
        }
    }

    pub(crate) async fn token(&self) -> Result<String, WarehouseError> {
        if let Credentials::Static(token) = &self.credentials {
            return Ok(token.clone());
        }

        if let Some(cached) = self.cached.read().await.as_ref()
            && cached.is_fresh()
        {
            return Ok(cached.value.clone());
        }

        let mut slot = self.cached.write().await;
        // another caller may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref()
            && cached.is_fresh()
        {
            return Ok(cached.value.clone());
        }

        let fresh = match &self.credentials {
            Credentials::Static(token) => CachedToken {
                value: token.clone(),
                expires_at: None,
            },
            Credentials::MetadataServer => self.fetch_metadata_token().await?,
            Credentials::GcloudCli => fetch_cli_token().await?,
        };
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(value)
    }

    async fn fetch_metadata_token(&self) -> Result<CachedToken, WarehouseError> {
        debug!("Requesting access token from the metadata server");
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| WarehouseError::Credentials(format!("metadata server unreachable: {e}")))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(WarehouseError::Credentials(format!(
                "metadata server answered {status}: {body}"
            )));
        }

        let token: MetadataToken = serde_json::from_str(&body)?;
        info!("Obtained managed access token, valid for {}s", token.expires_in);
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Some(Instant::now() + Duration::from_secs(token.expires_in)),
        })
    }
}

async fn fetch_cli_token() -> Result<CachedToken, WarehouseError> {
    debug!("Requesting access token from gcloud");
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| WarehouseError::Credentials(format!("failed to run gcloud: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WarehouseError::Credentials(format!(
            "gcloud auth print-access-token failed: {}",
            stderr.trim()
        )));
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Err(WarehouseError::Credentials(
            "gcloud returned an empty access token".to_string(),
        ));
    }
    Ok(CachedToken {
        value,
        expires_at: Some(Instant::now() + CLI_TOKEN_LIFETIME),
    })
}

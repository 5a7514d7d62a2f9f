//! Bearer tokens for the BigQuery REST API.

use async_trait::async_trait;
use object_store::CredentialProvider;
use object_store::gcp::{GcpCredentialProvider, GoogleCloudStorageBuilder};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{BigQueryAuth, BigQueryConfig};
use crate::error::{ConfigError, WarehouseError};

/// The storage builder insists on a bucket; only its credential chain is used.
const CREDENTIALS_ONLY_BUCKET: &str = "flurry-credentials";

/// Supplies the bearer token sent with each warehouse request.
#[async_trait]
pub trait TokenSource: Send + Sync + std::fmt::Debug {
    /// Token for the next request, or `None` to send it without one.
    async fn token(&self) -> Result<Option<String>, WarehouseError>;

    /// Drop whatever is cached so the next [`token`](Self::token) is freshly
    /// issued. Returns `false` when the source cannot mint a new token.
    async fn refresh(&self) -> Result<bool, WarehouseError> {
        Ok(false)
    }
}

/// A token fixed in configuration, or no token at all.
#[derive(Debug, Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<Option<String>, WarehouseError> {
        Ok(self.0.clone())
    }
}

/// Google credentials resolved the way the client libraries do: the given
/// credentials file (service account key or authorized user), then
/// `GOOGLE_APPLICATION_CREDENTIALS`, then the gcloud well-known file, then
/// the metadata server.
///
/// Tokens are cached and renewed ahead of expiry.
#[derive(Debug)]
pub struct GoogleToken {
    credentials_path: Option<String>,
    provider: RwLock<GcpCredentialProvider>,
}

impl GoogleToken {
    pub fn new(credentials_path: Option<String>) -> Result<Self, ConfigError> {
        let provider = Self::provider(credentials_path.as_deref())?;
        info!(
            "Using Google credentials from {}",
            credentials_path.as_deref().unwrap_or("the environment")
        );
        Ok(Self {
            credentials_path,
            provider: RwLock::new(provider),
        })
    }

    fn provider(credentials_path: Option<&str>) -> Result<GcpCredentialProvider, ConfigError> {
        let mut builder =
            GoogleCloudStorageBuilder::from_env().with_bucket_name(CREDENTIALS_ONLY_BUCKET);
        if let Some(path) = credentials_path {
            builder = builder.with_application_credentials(path);
        }
        let store = builder.build().map_err(|e| ConfigError::ConfigInvalid {
            name: "sink.bigquery.credentials_path".to_string(),
            reason: e.to_string(),
        })?;
        Ok(store.credentials().clone())
    }
}

#[async_trait]
impl TokenSource for GoogleToken {
    async fn token(&self) -> Result<Option<String>, WarehouseError> {
        let provider = self.provider.read().await.clone();
        let credential = provider
            .get_credential()
            .await
            .map_err(|e| WarehouseError::WarehouseTransient {
                message: format!("failed to obtain access token: {e}"),
            })?;
        Ok(Some(credential.bearer.clone()))
    }

    async fn refresh(&self) -> Result<bool, WarehouseError> {
        // A new provider starts with an empty token cache.
        let provider = Self::provider(self.credentials_path.as_deref()).map_err(|e| {
            WarehouseError::WarehousePermanent {
                message: e.to_string(),
            }
        })?;
        *self.provider.write().await = provider;
        debug!("[sink] Google credentials reloaded");
        Ok(true)
    }
}

/// Pick the token source named by `config.auth`.
pub fn token_source(config: &BigQueryConfig) -> Result<Arc<dyn TokenSource>, ConfigError> {
    let credentials_path = config.credentials_path.clone().filter(|p| !p.is_empty());
    let source: Arc<dyn TokenSource> = match config.auth {
        BigQueryAuth::None => Arc::new(StaticToken::new(None)),
        BigQueryAuth::Token => Arc::new(StaticToken::new(config.access_token.clone())),
        BigQueryAuth::Google => Arc::new(GoogleToken::new(credentials_path)?),
        BigQueryAuth::Auto => match config.access_token.as_deref() {
            Some(token) if !token.is_empty() => {
                Arc::new(StaticToken::new(Some(token.to_string())))
            }
            _ => Arc::new(GoogleToken::new(credentials_path)?),
        },
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_cannot_refresh() {
        let source = StaticToken::new(Some("abc".to_string()));
        assert_eq!(source.token().await.unwrap().as_deref(), Some("abc"));
        assert!(!source.refresh().await.unwrap());

        let empty = StaticToken::new(Some(String::new()));
        assert_eq!(empty.token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_auto_prefers_configured_token() {
        let config = BigQueryConfig {
            access_token: Some("configured".to_string()),
            ..BigQueryConfig::default()
        };
        let source = token_source(&config).unwrap();
        assert_eq!(source.token().await.unwrap().as_deref(), Some("configured"));
    }

    #[tokio::test]
    async fn test_anonymous_sends_no_token() {
        let config = BigQueryConfig {
            auth: BigQueryAuth::None,
            access_token: Some("ignored".to_string()),
            ..BigQueryConfig::default()
        };
        let source = token_source(&config).unwrap();
        assert_eq!(source.token().await.unwrap(), None);
    }

    #[test]
    fn test_missing_credentials_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = GoogleToken::new(Some(path.display().to_string())).unwrap_err();
        assert!(
            matches!(err, ConfigError::ConfigInvalid { ref name, .. } if name == "sink.bigquery.credentials_path")
        );
    }

    #[test]
    fn test_malformed_credentials_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(
            &path,
            r#"{"type": "service_account", "client_email": "ingest@example.iam.gserviceaccount.com",
                "private_key_id": "1", "private_key": "not a pem key"}"#,
        )
        .unwrap();

        assert!(GoogleToken::new(Some(path.display().to_string())).is_err());
    }
}

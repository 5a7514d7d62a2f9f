//! Object storage for checkpoints and dead letters.
//!
//! A [`StorageProvider`] is chosen from a URL: `s3://`, `gs://`, `file://`
//! or an absolute path, and `memory://` for an in-process store. Paths passed
//! to the provider are relative to the key prefix of that URL.

mod gcs;
mod local;
mod s3;

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
    Memory,
}

fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        vec![
            (
                Backend::S3,
                vec![
                    Regex::new(S3_ENDPOINT_URL).unwrap(),
                    Regex::new(S3_URL).unwrap(),
                ],
            ),
            (Backend::Gcs, vec![Regex::new(GCS_URL).unwrap()]),
            (
                Backend::Local,
                vec![Regex::new(FILE_URI).unwrap(), Regex::new(FILE_PATH).unwrap()],
            ),
            (Backend::Memory, vec![Regex::new(MEMORY_URL).unwrap()]),
        ]
    })
}

/// Storage location parsed from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
    Memory { key: Option<Path> },
}

fn key_of(matches: &regex::Captures) -> Option<Path> {
    matches
        .name("key")
        .map(|m| m.as_str().trim_matches('/'))
        .filter(|k| !k.is_empty())
        .map(Path::from)
}

impl BackendConfig {
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, regexes) in matchers() {
            if let Some(matches) = regexes.iter().find_map(|r| r.captures(url)) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&matches),
                    Backend::Gcs => Self::parse_gcs(&matches),
                    Backend::Local => Self::parse_local(&matches),
                    Backend::Memory => BackendConfig::Memory {
                        key: key_of(&matches),
                    },
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map_or_else(String::new, |m| m.as_str().to_string());

        let region = std::env::var("AWS_DEFAULT_REGION").ok();

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches.name("protocol").map_or("https", |p| p.as_str());
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: key_of(matches),
        })
    }

    fn parse_gcs(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map_or_else(String::new, |m| m.as_str().to_string());

        BackendConfig::Gcs(GcsConfig {
            bucket,
            key: key_of(matches),
        })
    }

    fn parse_local(matches: &regex::Captures) -> Self {
        let path = matches.name("path").map_or("", |m| m.as_str());
        let path = format!("/{}", path.trim_start_matches('/'));

        BackendConfig::Local(LocalConfig { path })
    }

    fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) => None,
            BackendConfig::Memory { key } => key.as_ref(),
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    ///
    /// Options are only consulted by the S3 backend.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Gcs(config) => Self::construct_gcs(config),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            memory @ BackendConfig::Memory { .. } => Ok(Self::construct_memory(memory)),
        }
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: status_of(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)
    }

    /// Write an object, replacing any previous contents.
    pub async fn put(&self, path: impl Into<Path>, bytes: Bytes) -> Result<(), StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(&path), PutPayload::from(bytes))
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: status_of(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }
}

fn status_of<T, E>(result: &Result<T, E>) -> RequestStatus {
    if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    }
}

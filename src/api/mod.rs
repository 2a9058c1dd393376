//! Remote catalog API client.
//!
//! This module provides the [`CatalogClient`], the crate's only window onto
//! the remote catalog: metadata lookup, file-tree retrieval, and content-hash
//! verification. All catalog calls share one [`RetryGate`] and one
//! [`ConcurrencyGovernor`], so a flailing API produces a single coordinated
//! backoff cycle across every in-flight request, batch-wide.
//!
//! # Example
//!
//! ```no_run
//! use workdl_core::api::CatalogClient;
//! use workdl_core::ids::SourceId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CatalogClient::builder("https://api.example.com/api/")
//!     .credentials("user", "hunter2")
//!     .build()?;
//! client.login().await?;
//! let meta = client.item_metadata(SourceId(123_456)).await?;
//! println!("{}", meta.source_name);
//! # Ok(())
//! # }
//! ```

mod types;

pub use types::{FileTreeEntry, ItemMetadata};

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Proxy, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::{ConcurrencyGovernor, GateError, RetryGate, Retryable};
use crate::ids::SourceId;

/// Connect timeout for catalog calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout for catalog calls; metadata payloads are small.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default concurrent catalog calls.
const DEFAULT_API_CONCURRENCY: usize = 4;

/// Default sustained catalog call rate per second.
const DEFAULT_API_RATE: f64 = 8.0;

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The item (or its track tree) does not exist remotely.
    #[error("item {id} not found: {detail}")]
    NotFound {
        /// The id that was requested.
        id: SourceId,
        /// Error detail reported by the catalog.
        detail: String,
    },

    /// Network-level failure talking to the catalog.
    #[error("network error calling {route}: {source}")]
    Network {
        /// The API route that failed.
        route: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The catalog answered with an error status.
    #[error("HTTP {status} calling {route}")]
    HttpStatus {
        /// The API route that failed.
        route: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The catalog answered with a body this client cannot interpret.
    #[error("unexpected response from {route}: {detail}")]
    UnexpectedResponse {
        /// The API route that failed.
        route: String,
        /// What was wrong with the body.
        detail: String,
    },

    /// Authentication failed or no token is held.
    #[error("authentication with the catalog failed: {detail}")]
    Auth {
        /// Failure detail.
        detail: String,
    },

    /// The shared retry budget was exhausted.
    #[error("catalog unavailable after {retries} retries: {source}")]
    Unavailable {
        /// The retry budget that was spent.
        retries: u32,
        /// The last transient failure.
        #[source]
        source: Box<ApiError>,
    },
}

impl Retryable for ApiError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound { .. }
            | Self::UnexpectedResponse { .. }
            | Self::Auth { .. }
            | Self::Unavailable { .. } => false,
        }
    }
}

impl From<GateError<ApiError>> for ApiError {
    fn from(e: GateError<ApiError>) -> Self {
        match e {
            GateError::Permanent(inner) => inner,
            GateError::Exhausted { retries, source } => Self::Unavailable {
                retries,
                source: Box::new(source),
            },
        }
    }
}

/// Builder for [`CatalogClient`].
#[derive(Debug)]
pub struct CatalogClientBuilder {
    base_url: String,
    username: String,
    password: String,
    proxy: Option<String>,
    concurrency: usize,
    max_rate: f64,
    retry_base_delay: Duration,
    max_retries: u32,
}

impl CatalogClientBuilder {
    /// Sets the account used by [`CatalogClient::login`].
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Routes catalog traffic through an HTTP proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Overrides the catalog-call concurrency and rate budget.
    #[must_use]
    pub fn budget(mut self, concurrency: usize, max_rate: f64) -> Self {
        self.concurrency = concurrency;
        self.max_rate = max_rate;
        self
    }

    /// Overrides the retry backoff base and budget.
    #[must_use]
    pub fn retries(mut self, base_delay: Duration, max_retries: u32) -> Self {
        self.retry_base_delay = base_delay;
        self.max_retries = max_retries;
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Auth`] when the proxy URL is malformed or the
    /// underlying HTTP client cannot be constructed.
    pub fn build(self) -> Result<CatalogClient, ApiError> {
        let mut builder = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .gzip(true)
            .cookie_store(true);
        if let Some(proxy) = &self.proxy {
            let proxy = Proxy::all(proxy).map_err(|e| ApiError::Auth {
                detail: format!("invalid proxy {proxy}: {e}"),
            })?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(|e| ApiError::Auth {
            detail: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(CatalogClient {
            http,
            base_url: self.base_url,
            username: self.username,
            password: self.password,
            token: std::sync::RwLock::new(None),
            governor: Arc::new(ConcurrencyGovernor::new(self.concurrency, self.max_rate)),
            gate: RetryGate::new(self.retry_base_delay, self.max_retries),
        })
    }
}

/// Authenticated catalog API client.
///
/// Holds the bearer token from [`login`](Self::login) and the shared
/// gate/governor pair for the catalog operation kind.
#[derive(Debug)]
pub struct CatalogClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    token: std::sync::RwLock<Option<String>>,
    governor: Arc<ConcurrencyGovernor>,
    gate: RetryGate,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    result: bool,
}

impl CatalogClient {
    /// Starts a builder for the given API base URL (trailing slash optional).
    #[must_use]
    pub fn builder(base_url: impl Into<String>) -> CatalogClientBuilder {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        CatalogClientBuilder {
            base_url,
            username: String::new(),
            password: String::new(),
            proxy: None,
            concurrency: DEFAULT_API_CONCURRENCY,
            max_rate: DEFAULT_API_RATE,
            retry_base_delay: Duration::from_secs(2),
            max_retries: 5,
        }
    }

    /// Authenticates against the catalog and stores the bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Auth`] when the catalog rejects the credentials,
    /// and transport errors per [`ApiError`].
    #[instrument(skip(self))]
    pub async fn login(&self) -> Result<(), ApiError> {
        let route = "auth/me";
        let url = format!("{}{route}", self.base_url);
        let body = json!({"name": self.username, "password": self.password});

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| ApiError::Network {
                route: route.to_string(),
                source,
            })?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Auth {
                detail: "catalog rejected the configured credentials".to_string(),
            });
        }
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                route: route.to_string(),
                status: status.as_u16(),
            });
        }

        let login: LoginResponse =
            response
                .json()
                .await
                .map_err(|e| ApiError::UnexpectedResponse {
                    route: route.to_string(),
                    detail: format!("missing token: {e}"),
                })?;
        *write_lock(&self.token) = Some(login.token);
        info!("authenticated with catalog");
        Ok(())
    }

    /// Fetches the metadata of one item.
    ///
    /// # Errors
    ///
    /// [`ApiError::NotFound`] for unknown ids; transport errors otherwise.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn item_metadata(&self, id: SourceId) -> Result<ItemMetadata, ApiError> {
        let route = format!("work/{}", id.0);
        let value = self.get_json(&route, id).await?;
        ItemMetadata::from_raw(value).map_err(|e| ApiError::UnexpectedResponse {
            route,
            detail: format!("malformed metadata: {e}"),
        })
    }

    /// Fetches the file tree of one item.
    ///
    /// The catalog reports a missing tree as an object with an `error`
    /// member instead of the usual top-level array; that is mapped to
    /// [`ApiError::NotFound`].
    ///
    /// # Errors
    ///
    /// [`ApiError::NotFound`] when the item has no tracks; transport errors
    /// otherwise.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn file_tree(&self, id: SourceId) -> Result<Vec<FileTreeEntry>, ApiError> {
        let route = format!("tracks/{}", id.0);
        let value = self.get_json(&route, id).await?;

        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(ApiError::NotFound {
                id,
                detail: error.to_string(),
            });
        }
        serde_json::from_value(value).map_err(|e| ApiError::UnexpectedResponse {
            route,
            detail: format!("malformed file tree: {e}"),
        })
    }

    /// Submits a locally computed content hash for verification.
    ///
    /// Returns true only when the catalog confirms the hash matches its own
    /// record for `file_id`.
    ///
    /// # Errors
    ///
    /// Transport errors per [`ApiError`]; an unknown file id surfaces as
    /// [`ApiError::UnexpectedResponse`].
    #[instrument(skip(self, hash))]
    pub async fn verify_hash(&self, file_id: u64, hash: &str) -> Result<bool, ApiError> {
        let route = format!("media/check-hash/{file_id}");
        let url = format!("{}{route}", self.base_url);
        let body = json!({"hash": hash});

        let value = self
            .gate
            .run(|| {
                self.governor
                    .run(self.post_json_once(url.clone(), route.clone(), body.clone()))
            })
            .await
            .map_err(ApiError::from)?;

        let verify: VerifyResponse =
            serde_json::from_value(value).map_err(|e| ApiError::UnexpectedResponse {
                route,
                detail: format!("malformed verification response: {e}"),
            })?;
        debug!(file_id, result = verify.result, "hash verification answered");
        Ok(verify.result)
    }

    /// GETs a route through the shared gate and governor.
    async fn get_json(&self, route: &str, id: SourceId) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}{route}", self.base_url);
        let value = match self
            .gate
            .run(|| {
                self.governor
                    .run(self.get_json_once(url.clone(), route.to_string()))
            })
            .await
            .map_err(ApiError::from)
        {
            Ok(value) => value,
            Err(ApiError::HttpStatus { status: 404, .. }) => {
                return Err(ApiError::NotFound {
                    id,
                    detail: "HTTP 404".to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        // Metadata errors come back as 200 + {"error": ...}.
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            warn!(%id, error, "catalog reported an error body");
            return Err(ApiError::NotFound {
                id,
                detail: error.to_string(),
            });
        }
        Ok(value)
    }

    async fn get_json_once(&self, url: String, route: String) -> Result<serde_json::Value, ApiError> {
        let mut request = self.http.get(&url);
        if let Some(token) = read_lock(&self.token).clone() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| ApiError::Network {
            route: route.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                route,
                status: status.as_u16(),
            });
        }
        response
            .json()
            .await
            .map_err(|source| ApiError::Network { route, source })
    }

    async fn post_json_once(
        &self,
        url: String,
        route: String,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = read_lock(&self.token).clone() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| ApiError::Network {
            route: route.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                route,
                status: status.as_u16(),
            });
        }
        response
            .json()
            .await
            .map_err(|source| ApiError::Network { route, source })
    }
}

fn read_lock<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = ApiError::HttpStatus {
            route: "tracks/1".to_string(),
            status: 503,
        };
        assert!(transient.is_transient());

        let rate_limited = ApiError::HttpStatus {
            route: "tracks/1".to_string(),
            status: 429,
        };
        assert!(rate_limited.is_transient());

        let not_found = ApiError::NotFound {
            id: SourceId(1),
            detail: "gone".to_string(),
        };
        assert!(!not_found.is_transient());

        let client_error = ApiError::HttpStatus {
            route: "tracks/1".to_string(),
            status: 404,
        };
        assert!(!client_error.is_transient());
    }

    #[test]
    fn test_builder_normalizes_base_url() {
        let client = CatalogClient::builder("https://api.example.com/api")
            .build()
            .unwrap();
        assert!(client.base_url.ends_with('/'));
    }

    #[test]
    fn test_gate_error_conversion() {
        let inner = ApiError::NotFound {
            id: SourceId(1),
            detail: "x".to_string(),
        };
        let converted: ApiError = GateError::Permanent(inner).into();
        assert!(matches!(converted, ApiError::NotFound { .. }));

        let exhausted: ApiError = GateError::Exhausted {
            retries: 5,
            source: ApiError::HttpStatus {
                route: "r".to_string(),
                status: 502,
            },
        }
        .into();
        assert!(matches!(
            converted_retries(&exhausted),
            Some(5)
        ));
    }

    fn converted_retries(e: &ApiError) -> Option<u32> {
        match e {
            ApiError::Unavailable { retries, .. } => Some(*retries),
            _ => None,
        }
    }
}

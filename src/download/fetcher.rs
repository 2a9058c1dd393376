//! Fetch backends for file bytes.
//!
//! The orchestrator never talks HTTP for file content directly; it hands
//! every transfer to a [`Fetcher`], a capability interface keyed by URL,
//! destination directory, and filename. The backend is chosen once at
//! orchestrator construction from configuration.
//!
//! The built-in [`HttpFetcher`] streams the response body to a `.part`
//! sibling and renames it into place on completion, so an interrupted
//! transfer never leaves a truncated file under the final name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder, Proxy};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};

use super::gate::Retryable;

/// Connect timeout for media transfers.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout for media transfers; audio files can be large.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from a fetch backend.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, mid-body drop).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with an error status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that failed.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Filesystem error writing the destination.
    #[error("IO error writing {path}: {source}")]
    Io {
        /// The destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Backend construction failed.
    #[error("fetch backend unavailable: {detail}")]
    Backend {
        /// Failure detail.
        detail: String,
    },
}

impl FetchError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Io { .. } | Self::Backend { .. } => false,
        }
    }
}

/// Capability interface for transferring one file.
///
/// The destination directory is guaranteed to exist and
/// `dest_dir/file_name` is guaranteed not to exist when called.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Transfers `url` into `dest_dir/file_name`.
    async fn fetch(&self, url: &str, dest_dir: &Path, file_name: &str) -> Result<(), FetchError>;
}

/// Streaming HTTP fetch backend.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates the backend, optionally routed through a proxy.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Backend`] when the proxy URL is malformed or
    /// the HTTP client cannot be built.
    pub fn new(proxy: Option<&str>) -> Result<Self, FetchError> {
        let mut builder = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .gzip(true);
        if let Some(proxy) = proxy {
            let proxy = Proxy::all(proxy).map_err(|e| FetchError::Backend {
                detail: format!("invalid proxy {proxy}: {e}"),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| FetchError::Backend {
            detail: format!("failed to build HTTP client: {e}"),
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), fields(url = %url, file = %file_name))]
    async fn fetch(&self, url: &str, dest_dir: &Path, file_name: &str) -> Result<(), FetchError> {
        let final_path = dest_dir.join(file_name);
        let part_path = dest_dir.join(format!("{file_name}.part"));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let result = stream_body(response, url, &part_path).await;
        if result.is_err() {
            debug!(path = %part_path.display(), "cleaning up partial file");
            let _ = tokio::fs::remove_file(&part_path).await;
        }
        let bytes = result?;

        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| FetchError::io(final_path.clone(), e))?;

        info!(path = %final_path.display(), bytes, "fetch complete");
        Ok(())
    }
}

/// Fetch backend that queues transfers on an external aria2 daemon.
///
/// Mirrors the daemon's contract: a transfer is considered dispatched once
/// aria2 accepts the URI; aria2 owns retries and partial files from there.
#[derive(Debug, Clone)]
pub struct Aria2Fetcher {
    client: Client,
    endpoint: String,
    secret: Option<String>,
}

impl Aria2Fetcher {
    /// Creates the backend for an aria2 JSON-RPC endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Backend`] when the RPC client cannot be built.
    pub fn new(endpoint: impl Into<String>, secret: Option<String>) -> Result<Self, FetchError> {
        let client = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Backend {
                detail: format!("failed to build RPC client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            secret,
        })
    }
}

#[async_trait]
impl Fetcher for Aria2Fetcher {
    #[instrument(skip(self), fields(url = %url, file = %file_name))]
    async fn fetch(&self, url: &str, dest_dir: &Path, file_name: &str) -> Result<(), FetchError> {
        let mut params = Vec::new();
        if let Some(secret) = &self.secret {
            params.push(serde_json::json!(format!("token:{secret}")));
        }
        params.push(serde_json::json!([url]));
        params.push(serde_json::json!({
            "dir": dest_dir.to_string_lossy(),
            "out": file_name,
            "auto-file-renaming": "false",
        }));
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "workdl",
            "method": "aria2.addUri",
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|source| FetchError::Network {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let reply: serde_json::Value =
            response
                .json()
                .await
                .map_err(|source| FetchError::Network {
                    url: self.endpoint.clone(),
                    source,
                })?;
        if let Some(error) = reply.get("error") {
            return Err(FetchError::Backend {
                detail: format!("aria2 rejected {url}: {error}"),
            });
        }

        info!(gid = ?reply.get("result"), "transfer handed to aria2");
        Ok(())
    }
}

/// Streams a response body into `part_path`, returning the byte count.
async fn stream_body(
    response: reqwest::Response,
    url: &str,
    part_path: &Path,
) -> Result<u64, FetchError> {
    let file = File::create(part_path)
        .await
        .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| FetchError::Network {
            url: url.to_string(),
            source,
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
    Ok(bytes_written)
}

//! Configuration loading for the CLI and library wiring.
//!
//! Configuration is a TOML file resolved from the XDG config directory
//! (`$XDG_CONFIG_HOME/workdl/config.toml`, falling back to
//! `$HOME/.config/workdl/config.toml`) or an explicit `--config` path.
//! Values are validated at load so misconfiguration surfaces at startup,
//! not mid-batch.
//!
//! ```toml
//! [api]
//! base_url = "https://api.example.com/api/"
//! username = "name"
//! password = "secret"
//!
//! [paths]
//! download_dir = "~/works/download"
//! storage_dir = "~/works/storage"
//!
//! [download]
//! concurrency = 4
//! max_rate = 4.0
//!
//! [[filters]]
//! pattern = "\\.wav$"
//! mode = "exclude"
//! scope = "file"
//! relaxable_on_empty = true
//! ```

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::filter::{FilterEngine, FilterError, FilterRule};

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No config path could be resolved and none was given.
    #[error("no config file found; create one or pass --config")]
    NotFound,

    /// The file could not be read.
    #[error("cannot read config {path}: {source}")]
    Read {
        /// The path that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// The path that failed.
        path: PathBuf,
        /// The TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of its accepted range.
    #[error("invalid config value for `{field}`: {detail}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// What was wrong.
        detail: String,
    },

    /// A filter rule failed to compile.
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Catalog account and endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    /// API base URL, e.g. `https://api.example.com/api/`.
    pub base_url: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Optional HTTP proxy for all remote traffic.
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Local library locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    /// Location for in-progress downloads.
    pub download_dir: PathBuf,
    /// Location for archived items.
    pub storage_dir: PathBuf,
}

/// Fetch backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    /// Built-in streaming HTTP fetcher.
    #[default]
    Http,
    /// Hand transfers to a running aria2 RPC endpoint.
    Aria2,
}

/// Download dispatch knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Maximum concurrent file fetches, batch-wide.
    pub concurrency: usize,
    /// Maximum sustained fetch completions per second.
    pub max_rate: f64,
    /// Retry budget shared by all concurrent fetches.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds; doubles per consecutive failure.
    pub base_delay_ms: u64,
    /// Delete and refetch files that already exist locally.
    pub replace: bool,
    /// Which fetch backend to hand transfers to.
    pub backend: FetchBackend,
    /// aria2 RPC endpoint, used when `backend = "aria2"`.
    pub aria2_url: String,
    /// aria2 RPC secret token, if the endpoint requires one.
    pub aria2_secret: Option<String>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_rate: 4.0,
            max_retries: 5,
            base_delay_ms: 2000,
            replace: false,
            backend: FetchBackend::Http,
            aria2_url: "http://127.0.0.1:6800/jsonrpc".to_string(),
            aria2_secret: None,
        }
    }
}

/// Fully parsed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Catalog account and endpoint.
    pub api: ApiSettings,
    /// Local library locations.
    pub paths: PathSettings,
    /// Download dispatch knobs.
    #[serde(default)]
    pub download: DownloadSettings,
    /// Ordered filter rules.
    #[serde(default)]
    pub filters: Vec<FilterRule>,
}

impl Config {
    /// Loads and validates the config at `path`.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from an explicit path, or from the default XDG location.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] when neither is available; otherwise as
    /// [`Config::load`].
    pub fn load_or_default_path(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = default_config_path().ok_or(ConfigError::NotFound)?;
                if !path.exists() {
                    return Err(ConfigError::NotFound);
                }
                Self::load(&path)
            }
        }
    }

    /// Compiles the configured filter rules into an engine.
    ///
    /// # Errors
    ///
    /// Propagates pattern compilation failures.
    pub fn filter_engine(&self) -> Result<FilterEngine, ConfigError> {
        Ok(FilterEngine::new(&self.filters)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.download.concurrency) {
            return Err(ConfigError::Invalid {
                field: "download.concurrency",
                detail: format!("{} not in 1..=100", self.download.concurrency),
            });
        }
        if !(self.download.max_rate > 0.0 && self.download.max_rate <= 1000.0) {
            return Err(ConfigError::Invalid {
                field: "download.max_rate",
                detail: format!("{} not in (0, 1000]", self.download.max_rate),
            });
        }
        if self.download.max_retries > 20 {
            return Err(ConfigError::Invalid {
                field: "download.max_retries",
                detail: format!("{} exceeds 20", self.download.max_retries),
            });
        }
        if self.download.base_delay_ms == 0 || self.download.base_delay_ms > 60_000 {
            return Err(ConfigError::Invalid {
                field: "download.base_delay_ms",
                detail: format!("{} not in 1..=60000", self.download.base_delay_ms),
            });
        }
        // Compile once here so bad patterns are a startup error.
        FilterEngine::new(&self.filters)?;
        Ok(())
    }
}

/// Resolves the default config path.
///
/// Priority: `$XDG_CONFIG_HOME/workdl/config.toml`, then
/// `$HOME/.config/workdl/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("workdl").join("config.toml"));
    }
    let home = env_var_non_empty("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("workdl")
            .join("config.toml"),
    )
}

fn env_var_non_empty(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Expands a leading `~` or `~/` to `$HOME`, leaving other paths untouched.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(rest) = path.to_str().and_then(|s| s.strip_prefix('~')) else {
        return path.to_path_buf();
    };
    let Some(home) = env_var_non_empty("HOME") else {
        return path.to_path_buf();
    };
    let home = PathBuf::from(home);
    match rest.strip_prefix('/') {
        Some(tail) => home.join(tail),
        None if rest.is_empty() => home,
        // `~user` forms are not supported; keep them literal.
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [api]
        base_url = "https://api.example.com/api/"
        username = "u"
        password = "p"

        [paths]
        download_dir = "/tmp/dl"
        storage_dir = "/tmp/st"
    "#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.download.concurrency, 4);
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.download.backend, FetchBackend::Http);
        assert!(config.filters.is_empty());
    }

    #[test]
    fn test_filters_parse_in_order() {
        let raw = format!(
            "{MINIMAL}\n\
             [[filters]]\n\
             pattern = \"SE\"\n\
             mode = \"exclude\"\n\
             \n\
             [[filters]]\n\
             pattern = \"\\\\.mp3$\"\n\
             mode = \"include\"\n\
             scope = \"file\"\n"
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert_eq!(config.filters.len(), 2);
        assert_eq!(config.filters[0].pattern, "SE");
        config.filter_engine().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.download.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "download.concurrency",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_filter_pattern() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.filters.push(FilterRule {
            pattern: "(unclosed".to_string(),
            mode: crate::filter::FilterMode::Exclude,
            scope: crate::filter::FilterScope::All,
            exact_match: false,
            ignore_case: false,
            relaxable_on_empty: false,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Filter(_))));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let result = Config::load(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = env::var_os("HOME").filter(|h| !h.is_empty()) {
            assert_eq!(
                expand_tilde(Path::new("~/works/dl")),
                PathBuf::from(&home).join("works/dl")
            );
            assert_eq!(expand_tilde(Path::new("~")), PathBuf::from(&home));
        }
        assert_eq!(
            expand_tilde(Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(expand_tilde(Path::new("~user/x")), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_backend_parses_lowercase() {
        let raw = format!("{MINIMAL}\n[download]\nbackend = \"aria2\"\n");
        let config: Config = toml::from_str(&raw).unwrap();
        assert_eq!(config.download.backend, FetchBackend::Aria2);
    }
}

//! Loads and validates `mahoraga.toml`.
//!
//! Grounded on `rattler_config`'s `ConfigBase` style (plain `serde` structs
//! deserialized with `toml`, every field defaulted so the file is fully
//! optional) but without that crate's multi-file merge machinery: mahoraga
//! reads exactly one configuration file, so there is nothing to merge.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Everything the proxy needs at startup: where to listen, how hard to hit
/// each upstream, which mirrors back each package family, which shard jobs
/// to run, and which hostnames are last-resort fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub cors: CorsConfig,
    pub mirrors: MirrorsConfig,
    pub npm: NpmConfig,
    #[serde(rename = "shard")]
    pub shards: Vec<ShardJobSpec>,
    /// Hostnames explicitly classified as fallback mirrors. Ranked strictly
    /// after every primary mirror in [`mahoraga_ledger::StatisticsLedger::key`]
    /// regardless of load.
    pub backup: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            log: LogConfig::default(),
            cors: CorsConfig::default(),
            mirrors: MirrorsConfig::default(),
            npm: NpmConfig::default(),
            shards: Vec::new(),
            backup: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on in-flight upstream connections per host.
    pub limit_concurrency: usize,
    /// Keep-alive duration, in seconds, for pooled upstream connections.
    pub keep_alive: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            limit_concurrency: 16,
            keep_alive: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    /// An `EnvFilter` directive string, e.g. `"info"` or
    /// `"mahoraga_stream=debug,info"`. Passed straight through to
    /// `tracing_subscriber::EnvFilter`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
        }
    }
}

/// One ordered mirror list per upstream family, plus per-channel overrides
/// for conda. Declaration order is load-bearing: the load balancer breaks
/// ties between equally-ranked mirrors by insertion order, so every list
/// here is a `Vec`/`IndexMap`, never a `HashMap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MirrorsConfig {
    pub conda: Vec<String>,
    /// Per-channel overrides, e.g. a conda-forge mirror that only serves one
    /// channel. Consulted before falling back to `conda`.
    pub conda_channels: IndexMap<String, Vec<String>>,
    pub pypi: Vec<String>,
    pub jsdelivr_npm: Vec<String>,
    pub jsdelivr_pyodide: Vec<String>,
    pub python_embed: Vec<String>,
    pub python_build_standalone: Vec<String>,
    pub uv: Vec<String>,
}

impl Default for MirrorsConfig {
    fn default() -> Self {
        Self {
            conda: vec!["https://conda.anaconda.org/{channel}".to_string()],
            conda_channels: IndexMap::new(),
            pypi: vec!["https://pypi.org".to_string()],
            jsdelivr_npm: vec!["https://cdn.jsdelivr.net/npm".to_string()],
            jsdelivr_pyodide: vec!["https://cdn.jsdelivr.net/pyodide".to_string()],
            python_embed: vec!["https://www.python.org/ftp/python/{version}/{name}".to_string()],
            python_build_standalone: vec![
                "https://github.com/astral-sh/python-build-standalone/releases/download/{tag}/{name}".to_string(),
            ],
            uv: vec!["https://github.com/astral-sh/uv/releases/download".to_string()],
        }
    }
}

/// Policy knobs specific to the npm/jsDelivr route adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NpmConfig {
    /// Scopes (without the leading `@`) the npm route accepts a
    /// `@scope/package` prefix for. See spec.md §9 Open Question #2: this is
    /// a policy decision, not a behavioral one, so it is configurable.
    pub scopes: Vec<String>,
    /// Base URL of the jsDelivr version-resolution/metadata API
    /// (`data.jsdelivr.com`). Configurable rather than hardcoded so tests
    /// can point it at a local mock server instead of the real network.
    pub resolver_base: String,
}

impl Default for NpmConfig {
    fn default() -> Self {
        Self {
            scopes: vec!["pyodide".to_string(), "jupyterlite".to_string()],
            resolver_base: "https://data.jsdelivr.com".to_string(),
        }
    }
}

/// One `ShardBuilder` job: convert full repodata for `channel`/`platform`
/// into the sharded format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShardJobSpec {
    pub channel: String,
    pub platform: String,
    /// Optional `label/<label>/` path segment, for channels that publish
    /// staged labels (e.g. conda-forge's `label/rc`).
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0}")]
    Validation(String),
}

impl Config {
    /// Loads `mahoraga.toml` from `path`. A missing file is not an error —
    /// the proxy runs with compiled-in defaults, matching spec.md §6
    /// ("Fully optional with documented defaults").
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(LoadError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&text).map_err(|source| LoadError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LoadError> {
        if self.server.limit_concurrency == 0 {
            return Err(LoadError::Validation(
                "server.limit-concurrency must be greater than 0".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(LoadError::Validation("server.port must be nonzero".to_string()));
        }
        Ok(())
    }

    /// Ordered base URLs for a conda channel, honoring any per-channel
    /// override before falling back to the family-wide list.
    pub fn conda_mirrors_for(&self, channel: &str) -> Vec<String> {
        self.mirrors
            .conda_channels
            .get(channel)
            .cloned()
            .unwrap_or_else(|| self.mirrors.conda.clone())
    }
}

/// Maps each upstream family to its base mirror count, for diagnostics and
/// the `shard build` CLI subcommand's startup log line.
pub fn mirror_counts(config: &Config) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    counts.insert("conda", config.mirrors.conda.len());
    counts.insert("pypi", config.mirrors.pypi.len());
    counts.insert("jsdelivr_npm", config.mirrors.jsdelivr_npm.len());
    counts.insert("jsdelivr_pyodide", config.mirrors.jsdelivr_pyodide.len());
    counts.insert("python_embed", config.mirrors.python_embed.len());
    counts.insert("python_build_standalone", config.mirrors.python_build_standalone.len());
    counts.insert("uv", config.mirrors.uv.len());
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let config = Config::load("/nonexistent/mahoraga.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_a_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mahoraga.toml");
        std::fs::write(
            &path,
            r#"
            backup = ["backup.example.org"]

            [server]
            port = 9000

            [mirrors]
            conda = ["https://a.example.org/{channel}", "https://b.example.org/{channel}"]

            [[shard]]
            channel = "conda-forge"
            platform = "linux-64"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.mirrors.conda.len(), 2);
        assert!(config.backup.contains("backup.example.org"));
        assert_eq!(config.shards.len(), 1);
        assert_eq!(config.shards[0].channel, "conda-forge");
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mahoraga.toml");
        std::fs::write(&path, "[server]\nlimit-concurrency = 0\n").unwrap();
        let result = Config::load(&path);
        assert!(matches!(result, Err(LoadError::Validation(_))));
    }

    #[test]
    fn conda_channel_override_takes_precedence() {
        let mut config = Config::default();
        config
            .mirrors
            .conda_channels
            .insert("conda-forge".to_string(), vec!["https://mirror.example.org".to_string()]);
        assert_eq!(config.conda_mirrors_for("conda-forge"), vec!["https://mirror.example.org"]);
        assert_eq!(config.conda_mirrors_for("bioconda"), config.mirrors.conda);
    }

    #[test]
    fn declaration_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mahoraga.toml");
        std::fs::write(
            &path,
            r#"
            [mirrors]
            pypi = ["https://z.example.org", "https://a.example.org", "https://m.example.org"]
            "#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.mirrors.pypi,
            vec!["https://z.example.org", "https://a.example.org", "https://m.example.org"]
        );
    }
}

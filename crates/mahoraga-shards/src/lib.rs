//! The sharded-repodata builder (spec.md §4.7): a background job pool that
//! converts full conda repodata into the sharded format the `/conda/.../shards/*`
//! routes serve directly from disk.
//!
//! Grounded on `rattler_repodata_gateway::gateway::sharded_subdir`'s shard
//! file shape (one `rmp_serde` + zstd envelope per package name, content
//! addressed by the SHA-256 of the compressed bytes) and `rattler_index`'s
//! job-pool pattern (`tokio::sync::Semaphore`-bounded concurrency over
//! `futures::stream::buffer_unordered`, the same
//! `ZSTD_REPODATA_COMPRESSION_LEVEL` / `CACHE_CONTROL_IMMUTABLE` constants).
//!
//! This component is specified only by its interface to the cache: it
//! writes into `channels/<channel>/[label/<label>/]<platform>/{run_exports.json.zst,
//! repodata_shards.msgpack.zst, shards/<sha256hex>.msgpack.zst}` and never
//! touches a path an in-flight client request is also writing to (the
//! StreamEngine's cache paths for conda artifacts never collide with a
//! shard job's paths).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use mahoraga_client::UpstreamClient;
use mahoraga_core::CacheAction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Compression level used for every shard and the index, matching
/// `rattler_index`'s `ZSTD_REPODATA_COMPRESSION_LEVEL`.
const ZSTD_REPODATA_COMPRESSION_LEVEL: i32 = 19;

/// How many `(channel, platform)` jobs run concurrently. Kept modest: the
/// CPU-bound encode step is isolated behind `spawn_blocking`, but the
/// network fetch of full repodata for many channels at once would still
/// contend for bandwidth.
const DEFAULT_JOB_CONCURRENCY: usize = 4;

/// One `(channel, platform[, label])` pair to materialize into shards.
#[derive(Debug, Clone)]
pub struct ShardJob {
    pub channel: String,
    pub platform: String,
    pub label: Option<String>,
}

impl ShardJob {
    /// The on-disk directory this job writes into, relative to the cache
    /// root: `channels/<channel>/[label/<label>/]<platform>/`.
    fn output_dir(&self, cache_root: &Path) -> PathBuf {
        let mut dir = cache_root.join("channels").join(&self.channel);
        if let Some(label) = &self.label {
            dir = dir.join("label").join(label);
        }
        dir.join(&self.platform)
    }
}

/// A single package-name shard: every record (as parsed straight out of
/// `repodata.json`'s `packages`/`packages.conda` maps) belonging to that
/// name, keyed by filename. Public so `mahoraga-routes` can look up a
/// package's declared `sha256`/`size` for opportunistic conda-artifact
/// caching without duplicating the on-disk shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct Shard {
    pub records: IndexMap<String, serde_json::Value>,
}

/// The shard index written as `repodata_shards.msgpack.zst`: maps each
/// package name to the SHA-256 (hex) of its shard file.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardIndex {
    pub info: ShardIndexInfo,
    pub shards: IndexMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardIndexInfo {
    pub channel: String,
    pub subdir: String,
}

/// Reads and decodes a `repodata_shards.msgpack.zst` index file.
pub async fn load_index(path: &Path) -> Result<ShardIndex, ShardJobError> {
    let compressed = tokio::fs::read(path).await.map_err(ShardJobError::Io)?;
    decode_zst_msgpack(compressed).await
}

/// Reads and decodes a single `<sha256hex>.msgpack.zst` shard file.
pub async fn load_shard(path: &Path) -> Result<Shard, ShardJobError> {
    let compressed = tokio::fs::read(path).await.map_err(ShardJobError::Io)?;
    decode_zst_msgpack(compressed).await
}

async fn decode_zst_msgpack<T>(compressed: Vec<u8>) -> Result<T, ShardJobError>
where
    T: for<'de> Deserialize<'de> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let decompressed = zstd::stream::decode_all(compressed.as_slice()).map_err(ShardJobError::Io)?;
        rmp_serde::from_slice(&decompressed).map_err(|error| ShardJobError::Io(std::io::Error::other(error)))
    })
    .await
    .map_err(|join_error| ShardJobError::Io(std::io::Error::other(join_error)))?
}

#[derive(Debug, thiserror::Error)]
pub enum ShardJobError {
    #[error("failed to fetch repodata.json for {channel}/{platform}: {source}")]
    Fetch {
        channel: String,
        platform: String,
        #[source]
        source: mahoraga_client::ClientError,
    },
    #[error("repodata.json for {channel}/{platform} was not valid JSON: {source}")]
    Parse {
        channel: String,
        platform: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write shard output: {0}")]
    Io(#[source] std::io::Error),
}

/// Runs every job in `jobs` to completion, bounded by `concurrency`
/// simultaneous jobs. A single job's failure is logged and does not affect
/// any other job — spec.md §4.7's "Failures are logged and do not block the
/// server."
pub async fn run_all(
    jobs: Vec<ShardJob>,
    mirrors: HashMap<String, Vec<String>>,
    client: Arc<UpstreamClient>,
    cache_root: PathBuf,
    concurrency: Option<usize>,
) {
    let concurrency = concurrency.unwrap_or(DEFAULT_JOB_CONCURRENCY).max(1);
    stream::iter(jobs)
        .map(|job| {
            let client = client.clone();
            let cache_root = cache_root.clone();
            let mirror_urls = mirrors.get(&job.channel).cloned().unwrap_or_default();
            async move {
                let label = job.label.clone();
                let channel = job.channel.clone();
                let platform = job.platform.clone();
                if let Err(error) = run_one(&job, &mirror_urls, &client, &cache_root).await {
                    tracing::warn!(channel, platform, ?label, %error, "shard job failed");
                }
            }
        })
        .buffer_unordered(concurrency)
        .for_each(|()| async {})
        .await;
}

async fn run_one(job: &ShardJob, mirror_base_urls: &[String], client: &UpstreamClient, cache_root: &Path) -> Result<(), ShardJobError> {
    let subdir_path = match &job.label {
        Some(label) => format!("label/{label}/{}", job.platform),
        None => job.platform.clone(),
    };

    let repodata = fetch_json(client, mirror_base_urls, &subdir_path, "repodata.json", job).await?;

    // The run_exports sidecar is optional: conda-forge only publishes it for
    // some channels, and its absence is routine, not a failure.
    let run_exports_url = first_mirror_url(mirror_base_urls, &subdir_path, "run_exports.json.zst");
    let run_exports = match run_exports_url {
        Some(url) => match client.get(&url, CacheAction::CacheOrFetch).await {
            Ok(response) if response.status.is_success() => Some(response.body),
            Ok(_) => {
                tracing::debug!(channel = job.channel, platform = job.platform, "no run_exports.json.zst sidecar, continuing without it");
                None
            }
            Err(error) => {
                tracing::debug!(channel = job.channel, platform = job.platform, %error, "run_exports.json.zst sidecar fetch failed, continuing without it");
                None
            }
        },
        None => None,
    };

    let by_name = group_by_package_name(&repodata, job)?;
    let output_dir = job.output_dir(cache_root);
    let shards_dir = output_dir.join("shards");
    tokio::fs::create_dir_all(&shards_dir).await.map_err(ShardJobError::Io)?;

    if let Some(run_exports) = run_exports {
        write_atomically(&output_dir.join("run_exports.json.zst"), run_exports.to_vec()).await?;
    }

    let mut index = IndexMap::new();
    for (name, records) in by_name {
        let shard = Shard { records };
        let (digest_hex, compressed) = encode_shard(shard).await?;
        let shard_path = shards_dir.join(format!("{digest_hex}.msgpack.zst"));
        if !is_present(&shard_path).await {
            write_atomically(&shard_path, compressed).await?;
        }
        index.insert(name, digest_hex);
    }

    let index = ShardIndex {
        info: ShardIndexInfo {
            channel: job.channel.clone(),
            subdir: job.platform.clone(),
        },
        shards: index,
    };
    let compressed_index = encode_index(index).await?;
    write_atomically(&output_dir.join("repodata_shards.msgpack.zst"), compressed_index).await?;

    Ok(())
}

async fn fetch_json(
    client: &UpstreamClient,
    mirror_base_urls: &[String],
    subdir_path: &str,
    filename: &str,
    job: &ShardJob,
) -> Result<serde_json::Value, ShardJobError> {
    let url = first_mirror_url(mirror_base_urls, subdir_path, filename).ok_or_else(|| ShardJobError::Fetch {
        channel: job.channel.clone(),
        platform: job.platform.clone(),
        source: mahoraga_client::ClientError::CacheMissRequired {
            url: format!("{}/{subdir_path}/{filename}", job.channel),
        },
    })?;

    let response = client.get(&url, CacheAction::NoCache).await.map_err(|source| ShardJobError::Fetch {
        channel: job.channel.clone(),
        platform: job.platform.clone(),
        source,
    })?;

    serde_json::from_slice(&response.body).map_err(|source| ShardJobError::Parse {
        channel: job.channel.clone(),
        platform: job.platform.clone(),
        source,
    })
}

fn first_mirror_url(mirror_base_urls: &[String], subdir_path: &str, filename: &str) -> Option<Url> {
    let base = mirror_base_urls.first()?;
    let base = base.trim_end_matches('/');
    Url::parse(&format!("{base}/{subdir_path}/{filename}")).ok()
}

/// Splits `repodata.json`'s `packages` and `packages.conda` maps by the
/// package name embedded in each entry, so each shard can be built
/// independently.
fn group_by_package_name(repodata: &serde_json::Value, job: &ShardJob) -> Result<IndexMap<String, IndexMap<String, serde_json::Value>>, ShardJobError> {
    let mut by_name: IndexMap<String, IndexMap<String, serde_json::Value>> = IndexMap::new();
    for key in ["packages", "packages.conda"] {
        let Some(entries) = repodata.get(key).and_then(|v| v.as_object()) else {
            continue;
        };
        for (filename, record) in entries {
            let name = record
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ShardJobError::Parse {
                    channel: job.channel.clone(),
                    platform: job.platform.clone(),
                    source: serde_json::Error::io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("record {filename} has no \"name\" field"),
                    )),
                })?
                .to_string();
            by_name.entry(name).or_default().insert(filename.clone(), record.clone());
        }
    }
    Ok(by_name)
}

/// Serializes and zstd-compresses a shard, returning the hex SHA-256 of the
/// *compressed* bytes (the content address shard files are keyed by) along
/// with the bytes themselves. Runs on a blocking thread: msgpack encoding
/// and zstd compression are CPU-bound and spec.md §9 asks that shard work
/// not contend with the I/O-driven event loop.
async fn encode_shard(shard: Shard) -> Result<(String, Vec<u8>), ShardJobError> {
    tokio::task::spawn_blocking(move || {
        let packed = rmp_serde::to_vec_named(&shard).expect("shard serializes to msgpack");
        let compressed = zstd::stream::encode_all(packed.as_slice(), ZSTD_REPODATA_COMPRESSION_LEVEL).expect("zstd compression never fails in-memory");
        let mut hasher = Sha256::new();
        hasher.update(&compressed);
        (hex::encode(hasher.finalize()), compressed)
    })
    .await
    .map_err(|join_error| ShardJobError::Io(std::io::Error::other(join_error)))
}

async fn encode_index(index: ShardIndex) -> Result<Vec<u8>, ShardJobError> {
    tokio::task::spawn_blocking(move || {
        let packed = rmp_serde::to_vec_named(&index).expect("shard index serializes to msgpack");
        zstd::stream::encode_all(packed.as_slice(), ZSTD_REPODATA_COMPRESSION_LEVEL).expect("zstd compression never fails in-memory")
    })
    .await
    .map_err(|join_error| ShardJobError::Io(std::io::Error::other(join_error)))
}

async fn is_present(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0,
        Err(_) => false,
    }
}

/// Writes `bytes` to `path` via a temp file in the same directory and an
/// atomic rename, matching the StreamEngine's own promotion discipline
/// (spec.md §4.5 step 6) so a shard consumer never observes a partial file.
async fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<(), ShardJobError> {
    let dir = path.parent().ok_or_else(|| ShardJobError::Io(std::io::Error::other("cache path has no parent directory")))?;
    tokio::fs::create_dir_all(dir).await.map_err(ShardJobError::Io)?;
    let temp = tempfile::Builder::new()
        .prefix(".mahoraga-shard-")
        .tempfile_in(dir)
        .map_err(ShardJobError::Io)?;
    let (mut file, temp_path) = temp.into_parts();
    use std::io::Write;
    file.write_all(&bytes).map_err(ShardJobError::Io)?;
    file.sync_all().map_err(ShardJobError::Io)?;
    temp_path.persist(path).map_err(|error| ShardJobError::Io(error.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mahoraga_lock::LockRegistry;

    fn sample_repodata() -> serde_json::Value {
        serde_json::json!({
            "info": {"subdir": "linux-64"},
            "packages": {
                "numpy-1.0-0.tar.bz2": {"name": "numpy", "version": "1.0"},
                "numpy-1.1-0.tar.bz2": {"name": "numpy", "version": "1.1"},
            },
            "packages.conda": {
                "scipy-1.0-0.conda": {"name": "scipy", "version": "1.0"},
            },
        })
    }

    async fn spawn_repodata_server(repodata: serde_json::Value, with_run_exports: bool) -> String {
        use axum::http::StatusCode;
        use axum::routing::get;
        let app = axum::Router::new()
            .route(
                "/channel/linux-64/repodata.json",
                get(move || {
                    let repodata = repodata.clone();
                    async move { axum::Json(repodata) }
                }),
            )
            .route(
                "/channel/linux-64/run_exports.json.zst",
                get(move || async move {
                    if with_run_exports {
                        (StatusCode::OK, vec![1, 2, 3]).into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                }),
            );
        use axum::response::IntoResponse;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/channel")
    }

    #[tokio::test]
    async fn builds_one_shard_per_package_name_and_an_index() {
        let base = spawn_repodata_server(sample_repodata(), true).await;
        let client = Arc::new(UpstreamClient::new().unwrap());
        let cache_root = tempfile::tempdir().unwrap();

        let job = ShardJob {
            channel: "conda-forge".to_string(),
            platform: "linux-64".to_string(),
            label: None,
        };
        let mut mirrors = HashMap::new();
        mirrors.insert("conda-forge".to_string(), vec![base]);

        run_all(vec![job], mirrors, client, cache_root.path().to_path_buf(), Some(1)).await;

        let output_dir = cache_root.path().join("channels/conda-forge/linux-64");
        assert!(output_dir.join("repodata_shards.msgpack.zst").exists());
        assert!(output_dir.join("run_exports.json.zst").exists());

        let shards_dir = output_dir.join("shards");
        let mut shard_files: Vec<_> = std::fs::read_dir(&shards_dir).unwrap().map(|e| e.unwrap().path()).collect();
        shard_files.sort();
        // numpy and scipy: two distinct package names, two distinct shards.
        assert_eq!(shard_files.len(), 2);

        let index_bytes = tokio::fs::read(output_dir.join("repodata_shards.msgpack.zst")).await.unwrap();
        let decompressed = zstd::stream::decode_all(index_bytes.as_slice()).unwrap();
        let index: ShardIndex = rmp_serde::from_slice(&decompressed).unwrap();
        assert_eq!(index.shards.len(), 2);
        assert!(index.shards.contains_key("numpy"));
        assert!(index.shards.contains_key("scipy"));

        // the public loaders used by the conda route adapter round-trip the
        // same files this job just wrote.
        let loaded_index = load_index(&output_dir.join("repodata_shards.msgpack.zst")).await.unwrap();
        assert_eq!(loaded_index.shards.len(), 2);
        let numpy_hash = loaded_index.shards.get("numpy").unwrap();
        let shard = load_shard(&shards_dir.join(format!("{numpy_hash}.msgpack.zst"))).await.unwrap();
        assert!(shard.records.contains_key("numpy-1.0-0.tar.bz2"));
        assert!(shard.records.contains_key("numpy-1.1-0.tar.bz2"));
    }

    #[tokio::test]
    async fn missing_run_exports_sidecar_does_not_fail_the_job() {
        let base = spawn_repodata_server(sample_repodata(), false).await;
        let client = Arc::new(UpstreamClient::new().unwrap());
        let cache_root = tempfile::tempdir().unwrap();

        let job = ShardJob {
            channel: "conda-forge".to_string(),
            platform: "linux-64".to_string(),
            label: None,
        };
        let mut mirrors = HashMap::new();
        mirrors.insert("conda-forge".to_string(), vec![base]);

        run_all(vec![job], mirrors, client, cache_root.path().to_path_buf(), None).await;

        let output_dir = cache_root.path().join("channels/conda-forge/linux-64");
        assert!(output_dir.join("repodata_shards.msgpack.zst").exists());
        assert!(!output_dir.join("run_exports.json.zst").exists());
    }

    #[tokio::test]
    async fn one_job_failing_does_not_stop_another() {
        let base = spawn_repodata_server(sample_repodata(), true).await;
        let client = Arc::new(UpstreamClient::new().unwrap());
        let cache_root = tempfile::tempdir().unwrap();

        let good_job = ShardJob {
            channel: "conda-forge".to_string(),
            platform: "linux-64".to_string(),
            label: None,
        };
        let bad_job = ShardJob {
            channel: "nonexistent-channel".to_string(),
            platform: "linux-64".to_string(),
            label: None,
        };
        let mut mirrors = HashMap::new();
        mirrors.insert("conda-forge".to_string(), vec![base]);
        // nonexistent-channel intentionally has no mirror entry, so its
        // fetch fails fast with no network access at all.

        run_all(vec![bad_job, good_job], mirrors, client, cache_root.path().to_path_buf(), Some(2)).await;

        let good_output = cache_root.path().join("channels/conda-forge/linux-64/repodata_shards.msgpack.zst");
        assert!(good_output.exists());
        let _unused = LockRegistry::new();
    }
}

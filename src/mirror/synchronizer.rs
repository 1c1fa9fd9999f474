//! Dataset synchronization
//!
//! Downloads a cloud's dataset and atomically replaces the local copy.

use futures::future::join_all;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cloud::CloudEnvironment;
use super::resolver::{DownloadUrlResolver, HtmlAnchorResolver};
use super::types::{Dataset, MirrorError, SyncAction, SyncOutcome};
use crate::config::MirrorConfig;

/// Fetches datasets and writes them under the data directory
pub struct DatasetSynchronizer {
    http_client: Client,
    resolver: Arc<dyn DownloadUrlResolver>,
    data_dir: PathBuf,
}

impl DatasetSynchronizer {
    /// Create a synchronizer using the HTML anchor resolver
    pub fn new(config: &MirrorConfig) -> Result<Self, MirrorError> {
        let http_client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| MirrorError::Sync {
                status: None,
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let resolver = Arc::new(HtmlAnchorResolver::new(http_client.clone()));
        Ok(Self::with_resolver(http_client, resolver, &config.data_dir))
    }

    /// Create a synchronizer with a custom download URL resolver
    pub fn with_resolver(
        http_client: Client,
        resolver: Arc<dyn DownloadUrlResolver>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http_client,
            resolver,
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn dataset_path(&self, env: &CloudEnvironment) -> PathBuf {
        env.dataset_path(&self.data_dir)
    }

    /// Download the current dataset for `env` and replace the local file
    ///
    /// The body must parse as a dataset before anything is written, and the
    /// file is replaced by rename so readers never see a partial write.
    pub async fn sync(&self, env: &CloudEnvironment) -> Result<SyncOutcome, MirrorError> {
        info!(cloud = %env.name, "Starting dataset sync");

        let download_url = self.resolver.resolve_download_url(&env.discovery_url).await?;

        let response = self.http_client.get(&download_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Sync {
                status: Some(status.as_u16()),
                message: format!("download {} returned {}", download_url, status),
            });
        }

        let body = response.bytes().await?;
        let path = self.dataset_path(env);

        let dataset = Dataset::from_slice(&body, Path::new(&download_url))?;
        if dataset.cloud_name != env.name {
            debug!(
                cloud = %env.name,
                dataset_cloud = %dataset.cloud_name,
                "Dataset cloud name differs from environment name"
            );
        }

        let previous = read_existing(&path).await?;
        if let Some(previous) = &previous {
            if previous.as_slice() == body.as_ref() {
                info!(
                    cloud = %env.name,
                    change_number = dataset.change_number,
                    "Dataset unchanged"
                );
                return Ok(SyncOutcome {
                    action: SyncAction::Unchanged,
                    change_number: dataset.change_number,
                });
            }

            if let Ok(old) = Dataset::from_slice(previous, &path) {
                if dataset.change_number < old.change_number {
                    warn!(
                        cloud = %env.name,
                        previous = old.change_number,
                        current = dataset.change_number,
                        "Change number decreased"
                    );
                }
            }
        }

        write_atomic(&path, &body).await?;

        info!(
            cloud = %env.name,
            change_number = dataset.change_number,
            services = dataset.services.len(),
            bytes = body.len(),
            path = %path.display(),
            "Dataset updated"
        );

        Ok(SyncOutcome {
            action: SyncAction::Updated,
            change_number: dataset.change_number,
        })
    }

    /// Sync every environment independently
    ///
    /// Results come back in input order; one failure does not affect others.
    pub async fn sync_all(
        &self,
        envs: &[CloudEnvironment],
    ) -> Vec<(String, Result<SyncOutcome, MirrorError>)> {
        let results = join_all(envs.iter().map(|env| self.sync(env))).await;

        envs.iter()
            .zip(results)
            .map(|(env, result)| {
                if let Err(e) = &result {
                    warn!(cloud = %env.name, error = %e, "Dataset sync failed");
                }
                (env.name.clone(), result)
            })
            .collect()
    }
}

async fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, MirrorError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MirrorError::io("Failed to read", path, e)),
    }
}

/// Write `bytes` to a temp file next to `path`, then rename it over `path`
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MirrorError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| MirrorError::io("Failed to create directory", &dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let temp_path = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    if let Err(e) = write_and_flush(&temp_path, bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(MirrorError::io("Failed to replace", path, e));
    }

    Ok(())
}

async fn write_and_flush(path: &Path, bytes: &[u8]) -> Result<(), MirrorError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| MirrorError::io("Failed to create", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| MirrorError::io("Failed to write", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| MirrorError::io("Failed to flush", path, e))?;
    Ok(())
}

//! Dataset store
//!
//! Loads mirrored datasets into immutable snapshots, populating a cloud
//! lazily on first access. Concurrent syncs of the same cloud are coalesced:
//! the first caller starts the download and everyone else awaits that same
//! result.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::cloud::CloudEnvironment;
use super::query::ServiceIndex;
use super::synchronizer::DatasetSynchronizer;
use super::types::{Dataset, MirrorError, SyncOutcome, SyncReport};

type SharedSync = Shared<BoxFuture<'static, Result<SyncOutcome, MirrorError>>>;

/// Loaded index tagged with the load that produced it
///
/// Generations are taken before the file is read, so a higher generation
/// always saw a file at least as new as a lower one.
struct Snapshot {
    generation: u64,
    index: Arc<ServiceIndex>,
}

/// Cached dataset snapshots keyed by cloud name
pub struct DatasetStore {
    synchronizer: Arc<DatasetSynchronizer>,
    in_flight: Mutex<HashMap<String, SharedSync>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
    generation: AtomicU64,
}

impl DatasetStore {
    pub fn new(synchronizer: DatasetSynchronizer) -> Self {
        Self {
            synchronizer: Arc::new(synchronizer),
            in_flight: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn synchronizer(&self) -> &DatasetSynchronizer {
        &self.synchronizer
    }

    pub fn dataset_path(&self, env: &CloudEnvironment) -> PathBuf {
        self.synchronizer.dataset_path(env)
    }

    /// Current dataset for `env`, syncing first if nothing is stored locally
    pub async fn get_dataset(&self, env: &CloudEnvironment) -> Result<Arc<Dataset>, MirrorError> {
        let index = self.get_index(env).await?;
        Ok(Arc::clone(index.dataset()))
    }

    /// Indexed snapshot for `env`, loading it if needed
    pub async fn get_index(&self, env: &CloudEnvironment) -> Result<Arc<ServiceIndex>, MirrorError> {
        if let Some(snapshot) = self.snapshots.read().await.get(&env.name) {
            return Ok(Arc::clone(&snapshot.index));
        }

        if let Some(flight) = self.flight_if_missing(env).await {
            debug!(cloud = %env.name, "No local dataset, waiting for sync");
            self.finish(env, flight).await?;
        }

        self.reload(env).await
    }

    /// Sync `env` now and swap in the new snapshot
    ///
    /// Joins a sync that is already running for the same cloud.
    pub async fn update(&self, env: &CloudEnvironment) -> Result<SyncOutcome, MirrorError> {
        let flight = self.flight(env).await;
        let outcome = self.finish(env, flight).await?;
        self.reload(env).await?;
        Ok(outcome)
    }

    /// Update several clouds concurrently, one report per cloud
    pub async fn update_all(&self, envs: &[CloudEnvironment]) -> Vec<SyncReport> {
        let results = join_all(envs.iter().map(|env| self.update(env))).await;

        envs.iter()
            .zip(results.iter())
            .map(|(env, result)| {
                if let Err(e) = result {
                    warn!(cloud = %env.name, error = %e, "Update failed");
                }
                SyncReport::from_result(&env.name, result)
            })
            .collect()
    }

    /// Attach to the in-flight sync for `env` or start one
    async fn flight(&self, env: &CloudEnvironment) -> SharedSync {
        let mut in_flight = self.in_flight.lock().await;
        self.join_or_start(&mut in_flight, env)
    }

    /// Like [`Self::flight`], but `None` when the dataset file already exists
    ///
    /// The existence check runs under the flight map lock, and a flight is
    /// only removed after its rename, so a caller either sees the file or
    /// joins the flight.
    async fn flight_if_missing(&self, env: &CloudEnvironment) -> Option<SharedSync> {
        let mut in_flight = self.in_flight.lock().await;
        prune_completed(&mut in_flight, &env.name);

        if !in_flight.contains_key(&env.name) && file_exists(&self.dataset_path(env)).await {
            return None;
        }
        Some(self.join_or_start(&mut in_flight, env))
    }

    fn join_or_start(
        &self,
        in_flight: &mut HashMap<String, SharedSync>,
        env: &CloudEnvironment,
    ) -> SharedSync {
        prune_completed(in_flight, &env.name);

        if let Some(flight) = in_flight.get(&env.name) {
            debug!(cloud = %env.name, "Joining in-flight sync");
            return flight.clone();
        }

        let synchronizer = Arc::clone(&self.synchronizer);
        let target = env.clone();
        let flight = async move { synchronizer.sync(&target).await }
            .boxed()
            .shared();

        in_flight.insert(env.name.clone(), flight.clone());
        flight
    }

    async fn finish(&self, env: &CloudEnvironment, flight: SharedSync) -> Result<SyncOutcome, MirrorError> {
        let result = flight.clone().await;

        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(&env.name)
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            in_flight.remove(&env.name);
        }

        result
    }

    /// Read the file for `env` and replace the cached snapshot
    async fn reload(&self, env: &CloudEnvironment) -> Result<Arc<ServiceIndex>, MirrorError> {
        let generation = self.next_generation();
        let dataset = load_dataset(&self.dataset_path(env)).await?;
        let index = Arc::new(ServiceIndex::new(Arc::new(dataset)));
        Ok(self.install(env, generation, index).await)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Cache `index` unless a later load already did; returns the cached index
    async fn install(
        &self,
        env: &CloudEnvironment,
        generation: u64,
        index: Arc<ServiceIndex>,
    ) -> Arc<ServiceIndex> {
        let mut snapshots = self.snapshots.write().await;

        if let Some(current) = snapshots.get(&env.name) {
            if current.generation > generation {
                debug!(
                    cloud = %env.name,
                    stale = index.change_number(),
                    cached = current.index.change_number(),
                    "Discarding load overtaken by a newer one"
                );
                return Arc::clone(&current.index);
            }
            if index.change_number() < current.index.change_number() {
                warn!(
                    cloud = %env.name,
                    previous = current.index.change_number(),
                    current = index.change_number(),
                    "Loaded dataset has a lower change number than the cached one"
                );
            }
        }

        snapshots.insert(
            env.name.clone(),
            Snapshot {
                generation,
                index: Arc::clone(&index),
            },
        );

        info!(
            cloud = %env.name,
            change_number = index.change_number(),
            prefixes = index.prefix_count(),
            "Dataset loaded"
        );
        index
    }
}

/// Drop a finished flight whose waiters all went away before removing it
fn prune_completed(in_flight: &mut HashMap<String, SharedSync>, cloud: &str) {
    if in_flight.get(cloud).is_some_and(|flight| flight.peek().is_some()) {
        debug!(cloud = %cloud, "Dropping completed sync left behind by cancelled callers");
        in_flight.remove(cloud);
    }
}

/// Read and deserialize a dataset file
pub async fn load_dataset(path: &Path) -> Result<Dataset, MirrorError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| MirrorError::io("Failed to read", path, e))?;
    Dataset::from_slice(&bytes, path)
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::resolver::DownloadUrlResolver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Resolver that counts calls and always fails
    struct FailingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DownloadUrlResolver for FailingResolver {
        async fn resolve_download_url(&self, discovery_url: &str) -> Result<String, MirrorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Err(MirrorError::Resolution {
                url: discovery_url.to_string(),
                message: "download link not found in page".to_string(),
            })
        }
    }

    fn store_with(dir: &Path, resolver: Arc<FailingResolver>) -> DatasetStore {
        let synchronizer =
            DatasetSynchronizer::with_resolver(reqwest::Client::new(), resolver, dir);
        DatasetStore::new(synchronizer)
    }

    fn env() -> CloudEnvironment {
        CloudEnvironment::new("Public", "http://127.0.0.1:9/discovery", "data_Public.json")
    }

    #[tokio::test]
    async fn test_existing_file_loads_without_sync() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("data_Public.json"),
            r#"{"changeNumber": 5, "cloud": "Public", "values": []}"#,
        )
        .unwrap();

        let resolver = Arc::new(FailingResolver { calls: AtomicUsize::new(0) });
        let store = store_with(dir.path(), Arc::clone(&resolver));

        let dataset = store.get_dataset(&env()).await.unwrap();
        assert_eq!(dataset.change_number, 5);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("data_Public.json"), "{ not json").unwrap();

        let resolver = Arc::new(FailingResolver { calls: AtomicUsize::new(0) });
        let store = store_with(dir.path(), resolver);

        let err = store.get_dataset(&env()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_lazy_sync_failure_is_shared_and_surfaced() {
        let dir = tempdir().unwrap();
        let resolver = Arc::new(FailingResolver { calls: AtomicUsize::new(0) });
        let store = Arc::new(store_with(dir.path(), Arc::clone(&resolver)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.get_dataset(&env()).await })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, MirrorError::Resolution { .. }));
        }

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert!(store.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_cached_snapshot() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("data_Public.json"),
            r#"{"changeNumber": 9, "cloud": "Public", "values": []}"#,
        )
        .unwrap();

        let resolver = Arc::new(FailingResolver { calls: AtomicUsize::new(0) });
        let store = store_with(dir.path(), resolver);

        let before = store.get_dataset(&env()).await.unwrap();
        let reports = store.update_all(&[env()]).await;

        assert_eq!(reports.len(), 1);
        assert!(!reports[0].success);

        let after = store.get_dataset(&env()).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_stale_load_does_not_replace_newer_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_Public.json");
        std::fs::write(&path, r#"{"changeNumber": 1, "cloud": "Public", "values": []}"#).unwrap();

        let resolver = Arc::new(FailingResolver { calls: AtomicUsize::new(0) });
        let store = store_with(dir.path(), resolver);

        // A cold reader starts loading the old file...
        let slow_generation = store.next_generation();
        let old = load_dataset(&path).await.unwrap();

        // ...while a refresh replaces the file and installs the new snapshot
        std::fs::write(&path, r#"{"changeNumber": 2, "cloud": "Public", "values": []}"#).unwrap();
        let fresh = store.reload(&env()).await.unwrap();
        assert_eq!(fresh.change_number(), 2);

        let returned = store
            .install(&env(), slow_generation, Arc::new(ServiceIndex::new(Arc::new(old))))
            .await;
        assert_eq!(returned.change_number(), 2);
        assert_eq!(store.get_dataset(&env()).await.unwrap().change_number, 2);
    }

    #[tokio::test]
    async fn test_sync_abandoned_by_cancelled_caller_is_not_reused() {
        let dir = tempdir().unwrap();
        let resolver = Arc::new(FailingResolver { calls: AtomicUsize::new(0) });
        let store = Arc::new(store_with(dir.path(), Arc::clone(&resolver)));

        let task = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.update(&env()).await })
        };

        // Let the flight register, then hold the map until the sync is done
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let guard = store.in_flight.lock().await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        task.abort();
        let _ = task.await;
        drop(guard);

        assert_eq!(store.in_flight.lock().await.len(), 1);

        let err = store.update(&env()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Resolution { .. }));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert!(store.in_flight.lock().await.is_empty());
    }
}

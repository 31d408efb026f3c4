//! Coordinator for the raw DICOM cache.
//!
//! The store itself receives C-STOREs and persists instances; this
//! coordinator owns the behaviour around it: waiting for studies to become
//! stable, repairing transfers that delivered fewer instances than the
//! source advertised, recycling-LRU eviction bounded by a byte ceiling with
//! pinning of in-progress studies, and observer notification.

use sources::{SourceClient, SourceError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stores::{DicomStore, InstanceInfo, StoreError, StudyInfo};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("study {study_uid} did not stabilise within {waited:?}")]
    Unstable {
        study_uid: String,
        waited: Duration,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("operation cancelled")]
    Cancelled,
}

/// Callbacks for cache lifecycle events. What the original store raised as
/// embedded callbacks is reified here; the coordinator owns the lifecycle.
#[async_trait::async_trait]
pub trait CacheObserver: Send + Sync {
    async fn on_instance_stored(&self, _study_uid: &str, _sop_uid: &str) {}
    async fn on_study_stable(&self, _study_uid: &str) {}
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cadence of stability probes.
    pub stable_poll: Duration,
    /// Upper bound on one stability wait.
    pub stable_wait_timeout: Duration,
    /// Byte ceiling (in MB) before LRU eviction kicks in; 0 disables.
    pub max_storage_mb: u64,
    /// Attempts for transient instance reads.
    pub read_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            stable_poll: Duration::from_secs(2),
            stable_wait_timeout: Duration::from_secs(600),
            max_storage_mb: 0,
            read_attempts: 3,
        }
    }
}

#[derive(Default)]
struct LruState {
    clock: u64,
    touched: HashMap<String, u64>,
    pins: HashMap<String, u32>,
    seen: HashSet<(String, String)>,
}

pub struct RawCache {
    store: Arc<dyn DicomStore>,
    config: CacheConfig,
    lru: Arc<Mutex<LruState>>,
    observers: Vec<Arc<dyn CacheObserver>>,
}

/// Pins a study against eviction for as long as it is held.
pub struct PinGuard {
    lru: Arc<Mutex<LruState>>,
    id: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut lru = self.lru.lock().unwrap();
        if let Some(count) = lru.pins.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                lru.pins.remove(&self.id);
            }
        }
    }
}

impl RawCache {
    pub fn new(store: Arc<dyn DicomStore>, config: CacheConfig) -> Self {
        RawCache {
            store,
            config,
            lru: Arc::new(Mutex::new(LruState::default())),
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn store(&self) -> &Arc<dyn DicomStore> {
        &self.store
    }

    pub fn pin(&self, id: &str) -> PinGuard {
        let mut lru = self.lru.lock().unwrap();
        *lru.pins.entry(id.to_string()).or_insert(0) += 1;
        PinGuard {
            lru: self.lru.clone(),
            id: id.to_string(),
        }
    }

    fn touch(&self, id: &str) {
        let mut lru = self.lru.lock().unwrap();
        lru.clock += 1;
        let clock = lru.clock;
        lru.touched.insert(id.to_string(), clock);
    }

    /// Resolve the local identifier of a study by StudyInstanceUID.
    pub async fn find_study(&self, study_uid: &str) -> Result<Option<String>, CacheError> {
        Ok(self.store.find_study(study_uid).await?)
    }

    /// Wait until the store reports the study stable, or until the instance
    /// count matches the source's advertised count when one is known.
    pub async fn wait_stable(
        &self,
        id: &str,
        expected_instances: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<StudyInfo, CacheError> {
        self.touch(id);
        let started = tokio::time::Instant::now();
        loop {
            let info = self.store.study_info(id).await?;
            let complete =
                expected_instances.is_some_and(|expected| info.instance_count >= expected);
            if info.is_stable || complete {
                for observer in &self.observers {
                    observer.on_study_stable(&info.study_uid).await;
                }
                return Ok(info);
            }

            if started.elapsed() >= self.config.stable_wait_timeout {
                return Err(CacheError::Unstable {
                    study_uid: info.study_uid,
                    waited: started.elapsed(),
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(CacheError::Cancelled),
                () = tokio::time::sleep(self.config.stable_poll) => {}
            }
        }
    }

    /// Verify the cache holds everything the source advertised; reissue an
    /// image-level C-MOVE for any missing SOPInstanceUIDs (single round).
    /// Returns the final instance listing.
    pub async fn ensure_complete(
        &self,
        source: &SourceClient,
        id: &str,
        study_uid: &str,
        expected_instances: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstanceInfo>, CacheError> {
        self.touch(id);
        let present = self.store.study_instances(id).await?;
        let missing_count = match expected_instances {
            Some(expected) if (present.len() as u32) < expected => {
                expected - present.len() as u32
            }
            _ => {
                self.notify_stored(study_uid, &present).await;
                return Ok(present);
            }
        };

        let held: HashSet<&str> = present.iter().map(|i| i.sop_uid.as_str()).collect();
        let advertised = source.find_instance_uids(study_uid, cancel).await?;
        let missing: Vec<String> = advertised
            .into_iter()
            .filter(|sop| !held.contains(sop.as_str()))
            .collect();
        tracing::warn!(
            study_uid,
            missing = missing.len(),
            short_by = missing_count,
            "repairing incomplete transfer",
        );
        source
            .retrieve_instances(study_uid, &missing, cancel)
            .await?;

        let repaired = self.store.study_instances(id).await?;
        self.notify_stored(study_uid, &repaired).await;
        Ok(repaired)
    }

    async fn notify_stored(&self, study_uid: &str, instances: &[InstanceInfo]) {
        if self.observers.is_empty() {
            return;
        }
        let fresh: Vec<String> = {
            let mut lru = self.lru.lock().unwrap();
            instances
                .iter()
                .filter(|i| {
                    lru.seen
                        .insert((study_uid.to_string(), i.sop_uid.clone()))
                })
                .map(|i| i.sop_uid.clone())
                .collect()
        };
        for sop_uid in fresh {
            for observer in &self.observers {
                observer.on_instance_stored(study_uid, &sop_uid).await;
            }
        }
    }

    /// Fetch one instance, retrying transient read failures.
    pub async fn instance_bytes(&self, instance_id: &str) -> Result<Vec<u8>, CacheError> {
        let mut last = None;
        for attempt in 1..=self.config.read_attempts {
            match self.store.instance_bytes(instance_id).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    tracing::warn!(instance_id, attempt, error = %err, "cache read failed");
                    last = Some(err);
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
            }
        }
        Err(CacheError::Store(last.expect("at least one attempt")))
    }

    /// Evict least-recently-used unpinned studies until the store is back
    /// under its byte ceiling. In-progress (pinned) studies are never
    /// evicted; untouched studies count as oldest.
    pub async fn evict_for_headroom(&self) -> Result<(), CacheError> {
        if self.config.max_storage_mb == 0 {
            return Ok(());
        }
        loop {
            let stats = self.store.statistics().await?;
            if stats.total_disk_size_mb < self.config.max_storage_mb {
                return Ok(());
            }

            let mut studies = self.store.list_studies().await?;
            let candidate = {
                let lru = self.lru.lock().unwrap();
                studies.retain(|id| !lru.pins.contains_key(id));
                studies
                    .into_iter()
                    .min_by_key(|id| lru.touched.get(id).copied().unwrap_or(0))
            };
            let Some(victim) = candidate else {
                tracing::warn!("cache over its byte ceiling but every study is pinned");
                return Ok(());
            };

            tracing::info!(study = %victim, "evicting least-recently-used study");
            self.store.delete_study(&victim).await?;
            self.lru.lock().unwrap().touched.remove(&victim);
        }
    }
}

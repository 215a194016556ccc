//! Fingerprint-keyed result cache with single-flight claims.
//!
//! Entries live at `cache/entries/{digest}.json` and are visible only while
//! `now < expires_at`. Expired entries are deleted lazily on lookup or in
//! bulk by [`CacheIndex::sweep`].
//!
//! Single-flight uses a put-if-absent claim at `cache/inflight/{digest}.json`
//! naming the task that owns the computation. Concurrent submitters of the
//! same fingerprint join the owner's task instead of generating again. A
//! claim is taken over (version-matched write) when its owner:
//! - failed or was cancelled,
//! - completed but its entry is gone (expired or swept),
//! - still has no task record after the claim grace period.
//!
//! Every storage failure surfaces as [`Error::CacheUnavailable`]; callers
//! degrade to a miss.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use spool_core::{SpoolPaths, StorageBackend, TaskId, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::fingerprint::digest;
use crate::metrics::FlowMetrics;
use crate::registry::TaskRegistry;
use crate::task::TaskStatus;

/// Default entry time-to-live.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default time a claim may exist without its owner's task record.
pub const DEFAULT_CLAIM_GRACE: Duration = Duration::from_secs(30);

const MAX_CLAIM_CONFLICTS: u32 = 16;
const CLAIM_POLL: Duration = Duration::from_millis(50);

/// A cached final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Request fingerprint.
    pub fingerprint: String,
    /// Complete generated text.
    pub final_text: String,
    /// When the entry was stored.
    pub created_at: DateTime<Utc>,
    /// When the entry stops being visible.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Returns true if the entry is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Unexpired entries currently stored.
    pub entries: u64,
    /// Expired entries removed.
    pub evictions: u64,
}

/// The single-flight owner of a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InflightClaim {
    /// Request fingerprint.
    pub fingerprint: String,
    /// Owning task.
    pub task_id: TaskId,
    /// When the claim was written.
    pub claimed_at: DateTime<Utc>,
}

/// Outcome of a single-flight claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the computation.
    Leader,
    /// Another task owns the computation; follow it.
    Joined(TaskId),
}

/// How a claim's owner looks to a later claimant.
enum OwnerState {
    /// Running, or completed with its entry still cached.
    Live,
    /// No task record yet, within the grace period.
    Pending,
    /// Failed, cancelled, completed without an entry, or never recorded.
    Stale,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// The result cache.
#[derive(Clone)]
pub struct CacheIndex {
    storage: Arc<dyn StorageBackend>,
    registry: TaskRegistry,
    claim_grace: Duration,
    counters: Arc<Counters>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for CacheIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheIndex")
            .field("claim_grace", &self.claim_grace)
            .finish_non_exhaustive()
    }
}

impl CacheIndex {
    /// Creates a cache index. The registry is consulted to judge claims.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, registry: TaskRegistry) -> Self {
        Self {
            storage,
            registry,
            claim_grace: DEFAULT_CLAIM_GRACE,
            counters: Arc::new(Counters::default()),
            metrics: FlowMetrics::new(),
        }
    }

    /// Sets the claim grace period.
    #[must_use]
    pub const fn with_claim_grace(mut self, grace: Duration) -> Self {
        self.claim_grace = grace;
        self
    }

    /// Returns the unexpired entry for `fingerprint`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let result = self.lookup_inner(fingerprint).await;
        let label = match &result {
            Ok(Some(_)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                "hit"
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                "miss"
            }
            Err(_) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                "error"
            }
        };
        self.metrics.record_cache_lookup(label);
        result
    }

    async fn lookup_inner(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let path = SpoolPaths::cache_entry(digest(fingerprint)?);
        let Some(entry) = self.load::<CacheEntry>(&path).await? else {
            return Ok(None);
        };
        if entry.is_expired_at(Utc::now()) {
            self.evict(&path).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Stores (or overwrites) the entry for `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn store(&self, fingerprint: &str, final_text: &str, ttl: Duration) -> Result<()> {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            final_text: final_text.to_string(),
            created_at,
            expires_at,
        };
        self.storage
            .put(
                &SpoolPaths::cache_entry(digest(fingerprint)?),
                encode(&entry)?,
                WritePrecondition::None,
            )
            .await
            .map_err(unavailable)?;
        tracing::debug!(fingerprint, %expires_at, "cache entry stored");
        Ok(())
    }

    /// Deletes every expired entry, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn sweep(&self) -> Result<u64> {
        let now = Utc::now();
        let mut removed = 0;
        for meta in self.list_entries().await? {
            if let Some(entry) = self.load::<CacheEntry>(&meta.path).await? {
                if entry.is_expired_at(now) {
                    self.evict(&meta.path).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }

    /// Returns the cache counters.
    ///
    /// Hits, misses and evictions count this process's lookups; `entries`
    /// counts unexpired entries in storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn stats(&self) -> Result<CacheStats> {
        let now = Utc::now();
        let mut entries = 0;
        for meta in self.list_entries().await? {
            if self
                .load::<CacheEntry>(&meta.path)
                .await?
                .is_some_and(|entry| !entry.is_expired_at(now))
            {
                entries += 1;
            }
        }
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        })
    }

    /// Claims single-flight ownership of `fingerprint` for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage or the registry fails.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn claim(&self, fingerprint: &str, task_id: TaskId) -> Result<ClaimOutcome> {
        let path = SpoolPaths::inflight_claim(digest(fingerprint)?);
        let claim = InflightClaim {
            fingerprint: fingerprint.to_string(),
            task_id,
            claimed_at: Utc::now(),
        };
        let bytes = encode(&claim)?;

        let mut conflicts = 0;
        while conflicts < MAX_CLAIM_CONFLICTS {
            if self
                .storage
                .put(&path, bytes.clone(), WritePrecondition::DoesNotExist)
                .await
                .map_err(unavailable)?
                .is_success()
            {
                self.metrics.record_singleflight("leader");
                return Ok(ClaimOutcome::Leader);
            }

            let Some(meta) = self.storage.head(&path).await.map_err(unavailable)? else {
                conflicts += 1;
                continue;
            };
            let Some(existing) = self.load::<InflightClaim>(&path).await? else {
                conflicts += 1;
                continue;
            };
            if existing.task_id == task_id {
                return Ok(ClaimOutcome::Leader);
            }

            match self.owner_state(&existing).await? {
                OwnerState::Live => {
                    self.metrics.record_singleflight("joined");
                    return Ok(ClaimOutcome::Joined(existing.task_id));
                }
                OwnerState::Pending => {
                    tokio::time::sleep(CLAIM_POLL).await;
                    continue;
                }
                OwnerState::Stale => {}
            }

            match self
                .storage
                .put(&path, bytes.clone(), WritePrecondition::MatchesVersion(meta.version))
                .await
                .map_err(unavailable)?
            {
                WriteResult::Success { .. } => {
                    tracing::info!(previous_owner = %existing.task_id, "took over stale single-flight claim");
                    self.metrics.record_singleflight("takeover");
                    return Ok(ClaimOutcome::Leader);
                }
                WriteResult::PreconditionFailed { .. } => conflicts += 1,
            }
        }

        Err(Error::CacheUnavailable {
            message: format!("single-flight claim for {fingerprint} contended"),
        })
    }

    /// Releases the claim if `task_id` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn release_claim(&self, fingerprint: &str, task_id: &TaskId) -> Result<()> {
        let path = SpoolPaths::inflight_claim(digest(fingerprint)?);
        match self.load::<InflightClaim>(&path).await? {
            Some(claim) if claim.task_id == *task_id => {
                self.storage.delete(&path).await.map_err(unavailable)?;
                tracing::debug!(task_id = %task_id, "released single-flight claim");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns the current claim on `fingerprint`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn current_claim(&self, fingerprint: &str) -> Result<Option<InflightClaim>> {
        self.load(&SpoolPaths::inflight_claim(digest(fingerprint)?))
            .await
    }

    async fn owner_state(&self, claim: &InflightClaim) -> Result<OwnerState> {
        let owner = self
            .registry
            .find(&claim.task_id)
            .await
            .map_err(unavailable_from)?;
        Ok(match owner.map(|task| task.status) {
            Some(TaskStatus::Failed | TaskStatus::Cancelled) => OwnerState::Stale,
            Some(TaskStatus::Completed) => {
                if self.lookup_inner(&claim.fingerprint).await?.is_some() {
                    OwnerState::Live
                } else {
                    OwnerState::Stale
                }
            }
            Some(_) => OwnerState::Live,
            None => {
                let age = (Utc::now() - claim.claimed_at).to_std().unwrap_or_default();
                if age <= self.claim_grace {
                    OwnerState::Pending
                } else {
                    OwnerState::Stale
                }
            }
        })
    }

    async fn evict(&self, path: &str) -> Result<()> {
        self.storage.delete(path).await.map_err(unavailable)?;
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache_evictions(1);
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<spool_core::ObjectMeta>> {
        self.storage
            .list(SpoolPaths::cache_entries_prefix())
            .await
            .map_err(unavailable)
    }

    async fn load<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.storage.get(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| Error::CacheUnavailable {
                    message: format!("corrupt cache object {path}: {e}"),
                }),
            Err(spool_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable(err: spool_core::Error) -> Error {
    Error::CacheUnavailable {
        message: err.to_string(),
    }
}

fn unavailable_from(err: Error) -> Error {
    match err {
        Error::CacheUnavailable { .. } => err,
        other => Error::CacheUnavailable {
            message: other.to_string(),
        },
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Error::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{GenerationParams, StatusUpdate, Task};
    use spool_core::MemoryBackend;

    const FP: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn cache() -> (CacheIndex, TaskRegistry) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let registry = TaskRegistry::new(storage.clone());
        (CacheIndex::new(storage, registry.clone()), registry)
    }

    async fn create_task(registry: &TaskRegistry) -> Task {
        let task = Task::new(
            TaskId::generate(),
            FP,
            GenerationParams {
                prompt: "Hello".into(),
                provider: "echo".into(),
                model: "echo-1".into(),
                temperature_milli: 700,
                max_tokens: 4000,
            },
        );
        registry.create(&task).await.expect("create");
        task
    }

    #[tokio::test]
    async fn store_then_hit() -> Result<()> {
        let (cache, _) = cache();
        assert!(cache.lookup(FP).await?.is_none());
        cache.store(FP, "Hi there", DEFAULT_CACHE_TTL).await?;
        let entry = cache.lookup(FP).await?.expect("hit");
        assert_eq!(entry.final_text, "Hi there");

        let stats = cache.stats().await?;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_lookup() -> Result<()> {
        let (cache, _) = cache();
        cache.store(FP, "Hi there", Duration::ZERO).await?;
        assert!(cache.lookup(FP).await?.is_none());

        let stats = cache.stats().await?;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.hits, 0);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() -> Result<()> {
        let (cache, _) = cache();
        let other = format!("sha256:{}", "0".repeat(64));
        cache.store(FP, "stale", Duration::ZERO).await?;
        cache.store(&other, "fresh", DEFAULT_CACHE_TTL).await?;

        assert_eq!(cache.sweep().await?, 1);
        assert!(cache.lookup(&other).await?.is_some());
        assert_eq!(cache.stats().await?.entries, 1);
        Ok(())
    }

    #[tokio::test]
    async fn second_claimant_joins_live_owner() -> Result<()> {
        let (cache, registry) = cache();
        let owner = create_task(&registry).await;
        assert_eq!(cache.claim(FP, owner.id).await?, ClaimOutcome::Leader);
        assert_eq!(cache.claim(FP, owner.id).await?, ClaimOutcome::Leader);
        assert_eq!(
            cache.claim(FP, TaskId::generate()).await?,
            ClaimOutcome::Joined(owner.id)
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_owner_claim_is_taken_over() -> Result<()> {
        let (cache, registry) = cache();
        let owner = create_task(&registry).await;
        cache.claim(FP, owner.id).await?;
        registry
            .update_status(&owner.id, StatusUpdate::to(TaskStatus::Failed))
            .await?;

        let successor = TaskId::generate();
        assert_eq!(cache.claim(FP, successor).await?, ClaimOutcome::Leader);
        assert_eq!(
            cache.current_claim(FP).await?.map(|c| c.task_id),
            Some(successor)
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_owner_record_is_taken_over_after_grace() -> Result<()> {
        let (cache, _) = cache();
        let cache = cache.with_claim_grace(Duration::ZERO);
        let ghost = TaskId::generate();
        cache.claim(FP, ghost).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let successor = TaskId::generate();
        assert_eq!(cache.claim(FP, successor).await?, ClaimOutcome::Leader);
        Ok(())
    }

    #[tokio::test]
    async fn release_only_by_owner() -> Result<()> {
        let (cache, registry) = cache();
        let owner = create_task(&registry).await;
        cache.claim(FP, owner.id).await?;

        cache.release_claim(FP, &TaskId::generate()).await?;
        assert!(cache.current_claim(FP).await?.is_some());

        cache.release_claim(FP, &owner.id).await?;
        assert!(cache.current_claim(FP).await?.is_none());
        Ok(())
    }
}

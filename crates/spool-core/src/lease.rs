//! Storage-backed leases giving one worker exclusive control of a task.
//!
//! A lease is a small JSON record written with conditional puts:
//! - **Acquire**: `DoesNotExist` for a fresh lease; an expired lease is taken
//!   over with `MatchesVersion` against the version read alongside it
//! - **Fence**: every acquisition increments `sequence_number`, so a stale
//!   holder is detectable by comparing [`FencingToken`]s
//! - **Extend**: rewrites the record with the version this holder last wrote;
//!   any intervening write by another holder fails the CAS
//! - **Release**: writes an expired record by CAS instead of deleting, so a
//!   late release can never remove a successor's lease
//!
//! A crashed worker simply stops extending; once `expires_at` passes, any
//! other worker may take the lease over.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::WorkerId;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lease TTL (30 seconds).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Lease record contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    /// Worker holding the lease.
    pub holder_id: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Monotonically increasing acquisition counter used for fencing.
    #[serde(default)]
    pub sequence_number: u64,
}

impl LeaseInfo {
    /// Creates a new lease record expiring `ttl` from now.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now + to_chrono(ttl),
            acquired_at: now,
            sequence_number,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Fencing token derived from a lease acquisition.
///
/// A higher token always supersedes a lower one for the same lease path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Returns the raw sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The lease is now held by the caller.
    Acquired(Lease),
    /// Another worker holds an unexpired lease.
    Held {
        /// The current holder.
        holder_id: String,
    },
}

/// Issues leases stored at caller-chosen paths.
#[derive(Clone)]
pub struct LeaseManager {
    storage: Arc<dyn StorageBackend>,
    ttl: Duration,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Creates a lease manager issuing leases with the given TTL.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// Returns the TTL of issued leases.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts to acquire the lease at `path` once, without retrying.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the lease record is unreadable.
    pub async fn try_acquire(&self, path: &str, holder: &WorkerId) -> Result<AcquireOutcome> {
        let fresh = LeaseInfo::new(holder.as_str(), self.ttl, 1);
        match self
            .storage
            .put(path, encode(&fresh)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => {
                return Ok(AcquireOutcome::Acquired(self.guard(path, holder, version, 1)));
            }
            WriteResult::PreconditionFailed { .. } => {}
        }

        // Version first, then contents: the expiry decision is bound to the
        // version used for the takeover CAS.
        let Some(meta) = self.storage.head(path).await? else {
            return Ok(AcquireOutcome::Held {
                holder_id: "race".into(),
            });
        };
        let Some(existing) = read_info(self.storage.as_ref(), path).await? else {
            return Ok(AcquireOutcome::Held {
                holder_id: "race".into(),
            });
        };

        if !existing.is_expired() {
            return Ok(AcquireOutcome::Held {
                holder_id: existing.holder_id,
            });
        }

        let sequence = existing.sequence_number.saturating_add(1);
        let takeover = LeaseInfo::new(holder.as_str(), self.ttl, sequence);
        match self
            .storage
            .put(
                path,
                encode(&takeover)?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => {
                tracing::debug!(
                    path,
                    holder = %holder,
                    previous = %existing.holder_id,
                    sequence,
                    "took over expired lease"
                );
                Ok(AcquireOutcome::Acquired(
                    self.guard(path, holder, version, sequence),
                ))
            }
            WriteResult::PreconditionFailed { .. } => Ok(AcquireOutcome::Held {
                holder_id: "unknown".into(),
            }),
        }
    }

    /// Reads the lease record at `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record is unreadable.
    pub async fn read(&self, path: &str) -> Result<Option<LeaseInfo>> {
        read_info(self.storage.as_ref(), path).await
    }

    fn guard(&self, path: &str, holder: &WorkerId, version: String, sequence: u64) -> Lease {
        Lease {
            storage: Arc::clone(&self.storage),
            path: path.to_string(),
            holder_id: holder.to_string(),
            version,
            fencing_token: FencingToken(sequence),
            ttl: self.ttl,
            released: false,
        }
    }
}

/// A held lease.
///
/// Released on drop (best effort) when not released explicitly.
pub struct Lease {
    storage: Arc<dyn StorageBackend>,
    path: String,
    holder_id: String,
    version: String,
    fencing_token: FencingToken,
    ttl: Duration,
    released: bool,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("path", &self.path)
            .field("holder_id", &self.holder_id)
            .field("fencing_token", &self.fencing_token)
            .finish_non_exhaustive()
    }
}

impl Lease {
    /// Returns the holder ID.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the lease path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the fencing token of this acquisition.
    #[must_use]
    pub const fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Returns the TTL the lease is extended by.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extends the lease by its TTL from now.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` if another holder wrote the lease
    /// since this holder's last write.
    pub async fn extend(&mut self) -> Result<()> {
        let mut info = LeaseInfo::new(&self.holder_id, self.ttl, self.fencing_token.0);
        if let Some(current) = read_info(self.storage.as_ref(), &self.path).await? {
            info.acquired_at = current.acquired_at;
        }

        match self
            .storage
            .put(
                &self.path,
                encode(&info)?,
                WritePrecondition::MatchesVersion(self.version.clone()),
            )
            .await?
        {
            WriteResult::Success { version } => {
                self.version = version;
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                message: format!("lease {} lost by {}", self.path, self.holder_id),
            }),
        }
    }

    /// Explicitly releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails. Losing the lease to another holder
    /// is not an error: their record is left intact.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let expired = expired_record(&self.holder_id, self.fencing_token.0);
        let _ = self
            .storage
            .put(
                &self.path,
                encode(&expired)?,
                WritePrecondition::MatchesVersion(self.version.clone()),
            )
            .await?;
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Without a runtime the TTL handles cleanup.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let storage = Arc::clone(&self.storage);
        let path = self.path.clone();
        let version = self.version.clone();
        let expired = expired_record(&self.holder_id, self.fencing_token.0);
        handle.spawn(async move {
            if let Ok(bytes) = encode(&expired) {
                let _ = storage
                    .put(&path, bytes, WritePrecondition::MatchesVersion(version))
                    .await;
            }
        });
    }
}

fn expired_record(holder_id: &str, sequence_number: u64) -> LeaseInfo {
    let now = Utc::now();
    LeaseInfo {
        holder_id: holder_id.to_string(),
        expires_at: now - chrono::Duration::seconds(1),
        acquired_at: now,
        sequence_number,
    }
}

async fn read_info(storage: &dyn StorageBackend, path: &str) -> Result<Option<LeaseInfo>> {
    match storage.get(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::serialization(format!("parse lease {path}: {e}"))),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn encode(info: &LeaseInfo) -> Result<Bytes> {
    serde_json::to_vec(info)
        .map(Bytes::from)
        .map_err(|e| Error::serialization(format!("serialize lease: {e}")))
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn manager(ttl: Duration) -> (Arc<MemoryBackend>, LeaseManager) {
        let storage = Arc::new(MemoryBackend::new());
        let manager = LeaseManager::new(storage.clone(), ttl);
        (storage, manager)
    }

    async fn acquire(manager: &LeaseManager, holder: &str) -> Option<Lease> {
        match manager
            .try_acquire("leases/t.json", &WorkerId::new(holder))
            .await
            .expect("acquire")
        {
            AcquireOutcome::Acquired(lease) => Some(lease),
            AcquireOutcome::Held { .. } => None,
        }
    }

    #[tokio::test]
    async fn second_holder_is_rejected_while_live() {
        let (_storage, manager) = manager(Duration::from_secs(30));
        let first = acquire(&manager, "w1").await.expect("first acquires");
        assert_eq!(first.fencing_token().sequence(), 1);

        match manager
            .try_acquire("leases/t.json", &WorkerId::new("w2"))
            .await
            .expect("acquire")
        {
            AcquireOutcome::Held { holder_id } => assert_eq!(holder_id, "w1"),
            AcquireOutcome::Acquired(_) => panic!("lease must be exclusive"),
        }
        first.release().await.expect("release");
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_with_higher_fence() {
        let (storage, manager) = manager(Duration::from_secs(30));
        let stale = LeaseInfo {
            holder_id: "crashed".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(5),
            acquired_at: Utc::now() - chrono::Duration::seconds(35),
            sequence_number: 4,
        };
        storage
            .put(
                "leases/t.json",
                encode(&stale).expect("encode"),
                WritePrecondition::None,
            )
            .await
            .expect("put");

        let lease = acquire(&manager, "w2").await.expect("takeover");
        assert_eq!(lease.fencing_token().sequence(), 5);
        let info = manager.read("leases/t.json").await.expect("read").expect("exists");
        assert_eq!(info.holder_id, "w2");
        lease.release().await.expect("release");
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let (_storage, manager) = manager(Duration::from_secs(30));
        let first = acquire(&manager, "w1").await.expect("acquire");
        first.release().await.expect("release");

        let second = acquire(&manager, "w2").await.expect("reacquire");
        assert_eq!(second.fencing_token().sequence(), 2);
        second.release().await.expect("release");
    }

    #[tokio::test]
    async fn extend_fails_after_takeover() {
        let (_storage, manager) = manager(Duration::from_millis(20));
        let mut first = acquire(&manager, "w1").await.expect("acquire");
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = acquire(&manager, "w2").await.expect("takeover");
        let err = first.extend().await.expect_err("lease was lost");
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        // The loser's release must not clobber the new holder.
        first.release().await.expect("release");
        let info = manager.read("leases/t.json").await.expect("read").expect("exists");
        assert_eq!(info.holder_id, "w2");
        assert!(!info.is_expired());
        second.release().await.expect("release");
    }

    #[tokio::test]
    async fn extend_pushes_expiry_forward() {
        let (_storage, manager) = manager(Duration::from_secs(30));
        let mut lease = acquire(&manager, "w1").await.expect("acquire");
        let before = manager.read("leases/t.json").await.expect("read").expect("exists");
        tokio::time::sleep(Duration::from_millis(5)).await;
        lease.extend().await.expect("extend");
        let after = manager.read("leases/t.json").await.expect("read").expect("exists");
        assert!(after.expires_at > before.expires_at);
        assert_eq!(after.acquired_at, before.acquired_at);
        lease.release().await.expect("release");
    }
}

//! Typed storage key helpers for spool artifacts.
//!
//! ```text
//! tasks/{task_id}/record.json            task record (CAS updated)
//! tasks/{task_id}/generation.json        generation checkpoint (write once)
//! tasks/{task_id}/chunks/{seq:010}.json  chunk log entries (write once)
//! tasks/{task_id}/cancel.json            cancellation request
//! tasks/{task_id}/intent.json            next chunk the driver will append
//! active/{task_id}                       index of non-terminal tasks
//! leases/tasks/{task_id}.json            driver lease
//! cache/entries/{digest}.json            cached results
//! cache/inflight/{digest}.json           single-flight claims
//! ```
//!
//! Chunk sequences are zero padded so lexicographic order is numeric order.

use crate::id::TaskId;

/// Width of zero-padded chunk sequence numbers in keys.
pub const SEQUENCE_WIDTH: usize = 10;

/// Key builder for every object spool persists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpoolPaths;

impl SpoolPaths {
    /// Returns the prefix holding every task.
    #[must_use]
    pub const fn tasks_prefix() -> &'static str {
        "tasks/"
    }

    /// Returns the prefix holding all objects of a task.
    #[must_use]
    pub fn task_prefix(task_id: &TaskId) -> String {
        format!("tasks/{task_id}/")
    }

    /// Returns the task record key.
    #[must_use]
    pub fn task_record(task_id: &TaskId) -> String {
        format!("tasks/{task_id}/record.json")
    }

    /// Returns the generation checkpoint key.
    #[must_use]
    pub fn generation(task_id: &TaskId) -> String {
        format!("tasks/{task_id}/generation.json")
    }

    /// Returns the prefix holding a task's chunks.
    #[must_use]
    pub fn chunks_prefix(task_id: &TaskId) -> String {
        format!("tasks/{task_id}/chunks/")
    }

    /// Returns the key of one chunk.
    #[must_use]
    pub fn chunk(task_id: &TaskId, sequence: u64) -> String {
        format!(
            "tasks/{task_id}/chunks/{sequence:0width$}.json",
            width = SEQUENCE_WIDTH
        )
    }

    /// Returns the cancellation request key.
    #[must_use]
    pub fn cancel_request(task_id: &TaskId) -> String {
        format!("tasks/{task_id}/cancel.json")
    }

    /// Returns the persist intent key.
    #[must_use]
    pub fn persist_intent(task_id: &TaskId) -> String {
        format!("tasks/{task_id}/intent.json")
    }

    /// Returns the prefix of the active-task index.
    #[must_use]
    pub const fn active_prefix() -> &'static str {
        "active/"
    }

    /// Returns the active-index marker for a task.
    #[must_use]
    pub fn active_marker(task_id: &TaskId) -> String {
        format!("active/{task_id}")
    }

    /// Returns the driver lease key for a task.
    #[must_use]
    pub fn task_lease(task_id: &TaskId) -> String {
        format!("leases/tasks/{task_id}.json")
    }

    /// Returns the prefix holding cache entries.
    #[must_use]
    pub const fn cache_entries_prefix() -> &'static str {
        "cache/entries/"
    }

    /// Returns the cache entry key for a fingerprint digest.
    #[must_use]
    pub fn cache_entry(digest: &str) -> String {
        format!("cache/entries/{digest}.json")
    }

    /// Returns the single-flight claim key for a fingerprint digest.
    #[must_use]
    pub fn inflight_claim(digest: &str) -> String {
        format!("cache/inflight/{digest}.json")
    }

    /// Parses the sequence number out of a chunk key.
    #[must_use]
    pub fn parse_chunk_sequence(path: &str) -> Option<u64> {
        let name = path.rsplit('/').next()?;
        name.strip_suffix(".json")?.parse().ok()
    }

    /// Parses the task ID out of a task record key.
    #[must_use]
    pub fn parse_task_record(path: &str) -> Option<TaskId> {
        path.strip_prefix(Self::tasks_prefix())?
            .strip_suffix("/record.json")?
            .parse()
            .ok()
    }

    /// Parses the task ID out of an active-index marker key.
    #[must_use]
    pub fn parse_active_marker(path: &str) -> Option<TaskId> {
        path.strip_prefix(Self::active_prefix())?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_keys_sort_numerically() {
        let id = TaskId::generate();
        let nine = SpoolPaths::chunk(&id, 9);
        let ten = SpoolPaths::chunk(&id, 10);
        assert!(nine < ten);
        assert!(nine.starts_with(&SpoolPaths::chunks_prefix(&id)));
    }

    #[test]
    fn chunk_sequence_roundtrips() {
        let id = TaskId::generate();
        let key = SpoolPaths::chunk(&id, 42);
        assert_eq!(SpoolPaths::parse_chunk_sequence(&key), Some(42));
        assert_eq!(SpoolPaths::parse_chunk_sequence("tasks/x/record.json"), None);
    }

    #[test]
    fn active_marker_roundtrips() {
        let id = TaskId::generate();
        let marker = SpoolPaths::active_marker(&id);
        assert_eq!(SpoolPaths::parse_active_marker(&marker), Some(id));
        assert_eq!(SpoolPaths::parse_active_marker("active/garbage"), None);
    }

    #[test]
    fn task_record_keys_parse_back() {
        let id = TaskId::generate();
        assert_eq!(SpoolPaths::parse_task_record(&SpoolPaths::task_record(&id)), Some(id));
        assert_eq!(SpoolPaths::parse_task_record(&SpoolPaths::generation(&id)), None);
        assert_eq!(SpoolPaths::parse_task_record(&SpoolPaths::chunk(&id, 0)), None);
    }
}

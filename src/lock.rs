//! Errors surfaced by the lock protocol implemented in [`crate::store::Store`].
//!
//! The lock itself has no separate type: `acquire_lock`/`release_lock` live
//! directly on the store, since the lease is a property of the workflow
//! row, not a distinct resource. This module only carries the taxonomy the
//! executor driver matches against.

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another executor instance holds a lease that has not gone stale.
    #[error("workflow is locked by another running instance")]
    ConcurrentExecution,

    /// This instance ran past `max_duration` and a different instance took
    /// over before this one finished; the lock cannot be released as owner.
    #[error("workflow lock expired and was taken over by another instance")]
    LongRunningConcurrentExecution,
}

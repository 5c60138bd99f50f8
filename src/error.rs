//! Error types.
//!
//! Expected outcomes (a lock denied because the object is being removed,
//! a lookup miss) are booleans or null handles, never errors. What lives
//! here is either a broken caller contract or a resource failure.

use std::io;

/// Misuse of the reference/removal protocol by calling code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("cannot insert safe object twice")]
    DuplicateInsert,
    #[error("safe object dereferenced below zero")]
    ReferenceUnderflow,
    #[error("safe object dropped while still referenced")]
    DroppedWhileReferenced,
}

/// Fallible operations of the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn sweeper thread for {collection}")]
    SpawnSweeper {
        collection: String,
        #[source]
        source: io::Error,
    },
}

/// Log a contract violation; in debug builds also panic.
///
/// Release builds keep running and let the caller refuse the operation.
#[track_caller]
pub(crate) fn report(violation: ContractViolation) {
    tracing::error!(%violation, "safe object contract violated");
    if cfg!(debug_assertions) {
        panic!("{violation}");
    }
}

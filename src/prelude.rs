//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` is the stable default for applications that only run migrations.
//! `advanced` exposes the lock, ledger and storage building blocks.

pub mod dx {
    //! Stable high-level surface.
    //!
    //! Intended usage in app code:
    //! - build `ChangeUnit`s (or a `ChangeUnitSource`),
    //! - `Runner` bootstrap over a `DocumentStore`,
    //! - inspect the returned `RunReport`.
    pub use crate::{
        ChangeUnit, ChangeUnitSource, DocumentStore, InMemoryStorage, MigrationConfig, RunReport,
        RunStatus, Runner,
    };
}

pub mod advanced {
    //! Escape hatch for the engine internals.
    //!
    //! App-level code should normally stay on `prelude::dx`.
    pub use crate::engine::{ChangeAction, EngineState, MigrationEngine};
    pub use crate::ledger::{ChangeRecord, LedgerStore, RecordOutcome};
    pub use crate::lock::{LockGuard, LockRecord, LockState, LockStore};
    pub use crate::storage::{DurabilityMode, SnapshotManager};
}

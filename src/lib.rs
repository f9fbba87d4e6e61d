// ============================================================================
// changebee Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod config;
pub mod lock;
pub mod ledger;
pub mod engine;
pub mod prelude;

// Re-export main types for convenience
pub use crate::core::{DbError, Document, Filter, IndexSpec, MigrationError, Result, Update, Value};
pub use crate::storage::{DocumentStore, DurabilityMode, InMemoryStorage};
pub use crate::config::MigrationConfig;
pub use crate::lock::{LockGuard, LockRecord, LockState, LockStore};
pub use crate::ledger::{ChangeRecord, LedgerStore, RecordOutcome};
pub use crate::engine::{
    ChangeAction, ChangeUnit, ChangeUnitSource, EngineState, ErrorDescriptor, ErrorKind,
    MigrationEngine, RunReport, RunStatus,
};

// ============================================================================
// High-level Runner API
// ============================================================================

/// Migration runner bound to a document store
///
/// This is the recommended entry point: it wires the lock, the ledger and the
/// engine onto one store handle.
///
/// # Examples
///
/// ```
/// use changebee::{ChangeUnit, InMemoryStorage, Runner, RunStatus};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runner = Runner::new(InMemoryStorage::new())?;
///
/// let units = vec![
///     ChangeUnit::from_fn("create-users", "alice", 1, |_db| async move { anyhow::Ok(()) }),
///     ChangeUnit::from_fn("seed-admin", "alice", 2, |_db| async move { anyhow::Ok(()) }),
/// ];
///
/// let report = runner.run(&units).await;
/// assert_eq!(report.status, RunStatus::Completed);
/// assert_eq!(report.executed_count, 2);
/// # Ok(())
/// # }
/// ```
pub struct Runner {
    engine: MigrationEngine,
}

impl Runner {
    /// Runner with default configuration
    pub fn new<S: DocumentStore + 'static>(store: S) -> std::result::Result<Self, MigrationError> {
        Self::with_config(store, MigrationConfig::default())
    }

    /// Runner with custom configuration
    ///
    /// # Examples
    ///
    /// ```
    /// # use changebee::{InMemoryStorage, MigrationConfig, Runner};
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = MigrationConfig::new("orders")
    ///     .changelog_collection("orders_changelog")
    ///     .lock_collection("orders_lock");
    ///
    /// let runner = Runner::with_config(InMemoryStorage::new(), config)?;
    /// assert_eq!(runner.engine().config().database, "orders");
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_config<S: DocumentStore + 'static>(
        store: S,
        config: MigrationConfig,
    ) -> std::result::Result<Self, MigrationError> {
        let engine = MigrationEngine::new(std::sync::Arc::new(store), config)?;
        Ok(Self { engine })
    }

    /// Apply `units` in order and report what happened
    pub async fn run(&self, units: &[ChangeUnit]) -> RunReport {
        self.engine.run(units).await
    }

    /// Apply the units produced by `source`
    pub async fn run_source(&self, source: &dyn ChangeUnitSource) -> RunReport {
        self.engine.run_source(source).await
    }

    /// Advisory check whether any process currently holds the migration lock
    pub async fn is_migration_in_progress(&self) -> Result<bool> {
        self.engine.lock_store().is_held().await
    }

    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }
}

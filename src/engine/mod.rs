//! Migration engine: lock, apply pending change units in order, record, unlock.

pub mod report;
pub mod unit;

pub use report::{ErrorDescriptor, ErrorKind, RunReport, RunStatus};
pub use unit::{ChangeAction, ChangeUnit, ChangeUnitSource};

use crate::config::MigrationConfig;
use crate::core::{DbError, MigrationError};
use crate::ledger::{ChangeRecord, LedgerStore, RecordOutcome};
use crate::lock::{LockGuard, LockStore};
use crate::storage::DocumentStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{Instrument, Level, event, info_span};

/// Lifecycle of a single run.
///
/// `Idle -> LockPending -> (Locked | Skipped) -> Running -> (Completed | Failed) -> Unlocked`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    LockPending,
    Locked,
    Skipped,
    Running,
    Completed,
    Failed,
    Unlocked,
}

#[derive(Debug, Default)]
struct Progress {
    executed: usize,
    skipped: usize,
}

pub struct MigrationEngine {
    store: Arc<dyn DocumentStore>,
    config: MigrationConfig,
    lock: Arc<LockStore>,
    ledger: LedgerStore,
    state: watch::Sender<EngineState>,
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: MigrationConfig) -> Result<Self, MigrationError> {
        config.validate().map_err(MigrationError::InvalidConfig)?;

        let lock = Arc::new(LockStore::new(
            Arc::clone(&store),
            &config.lock_collection,
            &config.owner,
        ));
        let ledger = LedgerStore::new(Arc::clone(&store), &config.changelog_collection);
        let (state, _) = watch::channel(EngineState::Idle);

        Ok(Self {
            store,
            config,
            lock,
            ledger,
            state,
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn lock_store(&self) -> &LockStore {
        &self.lock
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch state transitions of this engine.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Pull units from `source` and run them.
    pub async fn run_source(&self, source: &dyn ChangeUnitSource) -> RunReport {
        let units = source.produce_change_units();
        self.run(&units).await
    }

    /// Run `units` in the given order. Failures are reported, never returned.
    pub async fn run(&self, units: &[ChangeUnit]) -> RunReport {
        self.run_inner(units).await.0
    }

    /// Like `run`, but a failed run comes back as its underlying error.
    pub async fn run_checked(&self, units: &[ChangeUnit]) -> Result<RunReport, MigrationError> {
        match self.run_inner(units).await {
            (_, Some(err)) => Err(err),
            (report, None) => Ok(report),
        }
    }

    async fn run_inner(&self, units: &[ChangeUnit]) -> (RunReport, Option<MigrationError>) {
        let span = info_span!(
            "migration_run",
            database = %self.config.database,
            owner = %self.config.owner,
            units = units.len()
        );
        self.execute(units).instrument(span).await
    }

    async fn execute(&self, units: &[ChangeUnit]) -> (RunReport, Option<MigrationError>) {
        let discovered = units.len();

        if !self.config.enabled {
            event!(Level::INFO, "migration runner disabled, skipping");
            self.transition(EngineState::Skipped);
            return (RunReport::skipped(discovered), None);
        }

        self.transition(EngineState::LockPending);
        let guard = match self.prepare_and_lock().await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                event!(Level::INFO, "migration lock held elsewhere, skipping");
                self.transition(EngineState::Skipped);
                return (RunReport::skipped(discovered), None);
            }
            Err(err) => {
                self.transition(EngineState::Failed);
                return self.finish(discovered, &Progress::default(), Some(err));
            }
        };

        self.transition(EngineState::Locked);
        self.transition(EngineState::Running);

        let mut progress = Progress::default();
        let outcome = self.apply_all(units, &mut progress).await;

        self.transition(match outcome {
            Ok(()) => EngineState::Completed,
            Err(_) => EngineState::Failed,
        });

        let released = guard.release().await;
        self.transition(EngineState::Unlocked);

        let failure = match (outcome, released) {
            (Err(err), Err(release_err)) => {
                event!(Level::WARN, error = %release_err, "lock release failed after failed run");
                Some(err)
            }
            (Err(err), Ok(())) => Some(err),
            (Ok(()), Err(release_err)) => Some(MigrationError::from(release_err)),
            (Ok(()), Ok(())) => None,
        };

        self.finish(discovered, &progress, failure)
    }

    async fn prepare_and_lock(&self) -> Result<Option<LockGuard>, MigrationError> {
        self.lock.initialize().await?;
        self.ledger.ensure_uniqueness_constraint().await?;
        Ok(self.lock.try_lock().await?)
    }

    async fn apply_all(&self, units: &[ChangeUnit], progress: &mut Progress) -> Result<(), MigrationError> {
        for unit in units {
            let span = info_span!(
                "change_unit",
                change_id = %unit.change_id,
                author = %unit.author,
                order = unit.order
            );
            self.apply_one(unit, progress).instrument(span).await?;
        }
        Ok(())
    }

    async fn apply_one(&self, unit: &ChangeUnit, progress: &mut Progress) -> Result<(), MigrationError> {
        if self.ledger.is_applied(&unit.change_id, &unit.author).await? && !unit.run_always {
            event!(Level::DEBUG, "already applied, skipping");
            progress.skipped += 1;
            return Ok(());
        }

        let started = Instant::now();
        let result = AssertUnwindSafe(unit.action.execute(Arc::clone(&self.store)))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => Some(anyhow::anyhow!("change unit panicked: {}", panic_message(&panic))),
        };
        if let Some(source) = failure {
            event!(Level::ERROR, error = %source, "change unit failed");
            return Err(MigrationError::ChangeUnitExecutionFailed {
                change_id: unit.change_id.clone(),
                author: unit.author.clone(),
                source,
            });
        }

        progress.executed += 1;
        let elapsed = started.elapsed().as_millis() as i64;
        event!(Level::INFO, duration_ms = elapsed, "change unit applied");

        let record = ChangeRecord::new(&unit.change_id, &unit.author)
            .with_source(&unit.change_log_class, &unit.change_set_method)
            .with_duration_millis(elapsed);

        match self.ledger.record(&record).await {
            Ok(RecordOutcome::Inserted) => Ok(()),
            Ok(RecordOutcome::AlreadyRecorded) => {
                event!(Level::DEBUG, "ledger entry already present");
                Ok(())
            }
            Err(DbError::StorageUnavailable(msg)) => Err(MigrationError::StorageUnavailable(msg)),
            Err(source) => Err(MigrationError::LedgerWriteFailed {
                change_id: unit.change_id.clone(),
                author: unit.author.clone(),
                source,
            }),
        }
    }

    fn finish(
        &self,
        discovered: usize,
        progress: &Progress,
        failure: Option<MigrationError>,
    ) -> (RunReport, Option<MigrationError>) {
        let report = RunReport {
            status: if failure.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            },
            discovered_count: discovered,
            executed_count: progress.executed,
            skipped_count: progress.skipped,
            error: failure.as_ref().map(ErrorDescriptor::from),
        };
        match &failure {
            Some(err) => event!(Level::ERROR, error = %err, executed = report.executed_count, "migration run failed"),
            None => event!(
                Level::INFO,
                executed = report.executed_count,
                skipped = report.skipped_count,
                "migration run completed"
            ),
        }
        (report, failure)
    }

    fn transition(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        event!(Level::DEBUG, from = ?previous, to = ?next, "engine state");
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

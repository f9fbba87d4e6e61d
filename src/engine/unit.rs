use crate::storage::DocumentStore;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The executable body of a change unit.
///
/// The ledger can only prove that a unit's record was committed, not that its
/// side effects happened once: a unit whose action succeeded but whose record
/// was never written runs again next time. Actions should be safe to repeat.
#[async_trait]
pub trait ChangeAction: Send + Sync {
    async fn execute(&self, db: Arc<dyn DocumentStore>) -> anyhow::Result<()>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> ChangeAction for FnAction<F>
where
    F: Fn(Arc<dyn DocumentStore>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, db: Arc<dyn DocumentStore>) -> anyhow::Result<()> {
        (self.0)(db).await
    }
}

/// One ordered migration step, identified by `(change_id, author)`.
#[derive(Clone)]
pub struct ChangeUnit {
    pub change_id: String,
    pub author: String,
    /// Caller's sequencing value; the engine runs units in slice order and
    /// never sorts by this.
    pub order: u32,
    pub change_log_class: String,
    pub change_set_method: String,
    /// Execute on every run, even when already recorded.
    pub run_always: bool,
    pub action: Arc<dyn ChangeAction>,
}

impl ChangeUnit {
    pub fn new(change_id: &str, author: &str, order: u32, action: Arc<dyn ChangeAction>) -> Self {
        Self {
            change_id: change_id.to_string(),
            author: author.to_string(),
            order,
            change_log_class: String::new(),
            change_set_method: change_id.to_string(),
            run_always: false,
            action,
        }
    }

    /// Build a unit from an async closure.
    ///
    /// ```
    /// use changebee::ChangeUnit;
    ///
    /// let unit = ChangeUnit::from_fn("create-users", "alice", 1, |_db| async move {
    ///     anyhow::Ok(())
    /// });
    /// assert_eq!(unit.change_id, "create-users");
    /// ```
    pub fn from_fn<F, Fut>(change_id: &str, author: &str, order: u32, f: F) -> Self
    where
        F: Fn(Arc<dyn DocumentStore>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(change_id, author, order, Arc::new(FnAction(f)))
    }

    pub fn with_source(mut self, change_log_class: &str, change_set_method: &str) -> Self {
        self.change_log_class = change_log_class.to_string();
        self.change_set_method = change_set_method.to_string();
        self
    }

    pub fn run_always(mut self, run_always: bool) -> Self {
        self.run_always = run_always;
        self
    }
}

impl fmt::Debug for ChangeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeUnit")
            .field("change_id", &self.change_id)
            .field("author", &self.author)
            .field("order", &self.order)
            .field("change_log_class", &self.change_log_class)
            .field("change_set_method", &self.change_set_method)
            .field("run_always", &self.run_always)
            .finish_non_exhaustive()
    }
}

/// External collaborator that discovers change units and filters them for
/// the current environment. Returned units are already in execution order.
pub trait ChangeUnitSource: Send + Sync {
    fn produce_change_units(&self) -> Vec<ChangeUnit>;
}

impl ChangeUnitSource for Vec<ChangeUnit> {
    fn produce_change_units(&self) -> Vec<ChangeUnit> {
        self.clone()
    }
}

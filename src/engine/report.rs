use crate::core::MigrationError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Failed,
    /// Lock held elsewhere, or the runner is disabled.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    StorageUnavailable,
    ChangeUnitExecutionFailed,
    LedgerWriteFailed,
    Storage,
    InvalidConfig,
}

/// Serializable summary of the error that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub message: String,
}

impl From<&MigrationError> for ErrorDescriptor {
    fn from(err: &MigrationError) -> Self {
        let kind = match err {
            MigrationError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            MigrationError::ChangeUnitExecutionFailed { .. } => ErrorKind::ChangeUnitExecutionFailed,
            MigrationError::LedgerWriteFailed { .. } => ErrorKind::LedgerWriteFailed,
            MigrationError::Storage(_) => ErrorKind::Storage,
            MigrationError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        };
        let (change_id, author) = match err.change_unit() {
            Some((change_id, author)) => (Some(change_id.to_string()), Some(author.to_string())),
            None => (None, None),
        };
        Self {
            kind,
            change_id,
            author,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub status: RunStatus,
    pub discovered_count: usize,
    pub executed_count: usize,
    pub skipped_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl RunReport {
    pub(crate) fn skipped(discovered_count: usize) -> Self {
        Self {
            status: RunStatus::Skipped,
            discovered_count,
            executed_count: 0,
            skipped_count: 0,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != RunStatus::Failed
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

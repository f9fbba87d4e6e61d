use uuid::Uuid;

pub const DEFAULT_CHANGELOG_COLLECTION: &str = "dbchangelog";
pub const DEFAULT_LOCK_COLLECTION: &str = "mongobeelock";

/// Migration runner configuration
///
/// Collection names are configuration rather than part of the storage
/// contract, so two independent tools can share one database.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Database name, informational for logs
    pub database: String,

    /// Collection holding one record per applied change unit
    pub changelog_collection: String,

    /// Collection holding the singleton lock document
    pub lock_collection: String,

    /// Identity written into the lock document when acquired
    pub owner: String,

    /// When false, `run` returns a skipped report without touching storage
    pub enabled: bool,
}

impl MigrationConfig {
    /// Create a configuration with default collection names
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            changelog_collection: DEFAULT_CHANGELOG_COLLECTION.to_string(),
            lock_collection: DEFAULT_LOCK_COLLECTION.to_string(),
            owner: default_owner(),
            enabled: true,
        }
    }

    /// Set the changelog collection name
    pub fn changelog_collection(mut self, name: &str) -> Self {
        self.changelog_collection = name.to_string();
        self
    }

    /// Set the lock collection name
    pub fn lock_collection(mut self, name: &str) -> Self {
        self.lock_collection = name.to_string();
        self
    }

    /// Set the lock owner identity
    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = owner.to_string();
        self
    }

    /// Enable or disable the runner
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.changelog_collection.is_empty() {
            return Err("changelog_collection cannot be empty".to_string());
        }

        if self.lock_collection.is_empty() {
            return Err("lock_collection cannot be empty".to_string());
        }

        if self.changelog_collection == self.lock_collection {
            return Err("changelog_collection and lock_collection must differ".to_string());
        }

        if self.owner.is_empty() {
            return Err("owner cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::new("changebee")
    }
}

fn default_owner() -> String {
    format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple())
}

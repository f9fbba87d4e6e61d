pub mod collection;
pub mod engine;
pub mod memory;
pub mod persistence;

pub use collection::{Collection, ID_INDEX_NAME};
pub use engine::DocumentStore;
pub use memory::InMemoryStorage;
pub use persistence::{DurabilityMode, SnapshotManager, StoreSnapshot};

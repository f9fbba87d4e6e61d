pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, MigrationError, Result};
pub use types::{Document, Filter, ID_FIELD, IndexSpec, Update, UpdateResult};
pub use value::Value;

pub mod config;
pub mod cursor;
pub mod store;

pub use config::{AccountConfig, AccountKind, Config, ConfigError};
pub use cursor::{SqliteCursorStore, SyncCursor, SyncCursorStore};
pub use store::{LocalEventStore, SqliteEventStore, StoreError};

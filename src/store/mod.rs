//! Durable key/value storage scoped to the runtime session.
//!
//! Trackers persist after every mutation and treat every read/write fault as
//! recoverable: a failed read defaults to empty state, a failed write is
//! logged and dropped. Only construction of a backing store may fail hard.

use anyhow::Result;
use async_trait::async_trait;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage keys shared with prior runs of the same runtime session.
pub mod keys {
    pub const LIFECYCLE_FOREGROUND: &str = "stopwatch/foreground";
    pub const LIFECYCLE_BACKGROUND: &str = "stopwatch/background";
    pub const LIFECYCLE_BACKGROUND_TIME: &str = "stopwatch/backgroundTime";
    pub const PLAYER_SESSION: &str = "player/session";
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

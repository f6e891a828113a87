//! Player session tracking: one active session per tracker, persisted for
//! recovery across process teardown, summarized at most once.

pub mod meta;
pub mod session;
pub mod tracker;

pub use meta::{Metadata, MetadataResolver, MetadataSource, ResolveContext};
pub use session::{EndReason, PlayerSession, SessionCore};
pub use tracker::{EndOptions, PlayerTracker, TrackedPlayer};

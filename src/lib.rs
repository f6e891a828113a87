//! Client-side session tracking and analytics for cloud-player applications.
//!
//! The core observes two lifecycles: the application's foreground/background
//! transitions and a media player's playback. Both trackers keep their state
//! durable across process teardown through a session-scoped key/value store,
//! and emit structured events to an external analytics transport with
//! at-most-once delivery for terminal summaries.
//!
//! Hosts construct one [`SenzaAnalytics`] via [`AnalyticsBuilder`], feed it
//! lifecycle signals over the channel from
//! [`SenzaAnalytics::lifecycle_sender`], and route player control through the
//! [`TrackedPlayer`] returned by the track calls.

mod analytics;
mod config;
mod events;
mod geoip;
mod lifecycle;
mod playback;
mod player;
mod stopwatch;
mod store;

pub use analytics::{
    AnalyticsBuilder, DeviceInfo, LifecycleSignal, SenzaAnalytics, TransitionState,
};
pub use config::{Config, ConfigHandle, GoogleConfig, IpDataConfig, TrackerConfig};
pub use events::{AnalyticsTransport, EventEmitter, TransportEvent};
pub use geoip::{GeoIp, GeoLocation};
pub use lifecycle::{LifecycleSnapshot, LifecycleTracker};
pub use playback::{MediaElement, MediaEvent, PlayerBackend};
pub use player::{
    EndOptions, EndReason, Metadata, MetadataResolver, MetadataSource, PlayerTracker,
    ResolveContext, SessionCore, TrackedPlayer,
};
pub use stopwatch::{NullOverlay, OverlayFrame, OverlaySink};
pub use store::{MemoryStore, SessionStore, SqliteStore};

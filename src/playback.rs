//! Consumed playback capabilities: the media element and player control
//! surfaces the host wires in, plus the event stream both publish on.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Low-level playback transitions observed by the session tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    Playing,
    Pause,
    Waiting,
    Stalled,
    Seeking,
    Seeked,
    Ended,
    LoadedMetadata,
    /// The player is tearing down its current load.
    Unloading,
    /// Remote player switched load modes; treated as a session boundary.
    LoadModeChange,
}

/// A local media element (HTMLMediaElement equivalent).
pub trait MediaElement: Send + Sync {
    fn current_src(&self) -> Option<String>;
    fn current_time(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn events(&self) -> broadcast::Receiver<MediaEvent>;
}

/// A player control object: the local player paired with a media element,
/// or a remote player proxy used standalone.
#[async_trait]
pub trait PlayerBackend: Send + Sync {
    async fn load(&self, url: &str) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn unload(&self) -> Result<()>;
    async fn detach(&self) -> Result<()>;

    /// Canonical asset URI once the player has resolved one.
    fn asset_uri(&self) -> Option<String> {
        None
    }

    fn current_time(&self) -> f64 {
        0.0
    }

    fn duration(&self) -> Option<f64> {
        None
    }

    fn events(&self) -> broadcast::Receiver<MediaEvent>;
}

//! The player session entity: one continuous tracked interval of watching a
//! single piece of content, from load to close.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::meta::Metadata;

/// Why a session ended. Terminal reasons discard the persisted record;
/// everything else leaves it recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Ended,
    Unload,
    LoadNewUrl,
    SessionEnd,
    ContentChange,
    UserDisconnected,
    Unknown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Unload => "unload",
            EndReason::LoadNewUrl => "load_new_url",
            EndReason::SessionEnd => "session_end",
            EndReason::ContentChange => "content_change",
            EndReason::UserDisconnected => "userdisconnected",
            EndReason::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EndReason::Ended | EndReason::SessionEnd | EndReason::UserDisconnected
        )
    }
}

/// In-memory state of the current session.
#[derive(Debug, Clone)]
pub struct PlayerSession {
    pub id: Uuid,
    pub active: bool,
    /// True once a terminal summary has been emitted; guards at-most-once
    /// summary delivery.
    pub sent: bool,
    pub started_at_ms: i64,
    /// Set while playback is actually running; the open interval folds into
    /// `watched_ms` on the next transition out of playing.
    pub last_play_start_ms: Option<i64>,
    pub watched_ms: u64,
    pub last_time: f64,
    pub meta: Metadata,
    pub url_hint: String,
}

impl PlayerSession {
    pub fn begin(meta: Metadata, url_hint: &str, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            active: true,
            sent: false,
            started_at_ms: now_ms,
            last_play_start_ms: None,
            watched_ms: 0,
            last_time: 0.0,
            meta,
            url_hint: url_hint.to_string(),
        }
    }

    /// Starts counting watch time. Returns false when already counting.
    pub fn enter_playing(&mut self, now_ms: i64) -> bool {
        if self.last_play_start_ms.is_some() {
            return false;
        }
        self.last_play_start_ms = Some(now_ms);
        true
    }

    /// Folds the open play interval into `watched_ms`, if any.
    pub fn fold_interval(&mut self, now_ms: i64) {
        if let Some(started) = self.last_play_start_ms.take() {
            self.watched_ms = self
                .watched_ms
                .saturating_add(now_ms.saturating_sub(started).max(0) as u64);
        }
    }

    pub fn watched_sec(&self) -> u64 {
        (self.watched_ms + 500) / 1000
    }

    /// Transplants timing and (when empty) metadata from a persisted record,
    /// turning this freshly started session into a continuation.
    pub fn adopt(&mut self, core: &SessionCore) {
        self.started_at_ms = core.started_at;
        self.watched_ms = core.watched_ms;
        self.last_play_start_ms = core.last_play_start;
        self.last_time = core.last_time;
        if self.meta.is_empty() {
            self.meta = Metadata(core.meta_snapshot.clone());
        }
    }

    /// Persisted shape for recovery after teardown.
    pub fn core(&self, src: String) -> SessionCore {
        SessionCore {
            src,
            started_at: self.started_at_ms,
            watched_ms: self.watched_ms,
            last_play_start: self.last_play_start_ms,
            last_time: self.last_time,
            meta_snapshot: self.meta.0.clone(),
            sent: self.sent,
            active: self.active,
            session_id: Some(self.id),
        }
    }
}

/// Durable session record. Field names match what earlier builds wrote, so
/// recovery keeps working across upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionCore {
    pub src: String,
    pub started_at: i64,
    pub watched_ms: u64,
    pub last_play_start: Option<i64>,
    pub last_time: f64,
    pub meta_snapshot: Map<String, Value>,
    pub sent: bool,
    pub active: bool,
    pub session_id: Option<Uuid>,
}

impl Default for SessionCore {
    fn default() -> Self {
        Self {
            src: String::new(),
            started_at: 0,
            watched_ms: 0,
            last_play_start: None,
            last_time: 0.0,
            meta_snapshot: Map::new(),
            sent: false,
            active: false,
            session_id: None,
        }
    }
}

impl SessionCore {
    /// A persisted session is a continuation candidate for `url` when it was
    /// still active, never summarized, and covered the same source.
    pub fn continues(&self, url: &str) -> bool {
        self.active && !self.sent && self.src == url
    }

    pub fn watched_sec(&self) -> u64 {
        (self.watched_ms + 500) / 1000
    }
}

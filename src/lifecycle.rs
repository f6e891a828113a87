//! Foreground/background lifecycle tracking.
//!
//! Counts whole seconds of foreground time on a repeating ticker, folds
//! background stretches in on return to foreground, and persists after every
//! mutation so the counters survive page-level teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::warn;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ConfigHandle;
use crate::events::{await_delivery, EventEmitter};
use crate::stopwatch::{ratio_percent, OverlayFrame, OverlaySink};
use crate::store::{keys, SessionStore};

/// Render delay granted before the host freezes the page on background.
const PRE_BACKGROUND_DELAY: Duration = Duration::from_millis(25);

/// How long the overlay stays in alert colors after returning foreground.
const ALERT_CLEAR_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
struct LifecycleState {
    foreground: u64,
    background: u64,
    /// Millisecond timestamp of the most recent transition into background;
    /// zero while foregrounded.
    background_entered_at_ms: i64,
}

/// Snapshot used for event payloads.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LifecycleSnapshot {
    pub foreground: u64,
    pub background: u64,
    pub total: u64,
    /// Foreground share of total tracked time, floored to 3 decimals.
    pub ratio: f64,
}

impl LifecycleSnapshot {
    fn of(state: &LifecycleState) -> Self {
        let total = state.foreground + state.background;
        let ratio = if total == 0 {
            0.0
        } else {
            (state.foreground as f64 / total as f64 * 1000.0).floor() / 1000.0
        };
        Self {
            foreground: state.foreground,
            background: state.background,
            total,
            ratio,
        }
    }

    pub fn params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("foreground".into(), Value::from(self.foreground));
        params.insert("background".into(), Value::from(self.background));
        params.insert("total".into(), Value::from(self.total));
        params.insert("ratio".into(), Value::from(self.ratio));
        params
    }
}

#[derive(Clone)]
pub struct LifecycleTracker {
    state: Arc<Mutex<LifecycleState>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    store: Arc<dyn SessionStore>,
    emitter: EventEmitter,
    config: ConfigHandle,
    overlay: Arc<dyn OverlaySink>,
    visible: Arc<AtomicBool>,
    alert: Arc<AtomicBool>,
}

impl LifecycleTracker {
    /// Restores counters from the store; absent or malformed values default
    /// to zero.
    pub async fn restore(
        store: Arc<dyn SessionStore>,
        emitter: EventEmitter,
        config: ConfigHandle,
        overlay: Arc<dyn OverlaySink>,
    ) -> Self {
        let state = LifecycleState {
            foreground: read_counter(&store, keys::LIFECYCLE_FOREGROUND).await,
            background: read_counter(&store, keys::LIFECYCLE_BACKGROUND).await,
            background_entered_at_ms: read_counter(&store, keys::LIFECYCLE_BACKGROUND_TIME).await
                as i64,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            ticker: Arc::new(Mutex::new(None)),
            store,
            emitter,
            config,
            overlay,
            visible: Arc::new(AtomicBool::new(false)),
            alert: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot::of(&*self.state.lock().await)
    }

    /// Starts (or restarts) the per-second foreground ticker. The previous
    /// ticker is always aborted; a stale timer must never keep counting.
    pub async fn start_timer(&self) {
        self.render_overlay().await;

        let mut ticker = self.ticker.lock().await;
        if let Some(handle) = ticker.take() {
            handle.abort();
        }

        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(1));
            // The first tick completes immediately; counting starts one
            // second in.
            interval.tick().await;
            loop {
                interval.tick().await;
                let snapshot = {
                    let mut state = tracker.state.lock().await;
                    state.foreground += 1;
                    state.clone()
                };
                tracker.render_overlay().await;
                tracker.save(&snapshot).await;
            }
        });
        *ticker = Some(handle);
    }

    pub async fn stop_timer(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// Pre-transition hook: gives the overlay a moment to render the alert
    /// state before the host freezes the page.
    pub async fn will_move_to_background(&self) {
        self.alert.store(true, Ordering::SeqCst);
        self.render_overlay().await;
        time::sleep(PRE_BACKGROUND_DELAY).await;
    }

    pub async fn moved_to_background(&self) {
        self.alert.store(true, Ordering::SeqCst);
        self.stop_timer().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            state.background_entered_at_ms = Utc::now().timestamp_millis();
            state.clone()
        };
        self.save(&snapshot).await;
        self.log_lifecycle_event("background").await;
    }

    pub async fn moved_to_foreground(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.background_entered_at_ms > 0 {
                let elapsed_ms =
                    (Utc::now().timestamp_millis() - state.background_entered_at_ms).max(0);
                // Ceiling to whole seconds; partial seconds count as spent.
                state.background += (elapsed_ms as u64).div_ceil(1000);
                state.background_entered_at_ms = 0;
            }
            state.clone()
        };
        self.save(&snapshot).await;
        self.start_timer().await;
        self.log_lifecycle_event("foreground").await;

        let alert = self.alert.clone();
        let tracker = self.clone();
        tokio::spawn(async move {
            time::sleep(ALERT_CLEAR_DELAY).await;
            alert.store(false, Ordering::SeqCst);
            tracker.render_overlay().await;
        });
    }

    /// Terminal lifecycle summary. Resolves after the transport acknowledges
    /// delivery (plus the grace delay) or the delivery timeout elapses.
    pub async fn session_end(&self) {
        if !self.config.lifecycle().summary {
            return;
        }
        let params = self.snapshot().await.params();
        let ack = self.emitter.emit_with_delivery("lifecycle_session_end", params);
        await_delivery(ack).await;
    }

    async fn log_lifecycle_event(&self, state: &str) {
        if !self.config.lifecycle().raw {
            return;
        }
        let mut params = self.snapshot().await.params();
        params.insert("state".into(), Value::String(state.to_string()));
        self.emitter.emit("lifecycle", params);
    }

    pub async fn show_overlay(&self) {
        self.visible.store(true, Ordering::SeqCst);
        self.render_overlay().await;
    }

    pub async fn hide_overlay(&self) {
        self.visible.store(false, Ordering::SeqCst);
        self.render_overlay().await;
    }

    async fn render_overlay(&self) {
        let state = self.state.lock().await;
        let frame = OverlayFrame {
            foreground: state.foreground,
            background: state.background,
            ratio_percent: ratio_percent(state.foreground, state.background),
            visible: self.visible.load(Ordering::SeqCst),
            alert: self.alert.load(Ordering::SeqCst),
        };
        drop(state);
        self.overlay.render(&frame);
    }

    async fn save(&self, state: &LifecycleState) {
        let entries = [
            (keys::LIFECYCLE_FOREGROUND, state.foreground.to_string()),
            (keys::LIFECYCLE_BACKGROUND, state.background.to_string()),
            (
                keys::LIFECYCLE_BACKGROUND_TIME,
                state.background_entered_at_ms.to_string(),
            ),
        ];
        for (key, value) in entries {
            if let Err(err) = self.store.set(key, &value).await {
                warn!("Failed to persist lifecycle state ({key}): {err}");
            }
        }
    }
}

async fn read_counter(store: &Arc<dyn SessionStore>, key: &str) -> u64 {
    match store.get(key).await {
        Ok(Some(raw)) => raw.trim().parse().unwrap_or(0),
        Ok(None) => 0,
        Err(err) => {
            warn!("Failed to read persisted lifecycle value ({key}): {err}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ratio_is_floored_and_clamped() {
        let snapshot = LifecycleSnapshot::of(&LifecycleState {
            foreground: 1,
            background: 2,
            background_entered_at_ms: 0,
        });
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.ratio, 0.333);

        let empty = LifecycleSnapshot::of(&LifecycleState::default());
        assert_eq!(empty.ratio, 0.0);

        let all_foreground = LifecycleSnapshot::of(&LifecycleState {
            foreground: 10,
            background: 0,
            background_entered_at_ms: 0,
        });
        assert_eq!(all_foreground.ratio, 1.0);
    }
}

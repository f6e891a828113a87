//! Top-level analytics facade: wires the trackers together, consumes host
//! lifecycle signals, and exposes the public instrumentation surface.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::config::{Config, ConfigHandle};
use crate::events::{AnalyticsTransport, EventEmitter};
use crate::geoip::GeoIp;
use crate::lifecycle::LifecycleTracker;
use crate::playback::{MediaElement, PlayerBackend};
use crate::player::meta::snake_keys;
use crate::player::{EndOptions, EndReason, MetadataSource, PlayerTracker, TrackedPlayer};
use crate::stopwatch::{NullOverlay, OverlaySink};
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Foreground,
    Background,
}

/// Host lifecycle notifications. Signals carrying a oneshot sender are
/// awaitable: the host may block its own transition until the reply.
pub enum LifecycleSignal {
    /// Pre-transition notification; the core replies on `ready` once it is
    /// safe for the host to proceed.
    BeforeStateChange {
        state: TransitionState,
        ready: oneshot::Sender<()>,
    },
    StateChange {
        state: TransitionState,
    },
    /// The user disconnected; `done` fires after terminal summaries have
    /// been flushed to the transport.
    UserDisconnected {
        done: oneshot::Sender<()>,
    },
}

/// Device identity from the host runtime, when running on a managed device.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub device_id: String,
    pub client_ip: Option<String>,
    pub country_code: Option<String>,
    pub tenant: Option<String>,
    pub community: Option<String>,
    pub connection_type: Option<String>,
}

pub struct AnalyticsBuilder {
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn AnalyticsTransport>,
    overlay: Arc<dyn OverlaySink>,
    device_info: Option<DeviceInfo>,
    remote_player: Option<Arc<dyn PlayerBackend>>,
}

impl AnalyticsBuilder {
    pub fn new(store: Arc<dyn SessionStore>, transport: Arc<dyn AnalyticsTransport>) -> Self {
        Self {
            store,
            transport,
            overlay: Arc::new(NullOverlay),
            device_info: None,
            remote_player: None,
        }
    }

    pub fn overlay(mut self, overlay: Arc<dyn OverlaySink>) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn device_info(mut self, info: DeviceInfo) -> Self {
        self.device_info = Some(info);
        self
    }

    pub fn remote_player(mut self, player: Arc<dyn PlayerBackend>) -> Self {
        self.remote_player = Some(player);
        self
    }

    /// Restores persisted tracker state, starts the foreground ticker, and
    /// begins consuming host lifecycle signals.
    pub async fn build(self) -> SenzaAnalytics {
        let config = ConfigHandle::new(Config::default());
        let emitter = EventEmitter::new(self.transport.clone(), config.clone());

        let lifecycle = LifecycleTracker::restore(
            self.store.clone(),
            emitter.clone(),
            config.clone(),
            self.overlay.clone(),
        )
        .await;
        let player =
            PlayerTracker::restore(self.store.clone(), emitter.clone(), config.clone()).await;

        lifecycle.start_timer().await;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        spawn_signal_loop(signal_rx, lifecycle.clone(), player.clone());

        SenzaAnalytics {
            config,
            emitter,
            transport: self.transport,
            lifecycle,
            player,
            device_info: self.device_info,
            remote_player: self.remote_player,
            signal_tx,
        }
    }
}

fn spawn_signal_loop(
    mut rx: mpsc::UnboundedReceiver<LifecycleSignal>,
    lifecycle: LifecycleTracker,
    player: PlayerTracker,
) {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            match signal {
                LifecycleSignal::BeforeStateChange { state, ready } => {
                    if state == TransitionState::Background {
                        lifecycle.will_move_to_background().await;
                    }
                    let _ = ready.send(());
                }
                LifecycleSignal::StateChange { state } => match state {
                    TransitionState::Background => {
                        lifecycle.moved_to_background().await;
                        player.persist_current().await;
                    }
                    TransitionState::Foreground => {
                        lifecycle.moved_to_foreground().await;
                    }
                },
                LifecycleSignal::UserDisconnected { done } => {
                    player
                        .end_session(
                            EndReason::SessionEnd,
                            EndOptions {
                                await_delivery: true,
                                detach_listeners: false,
                            },
                        )
                        .await;
                    lifecycle.session_end().await;
                    let _ = done.send(());
                }
            }
        }
    });
}

/// The analytics core. Construct one per application via
/// [`AnalyticsBuilder`] and share it by reference; there is no ambient
/// global instance.
pub struct SenzaAnalytics {
    config: ConfigHandle,
    emitter: EventEmitter,
    transport: Arc<dyn AnalyticsTransport>,
    lifecycle: LifecycleTracker,
    player: PlayerTracker,
    device_info: Option<DeviceInfo>,
    remote_player: Option<Arc<dyn PlayerBackend>>,
    signal_tx: mpsc::UnboundedSender<LifecycleSignal>,
}

impl SenzaAnalytics {
    /// Channel on which the host delivers lifecycle notifications.
    pub fn lifecycle_sender(&self) -> mpsc::UnboundedSender<LifecycleSignal> {
        self.signal_tx.clone()
    }

    /// Applies configuration and announces the application with its user
    /// properties to the transport.
    pub async fn init(&self, app: &str, sparse_config: Value) {
        self.configure(sparse_config);

        let config = self.config.snapshot();
        info!(
            "analytics.config {}",
            serde_json::to_value(&config).unwrap_or(Value::Null)
        );

        if let Some(measurement_id) = &config.google.gtag {
            self.transport.configure(measurement_id, config.google.debug);
        }

        let mut props = Map::new();
        props.insert("app".into(), Value::String(app.to_string()));
        props.extend(snake_keys(&config.user_info));

        match &self.device_info {
            Some(device) => {
                if let Some(country_code) = &device.country_code {
                    props.insert("country_code".into(), Value::String(country_code.clone()));
                }
                if let Some(tenant) = &device.tenant {
                    props.insert("tenant".into(), Value::String(tenant.clone()));
                }
                if let Some(community) = &device.community {
                    props.insert("community".into(), Value::String(community.clone()));
                }
                if let Some(connection_type) = &device.connection_type {
                    props.insert(
                        "connection_type".into(),
                        Value::String(connection_type.clone()),
                    );
                }
                props.insert("user_id".into(), Value::String(device.device_id.clone()));
            }
            None => {
                props.insert("connection_type".into(), Value::String("browser".into()));
            }
        }

        if let Some(apikey) = &config.ipdata.apikey {
            let ip = self
                .device_info
                .as_ref()
                .and_then(|device| device.client_ip.clone())
                .unwrap_or_default();
            match GeoIp::new(apikey).lookup(&ip).await {
                Ok(location) => {
                    if let Some(city) = location.city {
                        props.insert("city".into(), Value::String(city));
                    }
                    if let Some(region) = location.region {
                        props.insert("region".into(), Value::String(region));
                    }
                    if let Some(country_code) = location.country_code {
                        props.insert("country_code".into(), Value::String(country_code));
                    }
                }
                Err(err) => warn!("Geo-ip lookup failed, continuing without location: {err}"),
            }
        }

        self.transport.set_user_properties(&props);
        info!("analytics.init {}", Value::Object(props));
    }

    /// Merges a sparse configuration fragment into the current config.
    pub fn configure(&self, sparse_config: Value) {
        self.config.merge(sparse_config);
    }

    /// Dispatches a named event with the fixed transport properties merged
    /// into `data`.
    pub fn log_event(&self, name: &str, data: Map<String, Value>) {
        self.emitter.emit(name, data);
    }

    /// Tracks a local player and its media element. The returned wrapper
    /// must be used for loads so session boundaries sequence correctly.
    pub async fn track_player_events(
        &self,
        player: Arc<dyn PlayerBackend>,
        media: Arc<dyn MediaElement>,
        meta_source: MetadataSource,
    ) -> TrackedPlayer {
        self.player.bind_local(player, media, meta_source).await
    }

    /// Tracks the remote player directly. Fails when the capability was not
    /// provided at construction.
    pub async fn track_remote_player_events(
        &self,
        meta_source: MetadataSource,
    ) -> Result<TrackedPlayer> {
        let player = self
            .remote_player
            .clone()
            .ok_or_else(|| anyhow!("remote player not available"))?;
        Ok(self.player.bind_remote(player, meta_source).await)
    }

    /// Marks a logical content change on the same stream: ends the current
    /// session and starts a fresh one with new metadata.
    pub async fn content_changed(&self, meta_source: Option<MetadataSource>) {
        self.player.content_changed(meta_source).await;
    }

    pub async fn show_stopwatch(&self) {
        self.lifecycle.show_overlay().await;
    }

    pub async fn hide_stopwatch(&self) {
        self.lifecycle.hide_overlay().await;
    }
}

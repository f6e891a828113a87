//! End-to-end tests for the session trackers, driven through fake playback
//! sources and a recording transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::time::sleep;

use senza_analytics::{
    AnalyticsBuilder, AnalyticsTransport, Config, ConfigHandle, EndOptions, EndReason,
    EventEmitter, LifecycleSignal, MediaElement, MediaEvent, MemoryStore, Metadata,
    MetadataSource, PlayerBackend, PlayerTracker, SessionCore, SessionStore, TransportEvent,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingTransport {
    events: Mutex<Vec<(String, Map<String, Value>)>>,
    ack: bool,
}

impl RecordingTransport {
    fn acking() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            ack: true,
        }
    }

    fn named(&self, name: &str) -> Vec<Map<String, Value>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, params)| params.clone())
            .collect()
    }

    fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl AnalyticsTransport for RecordingTransport {
    fn send(&self, name: &str, event: TransportEvent) {
        self.events
            .lock()
            .unwrap()
            .push((name.to_string(), event.params));
        if self.ack {
            if let Some(callback) = event.event_callback {
                let _ = callback.send(());
            }
        }
    }
}

struct FakeMedia {
    src: Mutex<Option<String>>,
    time: Mutex<f64>,
    duration: Mutex<Option<f64>>,
    tx: broadcast::Sender<MediaEvent>,
}

impl FakeMedia {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            src: Mutex::new(None),
            time: Mutex::new(0.0),
            duration: Mutex::new(None),
            tx: broadcast::channel(64).0,
        })
    }

    fn set_duration(&self, seconds: f64) {
        *self.duration.lock().unwrap() = Some(seconds);
    }

    fn fire(&self, event: MediaEvent) {
        let _ = self.tx.send(event);
    }
}

impl MediaElement for FakeMedia {
    fn current_src(&self) -> Option<String> {
        self.src.lock().unwrap().clone()
    }

    fn current_time(&self) -> f64 {
        *self.time.lock().unwrap()
    }

    fn duration(&self) -> Option<f64> {
        *self.duration.lock().unwrap()
    }

    fn events(&self) -> broadcast::Receiver<MediaEvent> {
        self.tx.subscribe()
    }
}

struct FakePlayer {
    loads: Mutex<Vec<String>>,
    ops: Mutex<Vec<&'static str>>,
    asset_uri: Mutex<Option<String>>,
    duration: Mutex<Option<f64>>,
    tx: broadcast::Sender<MediaEvent>,
}

impl FakePlayer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            asset_uri: Mutex::new(None),
            duration: Mutex::new(None),
            tx: broadcast::channel(64).0,
        })
    }

    fn fire(&self, event: MediaEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl PlayerBackend for FakePlayer {
    async fn load(&self, url: &str) -> Result<()> {
        self.loads.lock().unwrap().push(url.to_string());
        self.ops.lock().unwrap().push("load");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.ops.lock().unwrap().push("pause");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.ops.lock().unwrap().push("stop");
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        self.ops.lock().unwrap().push("unload");
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        self.ops.lock().unwrap().push("detach");
        Ok(())
    }

    fn asset_uri(&self) -> Option<String> {
        self.asset_uri.lock().unwrap().clone()
    }

    fn duration(&self) -> Option<f64> {
        *self.duration.lock().unwrap()
    }

    fn events(&self) -> broadcast::Receiver<MediaEvent> {
        self.tx.subscribe()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
    tracker: PlayerTracker,
}

async fn tracker_with(
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
    config: Config,
) -> PlayerTracker {
    let config = ConfigHandle::new(config);
    let emitter = EventEmitter::new(transport, config.clone());
    PlayerTracker::restore(store, emitter, config).await
}

async fn local_harness(config: Config) -> (Harness, Arc<FakePlayer>, Arc<FakeMedia>) {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::acking());
    let tracker = tracker_with(store.clone(), transport.clone(), config).await;
    let player = FakePlayer::new();
    let media = FakeMedia::new();
    (
        Harness {
            store,
            transport,
            tracker,
        },
        player,
        media,
    )
}

async fn persisted_core(store: &Arc<MemoryStore>) -> Option<SessionCore> {
    store
        .get("player/session")
        .await
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

/// Lets the spawned listener task drain pending broadcast events.
async fn settle() {
    sleep(Duration::from_millis(20)).await;
}

// ---------------------------------------------------------------------------
// Player session tracking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn summary_is_emitted_at_most_once_per_session() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    settle().await;

    // Ended followed by a teardown both race toward the summary.
    media.fire(MediaEvent::Ended);
    settle().await;
    player.fire(MediaEvent::Unloading);
    settle().await;
    h.tracker
        .end_session(EndReason::Unload, EndOptions::default())
        .await;

    assert_eq!(h.transport.named("player_session_end").len(), 1);
}

#[tokio::test]
async fn ended_summary_reports_watched_time_and_clears_the_record() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    sleep(Duration::from_millis(120)).await;
    media.fire(MediaEvent::Pause);
    settle().await;
    media.fire(MediaEvent::Playing);
    sleep(Duration::from_millis(80)).await;

    h.tracker
        .end_session(EndReason::Ended, EndOptions::default())
        .await;

    let summaries = h.transport.named("player_session_end");
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary["reason"], "ended");
    assert_eq!(summary["src"], "http://cdn/videoA.mpd");
    let watched_ms = summary["watched_ms"].as_u64().unwrap();
    assert!(
        (180..2000).contains(&watched_ms),
        "watched_ms out of range: {watched_ms}"
    );

    // Terminal reason: the persisted record is gone.
    assert!(persisted_core(&h.store).await.is_none());
}

#[tokio::test]
async fn reloading_the_same_url_continues_the_persisted_session() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    sleep(Duration::from_millis(100)).await;
    media.fire(MediaEvent::Pause);
    settle().await;

    let before = persisted_core(&h.store).await.expect("record persisted");
    assert!(before.active && !before.sent);
    assert!(before.watched_ms >= 80);

    // Process teardown: a fresh tracker restores from the same store.
    let tracker = tracker_with(h.store.clone(), h.transport.clone(), Config::default()).await;
    let player2 = FakePlayer::new();
    let media2 = FakeMedia::new();
    let tracked = tracker
        .bind_local(player2, media2, MetadataSource::default())
        .await;
    tracked.load("http://cdn/videoA.mpd").await.unwrap();

    let after = persisted_core(&h.store).await.expect("record persisted");
    assert_eq!(after.started_at, before.started_at);
    assert!(after.watched_ms >= before.watched_ms);
    assert!(h.transport.named("player_session_end").is_empty());
}

#[tokio::test]
async fn reloading_a_different_url_abandons_the_persisted_session() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    sleep(Duration::from_millis(90)).await;
    media.fire(MediaEvent::Pause);
    settle().await;
    let old = persisted_core(&h.store).await.unwrap();

    let tracker = tracker_with(h.store.clone(), h.transport.clone(), Config::default()).await;
    let player2 = FakePlayer::new();
    let media2 = FakeMedia::new();
    let tracked = tracker
        .bind_local(player2, media2, MetadataSource::default())
        .await;
    tracked.load("http://cdn/videoB.mpd").await.unwrap();

    let summaries = h.transport.named("player_session_end");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["reason"], "restart_abandoned");
    assert_eq!(summaries[0]["src"], "http://cdn/videoA.mpd");
    assert_eq!(summaries[0]["watched_ms"].as_u64().unwrap(), old.watched_ms);

    let fresh = persisted_core(&h.store).await.unwrap();
    assert_eq!(fresh.src, "http://cdn/videoB.mpd");
    assert_eq!(fresh.watched_ms, 0);
}

#[tokio::test]
async fn loading_a_new_url_closes_the_current_session_first() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    sleep(Duration::from_millis(60)).await;

    tracked.load("http://cdn/videoB.mpd").await.unwrap();

    let summaries = h.transport.named("player_session_end");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["reason"], "load_new_url");
    assert_eq!(summaries[0]["src"], "http://cdn/videoA.mpd");
    assert!(summaries[0]["watched_ms"].as_u64().unwrap() >= 40);

    let fresh = persisted_core(&h.store).await.unwrap();
    assert_eq!(fresh.src, "http://cdn/videoB.mpd");
    assert_eq!(fresh.watched_ms, 0);
    assert!(fresh.active && !fresh.sent);
}

#[tokio::test]
async fn non_terminal_end_keeps_a_recoverable_record() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    settle().await;

    h.tracker
        .end_session(EndReason::Unload, EndOptions::default())
        .await;

    let record = persisted_core(&h.store).await.expect("record kept");
    assert!(record.sent);
    assert!(!record.active);
    assert_eq!(record.src, "http://cdn/videoA.mpd");
}

#[tokio::test]
async fn content_change_rolls_the_session_without_reload() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(
            player.clone(),
            media.clone(),
            MetadataSource::Static(Metadata(
                json!({"contentId": "show-1"}).as_object().unwrap().clone(),
            )),
        )
        .await;

    tracked.load("http://cdn/live.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    sleep(Duration::from_millis(60)).await;

    h.tracker
        .content_changed(Some(MetadataSource::Static(Metadata(
            json!({"contentId": "show-2"}).as_object().unwrap().clone(),
        ))))
        .await;

    let first = h.transport.named("player_session_end");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0]["reason"], "content_change");
    assert_eq!(first[0]["content_id"], "show-1");

    // No new load was issued against the backend.
    assert_eq!(player.loads.lock().unwrap().len(), 1);

    media.fire(MediaEvent::Playing);
    settle().await;
    h.tracker
        .end_session(EndReason::Ended, EndOptions::default())
        .await;

    let all = h.transport.named("player_session_end");
    assert_eq!(all.len(), 2);
    assert_eq!(all[1]["content_id"], "show-2");
    assert!(all[1]["watched_ms"].as_u64().unwrap() < first[0]["watched_ms"].as_u64().unwrap() + 60);
}

#[tokio::test]
async fn content_change_without_active_session_is_a_noop() {
    let (h, _player, _media) = local_harness(Config::default()).await;
    h.tracker.content_changed(None).await;
    assert!(h.transport.names().is_empty());
}

#[tokio::test]
async fn duration_backfill_produces_watch_ratio() {
    let (h, player, media) = local_harness(Config::default()).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.set_duration(100.0);
    media.fire(MediaEvent::LoadedMetadata);
    settle().await;
    media.fire(MediaEvent::Playing);
    settle().await;

    h.tracker
        .end_session(EndReason::Ended, EndOptions::default())
        .await;

    let summary = &h.transport.named("player_session_end")[0];
    assert_eq!(summary["duration_sec"], 100);
    let ratio = summary["watch_ratio"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&ratio));
}

#[tokio::test]
async fn raw_events_track_transitions_on_the_local_path() {
    let mut config = Config::default();
    config.player.raw = true;
    let (h, player, media) = local_harness(config).await;
    let tracked = h
        .tracker
        .bind_local(player.clone(), media.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();
    media.fire(MediaEvent::Playing);
    settle().await;
    media.fire(MediaEvent::Seeking);
    settle().await;
    media.fire(MediaEvent::Seeked);
    settle().await;
    media.fire(MediaEvent::Pause);
    settle().await;

    let states: Vec<String> = h
        .transport
        .named("player_state")
        .iter()
        .map(|p| p["state"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(states, vec!["playing", "seeking", "pause"]);
    assert_eq!(h.transport.named("player_seek").len(), 1);
    assert_eq!(h.transport.named("player_seeked").len(), 1);
}

#[tokio::test]
async fn remote_path_ignores_seek_events() {
    let mut config = Config::default();
    config.player.raw = true;
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::acking());
    let tracker = tracker_with(store, transport.clone(), config).await;
    let player = FakePlayer::new();
    let tracked = tracker
        .bind_remote(player.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/remote.mpd").await.unwrap();
    player.fire(MediaEvent::Playing);
    settle().await;
    player.fire(MediaEvent::Seeking);
    player.fire(MediaEvent::Seeked);
    settle().await;

    assert!(transport.named("player_seek").is_empty());
    assert!(transport.named("player_seeked").is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_detach_flushes_the_summary_before_detaching() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::acking());
    let tracker = tracker_with(store, transport.clone(), Config::default()).await;
    let player = FakePlayer::new();
    let tracked = tracker
        .bind_remote(player.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/remote.mpd").await.unwrap();
    player.fire(MediaEvent::Playing);
    settle().await;

    tracked.detach().await.unwrap();

    let summaries = transport.named("player_session_end");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["reason"], "unload");
    // The backend detach runs only after the delivery wait resolved.
    assert_eq!(*player.ops.lock().unwrap().last().unwrap(), "detach");
}

#[tokio::test]
async fn remote_load_mode_change_ends_the_session() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::acking());
    let tracker = tracker_with(store, transport.clone(), Config::default()).await;
    let player = FakePlayer::new();
    let tracked = tracker
        .bind_remote(player.clone(), MetadataSource::default())
        .await;

    tracked.load("http://cdn/remote.mpd").await.unwrap();
    player.fire(MediaEvent::Playing);
    settle().await;
    player.fire(MediaEvent::LoadModeChange);
    settle().await;

    let summaries = transport.named("player_session_end");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["reason"], "load_new_url");
}

#[tokio::test]
async fn malformed_persisted_record_is_ignored() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    store.set("player/session", "{not json").await.unwrap();
    let transport = Arc::new(RecordingTransport::acking());
    let tracker = tracker_with(store.clone(), transport.clone(), Config::default()).await;
    let player = FakePlayer::new();
    let media = FakeMedia::new();
    let tracked = tracker
        .bind_local(player, media, MetadataSource::default())
        .await;

    tracked.load("http://cdn/videoA.mpd").await.unwrap();

    // No abandoned summary, just a fresh session.
    assert!(transport.named("player_session_end").is_empty());
    assert_eq!(persisted_core(&store).await.unwrap().src, "http://cdn/videoA.mpd");
}

// ---------------------------------------------------------------------------
// Facade / lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn user_disconnect_flushes_player_before_lifecycle_summary() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::acking());
    let analytics = AnalyticsBuilder::new(store.clone(), transport.clone())
        .remote_player(FakePlayer::new())
        .build()
        .await;
    analytics.init("demo", json!({})).await;

    let tracked = analytics
        .track_remote_player_events(MetadataSource::default())
        .await
        .unwrap();
    tracked.load("http://cdn/remote.mpd").await.unwrap();

    let signals = analytics.lifecycle_sender();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    signals
        .send(LifecycleSignal::UserDisconnected { done: done_tx })
        .unwrap();
    done_rx.await.unwrap();

    let names = transport.names();
    let player_idx = names
        .iter()
        .position(|n| n == "player_session_end")
        .expect("player summary sent");
    let lifecycle_idx = names
        .iter()
        .position(|n| n == "lifecycle_session_end")
        .expect("lifecycle summary sent");
    assert!(player_idx < lifecycle_idx);

    let summary = &transport.named("player_session_end")[0];
    assert_eq!(summary["reason"], "session_end");
    // Terminal reason clears the persisted record.
    assert_eq!(store.get("player/session").await.unwrap(), None);
}

#[tokio::test]
async fn background_time_folds_into_the_counters() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::acking());
    let analytics = AnalyticsBuilder::new(store.clone(), transport.clone())
        .build()
        .await;

    let signals = analytics.lifecycle_sender();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    signals
        .send(LifecycleSignal::BeforeStateChange {
            state: senza_analytics::TransitionState::Background,
            ready: ready_tx,
        })
        .unwrap();
    ready_rx.await.unwrap();
    signals
        .send(LifecycleSignal::StateChange {
            state: senza_analytics::TransitionState::Background,
        })
        .unwrap();
    sleep(Duration::from_millis(950)).await;
    signals
        .send(LifecycleSignal::StateChange {
            state: senza_analytics::TransitionState::Foreground,
        })
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let background: u64 = store
        .get("stopwatch/background")
        .await
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=2).contains(&background), "background = {background}");
    // The stamp is cleared once foregrounded again.
    assert_eq!(
        store.get("stopwatch/backgroundTime").await.unwrap().unwrap(),
        "0"
    );
}

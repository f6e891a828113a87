//! Player session tracker: binds to a playback source, sequences session
//! boundaries around its load/stop/unload/detach operations, and reconciles
//! freshly loaded sessions with a record persisted before teardown.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::warn;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigHandle;
use crate::events::{await_delivery, EventEmitter};
use crate::playback::{MediaElement, MediaEvent, PlayerBackend};
use crate::store::{keys, SessionStore};

use super::meta::{snake_keys, Metadata, MetadataSource, ResolveContext};
use super::session::{EndReason, PlayerSession, SessionCore};

#[derive(Debug, Clone, Copy, Default)]
pub struct EndOptions {
    /// Hold the returned future until the summary is acknowledged or the
    /// delivery timeout elapses.
    pub await_delivery: bool,
    /// Tear down the playback event listeners with the session.
    pub detach_listeners: bool,
}

#[derive(Clone)]
enum Binding {
    Local {
        player: Arc<dyn PlayerBackend>,
        media: Arc<dyn MediaElement>,
    },
    Remote {
        player: Arc<dyn PlayerBackend>,
    },
}

impl Binding {
    fn player(&self) -> &Arc<dyn PlayerBackend> {
        match self {
            Binding::Local { player, .. } | Binding::Remote { player } => player,
        }
    }

    fn media(&self) -> Option<&Arc<dyn MediaElement>> {
        match self {
            Binding::Local { media, .. } => Some(media),
            Binding::Remote { .. } => None,
        }
    }

    fn current_time(&self) -> f64 {
        match self {
            Binding::Local { media, .. } => media.current_time(),
            Binding::Remote { player } => player.current_time(),
        }
    }

    fn duration(&self) -> Option<f64> {
        match self {
            Binding::Local { media, .. } => media.duration(),
            Binding::Remote { player } => player.duration(),
        }
    }
}

/// Resolved playback URL: live media source first, then metadata, then the
/// URL the load was requested with.
fn resolve_src(binding: Option<&Binding>, session: &PlayerSession) -> String {
    let from_binding = match binding {
        Some(Binding::Local { media, .. }) => media.current_src().filter(|s| !s.is_empty()),
        _ => None,
    };
    from_binding
        .or_else(|| session.meta.src_or_url().map(str::to_string))
        .or_else(|| match binding {
            Some(Binding::Remote { player }) => player.asset_uri().filter(|s| !s.is_empty()),
            _ => None,
        })
        .unwrap_or_else(|| session.url_hint.clone())
}

enum PersistAction {
    Save(SessionCore),
    Clear,
}

struct TrackerState {
    session: Option<PlayerSession>,
    /// Candidate persisted before an unexpected teardown; consulted only by
    /// the next load interception.
    restored: Option<SessionCore>,
    binding: Option<Binding>,
    meta_source: MetadataSource,
    listener: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct PlayerTracker {
    state: Arc<Mutex<TrackerState>>,
    store: Arc<dyn SessionStore>,
    emitter: EventEmitter,
    config: ConfigHandle,
}

impl PlayerTracker {
    /// Restores the persisted session candidate; malformed or unreadable
    /// data is treated as absent.
    pub async fn restore(
        store: Arc<dyn SessionStore>,
        emitter: EventEmitter,
        config: ConfigHandle,
    ) -> Self {
        let restored = match store.get(keys::PLAYER_SESSION).await {
            Ok(Some(raw)) => match serde_json::from_str::<SessionCore>(&raw) {
                Ok(core) => Some(core),
                Err(err) => {
                    warn!("Discarding malformed persisted player session: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("Failed to read persisted player session: {err}");
                None
            }
        };

        Self {
            state: Arc::new(Mutex::new(TrackerState {
                session: None,
                restored,
                binding: None,
                meta_source: MetadataSource::default(),
                listener: None,
            })),
            store,
            emitter,
            config,
        }
    }

    /// Tracks a local player paired with its media element. Low-level
    /// transitions arrive as media events; only `load` is intercepted.
    pub async fn bind_local(
        &self,
        player: Arc<dyn PlayerBackend>,
        media: Arc<dyn MediaElement>,
        meta_source: MetadataSource,
    ) -> TrackedPlayer {
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            if let Some(old) = state.listener.take() {
                old.cancel();
            }
            state.binding = Some(Binding::Local {
                player: player.clone(),
                media: media.clone(),
            });
            state.meta_source = meta_source;
            state.listener = Some(token.clone());
        }

        self.spawn_media_listener(media.events(), token.clone());
        self.spawn_player_listener(player.events(), token, BindMode::Local);

        TrackedPlayer {
            tracker: self.clone(),
            mode: BindMode::Local,
        }
    }

    /// Tracks a remote player proxy used standalone. All control operations
    /// are intercepted; only the remote's own event subset is observed.
    pub async fn bind_remote(
        &self,
        player: Arc<dyn PlayerBackend>,
        meta_source: MetadataSource,
    ) -> TrackedPlayer {
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            if let Some(old) = state.listener.take() {
                old.cancel();
            }
            state.binding = Some(Binding::Remote {
                player: player.clone(),
            });
            state.meta_source = meta_source;
            state.listener = Some(token.clone());
        }

        self.spawn_player_listener(player.events(), token, BindMode::Remote);

        TrackedPlayer {
            tracker: self.clone(),
            mode: BindMode::Remote,
        }
    }

    fn spawn_media_listener(
        &self,
        mut events: broadcast::Receiver<MediaEvent>,
        token: CancellationToken,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => tracker.on_media_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Media event stream lagged, skipped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_player_listener(
        &self,
        mut events: broadcast::Receiver<MediaEvent>,
        token: CancellationToken,
        mode: BindMode,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => match mode {
                            BindMode::Local => tracker.on_local_player_event(event).await,
                            BindMode::Remote => tracker.on_remote_player_event(event).await,
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Player event stream lagged, skipped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn on_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::Playing => self.enter_playing().await,
            MediaEvent::Pause => self.leave_playing(Some("pause")).await,
            MediaEvent::Waiting => self.leave_playing(Some("waiting")).await,
            MediaEvent::Stalled => self.leave_playing(Some("stalled")).await,
            MediaEvent::Seeking => self.on_seeking().await,
            MediaEvent::Seeked => self.on_seeked().await,
            MediaEvent::Ended => {
                self.leave_playing(Some("ended")).await;
                self.end_session(EndReason::Ended, EndOptions::default())
                    .await;
            }
            MediaEvent::LoadedMetadata => self.backfill_duration().await,
            MediaEvent::Unloading | MediaEvent::LoadModeChange => {}
        }
    }

    async fn on_local_player_event(&self, event: MediaEvent) {
        if event == MediaEvent::Unloading {
            self.end_session(EndReason::Unload, EndOptions::default())
                .await;
        }
    }

    /// The remote proxy publishes a reduced event subset; pause and unload
    /// boundaries come from operation interception instead.
    async fn on_remote_player_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::Playing => self.enter_playing().await,
            MediaEvent::Ended => {
                self.leave_playing(Some("ended")).await;
                self.end_session(EndReason::Ended, EndOptions::default())
                    .await;
            }
            MediaEvent::LoadedMetadata => self.backfill_duration().await,
            MediaEvent::LoadModeChange => {
                self.end_session(EndReason::LoadNewUrl, EndOptions::default())
                    .await;
            }
            _ => {}
        }
    }

    async fn enter_playing(&self) {
        let now = Utc::now().timestamp_millis();
        let (core, raw_params) = {
            let mut state = self.state.lock().await;
            let current_time = state
                .binding
                .as_ref()
                .map(Binding::current_time)
                .unwrap_or(0.0);
            let Some(session) = state.session.as_mut().filter(|s| s.active) else {
                return;
            };
            session.enter_playing(now);
            session.last_time = current_time;
            let snapshot = session.clone();
            let src = resolve_src(state.binding.as_ref(), &snapshot);
            let raw_params = self
                .config
                .player()
                .raw
                .then(|| state_params(&snapshot, &src, "playing", None, current_time));
            (snapshot.core(src), raw_params)
        };

        self.persist(core).await;
        if let Some(params) = raw_params {
            self.emitter.emit("player_state", params);
        }
    }

    pub(crate) async fn leave_playing(&self, raw_state: Option<&str>) {
        let now = Utc::now().timestamp_millis();
        let (core, raw_params) = {
            let mut state = self.state.lock().await;
            let current_time = state
                .binding
                .as_ref()
                .map(Binding::current_time)
                .unwrap_or(0.0);
            let Some(session) = state.session.as_mut().filter(|s| s.active) else {
                return;
            };
            session.fold_interval(now);
            session.last_time = current_time;
            let snapshot = session.clone();
            let src = resolve_src(state.binding.as_ref(), &snapshot);
            let raw_params = match raw_state {
                Some(name) if self.config.player().raw => {
                    Some(state_params(&snapshot, &src, name, None, current_time))
                }
                _ => None,
            };
            (snapshot.core(src), raw_params)
        };

        self.persist(core).await;
        if let Some(params) = raw_params {
            self.emitter.emit("player_state", params);
        }
    }

    async fn on_seeking(&self) {
        self.leave_playing(Some("seeking")).await;

        if !self.config.player().raw {
            return;
        }
        let params = {
            let state = self.state.lock().await;
            let Some(session) = state.session.as_ref().filter(|s| s.active) else {
                return;
            };
            let current_time = state
                .binding
                .as_ref()
                .map(Binding::current_time)
                .unwrap_or(0.0);
            let src = resolve_src(state.binding.as_ref(), session);
            seek_params(session, &src, current_time)
        };
        self.emitter.emit("player_seek", params);
    }

    async fn on_seeked(&self) {
        if !self.config.player().raw {
            return;
        }
        let params = {
            let state = self.state.lock().await;
            let Some(session) = state.session.as_ref().filter(|s| s.active) else {
                return;
            };
            let current_time = state
                .binding
                .as_ref()
                .map(Binding::current_time)
                .unwrap_or(0.0);
            let src = resolve_src(state.binding.as_ref(), session);
            seek_params(session, &src, current_time)
        };
        self.emitter.emit("player_seeked", params);
    }

    /// One-shot `durationSec` backfill once the real media duration is known.
    async fn backfill_duration(&self) {
        let core = {
            let mut state = self.state.lock().await;
            let duration = state.binding.as_ref().and_then(Binding::duration);
            let Some(session) = state.session.as_mut().filter(|s| s.active) else {
                return;
            };
            if session.meta.duration_sec().is_some() {
                return;
            }
            let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) else {
                return;
            };
            session.meta.set_duration_sec(duration.round() as u64);
            let snapshot = session.clone();
            let src = resolve_src(state.binding.as_ref(), &snapshot);
            snapshot.core(src)
        };
        self.persist(core).await;
    }

    /// Load interception. Decides continuation vs. abandonment against the
    /// restored candidate, always closes the current session before the
    /// underlying load runs, and begins the new session after it completes.
    pub(crate) async fn intercept_load(&self, url: &str) -> Result<()> {
        let (continuation, abandoned) = {
            let state = self.state.lock().await;
            match &state.restored {
                Some(core) if core.continues(url) => (Some(core.clone()), None),
                Some(core) if core.active && !core.sent => (None, Some(core.clone())),
                _ => (None, None),
            }
        };

        if continuation.is_none() {
            if let Some(core) = &abandoned {
                self.emitter
                    .emit("player_session_end", abandoned_params(core));
            }
            self.end_session(EndReason::LoadNewUrl, EndOptions::default())
                .await;
        }

        let (source, ctx, player) = {
            let state = self.state.lock().await;
            let binding = state
                .binding
                .as_ref()
                .ok_or_else(|| anyhow!("no playback source bound"))?;
            (
                state.meta_source.clone(),
                ResolveContext {
                    url: url.to_string(),
                    player: Some(binding.player().clone()),
                    media: binding.media().cloned(),
                },
                binding.player().clone(),
            )
        };

        let mut meta = source.resolve(ctx).await;
        if meta.src().is_none() {
            meta.set_src(url);
        }

        player.load(url).await?;

        let core = {
            let mut state = self.state.lock().await;
            let mut session = PlayerSession::begin(meta, url, Utc::now().timestamp_millis());
            if let Some(restored) = &continuation {
                session.adopt(restored);
            }
            state.restored = None;

            // Prefer the canonical asset URI once the player resolved one.
            if let Some(uri) = state
                .binding
                .as_ref()
                .and_then(|b| b.player().asset_uri())
                .filter(|s| !s.is_empty())
            {
                session.meta.set_src(&uri);
            }

            let src = resolve_src(state.binding.as_ref(), &session);
            let core = session.core(src);
            state.session = Some(session);
            core
        };
        self.persist(core).await;

        Ok(())
    }

    /// Idempotent session close. Every end-triggering path funnels through
    /// here; the summary is emitted at most once per session.
    pub async fn end_session(&self, reason: EndReason, opts: EndOptions) {
        let now = Utc::now().timestamp_millis();
        let (raw_params, summary_params, persist_action, listener) = {
            let mut state = self.state.lock().await;
            let current_time = state
                .binding
                .as_ref()
                .map(Binding::current_time)
                .unwrap_or(0.0);
            let Some(session) = state.session.as_mut().filter(|s| s.active) else {
                return;
            };

            session.fold_interval(now);
            session.last_time = current_time;

            let player_config = self.config.player();
            let send_summary = player_config.summary && !session.sent;
            session.sent = true;
            session.active = false;

            let snapshot = session.clone();
            let src = resolve_src(state.binding.as_ref(), &snapshot);

            let raw_params = player_config.raw.then(|| {
                state_params(&snapshot, &src, "closing", Some(reason.as_str()), current_time)
            });
            let summary_params =
                send_summary.then(|| summary_payload(&snapshot, &src, reason.as_str()));

            let listener = if opts.detach_listeners {
                state.listener.take()
            } else {
                None
            };

            let persist_action = if reason.is_terminal() {
                state.restored = None;
                PersistAction::Clear
            } else {
                PersistAction::Save(snapshot.core(src))
            };

            (raw_params, summary_params, persist_action, listener)
        };

        if let Some(params) = raw_params {
            self.emitter.emit("player_state", params);
        }

        let ack = summary_params.map(|params| {
            if opts.await_delivery {
                Some(self.emitter.emit_with_delivery("player_session_end", params))
            } else {
                self.emitter.emit("player_session_end", params);
                None
            }
        });

        match persist_action {
            PersistAction::Clear => self.clear_persisted().await,
            PersistAction::Save(core) => self.persist(core).await,
        }

        if let Some(token) = listener {
            token.cancel();
        }

        if let Some(Some(rx)) = ack {
            await_delivery(rx).await;
        }
    }

    /// Logical content change within one continuous stream: closes the
    /// current session and opens a fresh one on the same playback handles.
    pub async fn content_changed(&self, meta_source: Option<MetadataSource>) {
        let (prior_source, ctx, url_hint) = {
            let state = self.state.lock().await;
            let Some(session) = state.session.as_ref().filter(|s| s.active) else {
                warn!("contentChanged called with no active player session");
                return;
            };
            let url = resolve_src(state.binding.as_ref(), session);
            let ctx = ResolveContext {
                url,
                player: state.binding.as_ref().map(|b| b.player().clone()),
                media: state.binding.as_ref().and_then(|b| b.media().cloned()),
            };
            (state.meta_source.clone(), ctx, session.url_hint.clone())
        };

        self.end_session(
            EndReason::ContentChange,
            EndOptions {
                await_delivery: false,
                detach_listeners: false,
            },
        )
        .await;

        let source = meta_source.unwrap_or(prior_source);
        let mut meta = source.resolve(ctx.clone()).await;
        if meta.src().is_none() {
            meta.set_src(&ctx.url);
        }

        let mut state = self.state.lock().await;
        state.meta_source = source;
        state.session = Some(PlayerSession::begin(
            meta,
            &url_hint,
            Utc::now().timestamp_millis(),
        ));
    }

    /// Persists the current session record, closed or not. Called by the
    /// lifecycle tracker when the host is about to be backgrounded.
    pub async fn persist_current(&self) {
        let core = {
            let state = self.state.lock().await;
            state.session.as_ref().map(|session| {
                let src = resolve_src(state.binding.as_ref(), session);
                session.core(src)
            })
        };
        if let Some(core) = core {
            self.persist(core).await;
        }
    }

    pub(crate) async fn backend(&self) -> Result<Arc<dyn PlayerBackend>> {
        let state = self.state.lock().await;
        state
            .binding
            .as_ref()
            .map(|b| b.player().clone())
            .ok_or_else(|| anyhow!("no playback source bound"))
    }

    async fn persist(&self, core: SessionCore) {
        match serde_json::to_string(&core) {
            Ok(raw) => {
                if let Err(err) = self.store.set(keys::PLAYER_SESSION, &raw).await {
                    warn!("Failed to persist player session: {err}");
                }
            }
            Err(err) => warn!("Failed to serialize player session: {err}"),
        }
    }

    async fn clear_persisted(&self) {
        if let Err(err) = self.store.remove(keys::PLAYER_SESSION).await {
            warn!("Failed to clear persisted player session: {err}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindMode {
    Local,
    Remote,
}

/// Host-facing wrapper around the bound playback source. Session boundaries
/// are sequenced around the operations before they reach the backend.
pub struct TrackedPlayer {
    tracker: PlayerTracker,
    mode: BindMode,
}

impl TrackedPlayer {
    pub async fn load(&self, url: &str) -> Result<()> {
        self.tracker.intercept_load(url).await
    }

    pub async fn pause(&self) -> Result<()> {
        let player = self.tracker.backend().await?;
        let result = player.pause().await;
        if self.mode == BindMode::Remote {
            self.tracker.leave_playing(Some("pause")).await;
        }
        result
    }

    pub async fn stop(&self) -> Result<()> {
        let player = self.tracker.backend().await?;
        if self.mode == BindMode::Remote {
            self.tracker.leave_playing(Some("unload")).await;
            self.tracker
                .end_session(EndReason::Unload, EndOptions::default())
                .await;
        }
        player.stop().await
    }

    pub async fn unload(&self) -> Result<()> {
        let player = self.tracker.backend().await?;
        if self.mode == BindMode::Remote {
            self.tracker.leave_playing(Some("unload")).await;
            self.tracker
                .end_session(EndReason::Unload, EndOptions::default())
                .await;
        }
        player.unload().await
    }

    pub async fn detach(&self) -> Result<()> {
        let player = self.tracker.backend().await?;
        if self.mode == BindMode::Remote {
            self.tracker.leave_playing(Some("unload")).await;
            self.tracker
                .end_session(
                    EndReason::Unload,
                    EndOptions {
                        await_delivery: true,
                        detach_listeners: false,
                    },
                )
                .await;
        }
        player.detach().await
    }
}

fn state_params(
    session: &PlayerSession,
    src: &str,
    state: &str,
    reason: Option<&str>,
    current_time: f64,
) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("state".into(), Value::String(state.to_string()));
    if let Some(reason) = reason {
        params.insert("reason".into(), Value::String(reason.to_string()));
    }
    params.insert("current_time".into(), Value::from(current_time));
    params.insert("src".into(), Value::String(src.to_string()));
    params.extend(session.meta.snake_params());
    params
}

fn seek_params(session: &PlayerSession, src: &str, current_time: f64) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("current_time".into(), Value::from(current_time));
    params.insert("src".into(), Value::String(src.to_string()));
    params.extend(session.meta.snake_params());
    params
}

fn summary_payload(session: &PlayerSession, src: &str, reason: &str) -> Map<String, Value> {
    let watched_sec = session.watched_sec();
    let mut params = Map::new();
    params.insert("src".into(), Value::String(src.to_string()));
    params.insert("reason".into(), Value::String(reason.to_string()));
    params.insert("session_id".into(), Value::String(session.id.to_string()));
    params.insert("started_at_ms".into(), Value::from(session.started_at_ms));
    params.insert("watched_ms".into(), Value::from(session.watched_ms));
    params.insert("watched_sec".into(), Value::from(watched_sec));
    params.extend(session.meta.snake_params());

    if let Some(duration_sec) = session.meta.duration_sec().filter(|d| *d > 0) {
        let ratio = watched_sec as f64 / duration_sec as f64;
        params.insert("duration_sec".into(), Value::from(duration_sec));
        params.insert(
            "watch_ratio".into(),
            Value::from(((ratio * 1000.0).round() / 1000.0).min(1.0)),
        );
    }
    params
}

fn abandoned_params(core: &SessionCore) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("src".into(), Value::String(core.src.clone()));
    params.insert("reason".into(), Value::String("restart_abandoned".into()));
    if let Some(id) = core.session_id {
        params.insert("session_id".into(), Value::String(id.to_string()));
    }
    params.insert("started_at_ms".into(), Value::from(core.started_at));
    params.insert("watched_ms".into(), Value::from(core.watched_ms));
    params.insert("watched_sec".into(), Value::from(core.watched_sec()));
    params.extend(snake_keys(&core.meta_snapshot));
    params
}

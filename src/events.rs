//! Event formatting and dispatch to the external analytics transport.
//!
//! The emitter itself never blocks beyond the transport's synchronous call;
//! the session-end paths that need a guaranteed flush race an acknowledgment
//! channel against a fixed timeout via [`await_delivery`].

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time;

use crate::config::ConfigHandle;

/// How long a delivery wait may outlast an unacknowledged event.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Extra settle time after an acknowledgment. The transport's delivery
/// callback fires before the network flush is guaranteed complete.
pub const DELIVERY_GRACE: Duration = Duration::from_millis(3000);

/// One outgoing event as handed to the transport.
pub struct TransportEvent {
    pub params: Map<String, Value>,
    /// Fired by the transport once the event has been handed off. The
    /// emitter never races this against a timer; callers do.
    pub event_callback: Option<oneshot::Sender<()>>,
    pub event_timeout: Option<Duration>,
}

/// External analytics delivery surface (e.g. a gtag bridge).
pub trait AnalyticsTransport: Send + Sync {
    /// One-time transport bootstrap with the measurement id.
    fn configure(&self, measurement_id: &str, debug: bool) {
        let _ = (measurement_id, debug);
    }

    fn set_user_properties(&self, props: &Map<String, Value>) {
        let _ = props;
    }

    fn send(&self, name: &str, event: TransportEvent);
}

#[derive(Clone)]
pub struct EventEmitter {
    transport: Arc<dyn AnalyticsTransport>,
    config: ConfigHandle,
}

impl EventEmitter {
    pub fn new(transport: Arc<dyn AnalyticsTransport>, config: ConfigHandle) -> Self {
        Self { transport, config }
    }

    /// Fire-and-forget dispatch with the fixed transport properties merged in.
    pub fn emit(&self, name: &str, params: Map<String, Value>) {
        let params = self.decorate(params);
        debug!("event {name} {}", Value::Object(params.clone()));
        self.transport.send(
            name,
            TransportEvent {
                params,
                event_callback: None,
                event_timeout: None,
            },
        );
    }

    /// Dispatch with an acknowledgment channel attached; the caller awaits
    /// the returned receiver through [`await_delivery`].
    pub fn emit_with_delivery(&self, name: &str, params: Map<String, Value>) -> oneshot::Receiver<()> {
        let params = self.decorate(params);
        debug!("event {name} (awaiting delivery) {}", Value::Object(params.clone()));
        let (ack_tx, ack_rx) = oneshot::channel();
        self.transport.send(
            name,
            TransportEvent {
                params,
                event_callback: Some(ack_tx),
                event_timeout: Some(DELIVERY_TIMEOUT),
            },
        );
        ack_rx
    }

    fn decorate(&self, mut params: Map<String, Value>) -> Map<String, Value> {
        params.insert("debug_mode".into(), Value::Bool(self.config.debug_mode()));
        params.insert("transport_type".into(), Value::String("beacon".into()));
        params
    }
}

/// Resolves once the event is considered delivered: either the transport
/// acknowledged (plus the grace delay) or the timeout elapsed. Returns
/// uniformly regardless of which side won.
pub async fn await_delivery(ack: oneshot::Receiver<()>) {
    match time::timeout(DELIVERY_TIMEOUT, ack).await {
        // Acknowledged: allow the network flush to settle.
        Ok(Ok(())) => time::sleep(DELIVERY_GRACE).await,
        // Transport dropped the callback or the timeout elapsed.
        Ok(Err(_)) | Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct RecordingTransport {
        sent: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl AnalyticsTransport for RecordingTransport {
        fn send(&self, name: &str, event: TransportEvent) {
            self.sent
                .lock()
                .unwrap()
                .push((name.to_string(), event.params));
            if let Some(ack) = event.event_callback {
                let _ = ack.send(());
            }
        }
    }

    #[tokio::test]
    async fn emit_merges_fixed_transport_properties() {
        let transport = Arc::new(RecordingTransport {
            sent: Mutex::new(Vec::new()),
        });
        let emitter = EventEmitter::new(transport.clone(), ConfigHandle::default());

        let mut params = Map::new();
        params.insert("state".into(), Value::String("playing".into()));
        emitter.emit("player_state", params);

        let sent = transport.sent.lock().unwrap();
        let (name, params) = &sent[0];
        assert_eq!(name, "player_state");
        assert_eq!(params["transport_type"], "beacon");
        assert_eq!(params["debug_mode"], Value::Bool(false));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_delivery_waits_only_the_grace_delay() {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = ack_tx.send(());

        let before = Instant::now();
        await_delivery(ack_rx).await;
        // Paused clock: only the 3s grace sleep should have been consumed.
        assert_eq!(before.elapsed(), DELIVERY_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_delivery_times_out() {
        let (ack_tx, ack_rx) = oneshot::channel::<()>();

        let before = Instant::now();
        await_delivery(ack_rx).await;
        assert_eq!(before.elapsed(), DELIVERY_TIMEOUT);
        drop(ack_tx);
    }
}

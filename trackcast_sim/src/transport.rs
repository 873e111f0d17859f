//! Simulated pub/sub transport with fault injection.
//!
//! ```text
//!   Publisher ──► SimTransport ──► published log (decoded)
//!                     ▲
//!   Runner ──► SimTransportController (failures, loss, latency, presence)
//! ```
//!
//! Both halves share one state behind a mutex. Every random decision draws
//! from the transport's own ChaCha8 stream.

use crate::context::SimContext;
use crate::lock;
use async_trait::async_trait;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trackcast_env::{
    codec, ChannelEvent, ChannelStateListener, ConnectionStateChange, ConnectionStateListener, EnhancedLocationUpdate,
    EnvError, ErrorInformation, LocationUpdate, PresenceAction, PresenceData, PresenceListener, PresenceMessage,
    PublisherContext, Resolution, Transport,
};
use tracing::{debug, trace};

/// RNG stream used for publish loss decisions.
pub const TRANSPORT_RNG_STREAM: u64 = 0x7472_616e;

/// Status code reported for a randomly dropped publish.
const LOSS_STATUS_CODE: i32 = 503;

/// Transport operations that can be delayed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOperation {
    StartConnection,
    Connect,
    EnterPresence,
    SubscribePresence,
    Publish,
    UpdatePresence,
    Disconnect,
}

/// A publish that reached the transport and was accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedLocation {
    Enhanced(EnhancedLocationUpdate),
    Raw(LocationUpdate),
}

impl PublishedLocation {
    /// Observation time of the published position.
    pub fn time(&self) -> i64 {
        match self {
            PublishedLocation::Enhanced(update) => update.location.time,
            PublishedLocation::Raw(update) => update.location.time,
        }
    }

    pub fn skipped_times(&self) -> Vec<i64> {
        let skipped = match self {
            PublishedLocation::Enhanced(update) => &update.skipped_locations,
            PublishedLocation::Raw(update) => &update.skipped_locations,
        };
        skipped.iter().map(|location| location.time).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub trackable_id: String,

    /// Virtual milliseconds since simulation start
    pub at_ms: u64,
    pub location: PublishedLocation,
}

/// Counters reported in scenario metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub connection_starts: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub presence_enters: usize,
    pub presence_updates: usize,
    pub publish_attempts: usize,
    pub publishes_lost: usize,
    pub publishes_failed: usize,
    pub closes: usize,
}

struct TransportState {
    rng: ChaCha8Rng,

    /// Probability (0.0 - 1.0) that a publish is dropped with a retriable error
    publish_loss: f64,
    latency: HashMap<SimOperation, Duration>,
    failures: HashMap<SimOperation, VecDeque<ErrorInformation>>,

    published: Vec<PublishRecord>,
    presence_data: HashMap<String, PresenceData>,
    stats: TransportStats,

    presence_listeners: HashMap<String, PresenceListener>,
    channel_listeners: HashMap<String, ChannelStateListener>,
    connection_listeners: Vec<ConnectionStateListener>,
}

impl TransportState {
    /// Latency and scripted failure for the next call of `operation`.
    fn plan(&mut self, operation: SimOperation) -> (Option<Duration>, Option<ErrorInformation>) {
        let latency = self.latency.get(&operation).copied();
        let failure = self.failures.get_mut(&operation).and_then(VecDeque::pop_front);
        (latency, failure)
    }
}

/// In-memory transport driven by a [`SimTransportController`].
pub struct SimTransport {
    context: Arc<SimContext>,
    state: Arc<Mutex<TransportState>>,
}

impl SimTransport {
    /// Creates a transport and the controller that scripts it.
    pub fn new(context: Arc<SimContext>) -> (Self, SimTransportController) {
        let state = Arc::new(Mutex::new(TransportState {
            rng: context.derive_rng(TRANSPORT_RNG_STREAM),
            publish_loss: 0.0,
            latency: HashMap::new(),
            failures: HashMap::new(),
            published: Vec::new(),
            presence_data: HashMap::new(),
            stats: TransportStats::default(),
            presence_listeners: HashMap::new(),
            channel_listeners: HashMap::new(),
            connection_listeners: Vec::new(),
        }));
        let controller = SimTransportController {
            state: Arc::clone(&state),
        };
        (Self { context, state }, controller)
    }

    /// Applies configured latency and scripted failures for one call.
    async fn operate(&self, operation: SimOperation, trackable_id: &str) -> Result<(), EnvError> {
        let (latency, failure) = lock(&self.state).plan(operation);
        if let Some(latency) = latency {
            self.context.sleep(latency).await;
        }
        match failure {
            Some(info) => {
                debug!(?operation, trackable_id, error = %info, "Scripted transport failure");
                Err(EnvError::Connection(info))
            }
            None => Ok(()),
        }
    }

    fn decode(event: ChannelEvent, payload: &str) -> Result<PublishedLocation, EnvError> {
        match event {
            ChannelEvent::Enhanced => codec::decode_enhanced(payload).map(PublishedLocation::Enhanced),
            ChannelEvent::Raw => codec::decode_raw(payload).map(PublishedLocation::Raw),
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn start_connection(&self) -> Result<(), EnvError> {
        lock(&self.state).stats.connection_starts += 1;
        self.operate(SimOperation::StartConnection, "").await
    }

    async fn stop_connection(&self) -> Result<(), EnvError> {
        Ok(())
    }

    async fn connect(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError> {
        lock(&self.state).stats.connects += 1;
        self.operate(SimOperation::Connect, trackable_id).await?;
        lock(&self.state)
            .presence_data
            .insert(trackable_id.to_string(), presence_data.clone());
        Ok(())
    }

    async fn disconnect(&self, trackable_id: &str, _presence_data: &PresenceData) -> Result<(), EnvError> {
        lock(&self.state).stats.disconnects += 1;
        self.operate(SimOperation::Disconnect, trackable_id).await?;
        let mut state = lock(&self.state);
        state.presence_data.remove(trackable_id);
        state.presence_listeners.remove(trackable_id);
        state.channel_listeners.remove(trackable_id);
        Ok(())
    }

    async fn enter_presence(&self, trackable_id: &str, _presence_data: &PresenceData) -> Result<(), EnvError> {
        self.operate(SimOperation::EnterPresence, trackable_id).await?;
        lock(&self.state).stats.presence_enters += 1;
        Ok(())
    }

    async fn publish(&self, trackable_id: &str, event: ChannelEvent, payload: String) -> Result<(), EnvError> {
        lock(&self.state).stats.publish_attempts += 1;
        if let Err(err) = self.operate(SimOperation::Publish, trackable_id).await {
            lock(&self.state).stats.publishes_failed += 1;
            return Err(err);
        }

        let at_ms = self.context.now().as_millis() as u64;
        let location = Self::decode(event, &payload)?;
        let mut state = lock(&self.state);
        let loss = state.publish_loss;
        if loss > 0.0 && state.rng.gen_bool(loss) {
            state.stats.publishes_lost += 1;
            trace!(trackable_id, event = event.name(), "Publish dropped");
            return Err(EnvError::connection(80003, LOSS_STATUS_CODE, "publish dropped"));
        }
        state.published.push(PublishRecord {
            trackable_id: trackable_id.to_string(),
            at_ms,
            location,
        });
        Ok(())
    }

    async fn subscribe_for_presence(&self, trackable_id: &str, listener: PresenceListener) -> Result<(), EnvError> {
        self.operate(SimOperation::SubscribePresence, trackable_id).await?;
        lock(&self.state)
            .presence_listeners
            .insert(trackable_id.to_string(), listener);
        Ok(())
    }

    async fn update_presence_data(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError> {
        self.operate(SimOperation::UpdatePresence, trackable_id).await?;
        let mut state = lock(&self.state);
        state.stats.presence_updates += 1;
        state
            .presence_data
            .insert(trackable_id.to_string(), presence_data.clone());
        Ok(())
    }

    async fn wait_for_channel_attach(&self, _trackable_id: &str) -> Result<(), EnvError> {
        Ok(())
    }

    fn subscribe_for_connection_state(&self, listener: ConnectionStateListener) {
        lock(&self.state).connection_listeners.push(listener);
    }

    fn subscribe_for_channel_state(&self, trackable_id: &str, listener: ChannelStateListener) {
        lock(&self.state)
            .channel_listeners
            .insert(trackable_id.to_string(), listener);
    }

    async fn close(&self, _presence_data: &PresenceData) -> Result<(), EnvError> {
        let mut state = lock(&self.state);
        state.stats.closes += 1;
        state.presence_data.clear();
        state.presence_listeners.clear();
        state.channel_listeners.clear();
        Ok(())
    }
}

/// Transport controller for fault injection and observation.
#[derive(Clone)]
pub struct SimTransportController {
    state: Arc<Mutex<TransportState>>,
}

impl SimTransportController {
    /// Fails the next call of `operation` with the given error.
    pub fn fail_next(&self, operation: SimOperation, error: ErrorInformation) {
        lock(&self.state)
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Sets the publish loss rate.
    pub fn set_publish_loss(&self, rate: f64) {
        lock(&self.state).publish_loss = rate.clamp(0.0, 1.0);
    }

    pub fn set_latency(&self, operation: SimOperation, latency: Duration) {
        lock(&self.state).latency.insert(operation, latency);
    }

    /// Delivers a presence event on a trackable channel.
    ///
    /// Returns false when nobody is subscribed to the channel.
    pub fn inject_presence(&self, trackable_id: &str, message: PresenceMessage) -> bool {
        let listener = lock(&self.state).presence_listeners.get(trackable_id).cloned();
        match listener {
            Some(listener) => {
                listener(message);
                true
            }
            None => false,
        }
    }

    pub fn emit_channel_state(&self, trackable_id: &str, change: ConnectionStateChange) -> bool {
        let listener = lock(&self.state).channel_listeners.get(trackable_id).cloned();
        match listener {
            Some(listener) => {
                listener(change);
                true
            }
            None => false,
        }
    }

    pub fn emit_connection_state(&self, change: ConnectionStateChange) {
        let listeners = lock(&self.state).connection_listeners.clone();
        for listener in listeners {
            listener(change.clone());
        }
    }

    /// Accepted publishes for one trackable, in order.
    pub fn published(&self, trackable_id: &str) -> Vec<PublishRecord> {
        lock(&self.state)
            .published
            .iter()
            .filter(|record| record.trackable_id == trackable_id)
            .cloned()
            .collect()
    }

    /// Current publisher presence payload on a channel.
    pub fn presence_data(&self, trackable_id: &str) -> Option<PresenceData> {
        lock(&self.state).presence_data.get(trackable_id).cloned()
    }

    pub fn stats(&self) -> TransportStats {
        lock(&self.state).stats.clone()
    }
}

/// Builds a presence event from a subscriber client.
///
/// `serial` orders messages of the same connection.
pub fn subscriber_message(
    client_id: &str,
    action: PresenceAction,
    serial: i64,
    resolution: Option<Resolution>,
    timestamp: i64,
) -> PresenceMessage {
    let connection_id = format!("{client_id}-conn");
    PresenceMessage {
        action,
        data: PresenceData::subscriber(resolution),
        member_key: format!("{client_id}:{connection_id}"),
        id: format!("{connection_id}:{serial}:0"),
        connection_id,
        client_id: client_id.to_string(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackcast_env::{Location, LocationUpdateType};

    fn enhanced_payload(time: i64) -> String {
        let update = EnhancedLocationUpdate::new(Location::new(51.5, -0.12, time), Vec::new(), LocationUpdateType::Actual);
        codec::encode_enhanced(&update).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_records_decoded_location() {
        let (transport, controller) = SimTransport::new(SimContext::shared(1));
        transport
            .publish("t1", ChannelEvent::Enhanced, enhanced_payload(1_000))
            .await
            .unwrap();

        let published = controller.published("t1");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].location.time(), 1_000);
        assert!(controller.published("t2").is_empty());
        assert_eq!(controller.stats().publish_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_failure_applies_once() {
        let (transport, controller) = SimTransport::new(SimContext::shared(1));
        controller.fail_next(SimOperation::Connect, ErrorInformation::new(40000, 400, "bad request"));
        let data = PresenceData::publisher(false);

        let err = transport.connect("t1", &data).await.unwrap_err();
        assert!(matches!(err, EnvError::Connection(ref info) if info.status_code == 400));
        assert!(transport.connect("t1", &data).await.is_ok());
        assert_eq!(controller.presence_data("t1"), Some(data));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_advances_virtual_time() {
        let context = SimContext::shared(1);
        let (transport, controller) = SimTransport::new(Arc::clone(&context));
        controller.set_latency(SimOperation::EnterPresence, Duration::from_millis(250));

        transport
            .enter_presence("t1", &PresenceData::publisher(false))
            .await
            .unwrap();
        assert_eq!(context.now(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_is_deterministic_per_seed() {
        async fn lost_with_seed(seed: u64) -> usize {
            let (transport, controller) = SimTransport::new(SimContext::shared(seed));
            controller.set_publish_loss(0.5);
            for time in 0..50 {
                let _ = transport
                    .publish("t1", ChannelEvent::Enhanced, enhanced_payload(time))
                    .await;
            }
            controller.stats().publishes_lost
        }

        let first = lost_with_seed(7).await;
        assert_eq!(first, lost_with_seed(7).await);
        assert!(first > 0 && first < 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_injection_requires_subscription() {
        let (transport, controller) = SimTransport::new(SimContext::shared(1));
        let message = subscriber_message("sub", PresenceAction::Enter, 1, None, 0);
        assert!(!controller.inject_presence("t1", message.clone()));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport
            .subscribe_for_presence(
                "t1",
                Arc::new(move |message| sink.lock().unwrap().push(message)),
            )
            .await
            .unwrap();
        assert!(controller.inject_presence("t1", message.clone()));
        assert_eq!(received.lock().unwrap().as_slice(), &[message]);
    }
}

//! Real-time channel: topic publish/subscribe over a single shared connection.
//!
//! Subscribers receive [`Envelope`]s through a [`Subscription`], which can be
//! turned into a lazy stream of typed events. Dropping a subscription
//! unsubscribes it, so every subscribe has a matching unsubscribe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::{
    error::{FlowError, Result},
    model::SessionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    PriceCalculationRequest,
    PriceUpdate,
    PriceCalculationError,
    PhotoUploadAndAnalyze,
    UploadProgress,
    PhotoProcessingStatus,
    PhotoAnalysisResult,
    PhotoAnalysisError,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PriceCalculationRequest => "price-calculation-request",
            Topic::PriceUpdate => "price-update",
            Topic::PriceCalculationError => "price-calculation-error",
            Topic::PhotoUploadAndAnalyze => "photo-upload-and-analyze",
            Topic::UploadProgress => "upload-progress",
            Topic::PhotoProcessingStatus => "photo-processing-status",
            Topic::PhotoAnalysisResult => "photo-analysis-result",
            Topic::PhotoAnalysisError => "photo-analysis-error",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope: `{ "type": <topic>, "payload": {...}, "timestamp": <ISO8601> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub topic: Topic,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(topic: Topic, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            topic,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// The `sessionId` carried in the payload, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.payload
            .get("sessionId")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// A typed view of envelopes on one or more topics.
pub trait ChannelEvent: Sized {
    fn from_envelope(envelope: &Envelope) -> Option<Self>;
}

/// Bidirectional real-time transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    /// Observe connection state changes.
    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;

    async fn publish(&self, envelope: Envelope) -> Result<()>;

    fn subscribe(&self, topics: &[Topic]) -> Subscription;
}

/// Live subscriber counts per topic.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    counts: DashMap<Topic, usize>,
}

impl SubscriberRegistry {
    pub fn count(&self, topic: Topic) -> usize {
        self.counts.get(&topic).map(|c| *c).unwrap_or(0)
    }

    fn register(&self, topics: &[Topic]) {
        for topic in topics {
            *self.counts.entry(*topic).or_insert(0) += 1;
        }
    }

    fn release(&self, topics: &[Topic]) {
        for topic in topics {
            if let Some(mut count) = self.counts.get_mut(topic) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Receives envelopes for a fixed set of topics until dropped.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    topics: Vec<Topic>,
    registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    pub fn new(
        rx: broadcast::Receiver<Envelope>,
        topics: &[Topic],
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        let mut topics = topics.to_vec();
        topics.sort_by_key(|t| t.as_str());
        topics.dedup();
        registry.register(&topics);
        Self {
            rx,
            topics,
            registry,
        }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Next envelope on a subscribed topic; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.topics.contains(&envelope.topic) => return Some(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "channel subscriber lagged, envelopes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if self.topics.contains(&envelope.topic) => return Some(envelope),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "channel subscriber lagged, envelopes dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Converts the subscription into a lazy stream of typed events.
    /// Envelopes that do not decode as `E` are skipped.
    pub fn into_events<E>(self) -> impl Stream<Item = E> + Send
    where
        E: ChannelEvent + Send + 'static,
    {
        let mut subscription = self;
        async_stream::stream! {
            while let Some(envelope) = subscription.recv().await {
                match E::from_envelope(&envelope) {
                    Some(event) => yield event,
                    None => debug!(topic = %envelope.topic, "skipping undecodable envelope"),
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.release(&self.topics);
    }
}

/// In-process channel: the single shared connection, with many subscribers.
pub struct ChannelHub {
    tx: broadcast::Sender<Envelope>,
    state: watch::Sender<ConnectionState>,
    registry: Arc<SubscriberRegistry>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            tx,
            state,
            registry: Arc::new(SubscriberRegistry::default()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "channel connection state changed");
        }
    }

    pub fn connect(&self) {
        self.set_state(ConnectionState::Connected);
    }

    pub fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry.count(topic)
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Channel for ChannelHub {
    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if !self.connection_state().is_connected() {
            return Err(FlowError::Transport(format!(
                "channel is not connected, cannot publish {}",
                envelope.topic
            )));
        }
        let topic = envelope.topic;
        match self.tx.send(envelope) {
            Ok(receivers) => debug!(%topic, receivers, "published envelope"),
            Err(_) => debug!(%topic, "published envelope with no receivers"),
        }
        Ok(())
    }

    fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription::new(self.tx.subscribe(), topics, self.registry.clone())
    }
}

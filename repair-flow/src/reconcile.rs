//! Price reconciliation controller.
//!
//! Input changes are debounced before a `price-calculation-request` goes out
//! on the channel. Responses are matched to the inputs their request was
//! issued for and dropped when those inputs are no longer current. While the
//! channel is down the local estimator answers synchronously, so `Pending`
//! is never observable in that mode.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ChannelEvent, ConnectionState, Envelope, Subscription, Topic},
    error::{FlowError, Result},
    history::{EstimateSource, Trend, TrendHistory, TrendPoint},
    messages::{PriceEvent, PriceRequest},
    model::{PriceEstimate, PricingInputs, SessionId},
    pricing::{LocalEstimator, validate_inputs},
};

/// Outstanding requests remembered for freshness checks.
const MAX_OUTSTANDING: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub debounce: Duration,
    pub history_capacity: usize,
    pub request_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            history_capacity: 10,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PriceState {
    Idle,
    Pending,
    Settled,
    Error { message: String },
}

/// An estimate together with the inputs it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub inputs: PricingInputs,
    pub estimate: PriceEstimate,
    pub source: EstimateSource,
}

/// What the pricing view renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceDisplay {
    pub state: PriceState,
    pub estimate: Option<PriceEstimate>,
    pub source: Option<EstimateSource>,
    pub error_banner: Option<String>,
    pub history: Vec<TrendPoint>,
    pub trend: Option<Trend>,
}

/// Persistable part of the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingSnapshot {
    pub inputs: Option<PricingInputs>,
    pub quote: Option<Quote>,
    pub error_banner: Option<String>,
    pub history: Vec<TrendPoint>,
}

/// Result of one controller step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing scheduled and nothing in flight.
    Idle,
    RequestIssued(u64),
    Settled(EstimateSource),
    /// A response for superseded inputs was dropped.
    Discarded,
    Failed,
    /// Not addressed to this controller, or not a price event.
    Ignored,
}

#[derive(Debug, Clone)]
struct InFlight {
    request_id: u64,
    inputs: PricingInputs,
    deadline: Instant,
}

enum Wake {
    Debounce,
    Timeout,
    Envelope(Option<Envelope>),
    Connection(bool),
}

pub struct PriceReconciler {
    session_id: SessionId,
    channel: Arc<dyn Channel>,
    estimator: LocalEstimator,
    config: ReconcileConfig,
    inputs: Option<PricingInputs>,
    quote: Option<Quote>,
    state: PriceState,
    error_banner: Option<String>,
    history: TrendHistory,
    next_request_id: u64,
    outstanding: VecDeque<InFlight>,
    debounce_until: Option<Instant>,
    subscription: Option<Subscription>,
    connection: watch::Receiver<ConnectionState>,
    connection_closed: bool,
    requests_issued: u64,
}

impl PriceReconciler {
    pub fn new(
        session_id: SessionId,
        channel: Arc<dyn Channel>,
        estimator: LocalEstimator,
        config: ReconcileConfig,
    ) -> Self {
        let connection = channel.watch_connection();
        let history = TrendHistory::new(config.history_capacity);
        Self {
            session_id,
            channel,
            estimator,
            config,
            inputs: None,
            quote: None,
            state: PriceState::Idle,
            error_banner: None,
            history,
            next_request_id: 1,
            outstanding: VecDeque::new(),
            debounce_until: None,
            subscription: None,
            connection,
            connection_closed: false,
            requests_issued: 0,
        }
    }

    /// Rebuilds a controller from a snapshot. Nothing is in flight afterwards.
    pub fn restore(
        session_id: SessionId,
        channel: Arc<dyn Channel>,
        estimator: LocalEstimator,
        config: ReconcileConfig,
        snapshot: PricingSnapshot,
    ) -> Self {
        let mut reconciler = Self::new(session_id, channel, estimator, config);
        reconciler.history = TrendHistory::restore(reconciler.config.history_capacity, snapshot.history);
        reconciler.state = match (&snapshot.error_banner, &snapshot.quote) {
            (Some(message), _) => PriceState::Error {
                message: message.clone(),
            },
            (None, Some(_)) => PriceState::Settled,
            (None, None) => PriceState::Idle,
        };
        reconciler.inputs = snapshot.inputs;
        reconciler.quote = snapshot.quote;
        reconciler.error_banner = snapshot.error_banner;
        reconciler
    }

    pub fn snapshot(&self) -> PricingSnapshot {
        PricingSnapshot {
            inputs: self.inputs.clone(),
            quote: self.quote.clone(),
            error_banner: self.error_banner.clone(),
            history: self.history.to_vec(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Registers the response handler. Calling it again is a no-op.
    pub fn mount(&mut self) {
        if self.subscription.is_none() {
            self.subscription = Some(
                self.channel
                    .subscribe(&[Topic::PriceUpdate, Topic::PriceCalculationError]),
            );
            debug!(session_id = %self.session_id, "price reconciler mounted");
        }
    }

    /// Releases the response handler. Calling it again is a no-op.
    pub fn unmount(&mut self) {
        if self.subscription.take().is_some() {
            debug!(session_id = %self.session_id, "price reconciler unmounted");
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn state(&self) -> &PriceState {
        &self.state
    }

    pub fn inputs(&self) -> Option<&PricingInputs> {
        self.inputs.as_ref()
    }

    pub fn current_quote(&self) -> Option<&Quote> {
        self.quote.as_ref()
    }

    /// The quote, if it was computed for exactly these inputs and has not
    /// expired yet.
    pub fn quote_for(&self, inputs: &PricingInputs) -> Option<&Quote> {
        self.quote
            .as_ref()
            .filter(|q| &q.inputs == inputs && q.estimate.valid_until > Utc::now())
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued
    }

    pub fn history(&self) -> &TrendHistory {
        &self.history
    }

    /// Debounce armed or a request for the current inputs in flight.
    pub fn is_busy(&self) -> bool {
        self.debounce_until.is_some() || self.current_request_deadline().is_some()
    }

    pub fn display(&self) -> PriceDisplay {
        PriceDisplay {
            state: self.state.clone(),
            estimate: self.quote.as_ref().map(|q| q.estimate.clone()),
            source: self.quote.as_ref().map(|q| q.source),
            error_banner: self.error_banner.clone(),
            history: self.history.to_vec(),
            trend: self.history.trend(),
        }
    }

    pub fn dismiss_error(&mut self) {
        self.error_banner = None;
        if matches!(self.state, PriceState::Error { .. }) {
            self.state = if self.quote.is_some() {
                PriceState::Settled
            } else {
                PriceState::Idle
            };
        }
    }

    /// Records new inputs. Invalid inputs are rejected locally and never
    /// reach the channel.
    pub fn set_inputs(&mut self, inputs: PricingInputs) -> Result<()> {
        validate_inputs(self.estimator.rules(), &inputs)?;

        if self.inputs.as_ref() == Some(&inputs) && (self.is_busy() || self.quote_for(&inputs).is_some()) {
            return Ok(());
        }

        self.inputs = Some(inputs.clone());

        if self.quote_for(&inputs).is_some() && self.error_banner.is_none() {
            // back to inputs that are already priced
            self.debounce_until = None;
            self.state = PriceState::Settled;
            return Ok(());
        }

        if !self.channel.connection_state().is_connected() {
            self.debounce_until = None;
            self.settle_locally();
            return Ok(());
        }

        self.debounce_until = Some(Instant::now() + self.config.debounce);
        debug!(session_id = %self.session_id, "pricing inputs changed, debounce armed");
        Ok(())
    }

    /// Waits for the next event that concerns this controller and processes
    /// it. Returns [`ReconcileOutcome::Idle`] immediately when nothing is
    /// scheduled or in flight.
    pub async fn tick(&mut self) -> ReconcileOutcome {
        let debounce = self.debounce_until;
        let timeout = self.current_request_deadline();
        if debounce.is_none() && timeout.is_none() {
            return ReconcileOutcome::Idle;
        }

        let watch_connection = !self.connection_closed;
        let wake = tokio::select! {
            _ = sleep_until(debounce.unwrap_or_else(Instant::now)), if debounce.is_some() => Wake::Debounce,
            _ = sleep_until(timeout.unwrap_or_else(Instant::now)), if timeout.is_some() => Wake::Timeout,
            envelope = recv_or_pending(self.subscription.as_mut()) => Wake::Envelope(envelope),
            changed = self.connection.changed(), if watch_connection => Wake::Connection(changed.is_ok()),
        };

        match wake {
            Wake::Debounce => {
                self.debounce_until = None;
                self.issue_request().await
            }
            Wake::Timeout => {
                warn!(
                    session_id = %self.session_id,
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    "price request timed out, using local estimate"
                );
                self.fall_back()
            }
            Wake::Envelope(Some(envelope)) => self.handle_envelope(&envelope),
            Wake::Envelope(None) => {
                warn!(session_id = %self.session_id, "price channel closed");
                self.subscription = None;
                self.fall_back()
            }
            Wake::Connection(true) => {
                let state = *self.connection.borrow_and_update();
                if state.is_connected() {
                    ReconcileOutcome::Ignored
                } else {
                    info!(session_id = %self.session_id, "channel disconnected, pricing locally");
                    self.fall_back()
                }
            }
            Wake::Connection(false) => {
                self.connection_closed = true;
                ReconcileOutcome::Ignored
            }
        }
    }

    /// Ticks until nothing is scheduled or in flight.
    pub async fn run_until_idle(&mut self) -> PriceDisplay {
        while self.tick().await != ReconcileOutcome::Idle {}
        self.display()
    }

    /// Applies one channel envelope. Exposed so tests and alternative
    /// drivers can feed synthetic events.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> ReconcileOutcome {
        let Some(event) = PriceEvent::from_envelope(envelope) else {
            return ReconcileOutcome::Ignored;
        };
        if event.session_id() != self.session_id {
            return ReconcileOutcome::Ignored;
        }

        match event {
            PriceEvent::Updated(update) => {
                let Some(origin) = self.take_outstanding(update.request_id) else {
                    debug!(request_id = update.request_id, "price update for unknown request dropped");
                    return ReconcileOutcome::Discarded;
                };
                if self.inputs.as_ref() != Some(&origin.inputs) {
                    debug!(request_id = update.request_id, "stale price update dropped");
                    return ReconcileOutcome::Discarded;
                }
                self.forget_requests_for_current();
                self.apply_estimate(origin.inputs, update.estimate, EstimateSource::Remote);
                ReconcileOutcome::Settled(EstimateSource::Remote)
            }
            PriceEvent::Failed(failure) => {
                if let Some(request_id) = failure.request_id {
                    let Some(origin) = self.take_outstanding(request_id) else {
                        return ReconcileOutcome::Discarded;
                    };
                    if self.inputs.as_ref() != Some(&origin.inputs) {
                        debug!(request_id, "stale price error dropped");
                        return ReconcileOutcome::Discarded;
                    }
                }
                self.forget_requests_for_current();
                warn!(session_id = %self.session_id, message = %failure.message, "price calculation failed");
                self.error_banner = Some(failure.message.clone());
                self.state = PriceState::Error {
                    message: failure.message,
                };
                ReconcileOutcome::Failed
            }
        }
    }

    async fn issue_request(&mut self) -> ReconcileOutcome {
        let Some(inputs) = self.inputs.clone() else {
            return ReconcileOutcome::Idle;
        };
        if !self.channel.connection_state().is_connected() {
            return self.fall_back();
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = PriceRequest {
            session_id: self.session_id,
            request_id,
            inputs: inputs.clone(),
        };
        let published = match Envelope::new(Topic::PriceCalculationRequest, &request) {
            Ok(envelope) => self.channel.publish(envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(session_id = %self.session_id, error = %e, "price request not sent, pricing locally");
            return self.fall_back();
        }

        self.requests_issued += 1;
        self.outstanding.push_back(InFlight {
            request_id,
            inputs,
            deadline: Instant::now() + self.config.request_timeout,
        });
        while self.outstanding.len() > MAX_OUTSTANDING {
            self.outstanding.pop_front();
        }
        self.state = PriceState::Pending;
        debug!(session_id = %self.session_id, request_id, "price request issued");
        ReconcileOutcome::RequestIssued(request_id)
    }

    fn fall_back(&mut self) -> ReconcileOutcome {
        self.debounce_until = None;
        self.forget_requests_for_current();
        if self.inputs.is_none() {
            return ReconcileOutcome::Idle;
        }
        self.settle_locally()
    }

    fn settle_locally(&mut self) -> ReconcileOutcome {
        let Some(inputs) = self.inputs.clone() else {
            return ReconcileOutcome::Idle;
        };
        match self.estimator.estimate(&inputs) {
            Ok(estimate) => {
                self.apply_estimate(inputs, estimate, EstimateSource::Local);
                ReconcileOutcome::Settled(EstimateSource::Local)
            }
            Err(e) => {
                let message = local_failure_message(&e);
                self.error_banner = Some(message.clone());
                self.state = PriceState::Error { message };
                ReconcileOutcome::Failed
            }
        }
    }

    fn apply_estimate(&mut self, inputs: PricingInputs, estimate: PriceEstimate, source: EstimateSource) {
        self.history.push(TrendPoint {
            total: estimate.total,
            recorded_at: Utc::now(),
            source,
        });
        info!(
            session_id = %self.session_id,
            total = %estimate.total,
            ?source,
            "price settled"
        );
        self.quote = Some(Quote {
            inputs,
            estimate,
            source,
        });
        self.error_banner = None;
        self.state = PriceState::Settled;
    }

    fn take_outstanding(&mut self, request_id: u64) -> Option<InFlight> {
        let position = self
            .outstanding
            .iter()
            .position(|f| f.request_id == request_id)?;
        self.outstanding.remove(position)
    }

    fn forget_requests_for_current(&mut self) {
        if let Some(current) = &self.inputs {
            self.outstanding.retain(|f| &f.inputs != current);
        }
    }

    fn current_request_deadline(&self) -> Option<Instant> {
        let current = self.inputs.as_ref()?;
        self.outstanding
            .iter()
            .filter(|f| &f.inputs == current)
            .map(|f| f.deadline)
            .min()
    }
}

fn local_failure_message(error: &FlowError) -> String {
    match error {
        FlowError::Validation(reason) => reason.clone(),
        other => other.to_string(),
    }
}

async fn recv_or_pending(subscription: Option<&mut Subscription>) -> Option<Envelope> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

//! Server-Sent Events: relays channel envelopes addressed to one booking
//! session so browser clients can follow pricing and upload progress.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use repair_flow::{Channel, Envelope, SessionId, Subscription, Topic};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::service::{ApiError, AppState, bad_request_error};

/// Topics a client following a session cares about.
pub const CLIENT_TOPICS: [Topic; 6] = [
    Topic::PriceUpdate,
    Topic::PriceCalculationError,
    Topic::UploadProgress,
    Topic::PhotoProcessingStatus,
    Topic::PhotoAnalysisResult,
    Topic::PhotoAnalysisError,
];

/// Envelopes for `session_id` only, in arrival order.
pub fn session_envelopes(
    mut subscription: Subscription,
    session_id: SessionId,
) -> impl Stream<Item = Envelope> + Send {
    async_stream::stream! {
        while let Some(envelope) = subscription.recv().await {
            if envelope.session_id() == Some(session_id) {
                yield envelope;
            }
        }
    }
}

/// GET /api/bookings/{id}/events
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session_id: SessionId = session_id
        .parse()
        .map_err(|_| bad_request_error("Invalid session id"))?;
    info!(%session_id, "SSE client connected");

    let envelopes = session_envelopes(state.hub.subscribe(&CLIENT_TOPICS), session_id);
    let stream = async_stream::stream! {
        futures::pin_mut!(envelopes);
        while let Some(envelope) = futures::StreamExt::next(&mut envelopes).await {
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    debug!(topic = %envelope.topic, "sending SSE event");
                    yield Ok(Event::default().event(envelope.topic.as_str()).data(json));
                }
                Err(e) => warn!(error = %e, "failed to serialize envelope"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use repair_flow::ChannelHub;
    use serde_json::json;

    #[tokio::test]
    async fn only_the_requested_session_is_relayed() {
        let hub = ChannelHub::default();
        let mine = SessionId::new();
        let other = SessionId::new();
        let stream = session_envelopes(hub.subscribe(&CLIENT_TOPICS), mine);
        tokio::pin!(stream);

        for (session, progress) in [(other, 10), (mine, 40)] {
            hub.publish(
                Envelope::new(
                    Topic::UploadProgress,
                    json!({ "sessionId": session.to_string(), "progress": progress }),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        }

        let envelope = stream.next().await.unwrap();
        assert_eq!(envelope.payload["progress"], 40);
    }
}

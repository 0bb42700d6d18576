//! Server side of the real-time channel: answers price requests and photo
//! uploads published on the hub.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use repair_flow::{
    Channel, ChannelHub, Envelope, LocalEstimator, Topic,
    messages::{
        PhotoAnalysisError, PhotoAnalysisReady, PhotoProcessingStatus, PhotoUploadRequest,
        PriceCalculationError, PriceRequest, PriceUpdate, ProcessingStage, UploadProgress,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::analysis::PhotoAnalysisEngine;

pub fn spawn_pricing_responder(hub: Arc<ChannelHub>, estimator: LocalEstimator) -> JoinHandle<()> {
    let mut requests = hub.subscribe(&[Topic::PriceCalculationRequest]);
    tokio::spawn(
        async move {
            info!("pricing responder started");
            while let Some(envelope) = requests.recv().await {
                let request: PriceRequest = match envelope.decode() {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "malformed price request");
                        continue;
                    }
                };
                debug!(session_id = %request.session_id, request_id = request.request_id, "pricing request");

                match estimator.estimate(&request.inputs) {
                    Ok(estimate) => {
                        let update = PriceUpdate {
                            session_id: request.session_id,
                            request_id: request.request_id,
                            estimate,
                        };
                        reply(&hub, Topic::PriceUpdate, &update).await;
                    }
                    Err(e) => {
                        let failure = PriceCalculationError {
                            session_id: request.session_id,
                            request_id: Some(request.request_id),
                            message: e.to_string(),
                        };
                        reply(&hub, Topic::PriceCalculationError, &failure).await;
                    }
                }
            }
            info!("pricing responder stopped");
        }
        .instrument(info_span!("pricing_responder")),
    )
}

pub fn spawn_photo_responder(hub: Arc<ChannelHub>, engine: PhotoAnalysisEngine) -> JoinHandle<()> {
    let mut uploads = hub.subscribe(&[Topic::PhotoUploadAndAnalyze]);
    tokio::spawn(
        async move {
            info!("photo responder started");
            while let Some(envelope) = uploads.recv().await {
                let request: PhotoUploadRequest = match envelope.decode() {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "malformed photo upload");
                        continue;
                    }
                };
                handle_upload(&hub, &engine, request).await;
            }
            info!("photo responder stopped");
        }
        .instrument(info_span!("photo_responder")),
    )
}

async fn handle_upload(hub: &ChannelHub, engine: &PhotoAnalysisEngine, request: PhotoUploadRequest) {
    let session_id = request.session_id;
    let upload_id = request.upload_id;

    let bytes = match BASE64.decode(request.data.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            let failure = PhotoAnalysisError {
                session_id,
                upload_id,
                message: format!("upload payload is not valid base64: {}", e),
            };
            reply(hub, Topic::PhotoAnalysisError, &failure).await;
            return;
        }
    };

    let progress = UploadProgress {
        session_id,
        upload_id,
        progress: 100,
    };
    reply(hub, Topic::UploadProgress, &progress).await;

    let status = PhotoProcessingStatus {
        session_id,
        upload_id,
        stage: ProcessingStage::Analyzing,
    };
    reply(hub, Topic::PhotoProcessingStatus, &status).await;

    match engine.analyze_bytes(&request.file_name, &bytes) {
        Ok(analysis) => {
            let ready = PhotoAnalysisReady {
                session_id,
                upload_id,
                analysis,
            };
            reply(hub, Topic::PhotoAnalysisResult, &ready).await;
        }
        Err(e) => {
            let failure = PhotoAnalysisError {
                session_id,
                upload_id,
                message: e.to_string(),
            };
            reply(hub, Topic::PhotoAnalysisError, &failure).await;
        }
    }
}

async fn reply(hub: &ChannelHub, topic: Topic, payload: &impl Serialize) {
    let envelope = match Envelope::new(topic, payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(%topic, error = %e, "could not encode reply");
            return;
        }
    };
    if let Err(e) = hub.publish(envelope).await {
        warn!(%topic, error = %e, "reply not delivered");
    }
}

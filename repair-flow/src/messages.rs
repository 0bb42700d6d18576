//! Payloads carried inside channel envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    channel::{ChannelEvent, Envelope, Topic},
    model::{AnalysisResult, PriceEstimate, PricingInputs, SessionId},
};

/// Published on `price-calculation-request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRequest {
    pub session_id: SessionId,
    pub request_id: u64,
    pub inputs: PricingInputs,
}

/// Received on `price-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub session_id: SessionId,
    pub request_id: u64,
    pub estimate: PriceEstimate,
}

/// Received on `price-calculation-error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceCalculationError {
    pub session_id: SessionId,
    #[serde(default)]
    pub request_id: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PriceEvent {
    Updated(PriceUpdate),
    Failed(PriceCalculationError),
}

impl PriceEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            PriceEvent::Updated(update) => update.session_id,
            PriceEvent::Failed(error) => error.session_id,
        }
    }
}

impl ChannelEvent for PriceEvent {
    fn from_envelope(envelope: &Envelope) -> Option<Self> {
        match envelope.topic {
            Topic::PriceUpdate => envelope.decode().ok().map(PriceEvent::Updated),
            Topic::PriceCalculationError => envelope.decode().ok().map(PriceEvent::Failed),
            _ => None,
        }
    }
}

/// Published on `photo-upload-and-analyze`. `data` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploadRequest {
    pub session_id: SessionId,
    pub upload_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: SessionId,
    pub upload_id: Uuid,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStage {
    Received,
    Analyzing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoProcessingStatus {
    pub session_id: SessionId,
    pub upload_id: Uuid,
    pub stage: ProcessingStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoAnalysisReady {
    pub session_id: SessionId,
    pub upload_id: Uuid,
    pub analysis: AnalysisResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoAnalysisError {
    pub session_id: SessionId,
    pub upload_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(UploadProgress),
    Processing(PhotoProcessingStatus),
    Analyzed(PhotoAnalysisReady),
    Failed(PhotoAnalysisError),
}

impl UploadEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            UploadEvent::Progress(e) => e.session_id,
            UploadEvent::Processing(e) => e.session_id,
            UploadEvent::Analyzed(e) => e.session_id,
            UploadEvent::Failed(e) => e.session_id,
        }
    }

    pub fn upload_id(&self) -> Uuid {
        match self {
            UploadEvent::Progress(e) => e.upload_id,
            UploadEvent::Processing(e) => e.upload_id,
            UploadEvent::Analyzed(e) => e.upload_id,
            UploadEvent::Failed(e) => e.upload_id,
        }
    }
}

impl ChannelEvent for UploadEvent {
    fn from_envelope(envelope: &Envelope) -> Option<Self> {
        match envelope.topic {
            Topic::UploadProgress => envelope.decode().ok().map(UploadEvent::Progress),
            Topic::PhotoProcessingStatus => envelope.decode().ok().map(UploadEvent::Processing),
            Topic::PhotoAnalysisResult => envelope.decode().ok().map(UploadEvent::Analyzed),
            Topic::PhotoAnalysisError => envelope.decode().ok().map(UploadEvent::Failed),
            _ => None,
        }
    }
}

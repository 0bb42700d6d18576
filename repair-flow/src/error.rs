use thiserror::Error;

use crate::wizard::WizardStep;

/// Errors raised by the booking flow.
///
/// Staleness is deliberately absent: a response for superseded inputs is
/// dropped, never reported.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server reported an error: {0}")]
    ServerReported(String),

    #[error("Step {step} is not complete: {reason}")]
    StepIncomplete { step: WizardStep, reason: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Draft field '{field}' belongs to step {owner}, current step is {current}")]
    SlotLocked {
        field: &'static str,
        owner: WizardStep,
        current: WizardStep,
    },

    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;

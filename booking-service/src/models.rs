use repair_flow::{
    ConnectionState, Device, DeviceCategory, RepairCategory, StepTransition, UploadItem,
    flow::BookingView,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListing {
    #[serde(flatten)]
    pub device: Device,
    pub repairs: Vec<RepairCategory>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceFilter {
    pub category: Option<DeviceCategory>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCatalogResponse {
    pub devices: Vec<DeviceListing>,
    pub brands: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub transition: Option<StepTransition>,
    pub booking: BookingView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelStateRequest {
    pub state: ConnectionState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatusResponse {
    pub state: ConnectionState,
    pub pricing_responders: usize,
}

/// Outcome of a photo batch; completed uploads are already attached to `booking`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploadResponse {
    pub uploads: Vec<UploadItem>,
    pub rejected: Vec<String>,
    pub booking: BookingView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeTextRequest {
    pub text: String,
}

//! Request/response transport used when the real-time channel is down.
//!
//! Amounts on this wire are decimal major units (`600.0` for £600); they are
//! converted to [`Money`] at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    catalog::DeviceCatalog,
    error::{FlowError, Result},
    model::{
        AnalysisResult, Money, PriceComponent, PriceEstimate, PricingInputs, RepairCategory,
        ServiceOptions, UrgencyTier,
    },
    upload::{PhotoAnalyzer, PhotoFile},
};

pub const PRICING_PATH: &str = "/api/pricing/calculate";
pub const PHOTO_PATH: &str = "/api/photos/upload-and-analyze";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub device_model_id: String,
    pub repair_type: RepairCategory,
    pub urgency_level: String,
    #[serde(default)]
    pub additional_repairs: Vec<RepairCategory>,
    /// Remaining service options; the urgency inside is ignored in favour
    /// of `urgency_level`.
    #[serde(default)]
    pub service_options: Option<ServiceOptions>,
}

impl QuoteRequest {
    pub fn from_inputs(inputs: &PricingInputs) -> Result<Self> {
        let mut issues = inputs.issues.iter();
        let repair_type = issues.next().ok_or_else(|| {
            FlowError::Validation("at least one issue must be selected".to_string())
        })?;
        Ok(Self {
            device_model_id: inputs.device.id.clone(),
            repair_type,
            urgency_level: inputs.options.urgency.as_level().to_string(),
            additional_repairs: issues.collect(),
            service_options: Some(inputs.options),
        })
    }

    /// Resolves the request against the catalog.
    pub fn into_inputs(self, catalog: &DeviceCatalog) -> Result<PricingInputs> {
        let device = catalog.require(&self.device_model_id)?.clone();
        let urgency = UrgencyTier::from_level(&self.urgency_level).ok_or_else(|| {
            FlowError::Validation(format!("unknown urgency level '{}'", self.urgency_level))
        })?;
        let mut options = self.service_options.unwrap_or_default();
        options.urgency = urgency;
        Ok(PricingInputs {
            device,
            issues: std::iter::once(self.repair_type)
                .chain(self.additional_repairs)
                .collect(),
            options,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireComponent {
    pub name: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingBlock {
    pub base_price: f64,
    pub final_price: f64,
    pub currency: String,
    pub breakdown: Vec<WireComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validity {
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairDetails {
    pub device_model_id: String,
    pub device_name: String,
    pub repair_type: RepairCategory,
    pub additional_repairs: Vec<RepairCategory>,
    pub urgency_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub pricing: PricingBlock,
    pub validity: Validity,
    pub repair_details: RepairDetails,
    #[serde(default)]
    pub disclaimers: Vec<String>,
}

impl QuoteResponse {
    pub fn new(inputs: &PricingInputs, estimate: &PriceEstimate) -> Self {
        let mut issues = inputs.issues.iter();
        let repair_type = issues.next().unwrap_or(RepairCategory::Diagnostic);
        Self {
            pricing: PricingBlock {
                base_price: estimate.base_price.as_major(),
                final_price: estimate.total.as_major(),
                currency: estimate.currency.clone(),
                breakdown: estimate
                    .breakdown
                    .iter()
                    .map(|c| WireComponent {
                        name: c.name.clone(),
                        amount: c.amount.as_major(),
                    })
                    .collect(),
            },
            validity: Validity {
                valid_until: estimate.valid_until,
            },
            repair_details: RepairDetails {
                device_model_id: inputs.device.id.clone(),
                device_name: inputs.device.display_name(),
                repair_type,
                additional_repairs: issues.collect(),
                urgency_level: inputs.options.urgency.as_level().to_string(),
            },
            disclaimers: estimate.disclaimers.clone(),
        }
    }

    pub fn into_estimate(self) -> PriceEstimate {
        PriceEstimate {
            base_price: Money::from_major(self.pricing.base_price),
            breakdown: self
                .pricing
                .breakdown
                .into_iter()
                .map(|c| PriceComponent {
                    name: c.name,
                    amount: Money::from_major(c.amount),
                })
                .collect(),
            total: Money::from_major(self.pricing.final_price),
            currency: self.pricing.currency,
            valid_until: self.validity.valid_until,
            disclaimers: self.disclaimers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoAnalysisResponse {
    pub upload_id: Uuid,
    pub file_name: String,
    pub analysis: AnalysisResult,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Clone)]
pub struct HttpFallbackClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFallbackClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn quote(&self, inputs: &PricingInputs) -> Result<PriceEstimate> {
        let request = QuoteRequest::from_inputs(inputs)?;
        let url = format!("{}{}", self.base_url, PRICING_PATH);
        debug!(%url, device = %request.device_model_id, "requesting quote over http");

        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;
        let body: QuoteResponse = response.json().await?;
        Ok(body.into_estimate())
    }

    pub async fn upload_and_analyze(&self, file: &PhotoFile) -> Result<PhotoAnalysisResponse> {
        let part = Part::bytes(file.data.clone())
            .file_name(file.name.clone())
            .mime_str(&file.content_type)?;
        let form = Form::new().part("photo", part);
        let url = format!("{}{}", self.base_url, PHOTO_PATH);
        debug!(%url, file = %file.name, "uploading photo over http");

        let response = self.client.post(&url).multipart(form).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PhotoAnalyzer for HttpFallbackClient {
    async fn analyze(&self, file: &PhotoFile) -> Result<AnalysisResult> {
        Ok(self.upload_and_analyze(file).await?.analysis)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            error,
            details: Some(details),
        }) => format!("{} ({})", error, details),
        Ok(ErrorBody { error, .. }) => error,
        Err(_) if text.is_empty() => status.to_string(),
        Err(_) => text,
    };
    warn!(%status, %message, "server reported an error");
    Err(FlowError::ServerReported(message))
}

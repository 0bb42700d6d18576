pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod flow;
pub mod history;
#[cfg(feature = "http")]
pub mod http;
pub mod messages;
pub mod model;
pub mod nlu;
pub mod pricing;
pub mod reconcile;
pub mod runner;
pub mod storage;
pub mod upload;
pub mod wizard;

// Re-export commonly used types
pub use catalog::DeviceCatalog;
pub use channel::{Channel, ChannelEvent, ChannelHub, ConnectionState, Envelope, Subscription, Topic};
pub use config::FlowConfig;
pub use error::{FlowError, Result};
pub use flow::{BookingFlow, BookingView, FlowServices, WizardCommand};
pub use history::{EstimateSource, Trend, TrendHistory, TrendPoint};
#[cfg(feature = "http")]
pub use http::HttpFallbackClient;
pub use model::{
    AnalysisResult, CustomerInfo, Device, DeviceCategory, IssueSelection, Money, PaymentOutcome,
    PaymentProvider, PaymentRequest, PaymentStatus, PhotoRecord, PriceComponent, PriceEstimate,
    PricingInputs, RepairCategory, ServiceOptions, SessionId, UrgencyTier, WarrantyTier,
};
pub use nlu::ProblemClassifier;
pub use pricing::{LocalEstimator, PricingRules, evaluate};
pub use reconcile::{PriceDisplay, PriceReconciler, PriceState, ReconcileConfig};
pub use runner::{BookingRunner, RunResult};
pub use storage::{BookingSession, InMemorySessionStorage, SessionStorage};
pub use upload::{PhotoFile, UploadItem, UploadOrchestrator, UploadPolicy, UploadQueue, UploadStatus};
pub use wizard::{BookingWizard, StepTransition, WizardStep};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn services(hub: Arc<ChannelHub>) -> FlowServices {
        FlowServices {
            catalog: Arc::new(DeviceCatalog::default()),
            estimator: LocalEstimator::default(),
            channel: hub,
            classifier: Arc::new(ProblemClassifier::new().unwrap()),
            config: FlowConfig::default(),
        }
    }

    /// Drives a fresh flow to pricing-review with the given device and issue.
    fn to_pricing_review(flow: &mut BookingFlow, device_id: &str, issue: RepairCategory) {
        flow.apply(WizardCommand::SelectDevice {
            device_id: device_id.to_string(),
        })
        .unwrap();
        flow.apply(WizardCommand::Next).unwrap();
        flow.apply(WizardCommand::ToggleIssue { issue }).unwrap();
        flow.apply(WizardCommand::Next).unwrap();
        flow.apply(WizardCommand::Next).unwrap();
        assert_eq!(flow.wizard().current(), WizardStep::PricingReview);
    }

    #[test]
    fn macbook_screen_repair_high_urgency_is_600_pounds() {
        let catalog = DeviceCatalog::default();
        let inputs = PricingInputs {
            device: catalog.require("macbook-pro-16-2021").unwrap().clone(),
            issues: [RepairCategory::ScreenRepair].into_iter().collect(),
            options: ServiceOptions {
                urgency: UrgencyTier::from_level("HIGH").unwrap(),
                ..Default::default()
            },
        };
        let estimator = LocalEstimator::default();
        let quoted_at = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();

        let first = estimator.estimate_at(&inputs, quoted_at).unwrap();
        let second = estimator.estimate_at(&inputs, quoted_at).unwrap();

        assert_eq!(first.total, Money::from_minor(60_000));
        assert_eq!(first.total.to_string(), "600.00");
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn disconnect_mid_session_prices_synchronously() {
        let hub = Arc::new(ChannelHub::default());
        let mut flow = BookingFlow::new(SessionId::new(), services(hub.clone()));
        flow.mount();
        to_pricing_review(&mut flow, "macbook-pro-16-2021", RepairCategory::ScreenRepair);

        hub.disconnect();
        flow.apply(WizardCommand::SetOptions {
            options: ServiceOptions {
                urgency: UrgencyTier::High,
                ..Default::default()
            },
        })
        .unwrap();

        // settled inside the call, no pending state in between
        let view = flow.view();
        assert_eq!(view.pricing.state, PriceState::Settled);
        assert_eq!(view.pricing.source, Some(EstimateSource::Local));
        assert_eq!(view.pricing.estimate.unwrap().total.minor(), 60_000);
        assert!(!flow.pricing_busy());
        assert!(flow.wizard().is_complete(WizardStep::PricingReview));
    }

    #[tokio::test]
    async fn full_booking_over_local_pricing() {
        let hub = Arc::new(ChannelHub::default());
        hub.disconnect();
        let mut flow = BookingFlow::new(SessionId::new(), services(hub));
        flow.mount();
        to_pricing_review(&mut flow, "iphone-13", RepairCategory::ScreenRepair);

        flow.apply(WizardCommand::Next).unwrap();
        flow.apply(WizardCommand::SetCustomer {
            customer: CustomerInfo {
                name: "Alan Turing".to_string(),
                email: "alan@example.org".to_string(),
                phone: "01632 960001".to_string(),
                address: Some("Bletchley".to_string()),
                notes: None,
            },
        })
        .unwrap();
        flow.apply(WizardCommand::Next).unwrap();
        flow.apply(WizardCommand::RecordPayment {
            outcome: PaymentOutcome {
                provider: PaymentProvider::Stripe,
                status: PaymentStatus::Succeeded {
                    transaction_id: "pi_1".to_string(),
                },
            },
        })
        .unwrap();
        let transition = flow.apply(WizardCommand::Next).unwrap().unwrap();
        assert_eq!(transition.to, WizardStep::Confirmation);

        let confirmed = flow.view().confirmed.unwrap();
        assert!(confirmed.reference.starts_with("RPR-"));
        assert_eq!(confirmed.estimate.total.minor(), 15_000);
    }
}

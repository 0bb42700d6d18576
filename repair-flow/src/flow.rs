//! One booking: the wizard, its price reconciler and the reference data
//! both read from.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    catalog::DeviceCatalog,
    channel::Channel,
    config::FlowConfig,
    error::Result,
    model::{CustomerInfo, PaymentOutcome, PhotoRecord, RepairCategory, ServiceOptions, SessionId},
    nlu::ProblemClassifier,
    pricing::LocalEstimator,
    reconcile::{PriceDisplay, PriceReconciler},
    storage::BookingSession,
    wizard::{BookingDraft, BookingWizard, ConfirmedBooking, StepTransition, WizardStep},
};

/// Process-wide collaborators shared by every flow.
#[derive(Clone)]
pub struct FlowServices {
    pub catalog: Arc<DeviceCatalog>,
    pub estimator: LocalEstimator,
    pub channel: Arc<dyn Channel>,
    pub classifier: Arc<ProblemClassifier>,
    pub config: FlowConfig,
}

/// A user action against a booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WizardCommand {
    #[serde(rename_all = "camelCase")]
    SelectDevice { device_id: String },
    ToggleIssue { issue: RepairCategory },
    DescribeProblem { description: String },
    /// Selects every issue the description suggests that is not selected yet.
    ApplySuggestions,
    AttachPhoto { record: PhotoRecord },
    #[serde(rename_all = "camelCase")]
    RemovePhoto { upload_id: Uuid },
    SetOptions { options: ServiceOptions },
    Next,
    Previous,
    JumpTo { step: WizardStep },
    SetCustomer { customer: CustomerInfo },
    RecordPayment { outcome: PaymentOutcome },
    DismissPriceError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub step: WizardStep,
    pub complete: bool,
    pub reachable: bool,
}

/// Read model handed to clients after every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub session_id: SessionId,
    pub step: WizardStep,
    pub highest_reached: WizardStep,
    pub steps: Vec<StepStatus>,
    pub draft: BookingDraft,
    pub pricing: PriceDisplay,
    pub suggestions: Vec<RepairCategory>,
    pub confirmed: Option<ConfirmedBooking>,
}

pub struct BookingFlow {
    session_id: SessionId,
    wizard: BookingWizard,
    reconciler: PriceReconciler,
    services: FlowServices,
}

impl BookingFlow {
    pub fn new(session_id: SessionId, services: FlowServices) -> Self {
        let reconciler = PriceReconciler::new(
            session_id,
            services.channel.clone(),
            services.estimator.clone(),
            services.config.reconcile.clone(),
        );
        Self {
            session_id,
            wizard: BookingWizard::new(),
            reconciler,
            services,
        }
    }

    pub fn restore(session: &BookingSession, services: FlowServices) -> Self {
        let reconciler = PriceReconciler::restore(
            session.id,
            services.channel.clone(),
            services.estimator.clone(),
            services.config.reconcile.clone(),
            session.pricing.clone(),
        );
        Self {
            session_id: session.id,
            wizard: session.wizard.clone(),
            reconciler,
            services,
        }
    }

    /// Writes the flow's state back into its session record.
    pub fn store_into(&self, session: &mut BookingSession) {
        session.wizard = self.wizard.clone();
        session.pricing = self.reconciler.snapshot();
        session.updated_at = chrono::Utc::now();
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn wizard(&self) -> &BookingWizard {
        &self.wizard
    }

    pub fn mount(&mut self) {
        self.reconciler.mount();
    }

    pub fn unmount(&mut self) {
        self.reconciler.unmount();
    }

    /// Applies a command. Pricing that can be answered synchronously (a
    /// cached quote or the local estimator while disconnected) is settled
    /// before this returns; anything else is left to [`Self::settle_pricing`].
    pub fn apply(&mut self, command: WizardCommand) -> Result<Option<StepTransition>> {
        debug!(session_id = %self.session_id, ?command, "applying wizard command");
        let transition = match command {
            WizardCommand::SelectDevice { device_id } => {
                let device = self.services.catalog.require(&device_id)?.clone();
                self.wizard.select_device(device)?;
                None
            }
            WizardCommand::ToggleIssue { issue } => {
                self.wizard.toggle_issue(issue)?;
                None
            }
            WizardCommand::DescribeProblem { description } => {
                self.wizard.describe_problem(description)?;
                None
            }
            WizardCommand::ApplySuggestions => {
                for issue in self.suggestions() {
                    if !self.wizard.draft().issues().contains(issue) {
                        self.wizard.toggle_issue(issue)?;
                    }
                }
                None
            }
            WizardCommand::AttachPhoto { record } => {
                self.wizard.attach_photo(record)?;
                None
            }
            WizardCommand::RemovePhoto { upload_id } => {
                self.wizard.remove_photo(upload_id)?;
                None
            }
            WizardCommand::SetOptions { options } => {
                self.wizard.set_options(options)?;
                self.sync_pricing()?;
                None
            }
            WizardCommand::Next => Some(self.wizard.next()?),
            WizardCommand::Previous => Some(self.wizard.previous()?),
            WizardCommand::JumpTo { step } => Some(self.wizard.jump_to(step)?),
            WizardCommand::SetCustomer { customer } => {
                self.wizard.set_customer(customer)?;
                None
            }
            WizardCommand::RecordPayment { outcome } => {
                self.wizard.record_payment(outcome)?;
                None
            }
            WizardCommand::DismissPriceError => {
                self.reconciler.dismiss_error();
                None
            }
        };

        if let Some(transition) = &transition {
            if transition.to == WizardStep::PricingReview {
                self.sync_pricing()?;
            }
            if transition.to == WizardStep::Confirmation {
                info!(
                    session_id = %self.session_id,
                    reference = self.wizard.draft().booking_reference().unwrap_or_default(),
                    "booking reached confirmation"
                );
            }
        }
        Ok(transition)
    }

    /// Waits for outstanding pricing work and records the result.
    pub async fn settle_pricing(&mut self) -> Result<PriceDisplay> {
        let display = self.reconciler.run_until_idle().await;
        self.record_quote()?;
        Ok(display)
    }

    pub fn pricing_busy(&self) -> bool {
        self.reconciler.is_busy()
    }

    pub fn suggestions(&self) -> Vec<RepairCategory> {
        let description = self.wizard.draft().problem_description();
        if description.trim().is_empty() {
            return Vec::new();
        }
        let category = self.wizard.draft().device().map(|d| d.category);
        self.services
            .classifier
            .suggest(description)
            .into_iter()
            .filter(|issue| {
                category.is_none_or(|c| self.services.estimator.rules().offers(c, *issue))
            })
            .collect()
    }

    pub fn view(&self) -> BookingView {
        let steps = WizardStep::ALL
            .iter()
            .map(|&step| StepStatus {
                step,
                complete: self.wizard.is_complete(step),
                reachable: step <= self.wizard.highest_reached(),
            })
            .collect();
        BookingView {
            session_id: self.session_id,
            step: self.wizard.current(),
            highest_reached: self.wizard.highest_reached(),
            steps,
            draft: self.wizard.draft().clone(),
            pricing: self.reconciler.display(),
            suggestions: self.suggestions(),
            confirmed: self.wizard.confirmed_booking().ok(),
        }
    }

    /// Hands the current inputs to the reconciler while pricing-review is
    /// the active step.
    fn sync_pricing(&mut self) -> Result<()> {
        if self.wizard.current() != WizardStep::PricingReview {
            return Ok(());
        }
        if let Some(inputs) = self.wizard.draft().pricing_inputs() {
            self.reconciler.set_inputs(inputs)?;
        }
        self.record_quote()
    }

    fn record_quote(&mut self) -> Result<()> {
        if self.wizard.current() != WizardStep::PricingReview {
            return Ok(());
        }
        let Some(inputs) = self.wizard.draft().pricing_inputs() else {
            return Ok(());
        };
        if let Some(quote) = self.reconciler.quote_for(&inputs) {
            self.wizard.record_quote(quote.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHub;
    use crate::history::EstimateSource;
    use crate::model::UrgencyTier;
    use crate::reconcile::PriceState;

    fn services(hub: Arc<ChannelHub>) -> FlowServices {
        FlowServices {
            catalog: Arc::new(DeviceCatalog::default()),
            estimator: LocalEstimator::default(),
            channel: hub,
            classifier: Arc::new(ProblemClassifier::new().unwrap()),
            config: FlowConfig::default(),
        }
    }

    #[tokio::test]
    async fn suggestions_follow_description_and_device() {
        let hub = Arc::new(ChannelHub::default());
        hub.disconnect();
        let mut flow = BookingFlow::new(SessionId::new(), services(hub));
        flow.apply(WizardCommand::SelectDevice {
            device_id: "playstation-5".to_string(),
        })
        .unwrap();
        flow.apply(WizardCommand::Next).unwrap();
        flow.apply(WizardCommand::DescribeProblem {
            description: "cracked screen and it keeps crashing".to_string(),
        })
        .unwrap();

        // consoles are not offered screen repairs
        assert_eq!(flow.suggestions(), vec![RepairCategory::SoftwareIssue]);
        flow.apply(WizardCommand::ApplySuggestions).unwrap();
        assert!(flow.wizard().draft().issues().contains(RepairCategory::SoftwareIssue));
    }

    #[tokio::test]
    async fn unknown_device_is_refused() {
        let hub = Arc::new(ChannelHub::default());
        let mut flow = BookingFlow::new(SessionId::new(), services(hub));
        let err = flow
            .apply(WizardCommand::SelectDevice {
                device_id: "nokia-3310".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, crate::FlowError::DeviceNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn entering_pricing_review_requests_a_price() {
        let hub = Arc::new(ChannelHub::default());
        let mut flow = BookingFlow::new(SessionId::new(), services(hub.clone()));
        flow.mount();
        flow.apply(WizardCommand::SelectDevice {
            device_id: "iphone-13".to_string(),
        })
        .unwrap();
        flow.apply(WizardCommand::Next).unwrap();
        flow.apply(WizardCommand::ToggleIssue {
            issue: RepairCategory::BatteryReplacement,
        })
        .unwrap();
        flow.apply(WizardCommand::Next).unwrap();

        let transition = flow.apply(WizardCommand::Next).unwrap().unwrap();
        assert!(transition.pricing_required);
        assert!(flow.pricing_busy());

        // nobody answers: the request times out and the local estimate is used
        let display = flow.settle_pricing().await.unwrap();
        assert_eq!(display.state, PriceState::Settled);
        assert_eq!(display.source, Some(EstimateSource::Local));
        assert!(flow.wizard().draft().current_estimate().is_some());

        flow.apply(WizardCommand::SetOptions {
            options: ServiceOptions {
                urgency: UrgencyTier::Emergency,
                ..Default::default()
            },
        })
        .unwrap();
        assert!(flow.wizard().draft().current_estimate().is_none());
        assert!(flow.apply(WizardCommand::Next).is_err());
    }

    #[test]
    fn command_wire_format() {
        let command: WizardCommand = serde_json::from_value(serde_json::json!({
            "type": "selectDevice",
            "deviceId": "iphone-13"
        }))
        .unwrap();
        assert_eq!(
            command,
            WizardCommand::SelectDevice {
                device_id: "iphone-13".to_string()
            }
        );

        let jump: WizardCommand = serde_json::from_value(serde_json::json!({
            "type": "jumpTo",
            "step": "pricing-review"
        }))
        .unwrap();
        assert_eq!(
            jump,
            WizardCommand::JumpTo {
                step: WizardStep::PricingReview
            }
        );
    }
}

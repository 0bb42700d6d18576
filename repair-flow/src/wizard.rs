//! Booking wizard state machine.
//!
//! Steps are strictly ordered. `next` only moves forward when the current
//! step's completion predicate holds, `previous` is always allowed except
//! from the first step, and `jump_to` never goes past the furthest step
//! reached. Every draft field is owned by exactly one step and can only be
//! written while that step is current. Once a payment has succeeded the
//! booking is sealed: the only move left is forward into confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{FlowError, Result},
    model::{
        CustomerInfo, Device, IssueSelection, PaymentOutcome, PaymentRequest, PhotoRecord,
        PriceEstimate, PricingInputs, RepairCategory, ServiceOptions,
    },
    reconcile::Quote,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WizardStep {
    DeviceSelection,
    ProblemDescription,
    PhotoUpload,
    PricingReview,
    CustomerInfo,
    Payment,
    Confirmation,
}

impl WizardStep {
    pub const ALL: [WizardStep; 7] = [
        WizardStep::DeviceSelection,
        WizardStep::ProblemDescription,
        WizardStep::PhotoUpload,
        WizardStep::PricingReview,
        WizardStep::CustomerInfo,
        WizardStep::Payment,
        WizardStep::Confirmation,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<WizardStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<WizardStep> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WizardStep::Confirmation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WizardStep::DeviceSelection => "device-selection",
            WizardStep::ProblemDescription => "problem-description",
            WizardStep::PhotoUpload => "photo-upload",
            WizardStep::PricingReview => "pricing-review",
            WizardStep::CustomerInfo => "customer-info",
            WizardStep::Payment => "payment",
            WizardStep::Confirmation => "confirmation",
        }
    }
}

impl fmt::Display for WizardStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated selections. Fields are read freely but written only through
/// [`BookingWizard`], which enforces step ownership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookingDraft {
    device: Option<Device>,
    issues: IssueSelection,
    problem_description: String,
    photos: Vec<PhotoRecord>,
    options: ServiceOptions,
    quote: Option<Quote>,
    customer: Option<CustomerInfo>,
    payment: Option<PaymentOutcome>,
    booking_reference: Option<String>,
}

impl BookingDraft {
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn issues(&self) -> &IssueSelection {
        &self.issues
    }

    pub fn problem_description(&self) -> &str {
        &self.problem_description
    }

    pub fn photos(&self) -> &[PhotoRecord] {
        &self.photos
    }

    pub fn options(&self) -> ServiceOptions {
        self.options
    }

    pub fn quote(&self) -> Option<&Quote> {
        self.quote.as_ref()
    }

    pub fn customer(&self) -> Option<&CustomerInfo> {
        self.customer.as_ref()
    }

    pub fn payment(&self) -> Option<&PaymentOutcome> {
        self.payment.as_ref()
    }

    pub fn booking_reference(&self) -> Option<&str> {
        self.booking_reference.as_deref()
    }

    /// The pricing triple, once a device is chosen.
    pub fn pricing_inputs(&self) -> Option<PricingInputs> {
        self.device.as_ref().map(|device| PricingInputs {
            device: device.clone(),
            issues: self.issues.clone(),
            options: self.options,
        })
    }

    /// The quoted estimate, if it still matches the current selections.
    pub fn current_estimate(&self) -> Option<&PriceEstimate> {
        let inputs = self.pricing_inputs()?;
        self.quote
            .as_ref()
            .filter(|q| q.inputs == inputs)
            .map(|q| &q.estimate)
    }
}

/// Result of a successful transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTransition {
    pub from: WizardStep,
    pub to: WizardStep,
    /// Entered pricing-review without an estimate for the current inputs.
    pub pricing_required: bool,
}

/// Everything the submission collaborator receives once the wizard reaches
/// confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedBooking {
    pub reference: String,
    pub device: Device,
    pub issues: Vec<RepairCategory>,
    pub problem_description: String,
    pub photos: Vec<PhotoRecord>,
    pub options: ServiceOptions,
    pub estimate: PriceEstimate,
    pub customer: CustomerInfo,
    pub payment: PaymentOutcome,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingWizard {
    current: WizardStep,
    highest_reached: WizardStep,
    draft: BookingDraft,
}

impl Default for BookingWizard {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingWizard {
    pub fn new() -> Self {
        Self {
            current: WizardStep::DeviceSelection,
            highest_reached: WizardStep::DeviceSelection,
            draft: BookingDraft::default(),
        }
    }

    pub fn current(&self) -> WizardStep {
        self.current
    }

    pub fn highest_reached(&self) -> WizardStep {
        self.highest_reached
    }

    pub fn draft(&self) -> &BookingDraft {
        &self.draft
    }

    /// `Ok(())` when `step` is complete, otherwise the reason it is not.
    pub fn check_step(&self, step: WizardStep) -> std::result::Result<(), String> {
        let draft = &self.draft;
        match step {
            WizardStep::DeviceSelection => draft
                .device
                .as_ref()
                .map(|_| ())
                .ok_or_else(|| "select a device to continue".to_string()),
            WizardStep::ProblemDescription => {
                if draft.issues.is_empty() {
                    Err("select at least one issue".to_string())
                } else {
                    Ok(())
                }
            }
            WizardStep::PhotoUpload => Ok(()),
            WizardStep::PricingReview => draft
                .current_estimate()
                .map(|_| ())
                .ok_or_else(|| "no price estimate for the current selections".to_string()),
            WizardStep::CustomerInfo => match &draft.customer {
                None => Err("customer details are required".to_string()),
                Some(customer) => customer.problem().map_or(Ok(()), |p| Err(p.to_string())),
            },
            WizardStep::Payment => match &draft.payment {
                Some(outcome) if outcome.is_success() => Ok(()),
                Some(_) => Err("the last payment attempt was declined".to_string()),
                None => Err("payment has not been completed".to_string()),
            },
            WizardStep::Confirmation => Err("confirmation is the final step".to_string()),
        }
    }

    pub fn is_complete(&self, step: WizardStep) -> bool {
        self.check_step(step).is_ok()
    }

    pub fn next(&mut self) -> Result<StepTransition> {
        let from = self.current;
        let Some(to) = from.next() else {
            return Err(FlowError::InvalidTransition(format!(
                "{} is terminal, there is no next step",
                from
            )));
        };
        self.check_step(from)
            .map_err(|reason| FlowError::StepIncomplete { step: from, reason })?;
        Ok(self.enter(to))
    }

    pub fn previous(&mut self) -> Result<StepTransition> {
        self.ensure_unsealed()?;
        let from = self.current;
        let to = from.previous().ok_or_else(|| {
            FlowError::InvalidTransition(format!("{} is the first step", from))
        })?;
        Ok(self.enter(to))
    }

    /// Moves to any step already reached. Jumping forward also requires
    /// every step before the target to still be complete, since earlier
    /// edits can invalidate later steps.
    pub fn jump_to(&mut self, target: WizardStep) -> Result<StepTransition> {
        if target != self.current {
            self.ensure_unsealed()?;
        }
        if target > self.highest_reached {
            return Err(FlowError::InvalidTransition(format!(
                "cannot jump to {}, furthest step reached is {}",
                target, self.highest_reached
            )));
        }
        if target > self.current {
            for step in WizardStep::ALL.iter().copied().filter(|s| *s < target) {
                self.check_step(step)
                    .map_err(|reason| FlowError::StepIncomplete { step, reason })?;
            }
        }
        Ok(self.enter(target))
    }

    pub fn select_device(&mut self, device: Device) -> Result<()> {
        self.require_owner("device", WizardStep::DeviceSelection)?;
        if self.draft.device.as_ref() != Some(&device) {
            self.draft.device = Some(device);
            self.pricing_changed();
        }
        Ok(())
    }

    /// Returns whether the issue is selected afterwards.
    pub fn toggle_issue(&mut self, issue: RepairCategory) -> Result<bool> {
        self.require_owner("issues", WizardStep::ProblemDescription)?;
        let selected = self.draft.issues.toggle(issue);
        self.pricing_changed();
        Ok(selected)
    }

    pub fn describe_problem(&mut self, description: impl Into<String>) -> Result<()> {
        self.require_owner("problemDescription", WizardStep::ProblemDescription)?;
        self.draft.problem_description = description.into();
        Ok(())
    }

    /// Adds or replaces the record for the same upload.
    pub fn attach_photo(&mut self, record: PhotoRecord) -> Result<()> {
        self.require_owner("photos", WizardStep::PhotoUpload)?;
        match self
            .draft
            .photos
            .iter_mut()
            .find(|p| p.upload_id == record.upload_id)
        {
            Some(existing) => *existing = record,
            None => self.draft.photos.push(record),
        }
        Ok(())
    }

    pub fn remove_photo(&mut self, upload_id: Uuid) -> Result<bool> {
        self.require_owner("photos", WizardStep::PhotoUpload)?;
        let before = self.draft.photos.len();
        self.draft.photos.retain(|p| p.upload_id != upload_id);
        Ok(self.draft.photos.len() != before)
    }

    pub fn set_options(&mut self, options: ServiceOptions) -> Result<()> {
        self.require_owner("options", WizardStep::PricingReview)?;
        if self.draft.options != options {
            self.draft.options = options;
            self.pricing_changed();
        }
        Ok(())
    }

    /// Stores a settled quote. Quotes for inputs other than the current
    /// ones are refused.
    pub fn record_quote(&mut self, quote: Quote) -> Result<()> {
        self.require_owner("quote", WizardStep::PricingReview)?;
        if self.draft.pricing_inputs().as_ref() != Some(&quote.inputs) {
            return Err(FlowError::Validation(
                "quote does not match the current selections".to_string(),
            ));
        }
        if self.draft.quote.as_ref() != Some(&quote) {
            self.draft.quote = Some(quote);
            self.draft.payment = None;
        }
        Ok(())
    }

    pub fn set_customer(&mut self, customer: CustomerInfo) -> Result<()> {
        self.require_owner("customer", WizardStep::CustomerInfo)?;
        if let Some(problem) = customer.problem() {
            return Err(FlowError::Validation(problem.to_string()));
        }
        self.draft.customer = Some(customer);
        Ok(())
    }

    /// What to hand the payment collaborator. Assigns the booking reference
    /// on first use.
    pub fn payment_request(&mut self) -> Result<PaymentRequest> {
        if self.current != WizardStep::Payment {
            return Err(FlowError::InvalidTransition(format!(
                "payment can only be requested at {}, current step is {}",
                WizardStep::Payment,
                self.current
            )));
        }
        let estimate = self
            .draft
            .current_estimate()
            .cloned()
            .ok_or_else(|| FlowError::StepIncomplete {
                step: WizardStep::PricingReview,
                reason: "no price estimate for the current selections".to_string(),
            })?;
        if estimate.valid_until <= Utc::now() {
            return Err(FlowError::StepIncomplete {
                step: WizardStep::PricingReview,
                reason: format!(
                    "the price estimate expired at {}, review pricing again",
                    estimate.valid_until.to_rfc3339()
                ),
            });
        }
        Ok(PaymentRequest {
            booking_id: self.ensure_reference(),
            amount: estimate.total,
            currency: estimate.currency,
        })
    }

    /// A declined outcome is kept so it can be shown, and may be replaced
    /// by a later attempt. Once a payment succeeded it is final.
    pub fn record_payment(&mut self, outcome: PaymentOutcome) -> Result<()> {
        self.require_owner("payment", WizardStep::Payment)?;
        if self.draft.payment.as_ref().is_some_and(PaymentOutcome::is_success) {
            return Err(FlowError::InvalidTransition(
                "payment has already succeeded".to_string(),
            ));
        }
        info!(
            provider = ?outcome.provider,
            success = outcome.is_success(),
            "payment outcome recorded"
        );
        self.draft.payment = Some(outcome);
        Ok(())
    }

    pub fn confirmed_booking(&self) -> Result<ConfirmedBooking> {
        if self.current != WizardStep::Confirmation {
            return Err(FlowError::InvalidTransition(format!(
                "booking is not confirmed, current step is {}",
                self.current
            )));
        }
        let draft = &self.draft;
        let incomplete = |step: WizardStep, reason: &str| FlowError::StepIncomplete {
            step,
            reason: reason.to_string(),
        };
        Ok(ConfirmedBooking {
            reference: draft
                .booking_reference
                .clone()
                .ok_or_else(|| incomplete(WizardStep::Confirmation, "no booking reference"))?,
            device: draft
                .device
                .clone()
                .ok_or_else(|| incomplete(WizardStep::DeviceSelection, "no device"))?,
            issues: draft.issues.iter().collect(),
            problem_description: draft.problem_description.clone(),
            photos: draft.photos.clone(),
            options: draft.options,
            estimate: draft
                .current_estimate()
                .cloned()
                .ok_or_else(|| incomplete(WizardStep::PricingReview, "no estimate"))?,
            customer: draft
                .customer
                .clone()
                .ok_or_else(|| incomplete(WizardStep::CustomerInfo, "no customer"))?,
            payment: draft
                .payment
                .clone()
                .ok_or_else(|| incomplete(WizardStep::Payment, "no payment"))?,
            confirmed_at: Utc::now(),
        })
    }

    fn enter(&mut self, to: WizardStep) -> StepTransition {
        let from = self.current;
        self.current = to;
        self.highest_reached = self.highest_reached.max(to);
        if to == WizardStep::Confirmation {
            let reference = self.ensure_reference();
            info!(%reference, "booking confirmed");
        }
        let pricing_required =
            to == WizardStep::PricingReview && self.draft.current_estimate().is_none();
        debug!(%from, %to, pricing_required, "wizard transition");
        StepTransition {
            from,
            to,
            pricing_required,
        }
    }

    fn ensure_reference(&mut self) -> String {
        self.draft
            .booking_reference
            .get_or_insert_with(|| format!("RPR-{:08X}", rand::random::<u32>()))
            .clone()
    }

    pub fn is_sealed(&self) -> bool {
        self.current == WizardStep::Confirmation
            || self.draft.payment.as_ref().is_some_and(PaymentOutcome::is_success)
    }

    fn ensure_unsealed(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(FlowError::InvalidTransition(format!(
                "booking is paid and can no longer be edited, current step is {}",
                self.current
            )));
        }
        Ok(())
    }

    fn require_owner(&self, field: &'static str, owner: WizardStep) -> Result<()> {
        if self.current == owner {
            Ok(())
        } else {
            Err(FlowError::SlotLocked {
                field,
                owner,
                current: self.current,
            })
        }
    }

    /// Pricing inputs changed: anything from pricing-review onwards has to
    /// be walked through again.
    fn pricing_changed(&mut self) {
        self.draft.payment = None;
        self.highest_reached = self.highest_reached.min(WizardStep::PricingReview);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use uuid::Uuid;

/// An amount in the currency's minor unit (pence for GBP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Converts a major-unit amount (e.g. `412.5` pounds), rounding to the
    /// nearest minor unit.
    pub fn from_major(major: f64) -> Self {
        Self((major * 100.0).round() as i64)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn as_major(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Correlates asynchronous responses with the flow instance that asked for
/// them. Generated once per mounted flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceCategory {
    Phone,
    Tablet,
    Laptop,
    Desktop,
    Console,
    Wearable,
}

impl DeviceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCategory::Phone => "phone",
            DeviceCategory::Tablet => "tablet",
            DeviceCategory::Laptop => "laptop",
            DeviceCategory::Desktop => "desktop",
            DeviceCategory::Console => "console",
            DeviceCategory::Wearable => "wearable",
        }
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference data for one device model. Loaded once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub year: u16,
    pub category: DeviceCategory,
    pub average_repair_cost: Money,
}

impl Device {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.brand, self.model)
    }
}

/// Issue identifiers a customer can select against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairCategory {
    ScreenRepair,
    BatteryReplacement,
    ChargingPort,
    WaterDamage,
    KeyboardRepair,
    CameraRepair,
    AudioRepair,
    DataRecovery,
    SoftwareIssue,
    Diagnostic,
}

impl RepairCategory {
    pub const ALL: [RepairCategory; 10] = [
        RepairCategory::ScreenRepair,
        RepairCategory::BatteryReplacement,
        RepairCategory::ChargingPort,
        RepairCategory::WaterDamage,
        RepairCategory::KeyboardRepair,
        RepairCategory::CameraRepair,
        RepairCategory::AudioRepair,
        RepairCategory::DataRecovery,
        RepairCategory::SoftwareIssue,
        RepairCategory::Diagnostic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairCategory::ScreenRepair => "screen-repair",
            RepairCategory::BatteryReplacement => "battery-replacement",
            RepairCategory::ChargingPort => "charging-port",
            RepairCategory::WaterDamage => "water-damage",
            RepairCategory::KeyboardRepair => "keyboard-repair",
            RepairCategory::CameraRepair => "camera-repair",
            RepairCategory::AudioRepair => "audio-repair",
            RepairCategory::DataRecovery => "data-recovery",
            RepairCategory::SoftwareIssue => "software-issue",
            RepairCategory::Diagnostic => "diagnostic",
        }
    }
}

impl fmt::Display for RepairCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepairCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RepairCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown repair category '{}'", s))
    }
}

/// The set of issues selected against a device. Ordering is irrelevant, so
/// two selections with the same members compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueSelection(BTreeSet<RepairCategory>);

impl IssueSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the issue if absent, removes it otherwise. Returns whether the
    /// issue is selected afterwards.
    pub fn toggle(&mut self, issue: RepairCategory) -> bool {
        if self.0.remove(&issue) {
            false
        } else {
            self.0.insert(issue);
            true
        }
    }

    pub fn contains(&self, issue: RepairCategory) -> bool {
        self.0.contains(&issue)
    }

    pub fn iter(&self) -> impl Iterator<Item = RepairCategory> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn primary(&self) -> Option<RepairCategory> {
        self.0.iter().next().copied()
    }
}

impl FromIterator<RepairCategory> for IssueSelection {
    fn from_iter<I: IntoIterator<Item = RepairCategory>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UrgencyTier {
    #[default]
    Standard,
    Priority,
    High,
    Emergency,
}

impl UrgencyTier {
    /// Wire name used by the HTTP pricing endpoint.
    pub fn as_level(&self) -> &'static str {
        match self {
            UrgencyTier::Standard => "STANDARD",
            UrgencyTier::Priority => "PRIORITY",
            UrgencyTier::High => "HIGH",
            UrgencyTier::Emergency => "EMERGENCY",
        }
    }

    pub fn from_level(level: &str) -> Option<Self> {
        match level.to_ascii_uppercase().as_str() {
            "STANDARD" | "NORMAL" | "LOW" => Some(UrgencyTier::Standard),
            "PRIORITY" | "MEDIUM" => Some(UrgencyTier::Priority),
            "HIGH" => Some(UrgencyTier::High),
            "EMERGENCY" | "URGENT" => Some(UrgencyTier::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarrantyTier {
    #[default]
    Standard,
    Extended,
    Premium,
}

/// Service-level choices. Replaced as a whole on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOptions {
    pub urgency: UrgencyTier,
    pub express: bool,
    pub premium_parts: bool,
    pub warranty: WarrantyTier,
    pub pickup_delivery: bool,
}

/// Everything a price depends on. Two requests with equal inputs are
/// interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingInputs {
    pub device: Device,
    pub issues: IssueSelection,
    pub options: ServiceOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceComponent {
    pub name: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceEstimate {
    pub base_price: Money,
    pub breakdown: Vec<PriceComponent>,
    pub total: Money,
    pub currency: String,
    pub valid_until: DateTime<Utc>,
    pub disclaimers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CustomerInfo {
    /// Returns the first problem found, if any.
    pub fn problem(&self) -> Option<&'static str> {
        if self.name.trim().is_empty() {
            return Some("customer name is required");
        }
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => return Some("a valid email address is required"),
        }
        let digits = self.phone.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 7 {
            return Some("a valid phone number is required");
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    Paypal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PaymentStatus {
    #[serde(rename_all = "camelCase")]
    Succeeded { transaction_id: String },
    Declined { reason: String },
}

/// Callback payload from the payment collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub provider: PaymentProvider,
    #[serde(flatten)]
    pub status: PaymentStatus,
}

impl PaymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, PaymentStatus::Succeeded { .. })
    }
}

/// What the payment collaborator is handed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub booking_id: String,
    pub amount: Money,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub detected_issues: Vec<RepairCategory>,
    pub confidence: f32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// A completed photo analysis attached to the draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRecord {
    pub upload_id: Uuid,
    pub file_name: String,
    pub analysis: AnalysisResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_display_and_rounding() {
        assert_eq!(Money::from_major(19.999).minor(), 2000);
        assert_eq!(Money::from_minor(60000).to_string(), "600.00");
        assert_eq!(Money::from_minor(-505).to_string(), "-5.05");
    }

    #[test]
    fn issue_selection_is_order_independent() {
        let mut a = IssueSelection::new();
        a.toggle(RepairCategory::BatteryReplacement);
        a.toggle(RepairCategory::ScreenRepair);

        let b: IssueSelection = [RepairCategory::ScreenRepair, RepairCategory::BatteryReplacement]
            .into_iter()
            .collect();
        assert_eq!(a, b);

        assert!(!a.toggle(RepairCategory::ScreenRepair));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn repair_category_wire_names() {
        let json = serde_json::to_string(&RepairCategory::ScreenRepair).unwrap();
        assert_eq!(json, "\"screen-repair\"");
        assert_eq!(
            "water-damage".parse::<RepairCategory>().unwrap(),
            RepairCategory::WaterDamage
        );
    }

    #[test]
    fn customer_validation() {
        let mut customer = CustomerInfo {
            name: "Ada Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            phone: "+44 20 7946 0958".to_string(),
            address: None,
            notes: None,
        };
        assert_eq!(customer.problem(), None);

        customer.email = "ada.example.com".to_string();
        assert_eq!(customer.problem(), Some("a valid email address is required"));
    }

    #[test]
    fn payment_outcome_wire_shape() {
        let outcome: PaymentOutcome = serde_json::from_value(serde_json::json!({
            "provider": "stripe",
            "status": "succeeded",
            "transactionId": "pi_123"
        }))
        .unwrap();
        assert!(outcome.is_success());
    }
}

//! Pricing rules and the local estimator.
//!
//! [`evaluate`] is pure: the quote instant is an argument, so identical inputs
//! always produce an identical [`PriceEstimate`]. Multipliers are applied in a
//! fixed order (base, urgency, complexity, market, seasonal) on an unrounded
//! running amount; only the total is rounded to the minor unit. Breakdown
//! lines are differences of rounded running amounts, so they always add up
//! to the total.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::{
    error::{FlowError, Result},
    model::{
        DeviceCategory, Money, PriceComponent, PriceEstimate, PricingInputs, RepairCategory,
        UrgencyTier, WarrantyTier,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UrgencyMultipliers {
    pub standard: f64,
    pub priority: f64,
    pub high: f64,
    pub emergency: f64,
}

impl UrgencyMultipliers {
    pub fn for_tier(&self, tier: UrgencyTier) -> f64 {
        match tier {
            UrgencyTier::Standard => self.standard,
            UrgencyTier::Priority => self.priority,
            UrgencyTier::High => self.high,
            UrgencyTier::Emergency => self.emergency,
        }
    }
}

impl Default for UrgencyMultipliers {
    fn default() -> Self {
        Self {
            standard: 1.0,
            priority: 1.25,
            high: 1.5,
            emergency: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarrantyFees {
    pub standard: Money,
    pub extended: Money,
    pub premium: Money,
}

impl WarrantyFees {
    pub fn for_tier(&self, tier: WarrantyTier) -> Money {
        match tier {
            WarrantyTier::Standard => self.standard,
            WarrantyTier::Extended => self.extended,
            WarrantyTier::Premium => self.premium,
        }
    }
}

impl Default for WarrantyFees {
    fn default() -> Self {
        Self {
            standard: Money::ZERO,
            extended: Money::from_minor(2_900),
            premium: Money::from_minor(4_900),
        }
    }
}

/// Tunable pricing tables. Serializable so deployments can override them
/// from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingRules {
    pub currency: String,
    /// Per device category, the share of the device's average repair cost
    /// charged for each repair it supports. Missing entries are not offered.
    pub category_factors: BTreeMap<DeviceCategory, BTreeMap<RepairCategory, f64>>,
    pub urgency: UrgencyMultipliers,
    pub express_multiplier: f64,
    /// Added to the complexity multiplier for every issue beyond the first.
    pub complexity_step: f64,
    pub complexity_cap: f64,
    pub premium_parts_multiplier: f64,
    pub brand_multipliers: BTreeMap<String, f64>,
    /// Keyed by calendar month, 1 to 12.
    pub seasonal_multipliers: BTreeMap<u32, f64>,
    pub warranty_fees: WarrantyFees,
    pub pickup_delivery_fee: Money,
    pub validity_hours: i64,
}

impl Default for PricingRules {
    fn default() -> Self {
        let mut category_factors = BTreeMap::new();
        for category in [
            DeviceCategory::Phone,
            DeviceCategory::Tablet,
            DeviceCategory::Laptop,
            DeviceCategory::Desktop,
            DeviceCategory::Console,
            DeviceCategory::Wearable,
        ] {
            let factors: BTreeMap<RepairCategory, f64> = RepairCategory::ALL
                .into_iter()
                .filter_map(|repair| default_factor(category, repair).map(|f| (repair, f)))
                .collect();
            category_factors.insert(category, factors);
        }

        Self {
            currency: "GBP".to_string(),
            category_factors,
            urgency: UrgencyMultipliers::default(),
            express_multiplier: 1.2,
            complexity_step: 0.05,
            complexity_cap: 1.25,
            premium_parts_multiplier: 1.15,
            brand_multipliers: BTreeMap::new(),
            seasonal_multipliers: BTreeMap::new(),
            warranty_fees: WarrantyFees::default(),
            pickup_delivery_fee: Money::from_minor(1_500),
            validity_hours: 24,
        }
    }
}

fn default_factor(category: DeviceCategory, repair: RepairCategory) -> Option<f64> {
    use DeviceCategory as D;
    use RepairCategory as R;

    match (repair, category) {
        (R::ScreenRepair, D::Console) => None,
        (R::ScreenRepair, _) => Some(1.0),
        (R::BatteryReplacement, D::Desktop | D::Console) => None,
        (R::BatteryReplacement, _) => Some(0.45),
        (R::ChargingPort, D::Desktop) => None,
        (R::ChargingPort, _) => Some(0.35),
        (R::WaterDamage, _) => Some(1.25),
        (R::KeyboardRepair, D::Laptop) => Some(0.6),
        (R::KeyboardRepair, _) => None,
        (R::CameraRepair, D::Phone | D::Tablet | D::Laptop) => Some(0.5),
        (R::CameraRepair, _) => None,
        (R::AudioRepair, _) => Some(0.4),
        (R::DataRecovery, D::Wearable) => None,
        (R::DataRecovery, _) => Some(0.9),
        (R::SoftwareIssue, _) => Some(0.3),
        (R::Diagnostic, _) => Some(0.15),
    }
}

impl PricingRules {
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: PricingRules = serde_json::from_str(json)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("cannot read pricing rules {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let multipliers = [
            ("urgency.standard", self.urgency.standard),
            ("urgency.priority", self.urgency.priority),
            ("urgency.high", self.urgency.high),
            ("urgency.emergency", self.urgency.emergency),
            ("express_multiplier", self.express_multiplier),
            ("complexity_cap", self.complexity_cap),
            ("premium_parts_multiplier", self.premium_parts_multiplier),
        ];
        for (name, value) in multipliers {
            if !(value.is_finite() && value > 0.0) {
                return Err(FlowError::Config(format!("{} must be positive", name)));
            }
        }
        if self.complexity_step < 0.0 {
            return Err(FlowError::Config("complexity_step must not be negative".into()));
        }
        if self
            .brand_multipliers
            .values()
            .chain(self.seasonal_multipliers.values())
            .any(|m| !(m.is_finite() && *m > 0.0))
        {
            return Err(FlowError::Config(
                "brand and seasonal multipliers must be positive".into(),
            ));
        }
        for (category, factors) in &self.category_factors {
            if let Some((repair, factor)) = factors
                .iter()
                .find(|(_, f)| !(f.is_finite() && **f >= 0.0))
            {
                return Err(FlowError::Config(format!(
                    "category_factors.{}.{} must not be negative, got {}",
                    category, repair, factor
                )));
            }
        }
        let fees = [
            ("warranty_fees.standard", self.warranty_fees.standard),
            ("warranty_fees.extended", self.warranty_fees.extended),
            ("warranty_fees.premium", self.warranty_fees.premium),
            ("pickup_delivery_fee", self.pickup_delivery_fee),
        ];
        for (name, fee) in fees {
            if fee.minor() < 0 {
                return Err(FlowError::Config(format!("{} must not be negative", name)));
            }
        }
        if self.validity_hours <= 0 {
            return Err(FlowError::Config("validity_hours must be positive".into()));
        }
        Ok(())
    }

    /// Whether the repair is priced for devices of this category.
    pub fn offers(&self, category: DeviceCategory, repair: RepairCategory) -> bool {
        self.factor(category, repair).is_some()
    }

    fn factor(&self, category: DeviceCategory, repair: RepairCategory) -> Option<f64> {
        self.category_factors
            .get(&category)
            .and_then(|factors| factors.get(&repair))
            .copied()
    }
}

/// Checks the inputs against the rules without computing a price.
pub fn validate_inputs(rules: &PricingRules, inputs: &PricingInputs) -> Result<()> {
    if inputs.issues.is_empty() {
        return Err(FlowError::Validation(
            "at least one issue must be selected".to_string(),
        ));
    }
    for issue in inputs.issues.iter() {
        if !rules.offers(inputs.device.category, issue) {
            return Err(FlowError::Validation(format!(
                "{} is not offered for {} devices",
                issue, inputs.device.category
            )));
        }
    }
    Ok(())
}

/// Computes the estimate for `inputs` as quoted at `quoted_at`.
pub fn evaluate(
    rules: &PricingRules,
    inputs: &PricingInputs,
    quoted_at: DateTime<Utc>,
) -> Result<PriceEstimate> {
    validate_inputs(rules, inputs)?;

    let device = &inputs.device;
    let options = &inputs.options;
    let mut breakdown = Vec::new();

    let mut base_price = Money::ZERO;
    for issue in inputs.issues.iter() {
        let factor = rules.factor(device.category, issue).unwrap_or_default();
        let amount = round_minor(device.average_repair_cost.minor() as f64 * factor);
        base_price = base_price + amount;
        breakdown.push(PriceComponent {
            name: issue.as_str().to_string(),
            amount,
        });
    }

    let mut urgency = rules.urgency.for_tier(options.urgency);
    if options.express {
        urgency *= rules.express_multiplier;
    }

    let extra_issues = inputs.issues.len().saturating_sub(1) as f64;
    let mut complexity = (1.0 + rules.complexity_step * extra_issues).min(rules.complexity_cap);
    if options.premium_parts {
        complexity *= rules.premium_parts_multiplier;
    }

    let market = rules
        .brand_multipliers
        .get(&device.brand)
        .copied()
        .unwrap_or(1.0);

    let seasonal = rules
        .seasonal_multipliers
        .get(&quoted_at.month())
        .copied()
        .unwrap_or(1.0);

    let mut running = base_price.minor() as f64;
    for (name, multiplier) in [
        ("urgency", urgency),
        ("complexity", complexity),
        ("market", market),
        ("seasonal", seasonal),
    ] {
        let before = round_minor(running);
        running *= multiplier;
        let delta = round_minor(running) - before;
        if delta != Money::ZERO {
            breakdown.push(PriceComponent {
                name: format!("{} adjustment", name),
                amount: delta,
            });
        }
    }

    let mut total = round_minor(running);

    let warranty = rules.warranty_fees.for_tier(options.warranty);
    if warranty != Money::ZERO {
        breakdown.push(PriceComponent {
            name: "warranty".to_string(),
            amount: warranty,
        });
        total = total + warranty;
    }
    if options.pickup_delivery {
        breakdown.push(PriceComponent {
            name: "pickup and delivery".to_string(),
            amount: rules.pickup_delivery_fee,
        });
        total = total + rules.pickup_delivery_fee;
    }

    let mut disclaimers = vec![
        "Final price is confirmed after a diagnostic inspection.".to_string(),
        format!("This quote is valid for {} hours.", rules.validity_hours),
    ];
    if inputs.issues.len() > 1 {
        disclaimers.push(
            "Multiple repairs are priced with a combined complexity adjustment.".to_string(),
        );
    }
    if options.express {
        disclaimers.push("Express service is subject to parts availability.".to_string());
    }
    if options.premium_parts {
        disclaimers.push("Premium parts are genuine or OEM-grade components.".to_string());
    }

    Ok(PriceEstimate {
        base_price,
        breakdown,
        total,
        currency: rules.currency.clone(),
        valid_until: quoted_at + Duration::hours(rules.validity_hours),
        disclaimers,
    })
}

fn round_minor(value: f64) -> Money {
    Money::from_minor(value.round() as i64)
}

/// Prices requests locally when the real-time channel is unavailable.
#[derive(Debug, Clone)]
pub struct LocalEstimator {
    rules: Arc<PricingRules>,
}

impl LocalEstimator {
    pub fn new(rules: Arc<PricingRules>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PricingRules {
        &self.rules
    }

    pub fn estimate(&self, inputs: &PricingInputs) -> Result<PriceEstimate> {
        self.estimate_at(inputs, Utc::now())
    }

    pub fn estimate_at(&self, inputs: &PricingInputs, quoted_at: DateTime<Utc>) -> Result<PriceEstimate> {
        evaluate(&self.rules, inputs, quoted_at)
    }
}

impl Default for LocalEstimator {
    fn default() -> Self {
        Self::new(Arc::new(PricingRules::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DeviceCatalog;
    use crate::model::{IssueSelection, ServiceOptions};
    use chrono::TimeZone;

    fn inputs(device_id: &str, issues: &[RepairCategory], options: ServiceOptions) -> PricingInputs {
        PricingInputs {
            device: DeviceCatalog::default().require(device_id).unwrap().clone(),
            issues: issues.iter().copied().collect::<IssueSelection>(),
            options,
        }
    }

    fn quoted_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap()
    }

    #[test]
    fn high_urgency_screen_repair_on_macbook() {
        let rules = PricingRules::default();
        let options = ServiceOptions {
            urgency: UrgencyTier::High,
            ..Default::default()
        };
        let inputs = inputs("macbook-pro-16-2021", &[RepairCategory::ScreenRepair], options);

        let estimate = evaluate(&rules, &inputs, quoted_at()).unwrap();

        assert_eq!(estimate.base_price, Money::from_minor(40_000));
        assert_eq!(estimate.total, Money::from_minor(60_000));
        assert_eq!(estimate.currency, "GBP");
        assert_eq!(estimate.valid_until, quoted_at() + Duration::hours(24));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rules = PricingRules::default();
        let options = ServiceOptions {
            urgency: UrgencyTier::Priority,
            express: true,
            premium_parts: true,
            warranty: WarrantyTier::Extended,
            pickup_delivery: true,
        };
        let inputs = inputs(
            "iphone-13",
            &[RepairCategory::ScreenRepair, RepairCategory::BatteryReplacement],
            options,
        );

        let first = evaluate(&rules, &inputs, quoted_at()).unwrap();
        let second = evaluate(&rules, &inputs, quoted_at()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn breakdown_sums_to_total() {
        let mut rules = PricingRules::default();
        rules.brand_multipliers.insert("Samsung".to_string(), 0.97);
        rules.seasonal_multipliers.insert(3, 1.03);
        let options = ServiceOptions {
            urgency: UrgencyTier::Priority,
            express: true,
            premium_parts: true,
            warranty: WarrantyTier::Premium,
            pickup_delivery: true,
        };
        let inputs = inputs(
            "galaxy-s23",
            &[
                RepairCategory::ScreenRepair,
                RepairCategory::ChargingPort,
                RepairCategory::CameraRepair,
            ],
            options,
        );

        let estimate = evaluate(&rules, &inputs, quoted_at()).unwrap();
        let sum = estimate
            .breakdown
            .iter()
            .fold(Money::ZERO, |acc, c| acc + c.amount);
        assert_eq!(sum, estimate.total);
        assert!(estimate.breakdown.iter().any(|c| c.name == "market adjustment"));
        assert!(estimate.breakdown.iter().any(|c| c.name == "seasonal adjustment"));
    }

    #[test]
    fn multiplier_order_is_fixed() {
        let rules = PricingRules::default();
        let options = ServiceOptions {
            urgency: UrgencyTier::Priority,
            ..Default::default()
        };
        let inputs = inputs(
            "iphone-13",
            &[RepairCategory::ScreenRepair, RepairCategory::SoftwareIssue],
            options,
        );

        let estimate = evaluate(&rules, &inputs, quoted_at()).unwrap();
        let names: Vec<&str> = estimate.breakdown.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "screen-repair",
                "software-issue",
                "urgency adjustment",
                "complexity adjustment"
            ]
        );
    }

    #[test]
    fn empty_issue_set_is_a_validation_error() {
        let rules = PricingRules::default();
        let inputs = inputs("iphone-13", &[], ServiceOptions::default());
        assert!(matches!(
            evaluate(&rules, &inputs, quoted_at()),
            Err(FlowError::Validation(_))
        ));
    }

    #[test]
    fn repair_not_offered_for_category() {
        let rules = PricingRules::default();
        let inputs = inputs(
            "playstation-5",
            &[RepairCategory::ScreenRepair],
            ServiceOptions::default(),
        );
        let err = evaluate(&rules, &inputs, quoted_at()).unwrap_err();
        assert!(err.to_string().contains("not offered for console devices"));
    }

    #[test]
    fn rules_round_trip_through_json() {
        let rules = PricingRules::default();
        let json = serde_json::to_string(&rules).unwrap();
        let parsed = PricingRules::from_json(&json).unwrap();
        assert_eq!(parsed, rules);
    }

    #[test]
    fn rejects_non_positive_multiplier() {
        let json = r#"{ "express_multiplier": 0.0 }"#;
        assert!(matches!(
            PricingRules::from_json(json),
            Err(FlowError::Config(_))
        ));
    }

    #[test]
    fn rejects_negative_factors_and_fees() {
        let factor = r#"{ "category_factors": { "phone": { "screen-repair": -0.5 } } }"#;
        let err = PricingRules::from_json(factor).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
        assert!(err.to_string().contains("category_factors.phone.screen-repair"));

        let warranty = r#"{ "warranty_fees": { "standard": 0, "extended": -100, "premium": 9000 } }"#;
        let err = PricingRules::from_json(warranty).unwrap_err();
        assert!(err.to_string().contains("warranty_fees.extended"));

        let pickup = r#"{ "pickup_delivery_fee": -1 }"#;
        let err = PricingRules::from_json(pickup).unwrap_err();
        assert!(err.to_string().contains("pickup_delivery_fee"));

        let free = r#"{ "pickup_delivery_fee": 0 }"#;
        assert!(PricingRules::from_json(free).is_ok());
    }
}

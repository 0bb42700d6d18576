//! Free-text understanding for the problem-description step.
//!
//! Pattern matching only: whole-word phrases map to repair categories,
//! catalog devices and customer intents, each with a fixed confidence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    catalog::DeviceCatalog,
    error::{FlowError, Result},
    model::{Device, IssueSelection, Money, PricingInputs, RepairCategory, ServiceOptions},
    pricing::LocalEstimator,
};

const DIRECT_MATCH_CONFIDENCE: f32 = 0.9;
const KEYWORD_CONFIDENCE: f32 = 0.5;
const UNKNOWN_CONFIDENCE: f32 = 0.1;
/// Below this overall confidence no price is suggested.
const ESTIMATE_CONFIDENCE: f32 = 0.6;
/// Quoted range around the standard-options total, in percent.
const RANGE_LOW_PERCENT: i64 = 85;
const RANGE_HIGH_PERCENT: i64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemMatch {
    pub category: Option<RepairCategory>,
    pub matched: Option<String>,
    pub severity: Option<Severity>,
    pub repair_time: String,
    pub confidence: f32,
}

impl ProblemMatch {
    fn unknown() -> Self {
        Self {
            category: None,
            matched: None,
            severity: None,
            repair_time: "Assessment needed".to_string(),
            confidence: UNKNOWN_CONFIDENCE,
        }
    }
}

struct ProblemPattern {
    phrase: &'static str,
    regex: Regex,
    category: RepairCategory,
    severity: Severity,
    repair_time: &'static str,
}

/// (phrase, category, severity, repair time)
const PROBLEM_PATTERNS: &[(&str, RepairCategory, Severity, &str)] = &[
    ("cracked screen", RepairCategory::ScreenRepair, Severity::High, "1-2 hours"),
    ("broken screen", RepairCategory::ScreenRepair, Severity::High, "1-2 hours"),
    ("shattered", RepairCategory::ScreenRepair, Severity::High, "1-2 hours"),
    ("black screen", RepairCategory::ScreenRepair, Severity::High, "1-3 hours"),
    ("dead pixels", RepairCategory::ScreenRepair, Severity::Medium, "1-2 hours"),
    ("touch not working", RepairCategory::ScreenRepair, Severity::High, "1-2 hours"),
    ("flickering", RepairCategory::ScreenRepair, Severity::Medium, "1-3 hours"),
    ("battery drains", RepairCategory::BatteryReplacement, Severity::Medium, "30-60 minutes"),
    ("battery dies", RepairCategory::BatteryReplacement, Severity::Medium, "30-60 minutes"),
    ("swollen battery", RepairCategory::BatteryReplacement, Severity::Critical, "30-60 minutes"),
    ("won't hold charge", RepairCategory::BatteryReplacement, Severity::Medium, "30-60 minutes"),
    ("not charging", RepairCategory::ChargingPort, Severity::High, "1 hour"),
    ("won't charge", RepairCategory::ChargingPort, Severity::High, "1 hour"),
    ("charging port", RepairCategory::ChargingPort, Severity::Medium, "1 hour"),
    ("loose cable", RepairCategory::ChargingPort, Severity::Low, "1 hour"),
    ("water damage", RepairCategory::WaterDamage, Severity::Critical, "24-48 hours"),
    ("dropped in water", RepairCategory::WaterDamage, Severity::Critical, "24-48 hours"),
    ("liquid spill", RepairCategory::WaterDamage, Severity::Critical, "24-48 hours"),
    ("spilled", RepairCategory::WaterDamage, Severity::Critical, "24-48 hours"),
    ("sticky keys", RepairCategory::KeyboardRepair, Severity::Low, "2-3 hours"),
    ("keyboard not working", RepairCategory::KeyboardRepair, Severity::Medium, "2-3 hours"),
    ("keys not working", RepairCategory::KeyboardRepair, Severity::Medium, "2-3 hours"),
    ("blurry photos", RepairCategory::CameraRepair, Severity::Low, "1 hour"),
    ("camera not working", RepairCategory::CameraRepair, Severity::Medium, "1 hour"),
    ("no sound", RepairCategory::AudioRepair, Severity::Medium, "1 hour"),
    ("speaker crackling", RepairCategory::AudioRepair, Severity::Low, "1 hour"),
    ("microphone not working", RepairCategory::AudioRepair, Severity::Medium, "1 hour"),
    ("lost data", RepairCategory::DataRecovery, Severity::High, "1-3 days"),
    ("deleted files", RepairCategory::DataRecovery, Severity::High, "1-3 days"),
    ("recover photos", RepairCategory::DataRecovery, Severity::High, "1-3 days"),
    ("hard drive failed", RepairCategory::DataRecovery, Severity::Critical, "2-5 days"),
    ("virus", RepairCategory::SoftwareIssue, Severity::Medium, "2-4 hours"),
    ("malware", RepairCategory::SoftwareIssue, Severity::Medium, "2-4 hours"),
    ("keeps crashing", RepairCategory::SoftwareIssue, Severity::Medium, "1-3 hours"),
    ("stuck on logo", RepairCategory::SoftwareIssue, Severity::High, "1-3 hours"),
    ("won't turn on", RepairCategory::Diagnostic, Severity::High, "Assessment needed"),
    ("not turning on", RepairCategory::Diagnostic, Severity::High, "Assessment needed"),
    ("overheating", RepairCategory::Diagnostic, Severity::Medium, "1-2 hours"),
];

/// Single words used when no phrase matches.
const PROBLEM_KEYWORDS: &[(&str, RepairCategory)] = &[
    ("screen", RepairCategory::ScreenRepair),
    ("battery", RepairCategory::BatteryReplacement),
    ("slow", RepairCategory::SoftwareIssue),
    ("virus", RepairCategory::SoftwareIssue),
    ("broken", RepairCategory::Diagnostic),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RepairRequest,
    PriceInquiry,
    TimeInquiry,
    BookingRequest,
    GeneralInquiry,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentMatch {
    pub intent: Intent,
    pub confidence: f32,
}

const INTENT_PATTERNS: &[(Intent, f32, &[&str])] = &[
    (
        Intent::RepairRequest,
        0.8,
        &["fix", "repair", "broken", "not working", "problem", "issue", "help"],
    ),
    (
        Intent::PriceInquiry,
        0.9,
        &["cost", "price", "how much", "quote", "estimate", "fee", "charge"],
    ),
    (
        Intent::TimeInquiry,
        0.85,
        &["how long", "when", "time", "ready", "take", "duration"],
    ),
    (
        Intent::BookingRequest,
        0.9,
        &["book", "appointment", "schedule", "visit", "bring in", "drop off"],
    ),
    (
        Intent::GeneralInquiry,
        0.7,
        &["hello", "hi", "info", "information", "about"],
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Model,
    Brand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMatch {
    pub device: Option<Device>,
    pub brand: Option<String>,
    pub kind: Option<MatchKind>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    PriceEstimate,
    SpecificRecommendation,
    ClarifyingQuestion,
    GeneralGuidance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAnalysis {
    pub device: DeviceMatch,
    pub problem: ProblemMatch,
    pub intent: IntentMatch,
    pub overall_confidence: f32,
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_estimate: Option<RepairEstimate>,
}

/// Indicative price for a repair named in free text, quoted with standard
/// service options. The booking's own quote replaces it once pricing runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairEstimate {
    pub device_id: String,
    pub category: RepairCategory,
    pub estimated_cost: Money,
    pub cost_range: CostRange,
    pub currency: String,
    pub repair_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRange {
    pub low: Money,
    pub high: Money,
}

impl CostRange {
    fn around(total: Money) -> Self {
        let percent = |p: i64| Money::from_minor((total.minor() * p + 50) / 100);
        Self {
            low: percent(RANGE_LOW_PERCENT),
            high: percent(RANGE_HIGH_PERCENT),
        }
    }
}

pub struct ProblemClassifier {
    patterns: Vec<ProblemPattern>,
    keywords: Vec<(Regex, RepairCategory)>,
    intents: Vec<(Intent, f32, Vec<Regex>)>,
}

impl ProblemClassifier {
    pub fn new() -> Result<Self> {
        let mut patterns = PROBLEM_PATTERNS
            .iter()
            .map(|&(phrase, category, severity, repair_time)| {
                Ok(ProblemPattern {
                    phrase,
                    regex: word_regex(phrase)?,
                    category,
                    severity,
                    repair_time,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // longest phrase wins when several overlap
        patterns.sort_by(|a, b| b.phrase.len().cmp(&a.phrase.len()));

        let keywords = PROBLEM_KEYWORDS
            .iter()
            .map(|&(word, category)| Ok((word_regex(word)?, category)))
            .collect::<Result<Vec<_>>>()?;

        let intents = INTENT_PATTERNS
            .iter()
            .map(|&(intent, confidence, phrases)| {
                let regexes = phrases
                    .iter()
                    .map(|p| word_regex(p))
                    .collect::<Result<Vec<_>>>()?;
                Ok((intent, confidence, regexes))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            keywords,
            intents,
        })
    }

    /// Best single problem match for the text.
    pub fn classify(&self, text: &str) -> ProblemMatch {
        let text = text.to_lowercase();
        if let Some(pattern) = self.patterns.iter().find(|p| p.regex.is_match(&text)) {
            return ProblemMatch {
                category: Some(pattern.category),
                matched: Some(pattern.phrase.to_string()),
                severity: Some(pattern.severity),
                repair_time: pattern.repair_time.to_string(),
                confidence: DIRECT_MATCH_CONFIDENCE,
            };
        }
        if let Some((regex, category)) = self.keywords.iter().find(|(r, _)| r.is_match(&text)) {
            return ProblemMatch {
                category: Some(*category),
                matched: regex
                    .find(&text)
                    .map(|m| m.as_str().to_string()),
                severity: Some(Severity::Medium),
                repair_time: "1-3 hours".to_string(),
                confidence: KEYWORD_CONFIDENCE,
            };
        }
        ProblemMatch::unknown()
    }

    /// Every repair category mentioned in the text, in catalog order.
    pub fn suggest(&self, text: &str) -> Vec<RepairCategory> {
        let text = text.to_lowercase();
        let mut found: Vec<RepairCategory> = self
            .patterns
            .iter()
            .filter(|p| p.regex.is_match(&text))
            .map(|p| p.category)
            .collect();
        if found.is_empty() {
            found.extend(
                self.keywords
                    .iter()
                    .filter(|(r, _)| r.is_match(&text))
                    .map(|(_, c)| *c),
            );
        }
        found.sort();
        found.dedup();
        found
    }

    pub fn classify_intent(&self, text: &str) -> IntentMatch {
        let text = text.to_lowercase();
        let mut best = IntentMatch {
            intent: Intent::GeneralInquiry,
            confidence: 0.3,
        };
        for (intent, confidence, regexes) in &self.intents {
            if *confidence > best.confidence && regexes.iter().any(|r| r.is_match(&text)) {
                best = IntentMatch {
                    intent: *intent,
                    confidence: *confidence,
                };
            }
        }
        best
    }

    pub fn analyze(&self, text: &str, catalog: &DeviceCatalog) -> MessageAnalysis {
        self.analyze_inner(text, catalog, None)
    }

    /// Like [`analyze`](Self::analyze), and also prices the repair when
    /// both the device and the problem are recognised with enough
    /// confidence.
    pub fn analyze_with_estimate(
        &self,
        text: &str,
        catalog: &DeviceCatalog,
        estimator: &LocalEstimator,
    ) -> MessageAnalysis {
        self.analyze_inner(text, catalog, Some(estimator))
    }

    fn analyze_inner(
        &self,
        text: &str,
        catalog: &DeviceCatalog,
        estimator: Option<&LocalEstimator>,
    ) -> MessageAnalysis {
        let device = match_device(text, catalog);
        let problem = self.classify(text);
        let intent = self.classify_intent(text);
        let overall_confidence = (device.confidence + problem.confidence + intent.confidence) / 3.0;

        let repair_estimate = match estimator {
            Some(estimator) if overall_confidence > ESTIMATE_CONFIDENCE => {
                repair_estimate(&device, &problem, estimator)
            }
            _ => None,
        };

        let response_type = if overall_confidence > 0.8 {
            if intent.intent == Intent::PriceInquiry && repair_estimate.is_some() {
                ResponseType::PriceEstimate
            } else {
                ResponseType::SpecificRecommendation
            }
        } else if overall_confidence > 0.5 {
            ResponseType::ClarifyingQuestion
        } else {
            ResponseType::GeneralGuidance
        };
        MessageAnalysis {
            device,
            problem,
            intent,
            overall_confidence,
            response_type,
            repair_estimate,
        }
    }
}

fn repair_estimate(
    device: &DeviceMatch,
    problem: &ProblemMatch,
    estimator: &LocalEstimator,
) -> Option<RepairEstimate> {
    let device = device.device.as_ref()?;
    let category = problem.category?;
    if !estimator.rules().offers(device.category, category) {
        return None;
    }
    let inputs = PricingInputs {
        device: device.clone(),
        issues: [category].into_iter().collect::<IssueSelection>(),
        options: ServiceOptions::default(),
    };
    match estimator.estimate(&inputs) {
        Ok(estimate) => Some(RepairEstimate {
            device_id: device.id.clone(),
            category,
            estimated_cost: estimate.total,
            cost_range: CostRange::around(estimate.total),
            currency: estimate.currency,
            repair_time: problem.repair_time.clone(),
        }),
        Err(e) => {
            debug!(device = %device.id, %category, error = %e, "no estimate for message");
            None
        }
    }
}

/// Finds a catalog device named in the text. A full model name beats a
/// bare brand mention; among models the longest name wins.
pub fn match_device(text: &str, catalog: &DeviceCatalog) -> DeviceMatch {
    let text = text.to_lowercase();

    let model = catalog
        .devices()
        .iter()
        .filter(|d| contains_words(&text, &d.model.to_lowercase()))
        .max_by_key(|d| d.model.len());
    if let Some(device) = model {
        return DeviceMatch {
            device: Some(device.clone()),
            brand: Some(device.brand.clone()),
            kind: Some(MatchKind::Model),
            confidence: 0.95,
        };
    }

    if let Some(brand) = catalog
        .brands()
        .into_iter()
        .find(|b| contains_words(&text, &b.to_lowercase()))
    {
        return DeviceMatch {
            device: None,
            brand: Some(brand.to_string()),
            kind: Some(MatchKind::Brand),
            confidence: 0.6,
        };
    }

    DeviceMatch {
        device: None,
        brand: None,
        kind: None,
        confidence: UNKNOWN_CONFIDENCE,
    }
}

fn word_regex(phrase: &str) -> Result<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(phrase)))
        .map_err(|e| FlowError::Config(format!("invalid pattern '{}': {}", phrase, e)))
}

fn contains_words(text: &str, phrase: &str) -> bool {
    word_regex(phrase).map(|r| r.is_match(text)).unwrap_or(false)
}

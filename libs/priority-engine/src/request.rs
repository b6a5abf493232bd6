use serde::{Deserialize, Serialize};

/// How the booking arrived. Seeds the base priority score; also drives
/// preemption eligibility downstream in `allocation-engine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Online,
    Walkin,
    Priority,
    Followup,
    Emergency,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Online => "online",
            Source::Walkin => "walkin",
            Source::Priority => "priority",
            Source::Followup => "followup",
            Source::Emergency => "emergency",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Source::Online),
            "walkin" => Some(Source::Walkin),
            "priority" => Some(Source::Priority),
            "followup" => Some(Source::Followup),
            "emergency" => Some(Source::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Emergency,
    Critical,
    Urgent,
    Moderate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupUrgency {
    Urgent,
    Moderate,
    Routine,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicalHistory {
    pub critical: bool,
    pub chronic: bool,
    /// Named conditions, e.g. "diabetes", "Heart Disease". Matched
    /// case-insensitively against the adjustment table.
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientInfo {
    pub age: Option<u32>,
    pub medical_history: MedicalHistory,
    pub urgency_level: Option<UrgencyLevel>,
    pub is_pregnant: bool,
    pub has_disability: bool,
    pub followup_urgency: Option<FollowupUrgency>,
}

#[derive(Debug, Clone)]
pub struct PriorityRequest {
    pub source: Source,
    pub patient_info: PatientInfo,
    /// Negative values are clamped to 0 before rules run.
    pub waiting_minutes: i64,
}

impl PriorityRequest {
    pub fn new(source: Source, patient_info: PatientInfo, waiting_minutes: i64) -> Self {
        Self {
            source,
            patient_info,
            waiting_minutes: waiting_minutes.max(0),
        }
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use slot_lifecycle::Slot;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Allocated,
    Confirmed,
    Completed,
    Cancelled,
    Noshow,
    PendingReallocation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadata {
    /// Set when this token was rehoused from a different slot during
    /// reallocation.
    pub original_slot_id: Option<String>,
    /// Ids of tokens this one preempted, if it was an emergency insertion.
    pub preempted_token_ids: Vec<String>,
    pub waiting_time: Option<i64>,
    pub estimated_service_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub capacity_override: bool,
}

/// A patient's reservation of one seat in a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token_id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub slot_id: String,
    pub token_number: u64,
    pub source: String,
    pub priority: i64,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: TokenMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfoInput {
    pub age: Option<u32>,
    #[serde(default)]
    pub medical_history_critical: bool,
    #[serde(default)]
    pub medical_history_chronic: bool,
    #[serde(default)]
    pub conditions: Vec<String>,
    pub urgency_level: Option<String>,
    #[serde(default)]
    pub is_pregnant: bool,
    #[serde(default)]
    pub has_disability: bool,
    pub followup_urgency: Option<String>,
    /// The doctor the patient last saw; only read for `source = followup`
    /// continuity recommendations.
    pub last_visited_doctor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TargetedRequest {
    pub patient_id: String,
    pub doctor_id: String,
    pub slot_id: String,
    pub source: String,
    pub patient_info: PatientInfoInput,
    pub waiting_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct DepartmentRequest {
    pub patient_id: String,
    pub department: String,
    pub source: String,
    pub patient_info: PatientInfoInput,
    pub waiting_minutes: i64,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_doctor_id: Option<String>,
    pub preferred_slot_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AllocationRequest {
    Targeted(TargetedRequest),
    Department(DepartmentRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    Direct,
    Preemption,
    CapacityOverride,
    DepartmentSmart,
    /// Kept as a distinct wire value alongside the closed set of §4.4,
    /// since the department-smart forward-search scenario explicitly names
    /// it when generation was triggered on the winning day.
    AutoGeneratedNextAvailable,
}

#[derive(Debug, Clone)]
pub struct DepartmentInfo {
    pub department: String,
    pub selected_doctor_id: String,
    pub workload_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub token: Token,
    pub allocation_method: AllocationMethod,
    pub preempted_tokens: Vec<String>,
    pub department_info: Option<DepartmentInfo>,
}

#[derive(Debug, Clone)]
pub struct DoctorWorkload {
    pub current_patients: u32,
    pub available_slots: u32,
    pub utilization_rate: f64,
}

#[derive(Debug, Clone)]
pub struct AlternativeSlot {
    pub slot: Slot,
    pub doctor_workload: DoctorWorkload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    SameDepartmentToday,
    SameDoctorFuture,
    NextAvailable,
    FutureBooking,
}

#[derive(Debug, Clone, Default)]
pub struct AlternativesEnvelope {
    pub same_doctor_future_slots: Vec<AlternativeSlot>,
    pub same_department_other_doctors: Vec<AlternativeSlot>,
    pub next_available_slots: Vec<AlternativeSlot>,
    pub recommended_action: Option<RecommendedAction>,
}

/// Error taxonomy of the error-handling design: one variant per row, kept
/// distinct from the HTTP mapping (that lives in `apps/api`, thin glue over
/// this enum).
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("unknown source: {0}")]
    InvalidSource(String),
    #[error("patient already has a live token in slot {0}")]
    DuplicateInSlot(String),
    #[error("patient already has a live token with doctor {0}")]
    DuplicateWithDoctor(String),
    #[error("patient already has a live token on {0}")]
    DuplicateOnDate(String),
    #[error("follow-up should continue with the previously-visited doctor")]
    DoctorContinuityRecommended(Box<AlternativesEnvelope>),
    #[error("slot not found: {0}")]
    SlotNotFound(String),
    #[error("slot inactive: {0}")]
    SlotInactive(String),
    #[error("slot full, alternatives available")]
    SlotFullAlternatives(Box<AlternativesEnvelope>),
    #[error("no availability in department {0} within the search horizon")]
    NoAvailabilityInDepartment(String),
    #[error("preemption failed for displaced token {0}")]
    PreemptionFailed(String),
    #[error("store fault: {0}")]
    StoreFault(String),
}

impl AllocationError {
    /// Machine-readable code, for the host's JSON failure envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::ValidationError(_) => "ValidationError",
            AllocationError::InvalidSource(_) => "InvalidSource",
            AllocationError::DuplicateInSlot(_) => "DuplicateInSlot",
            AllocationError::DuplicateWithDoctor(_) => "DuplicateWithDoctor",
            AllocationError::DuplicateOnDate(_) => "DuplicateOnDate",
            AllocationError::DoctorContinuityRecommended(_) => "DoctorContinuityRecommended",
            AllocationError::SlotNotFound(_) => "SlotNotFound",
            AllocationError::SlotInactive(_) => "SlotInactive",
            AllocationError::SlotFullAlternatives(_) => "SlotFullAlternatives",
            AllocationError::NoAvailabilityInDepartment(_) => "NoAvailabilityInDepartment",
            AllocationError::PreemptionFailed(_) => "PreemptionFailed",
            AllocationError::StoreFault(_) => "StoreFault",
        }
    }
}

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use allocation_engine::{AllocationResult, DepartmentRequest, PatientInfoInput, TargetedRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetedAllocationRequest {
    pub patient_id: String,
    pub doctor_id: String,
    pub slot_id: String,
    pub source: String,
    pub patient_info: PatientInfoInput,
    #[serde(default)]
    pub waiting_minutes: i64,
}

impl From<TargetedAllocationRequest> for TargetedRequest {
    fn from(req: TargetedAllocationRequest) -> Self {
        TargetedRequest {
            patient_id: req.patient_id,
            doctor_id: req.doctor_id,
            slot_id: req.slot_id,
            source: req.source,
            patient_info: req.patient_info,
            waiting_minutes: req.waiting_minutes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentAllocationRequest {
    pub patient_id: String,
    pub department: String,
    pub source: String,
    pub patient_info: PatientInfoInput,
    #[serde(default)]
    pub waiting_minutes: i64,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_doctor_id: Option<String>,
    pub preferred_slot_id: Option<String>,
}

impl From<DepartmentAllocationRequest> for DepartmentRequest {
    fn from(req: DepartmentAllocationRequest) -> Self {
        DepartmentRequest {
            patient_id: req.patient_id,
            department: req.department,
            source: req.source,
            patient_info: req.patient_info,
            waiting_minutes: req.waiting_minutes,
            preferred_date: req.preferred_date,
            preferred_doctor_id: req.preferred_doctor_id,
            preferred_slot_id: req.preferred_slot_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAllocationRequest {
    pub patient_id: String,
    pub department: String,
    pub patient_info: PatientInfoInput,
    #[serde(default)]
    pub waiting_minutes: i64,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_doctor_id: Option<String>,
    pub preferred_slot_id: Option<String>,
}

impl From<EmergencyAllocationRequest> for DepartmentRequest {
    fn from(req: EmergencyAllocationRequest) -> Self {
        DepartmentRequest {
            patient_id: req.patient_id,
            department: req.department,
            source: "emergency".to_string(),
            patient_info: req.patient_info,
            waiting_minutes: req.waiting_minutes,
            preferred_date: req.preferred_date,
            preferred_doctor_id: req.preferred_doctor_id,
            preferred_slot_id: req.preferred_slot_id,
        }
    }
}

/// `AllocationResult`'s `department_info` doesn't derive `Serialize` (it's
/// only ever read back out by the host), so the wire shape is assembled by
/// hand here rather than via `json!(result)`.
pub fn allocation_result_json(result: &AllocationResult) -> Value {
    json!({
        "token": result.token,
        "allocationMethod": result.allocation_method,
        "preemptedTokens": result.preempted_tokens,
        "departmentInfo": result.department_info.as_ref().map(|info| json!({
            "department": info.department,
            "selectedDoctorId": info.selected_doctor_id,
            "workloadRatio": info.workload_ratio,
        })),
    })
}

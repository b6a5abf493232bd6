use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use allocation_engine::{AllocationError, AlternativeSlot, AlternativesEnvelope};

/// Thin HTTP wrapper over `AllocationError`, plus the handful of failures
/// that only make sense at the wire boundary (bad JSON, an id that isn't
/// found by a lookup the engine doesn't itself own).
#[derive(Debug)]
pub enum ApiError {
    Allocation(AllocationError),
    BadRequest(String),
    NotFound(String),
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        ApiError::Allocation(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details, suggestions) = match &self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BadRequest", msg.clone(), Value::Null, Vec::new())
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, "NotFound", msg.clone(), Value::Null, Vec::new())
            }
            ApiError::Allocation(err) => allocation_error_response(err),
        };

        tracing::error!(code, %message, "allocation request failed");

        // Partial success is never reported: a failure always carries the
        // full code/message/details/suggestions envelope, never a token.
        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "details": details,
                "suggestions": suggestions,
            }
        }));

        (status, body).into_response()
    }
}

fn allocation_error_response(
    err: &AllocationError,
) -> (StatusCode, &'static str, String, Value, Vec<&'static str>) {
    let code = err.code();
    let message = err.to_string();
    match err {
        AllocationError::ValidationError(_) | AllocationError::InvalidSource(_) => {
            (StatusCode::BAD_REQUEST, code, message, Value::Null, vec![])
        }
        AllocationError::DuplicateInSlot(slot_id) => (
            StatusCode::CONFLICT,
            code,
            message,
            json!({ "slotId": slot_id }),
            vec!["Check the patient's existing tokens before retrying"],
        ),
        AllocationError::DuplicateWithDoctor(doctor_id) => (
            StatusCode::CONFLICT,
            code,
            message,
            json!({ "doctorId": doctor_id }),
            vec!["Check the patient's existing tokens before retrying"],
        ),
        AllocationError::DuplicateOnDate(date) => (
            StatusCode::CONFLICT,
            code,
            message,
            json!({ "date": date }),
            vec!["Patients may only hold one live token per calendar day"],
        ),
        AllocationError::DoctorContinuityRecommended(envelope) => (
            StatusCode::CONFLICT,
            code,
            message,
            envelope_details(envelope),
            vec!["Book with the previously-visited doctor to preserve continuity of care"],
        ),
        AllocationError::SlotNotFound(slot_id) => (
            StatusCode::NOT_FOUND,
            code,
            message,
            json!({ "slotId": slot_id }),
            vec![],
        ),
        AllocationError::SlotInactive(slot_id) => (
            StatusCode::CONFLICT,
            code,
            message,
            json!({ "slotId": slot_id }),
            vec!["Choose an active slot"],
        ),
        AllocationError::SlotFullAlternatives(envelope) => (
            StatusCode::CONFLICT,
            code,
            message,
            envelope_details(envelope),
            vec!["Retry against one of the listed alternatives"],
        ),
        AllocationError::NoAvailabilityInDepartment(department) => (
            StatusCode::NOT_FOUND,
            code,
            message,
            json!({ "department": department }),
            vec!["Try again later or widen the search to other departments"],
        ),
        AllocationError::PreemptionFailed(token_id) => (
            StatusCode::CONFLICT,
            code,
            message,
            json!({ "tokenId": token_id }),
            vec![],
        ),
        AllocationError::StoreFault(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, code, message, Value::Null, vec!["Retry the request"])
        }
    }
}

fn envelope_details(envelope: &AlternativesEnvelope) -> Value {
    json!({
        "sameDoctorFutureSlots": envelope.same_doctor_future_slots.iter().map(alternative_json).collect::<Vec<_>>(),
        "sameDepartmentOtherDoctors": envelope.same_department_other_doctors.iter().map(alternative_json).collect::<Vec<_>>(),
        "nextAvailableSlots": envelope.next_available_slots.iter().map(alternative_json).collect::<Vec<_>>(),
        "recommendedAction": envelope.recommended_action,
    })
}

fn alternative_json(alt: &AlternativeSlot) -> Value {
    json!({
        "slot": alt.slot,
        "doctorWorkload": {
            "currentPatients": alt.doctor_workload.current_patients,
            "availableSlots": alt.doctor_workload.available_slots,
            "utilizationRate": alt.doctor_workload.utilization_rate,
        },
    })
}

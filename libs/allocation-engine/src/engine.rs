use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, Timelike, Utc};
use engine_config::{ConfigSource, EngineConfig};
use engine_store::{collections, Store, StoreExt};
use priority_engine::{
    FollowupUrgency, MedicalHistory, PatientInfo, PriorityEngine, PriorityRequest, Source,
    UrgencyLevel,
};
use serde_json::{json, Value};
use slot_lifecycle::{AvailableSlotsFilter, CapacityError, CapacityGuard, SlotLifecycle, SlotStatus};
use tracing::{info, instrument, warn};

use crate::alternatives::AlternativeFinder;
use crate::events::{Event, EventKind, EventSink, Severity};
use crate::ids::generate_token_id;
use crate::models::{
    AllocationError, AllocationMethod, AllocationRequest, AllocationResult, DepartmentInfo,
    DepartmentRequest, PatientInfoInput, TargetedRequest, Token, TokenMetadata, TokenStatus,
};
use crate::retry::{retry, RetryPolicy};

enum ReserveOutcome {
    Direct,
    Preempted { displaced_token_id: String, reused_token_number: u64 },
}

enum EmergencyReserveOutcome {
    Direct,
    Preempted { displaced_token_id: String, reused_token_number: u64 },
    /// No preemptible occupant was found; the caller applies `reserve_override`.
    Override,
}

/// Width of the search window `reallocate_displaced` uses when looking for
/// somewhere else to put a preempted token: same doctor, within this many
/// hours either side of the slot it was bumped from.
const REALLOCATION_WINDOW_HOURS: i64 = 2;
/// §5/§7: a token stuck `pending_reallocation` past this age is routed to the
/// dead-letter stream instead of being retried again by the sweep.
const DEAD_LETTER_THRESHOLD_MINUTES: i64 = 10;

/// Orchestrates the targeted, department-smart and emergency allocation
/// procedures, token state transitions, and displaced-token reallocation.
/// The single collaborator every other engine crate in this workspace feeds
/// into: `PriorityEngine` for scoring, `SlotLifecycle`/`CapacityGuard` for
/// slot bookkeeping, `AlternativeFinder` for failure-path suggestions.
pub struct AllocationEngine {
    store: Arc<dyn Store>,
    capacity: CapacityGuard,
    lifecycle: Arc<SlotLifecycle>,
    priority: PriorityEngine,
    alternatives: AlternativeFinder,
    events: Arc<dyn EventSink>,
    retry_policy: RetryPolicy,
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<dyn ConfigSource>,
        fallback: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let lifecycle = Arc::new(SlotLifecycle::new(store.clone()));
        Self {
            capacity: CapacityGuard::new(store.clone()),
            alternatives: AlternativeFinder::new(store.clone(), lifecycle.clone()),
            priority: PriorityEngine::new(config, fallback),
            lifecycle,
            store,
            events,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub async fn allocate(
        &self,
        request: AllocationRequest,
        correlation_id: &str,
    ) -> Result<AllocationResult, AllocationError> {
        match request {
            AllocationRequest::Targeted(req) => self.allocate_targeted(req, correlation_id).await,
            AllocationRequest::Department(req) => self.allocate_department(req, correlation_id).await,
        }
    }

    #[instrument(skip(self, req), fields(slot_id = %req.slot_id, patient_id = %req.patient_id))]
    pub async fn allocate_targeted(
        &self,
        req: TargetedRequest,
        correlation_id: &str,
    ) -> Result<AllocationResult, AllocationError> {
        let source = Source::parse(&req.source).ok_or_else(|| AllocationError::InvalidSource(req.source.clone()))?;
        let slot = self
            .lifecycle
            .find_by_slot_id(&req.slot_id)
            .await
            .map_err(lifecycle_fault)?
            .ok_or_else(|| AllocationError::SlotNotFound(req.slot_id.clone()))?;
        if slot.status != SlotStatus::Active {
            return Err(AllocationError::SlotInactive(req.slot_id.clone()));
        }

        self.check_slot_duplicates(
            &req.patient_id,
            &req.doctor_id,
            &req.slot_id,
            slot.date,
            source == Source::Emergency,
        )
        .await?;

        let priority_req = to_priority_request(source, &req.patient_info, req.waiting_minutes);
        let breakdown = self
            .priority
            .compute_priority(&priority_req)
            .await
            .map_err(|e| AllocationError::ValidationError(e.to_string()))?;

        if source == Source::Followup {
            if let Some(last_doctor) = req.patient_info.last_visited_doctor.as_deref() {
                if last_doctor != req.doctor_id {
                    let envelope = self
                        .alternatives
                        .build_envelope(&slot.department, Some(last_doctor), slot.date, false)
                        .await
                        .map_err(store_fault)?;
                    if !envelope.same_doctor_future_slots.is_empty() {
                        return Err(AllocationError::DoctorContinuityRecommended(Box::new(envelope)));
                    }
                }
            }
        }

        let slot_id = req.slot_id.clone();
        let priority = breakdown.final_priority as i64;
        let is_emergency = source == Source::Emergency;
        let outcome = retry(&self.retry_policy, || {
            self.reserve_or_preempt(&slot_id, priority, is_emergency, correlation_id)
        })
        .await;

        match outcome {
            Ok(ReserveOutcome::Direct) => {
                let token = self
                    .create_token(
                        &req.patient_id,
                        &req.doctor_id,
                        &req.slot_id,
                        source,
                        priority,
                        false,
                        None,
                        Vec::new(),
                        req.waiting_minutes,
                        false,
                        None,
                    )
                    .await?;
                self.events.emit(event(
                    EventKind::TokenAllocated,
                    &token.token_id,
                    correlation_id,
                    Severity::Low,
                    json!({ "method": "direct" }),
                ));
                Ok(AllocationResult {
                    token,
                    allocation_method: AllocationMethod::Direct,
                    preempted_tokens: Vec::new(),
                    department_info: None,
                })
            }
            Ok(ReserveOutcome::Preempted { displaced_token_id, reused_token_number }) => {
                let token = self
                    .create_token(
                        &req.patient_id,
                        &req.doctor_id,
                        &req.slot_id,
                        source,
                        priority,
                        false,
                        None,
                        vec![displaced_token_id.clone()],
                        req.waiting_minutes,
                        false,
                        Some(reused_token_number),
                    )
                    .await?;
                self.events.emit(event(
                    EventKind::TokenAllocated,
                    &token.token_id,
                    correlation_id,
                    Severity::Medium,
                    json!({ "method": "preemption", "displacedToken": displaced_token_id }),
                ));
                Ok(AllocationResult {
                    token,
                    allocation_method: AllocationMethod::Preemption,
                    preempted_tokens: vec![displaced_token_id],
                    department_info: None,
                })
            }
            Err(_) => {
                let envelope = self
                    .alternatives
                    .build_envelope(&slot.department, Some(&req.doctor_id), slot.date, is_emergency)
                    .await
                    .map_err(store_fault)?;
                Err(AllocationError::SlotFullAlternatives(Box::new(envelope)))
            }
        }
    }

    #[instrument(skip(self, req), fields(slot_id = %req.slot_id, patient_id = %req.patient_id))]
    pub async fn allocate_emergency(
        &self,
        req: TargetedRequest,
        correlation_id: &str,
    ) -> Result<AllocationResult, AllocationError> {
        let slot = self
            .lifecycle
            .find_by_slot_id(&req.slot_id)
            .await
            .map_err(lifecycle_fault)?
            .ok_or_else(|| AllocationError::SlotNotFound(req.slot_id.clone()))?;
        if slot.status != SlotStatus::Active {
            return Err(AllocationError::SlotInactive(req.slot_id.clone()));
        }

        self.check_slot_duplicates(&req.patient_id, &req.doctor_id, &req.slot_id, slot.date, true)
            .await?;

        let priority_req = to_priority_request(Source::Emergency, &req.patient_info, req.waiting_minutes);
        let breakdown = self
            .priority
            .compute_priority(&priority_req)
            .await
            .map_err(|e| AllocationError::ValidationError(e.to_string()))?;
        let priority = breakdown.final_priority as i64;

        let slot_id = req.slot_id.clone();
        let outcome = retry(&self.retry_policy, || {
            self.reserve_or_preempt_or_override(&slot_id, priority, correlation_id)
        })
        .await
        .map_err(capacity_fault)?;

        match outcome {
            EmergencyReserveOutcome::Direct => {
                let token = self
                    .create_token(
                        &req.patient_id,
                        &req.doctor_id,
                        &req.slot_id,
                        Source::Emergency,
                        priority,
                        false,
                        None,
                        Vec::new(),
                        req.waiting_minutes,
                        true,
                        None,
                    )
                    .await?;
                self.events.emit(event(
                    EventKind::TokenAllocated,
                    &token.token_id,
                    correlation_id,
                    Severity::High,
                    json!({ "method": "direct", "emergency": true }),
                ));
                Ok(AllocationResult {
                    token,
                    allocation_method: AllocationMethod::Direct,
                    preempted_tokens: Vec::new(),
                    department_info: None,
                })
            }
            EmergencyReserveOutcome::Preempted { displaced_token_id, reused_token_number } => {
                let token = self
                    .create_token(
                        &req.patient_id,
                        &req.doctor_id,
                        &req.slot_id,
                        Source::Emergency,
                        priority,
                        false,
                        None,
                        vec![displaced_token_id.clone()],
                        req.waiting_minutes,
                        true,
                        Some(reused_token_number),
                    )
                    .await?;
                self.events.emit(event(
                    EventKind::TokenAllocated,
                    &token.token_id,
                    correlation_id,
                    Severity::High,
                    json!({ "method": "preemption", "emergency": true }),
                ));
                Ok(AllocationResult {
                    token,
                    allocation_method: AllocationMethod::Preemption,
                    preempted_tokens: vec![displaced_token_id],
                    department_info: None,
                })
            }
            EmergencyReserveOutcome::Override => {
                self.capacity.reserve_override(&req.slot_id).await.map_err(capacity_fault)?;
                let token = self
                    .create_token(
                        &req.patient_id,
                        &req.doctor_id,
                        &req.slot_id,
                        Source::Emergency,
                        priority,
                        true,
                        None,
                        Vec::new(),
                        req.waiting_minutes,
                        true,
                        None,
                    )
                    .await?;
                warn!("emergency token {} applied a capacity override on {}", token.token_id, req.slot_id);
                self.events.emit(event(
                    EventKind::CapacityOverrideApplied,
                    &token.token_id,
                    correlation_id,
                    Severity::High,
                    json!({ "slotId": req.slot_id }),
                ));
                Ok(AllocationResult {
                    token,
                    allocation_method: AllocationMethod::CapacityOverride,
                    preempted_tokens: Vec::new(),
                    department_info: None,
                })
            }
        }
    }

    /// The emergency endpoint's own candidate search: chooses the best slot
    /// in the department today, preferring a slot with free capacity, then
    /// one with a preemption-eligible occupant, then the earliest active
    /// slot regardless of capacity. Preferred-slot/preferred-doctor hints
    /// are honored before falling back to the department-wide scan.
    #[instrument(skip(self, req), fields(department = %req.department, patient_id = %req.patient_id))]
    pub async fn allocate_emergency_department(
        &self,
        req: DepartmentRequest,
        correlation_id: &str,
    ) -> Result<AllocationResult, AllocationError> {
        let today = req.preferred_date.unwrap_or_else(|| Utc::now().date_naive());

        if let Some(slot_id) = req.preferred_slot_id.clone() {
            let slot = self
                .lifecycle
                .find_by_slot_id(&slot_id)
                .await
                .map_err(lifecycle_fault)?
                .ok_or_else(|| AllocationError::SlotNotFound(slot_id.clone()))?;
            return self
                .allocate_emergency(
                    targeted_from_department(&req, slot.doctor_id.clone(), slot_id),
                    correlation_id,
                )
                .await;
        }

        let mut candidates = self.department_slots_today(&req.department, today).await?;
        if let Some(doctor_id) = req.preferred_doctor_id.clone() {
            candidates.retain(|s| s.doctor_id == doctor_id);
        }
        if candidates.is_empty() {
            return Err(AllocationError::NoAvailabilityInDepartment(req.department.clone()));
        }
        candidates.sort_by_key(|s| s.start_time);

        if let Some(slot) = candidates.iter().find(|s| s.has_capacity()) {
            return self
                .allocate_emergency(
                    targeted_from_department(&req, slot.doctor_id.clone(), slot.slot_id.clone()),
                    correlation_id,
                )
                .await;
        }
        for slot in &candidates {
            if self.capacity.has_preemptible_occupant(&slot.slot_id).await.map_err(capacity_fault)? {
                return self
                    .allocate_emergency(
                        targeted_from_department(&req, slot.doctor_id.clone(), slot.slot_id.clone()),
                        correlation_id,
                    )
                    .await;
            }
        }
        let earliest = &candidates[0];
        self.allocate_emergency(
            targeted_from_department(&req, earliest.doctor_id.clone(), earliest.slot_id.clone()),
            correlation_id,
        )
        .await
    }

    async fn department_slots_today(
        &self,
        department: &str,
        date: NaiveDate,
    ) -> Result<Vec<slot_lifecycle::Slot>, AllocationError> {
        let department = department.to_string();
        let raw = self
            .store
            .query(
                collections::SLOTS,
                &move |v: &Value| {
                    v["department"].as_str() == Some(department.as_str())
                        && v["date"].as_str() == Some(date.to_string().as_str())
                        && v["status"].as_str() == Some("active")
                },
                None,
                None,
            )
            .await
            .map_err(store_fault)?;
        Ok(raw.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect())
    }

    #[instrument(skip(self, req), fields(department = %req.department, patient_id = %req.patient_id))]
    pub async fn allocate_department(
        &self,
        req: DepartmentRequest,
        correlation_id: &str,
    ) -> Result<AllocationResult, AllocationError> {
        let source = Source::parse(&req.source).ok_or_else(|| AllocationError::InvalidSource(req.source.clone()))?;
        let reference_date = req.preferred_date.unwrap_or_else(|| Utc::now().date_naive());

        self.check_department_duplicate(&req.patient_id, &req.department, reference_date)
            .await?;

        let priority_req = to_priority_request(source, &req.patient_info, req.waiting_minutes);
        let breakdown = self
            .priority
            .compute_priority(&priority_req)
            .await
            .map_err(|e| AllocationError::ValidationError(e.to_string()))?;
        let priority = breakdown.final_priority as i64;

        if source == Source::Followup {
            if let Some(last_doctor) = req.patient_info.last_visited_doctor.as_deref() {
                let envelope = self
                    .alternatives
                    .build_envelope(&req.department, Some(last_doctor), reference_date, false)
                    .await
                    .map_err(store_fault)?;
                if !envelope.same_doctor_future_slots.is_empty() {
                    return Err(AllocationError::DoctorContinuityRecommended(Box::new(envelope)));
                }
            }
        }

        if let Some(slot_id) = req.preferred_slot_id.clone() {
            if let Some(result) = self
                .try_reserve_slot(
                    &slot_id,
                    &req.patient_id,
                    source,
                    priority,
                    req.waiting_minutes,
                    AllocationMethod::DepartmentSmart,
                    correlation_id,
                )
                .await?
            {
                return Ok(self.with_department_info(result, &req.department).await);
            }
        }

        if let Some(doctor_id) = req.preferred_doctor_id.clone() {
            let slots = self
                .lifecycle
                .find_available(&AvailableSlotsFilter {
                    doctor_id: Some(doctor_id),
                    date_range: Some((reference_date, reference_date)),
                    ..Default::default()
                })
                .await
                .map_err(lifecycle_fault)?;
            for slot in slots {
                if let Some(result) = self
                    .try_reserve_slot(
                        &slot.slot_id,
                        &req.patient_id,
                        source,
                        priority,
                        req.waiting_minutes,
                        AllocationMethod::DepartmentSmart,
                        correlation_id,
                    )
                    .await?
                {
                    return Ok(self.with_department_info(result, &req.department).await);
                }
            }
        }

        let today_slots = self
            .lifecycle
            .find_available(&AvailableSlotsFilter {
                department: Some(req.department.clone()),
                date_range: Some((reference_date, reference_date)),
                ..Default::default()
            })
            .await
            .map_err(lifecycle_fault)?;

        if !today_slots.is_empty() {
            let mut scored = Vec::with_capacity(today_slots.len());
            for slot in today_slots {
                let workload = self.alternatives.doctor_workload(&slot.doctor_id).await.map_err(store_fault)?;
                scored.push((slot, workload));
            }
            scored.sort_by(|a, b| {
                a.1.utilization_rate
                    .partial_cmp(&b.1.utilization_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.doctor_id.cmp(&b.0.doctor_id))
            });

            for (slot, workload) in &scored {
                if let Some(mut result) = self
                    .try_reserve_slot(
                        &slot.slot_id,
                        &req.patient_id,
                        source,
                        priority,
                        req.waiting_minutes,
                        AllocationMethod::DepartmentSmart,
                        correlation_id,
                    )
                    .await?
                {
                    result.department_info = Some(DepartmentInfo {
                        department: req.department.clone(),
                        selected_doctor_id: slot.doctor_id.clone(),
                        workload_ratio: workload.utilization_rate,
                    });
                    return Ok(result);
                }
            }
        }

        let (next_slots, auto_generated) = self
            .alternatives
            .next_available_slots(&req.department, reference_date)
            .await
            .map_err(store_fault)?;

        let method = if auto_generated {
            AllocationMethod::AutoGeneratedNextAvailable
        } else {
            AllocationMethod::DepartmentSmart
        };

        for alt in &next_slots {
            if let Some(mut result) = self
                .try_reserve_slot(
                    &alt.slot.slot_id,
                    &req.patient_id,
                    source,
                    priority,
                    req.waiting_minutes,
                    method,
                    correlation_id,
                )
                .await?
            {
                result.department_info = Some(DepartmentInfo {
                    department: req.department.clone(),
                    selected_doctor_id: alt.slot.doctor_id.clone(),
                    workload_ratio: alt.doctor_workload.utilization_rate,
                });
                return Ok(result);
            }
        }

        Err(AllocationError::NoAvailabilityInDepartment(req.department))
    }

    /// Scans for tokens still `pending_reallocation` and retries rehousing
    /// each one, except those that have sat in that state longer than
    /// `DEAD_LETTER_THRESHOLD_MINUTES` — those are routed to the dead-letter
    /// stream instead, per §5/§7 ("host decides policy"), rather than
    /// retried forever. Called by `EngineBackgroundTasks`'s periodic sweep;
    /// exposed publicly so a host can also trigger it on demand (e.g. right
    /// after a new slot is generated for the doctor a token is waiting on).
    pub async fn retry_pending_reallocations(&self) -> Result<usize, AllocationError> {
        let pending = self
            .store
            .query(
                collections::TOKENS,
                &|v: &Value| v["status"].as_str() == Some("pending_reallocation"),
                None,
                None,
            )
            .await
            .map_err(store_fault)?;

        let now = Utc::now();
        let mut reallocated = 0;
        for raw in pending {
            let Ok(token) = serde_json::from_value::<Token>(raw) else {
                continue;
            };
            if now - token.updated_at >= Duration::minutes(DEAD_LETTER_THRESHOLD_MINUTES) {
                self.dead_letter_pending(token, "background-sweep").await;
                continue;
            }
            let token_id = token.token_id.clone();
            self.reallocate_displaced(token, "background-sweep").await;
            if let Some(updated) = self
                .store
                .get_typed::<Token>(collections::TOKENS, &token_id)
                .await
                .map_err(store_fault)?
            {
                if updated.status == TokenStatus::Allocated {
                    reallocated += 1;
                }
            }
        }
        Ok(reallocated)
    }

    /// Gives up on a token that has sat `pending_reallocation` past the
    /// dead-letter threshold: cancels it so the sweep stops retrying it
    /// forever, and emits `TokenDeadLettered` so the host can hand it off
    /// to whatever follow-up channel it wants (manual rebooking, a support
    /// queue, a page — the engine has no opinion).
    async fn dead_letter_pending(&self, mut token: Token, correlation_id: &str) {
        let age_minutes = (Utc::now() - token.updated_at).num_minutes();
        token.status = TokenStatus::Cancelled;
        token.updated_at = Utc::now();
        if self
            .store
            .put_typed(collections::TOKENS, &token.token_id, &token)
            .await
            .is_err()
        {
            warn!("failed to write cancelled status for dead-lettered token {}", token.token_id);
        }
        warn!("token {} dead-lettered after {age_minutes}m pending_reallocation", token.token_id);
        self.events.emit(event(
            EventKind::TokenDeadLettered,
            &token.token_id,
            correlation_id,
            Severity::High,
            json!({ "reason": "pending_reallocation_timeout", "ageMinutes": age_minutes }),
        ));
    }

    pub async fn confirm(&self, token_id: &str, correlation_id: &str) -> Result<Token, AllocationError> {
        self.set_status(
            token_id,
            &[TokenStatus::Allocated],
            TokenStatus::Confirmed,
            false,
            correlation_id,
            EventKind::TokenConfirmed,
        )
        .await
    }

    pub async fn complete(&self, token_id: &str, correlation_id: &str) -> Result<Token, AllocationError> {
        self.set_status(
            token_id,
            &[TokenStatus::Confirmed, TokenStatus::Allocated],
            TokenStatus::Completed,
            true,
            correlation_id,
            EventKind::TokenCompleted,
        )
        .await
    }

    pub async fn cancel(&self, token_id: &str, correlation_id: &str) -> Result<Token, AllocationError> {
        self.set_status(
            token_id,
            &[TokenStatus::Allocated, TokenStatus::Confirmed, TokenStatus::PendingReallocation],
            TokenStatus::Cancelled,
            true,
            correlation_id,
            EventKind::TokenCancelled,
        )
        .await
    }

    pub async fn noshow(&self, token_id: &str, correlation_id: &str) -> Result<Token, AllocationError> {
        self.set_status(
            token_id,
            &[TokenStatus::Allocated, TokenStatus::Confirmed],
            TokenStatus::Noshow,
            true,
            correlation_id,
            EventKind::TokenNoshow,
        )
        .await
    }

    /// The one path allowed to move a token between lifecycle statuses.
    /// `confirm`/`complete`/`cancel`/`noshow` are thin callers so a status
    /// transition is never written ad hoc elsewhere in this crate.
    async fn set_status(
        &self,
        token_id: &str,
        allowed_from: &[TokenStatus],
        to: TokenStatus,
        release_capacity: bool,
        correlation_id: &str,
        event_kind: EventKind,
    ) -> Result<Token, AllocationError> {
        let mut token = self
            .store
            .get_typed::<Token>(collections::TOKENS, token_id)
            .await
            .map_err(store_fault)?
            .ok_or_else(|| AllocationError::ValidationError(format!("token not found: {token_id}")))?;

        if !allowed_from.contains(&token.status) {
            return Err(AllocationError::ValidationError(format!(
                "cannot move token {token_id} from {:?} to {:?}",
                token.status, to
            )));
        }

        let slot_id = token.slot_id.clone();
        token.status = to;
        token.updated_at = Utc::now();
        self.store
            .put_typed(collections::TOKENS, token_id, &token)
            .await
            .map_err(store_fault)?;

        if release_capacity {
            self.capacity.release(&slot_id).await.map_err(capacity_fault)?;
        }

        self.events.emit(event(
            event_kind,
            token_id,
            correlation_id,
            Severity::Low,
            json!({ "to": format!("{to:?}") }),
        ));
        info!("token {token_id} transitioned to {to:?}");
        Ok(token)
    }

    /// Hands D's seat straight to the incoming token: D keeps occupying that
    /// unit of the slot's capacity counter until `reallocate_displaced`
    /// either moves it elsewhere (releasing the old seat once it lands a new
    /// one) or gives up and cancels it. No `reserve`/`release` pair runs on
    /// the full slot here — the incoming token inherits D's counted seat and
    /// D's `tokenNumber` directly. Returns D's original token number for the
    /// caller to reuse.
    async fn displace_token(&self, token_id: &str, correlation_id: &str) -> Result<u64, AllocationError> {
        let displaced = self
            .store
            .get_typed::<Token>(collections::TOKENS, token_id)
            .await
            .map_err(store_fault)?
            .ok_or_else(|| AllocationError::PreemptionFailed(token_id.to_string()))?;
        let original_token_number = displaced.token_number;

        self.events.emit(event(
            EventKind::TokenPreempted,
            token_id,
            correlation_id,
            Severity::Medium,
            json!({ "originalSlotId": displaced.slot_id }),
        ));

        self.reallocate_displaced(displaced, correlation_id).await;
        Ok(original_token_number)
    }

    /// Finds somewhere else to put a token preempted out of its original
    /// seat and moves it there, or gives up. Per the displacement contract:
    /// a candidate found and the move completes -> `allocated` in the new
    /// slot, old seat released. No candidate at all -> `cancelled`, old seat
    /// left alone (the incoming token already owns that counted unit). A
    /// candidate found but the move fails partway -> left `pending_reallocation`
    /// for the background sweeper to retry. Errors are swallowed rather than
    /// propagated: a failed reallocation must never undo the preemption that
    /// already gave away D's seat.
    async fn reallocate_displaced(&self, mut token: Token, correlation_id: &str) {
        let original_slot_id = token.slot_id.clone();
        let (original_date, original_start_time) = match self.lifecycle.find_by_slot_id(&original_slot_id).await {
            Ok(Some(slot)) => (slot.date, slot.start_time),
            _ => {
                warn!("could not load original slot {original_slot_id} for reallocation of {}", token.token_id);
                self.mark_pending_reallocation(&mut token).await;
                return;
            }
        };

        let candidate = match self
            .find_reallocation_candidate(&token.doctor_id, original_date, original_start_time, &original_slot_id)
            .await
        {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!("reallocation search failed for {}: {err}", token.token_id);
                self.mark_pending_reallocation(&mut token).await;
                return;
            }
        };

        let Some(new_slot) = candidate else {
            token.status = TokenStatus::Cancelled;
            token.updated_at = Utc::now();
            if self
                .store
                .put_typed(collections::TOKENS, &token.token_id, &token)
                .await
                .is_err()
            {
                warn!("failed to write cancelled status for displaced token {}", token.token_id);
            }
            self.events.emit(event(
                EventKind::TokenCancelled,
                &token.token_id,
                correlation_id,
                Severity::Medium,
                json!({ "reason": "preempted_no_alternatives" }),
            ));
            return;
        };

        if self.capacity.reserve(&new_slot.slot_id).await.is_err() {
            self.mark_pending_reallocation(&mut token).await;
            return;
        }
        let new_token_number = match self.capacity.next_token_number(&new_slot.slot_id).await {
            Ok(n) => n,
            Err(_) => {
                self.mark_pending_reallocation(&mut token).await;
                return;
            }
        };

        token.slot_id = new_slot.slot_id.clone();
        token.token_number = new_token_number;
        token.status = TokenStatus::Allocated;
        token.metadata.original_slot_id.get_or_insert(original_slot_id.clone());
        token.updated_at = Utc::now();
        if self
            .store
            .put_typed(collections::TOKENS, &token.token_id, &token)
            .await
            .is_err()
        {
            self.mark_pending_reallocation(&mut token).await;
            return;
        }
        if self.capacity.release(&original_slot_id).await.is_err() {
            warn!("reallocated token {} but could not release its old slot {original_slot_id}", token.token_id);
        }

        self.events.emit(event(
            EventKind::TokenReallocated,
            &token.token_id,
            correlation_id,
            Severity::Medium,
            json!({ "newSlotId": new_slot.slot_id, "originalSlotId": original_slot_id }),
        ));
    }

    async fn mark_pending_reallocation(&self, token: &mut Token) {
        token.status = TokenStatus::PendingReallocation;
        token.updated_at = Utc::now();
        let _ = self.store.put_typed(collections::TOKENS, &token.token_id, token).await;
    }

    /// Same-doctor slot within `REALLOCATION_WINDOW_HOURS` either side of
    /// `around`, excluding the slot the token is being moved out of.
    async fn find_reallocation_candidate(
        &self,
        doctor_id: &str,
        date: NaiveDate,
        around: NaiveTime,
        exclude_slot_id: &str,
    ) -> Result<Option<slot_lifecycle::Slot>, AllocationError> {
        let secs = around.num_seconds_from_midnight() as i64;
        let window_secs = REALLOCATION_WINDOW_HOURS * 3600;
        let lo = (secs - window_secs).max(0) as u32;
        let hi = (secs + window_secs).min(86_399) as u32;
        let lo_time = NaiveTime::from_num_seconds_from_midnight_opt(lo, 0).unwrap_or(around);
        let hi_time = NaiveTime::from_num_seconds_from_midnight_opt(hi, 0).unwrap_or(around);

        let slots = self
            .lifecycle
            .find_available(&AvailableSlotsFilter {
                doctor_id: Some(doctor_id.to_string()),
                date_range: Some((date, date)),
                start_time_ge: Some(lo_time),
                ..Default::default()
            })
            .await
            .map_err(lifecycle_fault)?;

        Ok(slots
            .into_iter()
            .find(|s| s.slot_id != exclude_slot_id && s.start_time <= hi_time))
    }

    /// Attempts `reserve`, falls back once to `preempt_lowest` + displacement
    /// — but only for emergency requests (§4.4 step 4, Glossary: preemption
    /// replaces "an allocated non-emergency token with an emergency one").
    /// A non-emergency request that finds the slot full never preempts; it
    /// surfaces `SlotAtCapacity` straight through so the caller falls to the
    /// alternatives envelope. Wrapped in the caller's exponential-backoff
    /// retry so a `reserve` that lost a race immediately after a successful
    /// preemption (another caller took the freed seat first) gets another
    /// attempt instead of surfacing a failure for what was, a moment
    /// earlier, a free slot.
    async fn reserve_or_preempt(
        &self,
        slot_id: &str,
        incoming_priority: i64,
        is_emergency: bool,
        correlation_id: &str,
    ) -> Result<ReserveOutcome, CapacityError> {
        match self.capacity.reserve(slot_id).await {
            Ok(_) => Ok(ReserveOutcome::Direct),
            Err(CapacityError::SlotAtCapacity(_)) if is_emergency => {
                match self.preempt_and_displace(slot_id, incoming_priority, correlation_id).await? {
                    Some((displaced_token_id, reused_token_number)) => {
                        Ok(ReserveOutcome::Preempted { displaced_token_id, reused_token_number })
                    }
                    None => Err(CapacityError::SlotAtCapacity(slot_id.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Selects and displaces the lowest-priority preemptible occupant of
    /// `slot_id`, holding the slot's scheduling lock (§4.5) for the whole
    /// selection-then-displacement sequence. Without the lock, two
    /// concurrent emergency preemptions against the same full slot could
    /// both have `preempt_lowest` select the same candidate — both would
    /// then reuse its token number (violating I2's uniqueness of
    /// `(slotId, tokenNumber)`) and both inherit its single counted seat
    /// (violating P2). `LockContention` bubbles up through the caller's
    /// retry wrapper so a loser simply tries again once the winner has
    /// released the lock, by which point the candidate is gone and
    /// `preempt_lowest` correctly reports nobody left to preempt.
    async fn preempt_and_displace(
        &self,
        slot_id: &str,
        incoming_priority: i64,
        correlation_id: &str,
    ) -> Result<Option<(String, u64)>, CapacityError> {
        let _lock = self.capacity.acquire_slot_lock(slot_id).await?;
        match self.capacity.preempt_lowest(slot_id, incoming_priority).await? {
            Some(candidate) => {
                let reused_token_number = self
                    .displace_token(&candidate.token_id, correlation_id)
                    .await
                    .map_err(|_| CapacityError::SlotAtCapacity(slot_id.to_string()))?;
                Ok(Some((candidate.token_id, reused_token_number)))
            }
            None => Ok(None),
        }
    }

    /// `allocateEmergency`'s own reserve/preempt/override decision, wrapped
    /// by the caller in the retry policy so a `LockContention` from a
    /// competing preemption is just another reason to try again rather than
    /// a hard failure.
    async fn reserve_or_preempt_or_override(
        &self,
        slot_id: &str,
        incoming_priority: i64,
        correlation_id: &str,
    ) -> Result<EmergencyReserveOutcome, CapacityError> {
        match self.capacity.reserve(slot_id).await {
            Ok(_) => Ok(EmergencyReserveOutcome::Direct),
            Err(CapacityError::SlotAtCapacity(_)) => {
                match self.preempt_and_displace(slot_id, incoming_priority, correlation_id).await? {
                    Some((displaced_token_id, reused_token_number)) => {
                        Ok(EmergencyReserveOutcome::Preempted { displaced_token_id, reused_token_number })
                    }
                    None => Ok(EmergencyReserveOutcome::Override),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Department-smart's candidate-by-candidate reservation: a slot at
    /// capacity simply means "try the next candidate", never preemption —
    /// only the targeted and emergency procedures displace anyone.
    async fn try_reserve_slot(
        &self,
        slot_id: &str,
        patient_id: &str,
        source: Source,
        priority: i64,
        waiting_minutes: i64,
        method: AllocationMethod,
        correlation_id: &str,
    ) -> Result<Option<AllocationResult>, AllocationError> {
        let slot = self
            .lifecycle
            .find_by_slot_id(slot_id)
            .await
            .map_err(lifecycle_fault)?
            .ok_or_else(|| AllocationError::SlotNotFound(slot_id.to_string()))?;
        self.check_slot_duplicates(patient_id, &slot.doctor_id, slot_id, slot.date, source == Source::Emergency)
            .await?;

        match self.capacity.reserve(slot_id).await {
            Ok(_) => {
                let token = self
                    .create_token(
                        patient_id,
                        &slot.doctor_id,
                        slot_id,
                        source,
                        priority,
                        false,
                        None,
                        Vec::new(),
                        waiting_minutes,
                        false,
                        None,
                    )
                    .await?;
                self.events.emit(event(
                    EventKind::TokenAllocated,
                    &token.token_id,
                    correlation_id,
                    Severity::Low,
                    json!({ "method": format!("{method:?}") }),
                ));
                Ok(Some(AllocationResult {
                    token,
                    allocation_method: method,
                    preempted_tokens: Vec::new(),
                    department_info: None,
                }))
            }
            Err(CapacityError::SlotAtCapacity(_)) => Ok(None),
            Err(e) => Err(capacity_fault(e)),
        }
    }

    async fn with_department_info(&self, mut result: AllocationResult, department: &str) -> AllocationResult {
        if result.department_info.is_none() {
            if let Ok(workload) = self.alternatives.doctor_workload(&result.token.doctor_id).await {
                result.department_info = Some(DepartmentInfo {
                    department: department.to_string(),
                    selected_doctor_id: result.token.doctor_id.clone(),
                    workload_ratio: workload.utilization_rate,
                });
            }
        }
        result
    }

    async fn create_token(
        &self,
        patient_id: &str,
        doctor_id: &str,
        slot_id: &str,
        source: Source,
        priority: i64,
        capacity_override: bool,
        original_slot_id: Option<String>,
        preempted_token_ids: Vec<String>,
        waiting_minutes: i64,
        emergency: bool,
        reused_token_number: Option<u64>,
    ) -> Result<Token, AllocationError> {
        let token_id = generate_token_id(self.store.as_ref(), emergency).await?;
        let token_number = match reused_token_number {
            Some(n) => n,
            None => self.capacity.next_token_number(slot_id).await.map_err(capacity_fault)?,
        };
        let now = Utc::now();
        let token = Token {
            token_id: token_id.clone(),
            patient_id: patient_id.to_string(),
            doctor_id: doctor_id.to_string(),
            slot_id: slot_id.to_string(),
            token_number,
            source: source.as_str().to_string(),
            priority,
            status: TokenStatus::Allocated,
            created_at: now,
            updated_at: now,
            metadata: TokenMetadata {
                original_slot_id,
                preempted_token_ids,
                waiting_time: Some(waiting_minutes),
                estimated_service_time: None,
                capacity_override,
            },
        };
        self.store
            .put_typed(collections::TOKENS, &token_id, &token)
            .await
            .map_err(store_fault)?;
        Ok(token)
    }

    async fn live_tokens_for_patient(&self, patient_id: &str) -> Result<Vec<Value>, AllocationError> {
        let patient_id = patient_id.to_string();
        self.store
            .query(
                collections::TOKENS,
                &move |v: &Value| {
                    v["patientId"].as_str() == Some(patient_id.as_str())
                        && matches!(v["status"].as_str(), Some("allocated") | Some("confirmed"))
                },
                None,
                None,
            )
            .await
            .map_err(store_fault)
    }

    /// Steps 3-5 of the validation pass: in-slot and with-doctor duplicates
    /// apply unconditionally (I4); the same-calendar-day check (I5) is
    /// skipped for emergency requests, which are explicitly exempted.
    async fn check_slot_duplicates(
        &self,
        patient_id: &str,
        doctor_id: &str,
        slot_id: &str,
        date: NaiveDate,
        is_emergency: bool,
    ) -> Result<(), AllocationError> {
        let live = self.live_tokens_for_patient(patient_id).await?;

        if live.iter().any(|t| t["slotId"].as_str() == Some(slot_id)) {
            return Err(AllocationError::DuplicateInSlot(slot_id.to_string()));
        }
        if live.iter().any(|t| t["doctorId"].as_str() == Some(doctor_id)) {
            return Err(AllocationError::DuplicateWithDoctor(doctor_id.to_string()));
        }
        if is_emergency {
            return Ok(());
        }
        for t in &live {
            if let Some(other_slot_id) = t["slotId"].as_str() {
                if other_slot_id == slot_id {
                    continue;
                }
                if let Some(other_slot) = self.lifecycle.find_by_slot_id(other_slot_id).await.map_err(lifecycle_fault)? {
                    if other_slot.date == date {
                        return Err(AllocationError::DuplicateOnDate(date.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_department_duplicate(
        &self,
        patient_id: &str,
        department: &str,
        date: NaiveDate,
    ) -> Result<(), AllocationError> {
        let live = self.live_tokens_for_patient(patient_id).await?;
        for t in &live {
            if let Some(slot_id) = t["slotId"].as_str() {
                if let Some(slot) = self.lifecycle.find_by_slot_id(slot_id).await.map_err(lifecycle_fault)? {
                    if slot.department == department && slot.date == date {
                        return Err(AllocationError::DuplicateOnDate(date.to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn targeted_from_department(req: &DepartmentRequest, doctor_id: String, slot_id: String) -> TargetedRequest {
    TargetedRequest {
        patient_id: req.patient_id.clone(),
        doctor_id,
        slot_id,
        source: req.source.clone(),
        patient_info: req.patient_info.clone(),
        waiting_minutes: req.waiting_minutes,
    }
}

fn to_priority_request(source: Source, info: &PatientInfoInput, waiting_minutes: i64) -> PriorityRequest {
    let patient_info = PatientInfo {
        age: info.age,
        medical_history: MedicalHistory {
            critical: info.medical_history_critical,
            chronic: info.medical_history_chronic,
            conditions: info.conditions.clone(),
        },
        urgency_level: info.urgency_level.as_deref().and_then(parse_urgency_level),
        is_pregnant: info.is_pregnant,
        has_disability: info.has_disability,
        followup_urgency: info.followup_urgency.as_deref().and_then(parse_followup_urgency),
    };
    PriorityRequest::new(source, patient_info, waiting_minutes)
}

fn parse_urgency_level(raw: &str) -> Option<UrgencyLevel> {
    match raw {
        "emergency" => Some(UrgencyLevel::Emergency),
        "critical" => Some(UrgencyLevel::Critical),
        "urgent" => Some(UrgencyLevel::Urgent),
        "moderate" => Some(UrgencyLevel::Moderate),
        _ => None,
    }
}

fn parse_followup_urgency(raw: &str) -> Option<FollowupUrgency> {
    match raw {
        "urgent" => Some(FollowupUrgency::Urgent),
        "moderate" => Some(FollowupUrgency::Moderate),
        "routine" => Some(FollowupUrgency::Routine),
        _ => None,
    }
}

fn event(kind: EventKind, token_id: &str, correlation_id: &str, severity: Severity, metadata: Value) -> Event {
    Event {
        kind,
        token_id: token_id.to_string(),
        correlation_id: correlation_id.to_string(),
        severity,
        metadata,
    }
}

fn store_fault(err: engine_store::StoreError) -> AllocationError {
    AllocationError::StoreFault(err.to_string())
}

fn lifecycle_fault(err: slot_lifecycle::SlotLifecycleError) -> AllocationError {
    AllocationError::StoreFault(err.to_string())
}

fn capacity_fault(err: CapacityError) -> AllocationError {
    match err {
        // Reaching this from anywhere but `reserve_or_preempt`'s retried path
        // would mean a caller bypassed the alternatives-building fallback;
        // surfaced as a generic validation error rather than silently
        // fabricating an empty alternatives envelope.
        CapacityError::SlotAtCapacity(id) => {
            AllocationError::ValidationError(format!("slot {id} at capacity"))
        }
        CapacityError::SlotNotFound(id) => AllocationError::SlotNotFound(id),
        CapacityError::NothingToRelease(id) => {
            AllocationError::ValidationError(format!("nothing to release on slot {id}"))
        }
        CapacityError::LockContention(id) => {
            AllocationError::ValidationError(format!("could not acquire scheduling lock for slot {id}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventSink;
    use engine_config::EngineConfig;
    use engine_store::InMemoryStore;
    use slot_lifecycle::{DoctorSchedule, SlotType, WeeklySlotTemplate};
    use std::collections::HashMap;

    fn engine(store: Arc<dyn Store>) -> AllocationEngine {
        let config = EngineConfig::from_env();
        AllocationEngine::new(store, Arc::new(config.clone()), config, Arc::new(TracingEventSink))
    }

    fn patient_info() -> PatientInfoInput {
        PatientInfoInput {
            age: Some(35),
            medical_history_critical: false,
            medical_history_chronic: false,
            conditions: Vec::new(),
            urgency_level: None,
            is_pregnant: false,
            has_disability: false,
            followup_urgency: None,
            last_visited_doctor: None,
        }
    }

    fn targeted(patient_id: &str, doctor_id: &str, slot_id: &str, source: &str) -> TargetedRequest {
        TargetedRequest {
            patient_id: patient_id.into(),
            doctor_id: doctor_id.into(),
            slot_id: slot_id.into(),
            source: source.into(),
            patient_info: patient_info(),
            waiting_minutes: 0,
        }
    }

    async fn seed_slot(store: &Arc<dyn Store>, slot_id: &str, doctor_id: &str, department: &str, max_capacity: u32) {
        let slot = slot_lifecycle::Slot {
            slot_id: slot_id.into(),
            doctor_id: doctor_id.into(),
            department: department.into(),
            date: chrono::NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(),
            start_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            max_capacity,
            current_allocation: 0,
            last_token_number: 0,
            status: SlotStatus::Active,
            metadata: Default::default(),
        };
        store.put_typed(collections::SLOTS, slot_id, &slot).await.unwrap();
    }

    async fn schedule_for(store: &Arc<dyn Store>, doctor_id: &str, department: &str) {
        let mut weekly = HashMap::new();
        weekly.insert(
            1,
            vec![WeeklySlotTemplate {
                start_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                max_capacity: 5,
                slot_type: SlotType::Regular,
            }],
        );
        let schedule = DoctorSchedule {
            doctor_id: doctor_id.into(),
            department: department.into(),
            weekly_schedule: weekly,
            is_active: true,
            effective_from: chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            effective_to: None,
            emergency_available: true,
        };
        store
            .put_typed(collections::DOCTOR_SCHEDULES, doctor_id, &schedule)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn direct_allocation_assigns_first_token_number() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 5).await;
        let engine = engine(store.clone());

        let result = engine
            .allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1")
            .await
            .unwrap();

        assert_eq!(result.allocation_method, AllocationMethod::Direct);
        assert_eq!(result.token.token_number, 1);
        let slot = store.get_typed::<slot_lifecycle::Slot>(collections::SLOTS, "s1").await.unwrap().unwrap();
        assert_eq!(slot.current_allocation, 1);
    }

    #[tokio::test]
    async fn duplicate_in_slot_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 5).await;
        let engine = engine(store.clone());

        engine.allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1").await.unwrap();
        let second = engine.allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-2").await;

        assert!(matches!(second, Err(AllocationError::DuplicateInSlot(_))));
    }

    #[tokio::test]
    async fn non_emergency_cannot_preempt_a_full_slot() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 1).await;
        let engine = engine(store.clone());

        engine.allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1").await.unwrap();
        let blocked = engine.allocate_targeted(targeted("p2", "d1", "s1", "priority"), "corr-2").await;

        assert!(matches!(blocked, Err(AllocationError::SlotFullAlternatives(_))));
    }

    #[tokio::test]
    async fn emergency_preempts_low_priority_incumbent_and_reuses_its_token_number() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 1).await;
        let engine = engine(store.clone());

        let incumbent = engine
            .allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1")
            .await
            .unwrap();
        assert_eq!(incumbent.token.token_number, 1);

        let mut emergency_req = targeted("p2", "d1", "s1", "emergency");
        emergency_req.patient_info.urgency_level = Some("critical".into());
        emergency_req.patient_info.age = Some(68);
        let result = engine.allocate_targeted(emergency_req, "corr-2").await.unwrap();

        assert_eq!(result.allocation_method, AllocationMethod::Preemption);
        assert_eq!(result.token.token_number, incumbent.token.token_number);
        assert_eq!(result.preempted_tokens, vec![incumbent.token.token_id.clone()]);

        let displaced = store
            .get_typed::<Token>(collections::TOKENS, &incumbent.token.token_id)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(displaced.status, TokenStatus::Cancelled | TokenStatus::Allocated));
        if displaced.status == TokenStatus::Allocated {
            assert_ne!(displaced.slot_id, "s1");
        }
    }

    #[tokio::test]
    async fn emergency_applies_capacity_override_when_nothing_can_be_preempted() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 1).await;
        let engine = engine(store.clone());

        let mut first_emergency = targeted("p1", "d1", "s1", "emergency");
        first_emergency.patient_info.urgency_level = Some("emergency".into());
        engine.allocate_emergency(first_emergency, "corr-1").await.unwrap();

        let mut second_emergency = targeted("p2", "d1", "s1", "emergency");
        second_emergency.patient_info.urgency_level = Some("emergency".into());
        let result = engine.allocate_emergency(second_emergency, "corr-2").await.unwrap();

        assert_eq!(result.allocation_method, AllocationMethod::CapacityOverride);
        assert!(result.token.metadata.capacity_override);
    }

    #[tokio::test]
    async fn token_lifecycle_transitions_release_capacity_on_terminal_states() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 5).await;
        let engine = engine(store.clone());

        let allocated = engine.allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1").await.unwrap();
        let confirmed = engine.confirm(&allocated.token.token_id, "corr-2").await.unwrap();
        assert_eq!(confirmed.status, TokenStatus::Confirmed);

        let completed = engine.complete(&allocated.token.token_id, "corr-3").await.unwrap();
        assert_eq!(completed.status, TokenStatus::Completed);

        let slot = store.get_typed::<slot_lifecycle::Slot>(collections::SLOTS, "s1").await.unwrap().unwrap();
        assert_eq!(slot.current_allocation, 0);
    }

    #[tokio::test]
    async fn cannot_confirm_a_completed_token() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 5).await;
        let engine = engine(store.clone());

        let allocated = engine.allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1").await.unwrap();
        engine.confirm(&allocated.token.token_id, "corr-2").await.unwrap();
        engine.complete(&allocated.token.token_id, "corr-3").await.unwrap();

        let result = engine.confirm(&allocated.token.token_id, "corr-4").await;
        assert!(matches!(result, Err(AllocationError::ValidationError(_))));
    }

    #[tokio::test]
    async fn department_smart_honors_preferred_slot_first() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 5).await;
        schedule_for(&store, "d1", "cardiology").await;
        let engine = engine(store.clone());

        let req = DepartmentRequest {
            patient_id: "p1".into(),
            department: "cardiology".into(),
            source: "online".into(),
            patient_info: patient_info(),
            waiting_minutes: 0,
            preferred_date: None,
            preferred_doctor_id: None,
            preferred_slot_id: Some("s1".into()),
        };

        let result = engine.allocate_department(req, "corr-1").await.unwrap();
        assert_eq!(result.token.slot_id, "s1");
        assert!(result.department_info.is_some());
    }

    #[tokio::test]
    async fn emergency_department_search_prefers_a_slot_with_free_capacity() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 1).await;
        seed_slot(&store, "s2", "d2", "cardiology", 1).await;
        let engine = engine(store.clone());
        engine.allocate_targeted(targeted("p1", "d1", "s1", "online"), "corr-1").await.unwrap();

        let mut info = patient_info();
        info.urgency_level = Some("critical".into());
        let req = DepartmentRequest {
            patient_id: "p2".into(),
            department: "cardiology".into(),
            source: "emergency".into(),
            patient_info: info,
            waiting_minutes: 0,
            preferred_date: Some(chrono::NaiveDate::from_ymd_opt(2026, 8, 3).unwrap()),
            preferred_doctor_id: None,
            preferred_slot_id: None,
        };

        let result = engine.allocate_emergency_department(req, "corr-2").await.unwrap();
        assert_eq!(result.allocation_method, AllocationMethod::Direct);
        assert_eq!(result.token.slot_id, "s2");
    }

    #[tokio::test]
    async fn stale_pending_reallocation_is_dead_lettered_instead_of_retried() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_slot(&store, "s1", "d1", "cardiology", 1).await;
        seed_slot(&store, "s2", "d1", "cardiology", 5).await;
        let engine = engine(store.clone());

        let stale = Token {
            token_id: "t-stale".into(),
            patient_id: "p1".into(),
            doctor_id: "d1".into(),
            slot_id: "s1".into(),
            token_number: 1,
            source: "online".into(),
            priority: 400,
            status: TokenStatus::PendingReallocation,
            created_at: Utc::now() - Duration::minutes(20),
            updated_at: Utc::now() - Duration::minutes(11),
            metadata: TokenMetadata::default(),
        };
        store.put_typed(collections::TOKENS, &stale.token_id, &stale).await.unwrap();

        let fresh = Token {
            token_id: "t-fresh".into(),
            updated_at: Utc::now() - Duration::minutes(2),
            ..stale.clone()
        };
        store.put_typed(collections::TOKENS, &fresh.token_id, &fresh).await.unwrap();

        engine.retry_pending_reallocations().await.unwrap();

        let stale_after = store.get_typed::<Token>(collections::TOKENS, "t-stale").await.unwrap().unwrap();
        assert_eq!(stale_after.status, TokenStatus::Cancelled);

        let fresh_after = store.get_typed::<Token>(collections::TOKENS, "t-fresh").await.unwrap().unwrap();
        assert_eq!(fresh_after.status, TokenStatus::Allocated);
        assert_eq!(fresh_after.slot_id, "s2");
    }
}

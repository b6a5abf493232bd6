use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate};
use engine_store::{collections, Store};
use serde_json::Value;
use slot_lifecycle::{AvailableSlotsFilter, Slot, SlotLifecycle};
use tracing::debug;

use crate::models::{AlternativeSlot, AlternativesEnvelope, DoctorWorkload, RecommendedAction};

/// How many days forward department-smart's own `next_available_slots`
/// forward search walks before giving up. A hardcoded search bound, same
/// spirit as `CapacityGuard`'s displacement margin — a tuning constant, not
/// something a caller configures per call.
const MAX_FORWARD_DAYS: i64 = 30;
/// Window `same_doctor_future_slots` looks within for the envelope.
const SAME_DOCTOR_WINDOW_DAYS: i64 = 7;
/// Window the envelope's cross-department `nextAvailableSlots` looks within.
const NEXT_AVAILABLE_WINDOW_DAYS: i64 = 3;
const SAME_DOCTOR_CAP: usize = 3;
const SAME_DEPARTMENT_CAP: usize = 3;
const NEXT_AVAILABLE_CAP: usize = 5;

/// Builds the three-category alternatives envelope a failed or
/// department-smart allocation falls back to. Grounded on a conflict
/// detection service's alternative-slot search, generalized from
/// appointment-conflict resolution to slot-capacity exhaustion.
pub struct AlternativeFinder {
    store: Arc<dyn Store>,
    lifecycle: Arc<SlotLifecycle>,
}

impl AlternativeFinder {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<SlotLifecycle>) -> Self {
        Self { store, lifecycle }
    }

    pub async fn doctor_workload(&self, doctor_id: &str) -> Result<DoctorWorkload, engine_store::StoreError> {
        let doctor_id_owned = doctor_id.to_string();
        let tokens = self
            .store
            .query(
                collections::TOKENS,
                &move |v: &Value| {
                    v["doctorId"].as_str() == Some(doctor_id_owned.as_str())
                        && matches!(v["status"].as_str(), Some("allocated") | Some("confirmed"))
                },
                None,
                None,
            )
            .await?;

        let available = self
            .lifecycle
            .find_available(&AvailableSlotsFilter {
                doctor_id: Some(doctor_id.to_string()),
                ..Default::default()
            })
            .await
            .map(|slots| slots.len() as u32)
            .unwrap_or(0);

        let current_patients = tokens.len() as u32;
        let denominator = current_patients + available;
        let utilization_rate = if denominator == 0 {
            0.0
        } else {
            current_patients as f64 / denominator as f64
        };

        Ok(DoctorWorkload {
            current_patients,
            available_slots: available,
            utilization_rate,
        })
    }

    async fn to_alternative_slots(&self, slots: Vec<Slot>, cap: usize) -> Vec<AlternativeSlot> {
        let mut out = Vec::with_capacity(slots.len().min(cap));
        for slot in slots.into_iter().take(cap) {
            let doctor_workload = self
                .doctor_workload(&slot.doctor_id)
                .await
                .unwrap_or(DoctorWorkload {
                    current_patients: 0,
                    available_slots: 0,
                    utilization_rate: 0.0,
                });
            out.push(AlternativeSlot { slot, doctor_workload });
        }
        out
    }

    /// Up to 3 slots with the same doctor on dates strictly after
    /// `from_date`, within the next 7 days, with capacity.
    pub async fn same_doctor_future_slots(
        &self,
        doctor_id: &str,
        from_date: NaiveDate,
    ) -> Result<Vec<AlternativeSlot>, engine_store::StoreError> {
        let slots = self
            .lifecycle
            .find_available(&AvailableSlotsFilter {
                doctor_id: Some(doctor_id.to_string()),
                date_range: Some((
                    from_date + ChronoDuration::days(1),
                    from_date + ChronoDuration::days(SAME_DOCTOR_WINDOW_DAYS),
                )),
                ..Default::default()
            })
            .await
            .map_err(|e| match e {
                slot_lifecycle::SlotLifecycleError::Store(err) => err,
                other => engine_store::StoreError::Backend(other.to_string()),
            })?;
        Ok(self.to_alternative_slots(slots, SAME_DOCTOR_CAP).await)
    }

    /// Up to 3 slots from other doctors in the same department on `date`.
    pub async fn same_department_other_doctors(
        &self,
        department: &str,
        exclude_doctor_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AlternativeSlot>, engine_store::StoreError> {
        let slots = self
            .lifecycle
            .find_available(&AvailableSlotsFilter {
                department: Some(department.to_string()),
                date_range: Some((date, date)),
                ..Default::default()
            })
            .await
            .map_err(|e| match e {
                slot_lifecycle::SlotLifecycleError::Store(err) => err,
                other => engine_store::StoreError::Backend(other.to_string()),
            })?;
        let filtered: Vec<Slot> = slots
            .into_iter()
            .filter(|s| s.doctor_id != exclude_doctor_id)
            .collect();
        Ok(self.to_alternative_slots(filtered, SAME_DEPARTMENT_CAP).await)
    }

    /// Up to 5 earliest-capacity slots across any doctor within the next 3
    /// days, preferring `preferred_department`. Never triggers slot
    /// generation — that's department-smart's own forward search below.
    pub async fn cross_department_next_available(
        &self,
        preferred_department: &str,
        from_date: NaiveDate,
    ) -> Result<Vec<AlternativeSlot>, engine_store::StoreError> {
        let mut slots = self
            .lifecycle
            .find_available(&AvailableSlotsFilter {
                date_range: Some((from_date, from_date + ChronoDuration::days(NEXT_AVAILABLE_WINDOW_DAYS))),
                ..Default::default()
            })
            .await
            .map_err(|e| match e {
                slot_lifecycle::SlotLifecycleError::Store(err) => err,
                other => engine_store::StoreError::Backend(other.to_string()),
            })?;
        slots.sort_by_key(|s| if s.department == preferred_department { 0 } else { 1 });
        Ok(self.to_alternative_slots(slots, NEXT_AVAILABLE_CAP).await)
    }

    /// Scans forward day by day for the first date with department
    /// capacity, generating that day's slots from the weekly templates if
    /// they don't exist yet. Returns the slots found and whether generation
    /// was actually triggered on the winning day.
    pub async fn next_available_slots(
        &self,
        department: &str,
        from_date: NaiveDate,
    ) -> Result<(Vec<AlternativeSlot>, bool), engine_store::StoreError> {
        for offset in 0..MAX_FORWARD_DAYS {
            let date = from_date + ChronoDuration::days(offset);
            let existing = self
                .lifecycle
                .find_available(&AvailableSlotsFilter {
                    department: Some(department.to_string()),
                    date_range: Some((date, date)),
                    ..Default::default()
                })
                .await
                .map_err(|e| match e {
                    slot_lifecycle::SlotLifecycleError::Store(err) => err,
                    other => engine_store::StoreError::Backend(other.to_string()),
                })?;
            if !existing.is_empty() {
                return Ok((self.to_alternative_slots(existing, NEXT_AVAILABLE_CAP).await, false));
            }

            let generated = self
                .lifecycle
                .generate_for_date(date)
                .await
                .map_err(|e| match e {
                    slot_lifecycle::SlotLifecycleError::Store(err) => err,
                    other => engine_store::StoreError::Backend(other.to_string()),
                })?;
            let department_slots: Vec<Slot> = generated
                .into_iter()
                .filter(|s| s.department == department && s.has_capacity())
                .collect();
            if !department_slots.is_empty() {
                debug!("triggered slot generation for {date} while searching for {department} availability");
                return Ok((self.to_alternative_slots(department_slots, NEXT_AVAILABLE_CAP).await, true));
            }
        }
        Ok((Vec::new(), false))
    }

    /// Builds the three-category envelope a rejected allocation falls back
    /// to. `recommendedAction` prefers same-department-today, then
    /// same-doctor-future; the third preference then splits by urgency —
    /// emergency requests fall to next-available, non-emergency requests
    /// fall straight to future booking instead (§4.6).
    pub async fn build_envelope(
        &self,
        department: &str,
        same_doctor_id: Option<&str>,
        from_date: NaiveDate,
        is_emergency: bool,
    ) -> Result<AlternativesEnvelope, engine_store::StoreError> {
        let same_doctor_future_slots = match same_doctor_id {
            Some(doctor_id) => self.same_doctor_future_slots(doctor_id, from_date).await?,
            None => Vec::new(),
        };
        let same_department_other_doctors = match same_doctor_id {
            Some(doctor_id) => {
                self.same_department_other_doctors(department, doctor_id, from_date)
                    .await?
            }
            None => {
                self.same_department_other_doctors(department, "", from_date)
                    .await?
            }
        };
        let next_available_slots = self.cross_department_next_available(department, from_date).await?;

        let recommended_action = if !same_department_other_doctors.is_empty() {
            Some(RecommendedAction::SameDepartmentToday)
        } else if !same_doctor_future_slots.is_empty() {
            Some(RecommendedAction::SameDoctorFuture)
        } else if is_emergency && !next_available_slots.is_empty() {
            Some(RecommendedAction::NextAvailable)
        } else {
            Some(RecommendedAction::FutureBooking)
        };

        Ok(AlternativesEnvelope {
            same_doctor_future_slots,
            same_department_other_doctors,
            next_available_slots,
            recommended_action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_store::{InMemoryStore, StoreExt};
    use slot_lifecycle::{DoctorSchedule, SlotType, WeeklySlotTemplate};
    use std::collections::HashMap;

    fn schedule(doctor_id: &str, department: &str, weekday: u8) -> DoctorSchedule {
        let mut weekly = HashMap::new();
        weekly.insert(
            weekday,
            vec![WeeklySlotTemplate {
                start_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                max_capacity: 2,
                slot_type: SlotType::Regular,
            }],
        );
        DoctorSchedule {
            doctor_id: doctor_id.into(),
            department: department.into(),
            weekly_schedule: weekly,
            is_active: true,
            effective_from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            effective_to: None,
            emergency_available: true,
        }
    }

    fn weekday_index(date: NaiveDate) -> u8 {
        use chrono::Datelike;
        match date.weekday() {
            chrono::Weekday::Sun => 0,
            chrono::Weekday::Mon => 1,
            chrono::Weekday::Tue => 2,
            chrono::Weekday::Wed => 3,
            chrono::Weekday::Thu => 4,
            chrono::Weekday::Fri => 5,
            chrono::Weekday::Sat => 6,
        }
    }

    #[tokio::test]
    async fn next_available_slots_generates_forward_until_capacity_found() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let start = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let target = start + ChronoDuration::days(2);
        let sched = schedule("d1", "cardiology", weekday_index(target));
        store
            .put_typed(collections::DOCTOR_SCHEDULES, "d1", &sched)
            .await
            .unwrap();

        let lifecycle = Arc::new(SlotLifecycle::new(store.clone()));
        let finder = AlternativeFinder::new(store, lifecycle);

        let (slots, auto_generated) = finder.next_available_slots("cardiology", start).await.unwrap();
        assert!(!slots.is_empty());
        assert!(auto_generated);
        assert_eq!(slots[0].slot.date, target);
    }

    #[tokio::test]
    async fn recommended_action_prefers_same_department_today() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let sched = schedule("d2", "cardiology", weekday_index(date));
        store
            .put_typed(collections::DOCTOR_SCHEDULES, "d2", &sched)
            .await
            .unwrap();

        let lifecycle = Arc::new(SlotLifecycle::new(store.clone()));
        lifecycle.generate_for_date(date).await.unwrap();
        let finder = AlternativeFinder::new(store, lifecycle);

        let envelope = finder.build_envelope("cardiology", Some("d1"), date, false).await.unwrap();
        assert_eq!(
            envelope.recommended_action,
            Some(RecommendedAction::SameDepartmentToday)
        );
    }

    #[tokio::test]
    async fn non_emergency_skips_next_available_and_falls_to_future_booking() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let lifecycle = Arc::new(SlotLifecycle::new(store.clone()));
        let finder = AlternativeFinder::new(store, lifecycle);

        // No schedules exist anywhere, so same-department, same-doctor and
        // next-available all come back empty.
        let non_emergency = finder.build_envelope("cardiology", Some("d1"), date, false).await.unwrap();
        assert_eq!(non_emergency.recommended_action, Some(RecommendedAction::FutureBooking));
    }

    #[tokio::test]
    async fn emergency_prefers_next_available_over_future_booking() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let sched = schedule("d2", "neurology", weekday_index(date));
        store
            .put_typed(collections::DOCTOR_SCHEDULES, "d2", &sched)
            .await
            .unwrap();

        let lifecycle = Arc::new(SlotLifecycle::new(store.clone()));
        lifecycle.generate_for_date(date).await.unwrap();
        let finder = AlternativeFinder::new(store, lifecycle);

        // "cardiology" has nothing same-department or same-doctor, but
        // cross-department next-available (neurology) has capacity today.
        let emergency = finder.build_envelope("cardiology", Some("d1"), date, true).await.unwrap();
        assert_eq!(emergency.recommended_action, Some(RecommendedAction::NextAvailable));

        let non_emergency = finder.build_envelope("cardiology", Some("d1"), date, false).await.unwrap();
        assert_eq!(non_emergency.recommended_action, Some(RecommendedAction::FutureBooking));
    }
}

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};
use engine_store::{collections, Store, StoreExt};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::models::{
    build_slot_id, AvailableSlotsFilter, DoctorSchedule, Slot, SlotLifecycleError, SlotMetadata,
    SlotStatus,
};

fn day_of_week_index(date: NaiveDate) -> u8 {
    match date.weekday() {
        Weekday::Sun => 0,
        Weekday::Mon => 1,
        Weekday::Tue => 2,
        Weekday::Wed => 3,
        Weekday::Thu => 4,
        Weekday::Fri => 5,
        Weekday::Sat => 6,
    }
}

/// Materializes weekly `DoctorSchedule` templates into date-specific `Slot`
/// records, and answers the lookup/search questions `AllocationEngine` and
/// `AlternativeFinder` need. Never mutates `currentAllocation` or
/// `lastTokenNumber` outside of the idempotent refresh in `generate_for_date`
/// — everywhere else those two counters flow only through `CapacityGuard`.
pub struct SlotLifecycle {
    store: Arc<dyn Store>,
}

impl SlotLifecycle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Materializes one `Slot` per `(activeDoctorSchedule, weekdaySlot)` pair
    /// whose effective window covers `date`. Safe to call repeatedly for the
    /// same date: an existing slot has its two counters refreshed from the
    /// tokens collection rather than being recreated.
    #[instrument(skip(self))]
    pub async fn generate_for_date(&self, date: NaiveDate) -> Result<Vec<Slot>, SlotLifecycleError> {
        let weekday = day_of_week_index(date);
        let schedules = self.active_schedules(date).await?;

        let mut generated = Vec::new();
        for schedule in schedules {
            let Some(templates) = schedule.weekly_schedule.get(&weekday) else {
                continue;
            };

            for template in templates {
                let slot_id = build_slot_id(&schedule.doctor_id, date, template.start_time);
                let slot = match self.find_by_slot_id(&slot_id).await? {
                    Some(existing) => self.refresh_counters(existing).await?,
                    None => {
                        let slot = Slot {
                            slot_id: slot_id.clone(),
                            doctor_id: schedule.doctor_id.clone(),
                            department: schedule.department.clone(),
                            date,
                            start_time: template.start_time,
                            end_time: template.end_time,
                            max_capacity: template.max_capacity,
                            current_allocation: 0,
                            last_token_number: 0,
                            status: SlotStatus::Active,
                            metadata: SlotMetadata::default(),
                        };
                        self.store.put_typed(collections::SLOTS, &slot_id, &slot).await?;
                        slot
                    }
                };
                generated.push(slot);
            }
        }

        debug!("generated {} slots for {date}", generated.len());
        Ok(generated)
    }

    pub async fn find_by_slot_id(&self, slot_id: &str) -> Result<Option<Slot>, SlotLifecycleError> {
        Ok(self.store.get_typed(collections::SLOTS, slot_id).await?)
    }

    pub async fn find_available(
        &self,
        filter: &AvailableSlotsFilter,
    ) -> Result<Vec<Slot>, SlotLifecycleError> {
        let filter = filter.clone();
        let values = self
            .store
            .query(
                collections::SLOTS,
                &move |v: &Value| matches_available_filter(v, &filter),
                Some(&|a: &Value, b: &Value| compare_by_date_then_start(a, b)),
                None,
            )
            .await?;

        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn find_overlapping(
        &self,
        doctor_id: &str,
        date: NaiveDate,
        start: chrono::NaiveTime,
        end: chrono::NaiveTime,
    ) -> Result<Vec<Slot>, SlotLifecycleError> {
        let doctor_id = doctor_id.to_string();
        let values = self
            .store
            .query(
                collections::SLOTS,
                &move |v: &Value| {
                    v["doctorId"].as_str() == Some(doctor_id.as_str())
                        && v["date"].as_str() == Some(&date.to_string())
                },
                None,
                None,
            )
            .await?;

        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Slot>(v).ok())
            .filter(|s| s.overlaps(start, end))
            .collect())
    }

    async fn active_schedules(&self, date: NaiveDate) -> Result<Vec<DoctorSchedule>, SlotLifecycleError> {
        let values = self
            .store
            .query(
                collections::DOCTOR_SCHEDULES,
                &move |v: &Value| {
                    if !v["isActive"].as_bool().unwrap_or(false) {
                        return false;
                    }
                    let from = v["effectiveFrom"]
                        .as_str()
                        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                    let to = v["effectiveTo"]
                        .as_str()
                        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                    match from {
                        Some(from) if from <= date => to.map_or(true, |to| date <= to),
                        _ => false,
                    }
                },
                None,
                None,
            )
            .await?;

        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Recomputes `currentAllocation` from live tokens and `lastTokenNumber`
    /// from the maximum token number ever issued in the slot (including
    /// cancelled ones — (I3) forbids a number ever being reused).
    async fn refresh_counters(&self, mut slot: Slot) -> Result<Slot, SlotLifecycleError> {
        let slot_id = slot.slot_id.clone();
        let tokens = self
            .store
            .query(
                collections::TOKENS,
                &move |v: &Value| v["slotId"].as_str() == Some(slot_id.as_str()),
                None,
                None,
            )
            .await?;

        let live_count = tokens
            .iter()
            .filter(|t| matches!(t["status"].as_str(), Some("allocated") | Some("confirmed")))
            .count() as u32;
        let max_token_number = tokens
            .iter()
            .filter_map(|t| t["tokenNumber"].as_u64())
            .max()
            .unwrap_or(0);

        slot.current_allocation = live_count;
        slot.last_token_number = slot.last_token_number.max(max_token_number);
        self.store
            .put_typed(collections::SLOTS, &slot.slot_id, &slot)
            .await?;
        Ok(slot)
    }
}

fn matches_available_filter(v: &Value, filter: &AvailableSlotsFilter) -> bool {
    if v["status"].as_str() != Some("active") {
        return false;
    }
    let current = v["currentAllocation"].as_u64().unwrap_or(0);
    let max = v["maxCapacity"].as_u64().unwrap_or(0);
    if current >= max {
        return false;
    }
    if let Some(doctor_id) = &filter.doctor_id {
        if v["doctorId"].as_str() != Some(doctor_id.as_str()) {
            return false;
        }
    }
    if let Some(department) = &filter.department {
        if v["department"].as_str() != Some(department.as_str()) {
            return false;
        }
    }
    if let Some((from, to)) = filter.date_range {
        let date = v["date"]
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        match date {
            Some(d) if d >= from && d <= to => {}
            _ => return false,
        }
    }
    if let Some(start_ge) = filter.start_time_ge {
        let start = v["startTime"]
            .as_str()
            .and_then(|s| chrono::NaiveTime::parse_from_str(s, "%H:%M:%S").ok());
        match start {
            Some(s) if s >= start_ge => {}
            _ => return false,
        }
    }
    true
}

fn compare_by_date_then_start(a: &Value, b: &Value) -> Ordering {
    let a_date = a["date"].as_str().unwrap_or_default();
    let b_date = b["date"].as_str().unwrap_or_default();
    a_date
        .cmp(b_date)
        .then_with(|| {
            let a_start = a["startTime"].as_str().unwrap_or_default();
            let b_start = b["startTime"].as_str().unwrap_or_default();
            a_start.cmp(b_start)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SlotType, WeeklySlotTemplate};
    use chrono::NaiveTime;
    use engine_store::InMemoryStore;
    use std::collections::HashMap;

    fn sample_schedule(doctor_id: &str, weekday: u8) -> DoctorSchedule {
        let mut weekly = HashMap::new();
        weekly.insert(
            weekday,
            vec![WeeklySlotTemplate {
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                max_capacity: 3,
                slot_type: SlotType::Regular,
            }],
        );
        DoctorSchedule {
            doctor_id: doctor_id.to_string(),
            department: "cardiology".into(),
            weekly_schedule: weekly,
            is_active: true,
            effective_from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            effective_to: None,
            emergency_available: true,
        }
    }

    #[tokio::test]
    async fn generate_for_date_is_idempotent() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(); // a Monday
        let schedule = sample_schedule("d1", day_of_week_index(date));
        store
            .put_typed(collections::DOCTOR_SCHEDULES, "d1", &schedule)
            .await
            .unwrap();

        let lifecycle = SlotLifecycle::new(store.clone());
        let first = lifecycle.generate_for_date(date).await.unwrap();
        let second = lifecycle.generate_for_date(date).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].slot_id, second[0].slot_id);
        assert_eq!(second[0].current_allocation, 0);
    }

    #[tokio::test]
    async fn generate_for_date_skips_inactive_weekday() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let other_weekday = (day_of_week_index(date) + 1) % 7;
        let schedule = sample_schedule("d1", other_weekday);
        store
            .put_typed(collections::DOCTOR_SCHEDULES, "d1", &schedule)
            .await
            .unwrap();

        let lifecycle = SlotLifecycle::new(store);
        let result = lifecycle.generate_for_date(date).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn find_available_excludes_full_slots() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let slot = Slot {
            slot_id: "slot_d1_2026-08-03_0900".into(),
            doctor_id: "d1".into(),
            department: "cardiology".into(),
            date: NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            max_capacity: 1,
            current_allocation: 1,
            last_token_number: 1,
            status: SlotStatus::Active,
            metadata: Default::default(),
        };
        store
            .put_typed(collections::SLOTS, &slot.slot_id, &slot)
            .await
            .unwrap();

        let lifecycle = SlotLifecycle::new(store);
        let available = lifecycle
            .find_available(&AvailableSlotsFilter::default())
            .await
            .unwrap();
        assert!(available.is_empty());
    }
}

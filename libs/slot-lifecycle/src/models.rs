use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `slot_<doctorId>_<YYYY-MM-DD>_<HHMM>` — deterministic and idempotent to
/// regenerate.
pub fn build_slot_id(doctor_id: &str, date: NaiveDate, start_time: NaiveTime) -> String {
    format!(
        "slot_{doctor_id}_{}_{}",
        date.format("%Y-%m-%d"),
        start_time.format("%H%M")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Active,
    Suspended,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    Regular,
    EmergencyReserved,
    Vip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotMetadata {
    pub avg_consult_minutes: Option<u32>,
    pub buffer_minutes: Option<u32>,
    #[serde(default)]
    pub emergency_reserved: u32,
}

/// A finite-capacity window for one physician on one date. `current_allocation`
/// and `last_token_number` are owned exclusively by `CapacityGuard` — nothing
/// else in this crate or `allocation-engine` mutates them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub slot_id: String,
    pub doctor_id: String,
    /// Unified specialty/department concept (the source data mixed the two
    /// names for the same thing; this crate treats them as one field).
    pub department: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub max_capacity: u32,
    pub current_allocation: u32,
    pub last_token_number: u64,
    pub status: SlotStatus,
    pub metadata: SlotMetadata,
}

impl Slot {
    pub fn has_capacity(&self) -> bool {
        self.current_allocation < self.max_capacity
    }

    pub fn overlaps(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start_time < end && self.end_time > start
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklySlotTemplate {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub max_capacity: u32,
    pub slot_type: SlotType,
}

/// A weekly recurring template, authored out-of-band and consumed read-only
/// by `SlotLifecycle`. `weekly_schedule` keys are day-of-week indices,
/// `0 = Sunday ... 6 = Saturday`, matching the convention the rest of the
/// stack already uses for day-of-week lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorSchedule {
    pub doctor_id: String,
    pub department: String,
    pub weekly_schedule: HashMap<u8, Vec<WeeklySlotTemplate>>,
    pub is_active: bool,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub emergency_available: bool,
}

impl DoctorSchedule {
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.is_active
            && self.effective_from <= date
            && self.effective_to.map_or(true, |to| date <= to)
    }
}

#[derive(Debug, Error)]
pub enum SlotLifecycleError {
    #[error("slot not found: {0}")]
    SlotNotFound(String),
    #[error("store fault: {0}")]
    Store(#[from] engine_store::StoreError),
}

/// Filter for `SlotLifecycle::find_available`.
#[derive(Debug, Clone, Default)]
pub struct AvailableSlotsFilter {
    pub doctor_id: Option<String>,
    pub department: Option<String>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub start_time_ge: Option<NaiveTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_id_format_matches_spec() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let time = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        assert_eq!(build_slot_id("d1", date, time), "slot_d1_2026-08-01_0930");
    }

    #[test]
    fn schedule_applies_within_effective_window() {
        let schedule = DoctorSchedule {
            doctor_id: "d1".into(),
            department: "cardiology".into(),
            weekly_schedule: HashMap::new(),
            is_active: true,
            effective_from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            effective_to: Some(NaiveDate::from_ymd_opt(2026, 12, 31).unwrap()),
            emergency_available: true,
        };
        assert!(schedule.applies_on(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()));
        assert!(!schedule.applies_on(NaiveDate::from_ymd_opt(2027, 1, 1).unwrap()));
    }
}

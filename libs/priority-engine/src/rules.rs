use crate::request::PriorityRequest;

/// One named adjustment in the breakdown `computePriority` returns.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Adjustment {
    pub label: &'static str,
    pub delta: i32,
}

/// `Rule : Request → (label, delta)` — an itemized, independently testable
/// unit of the adjustment table. `evaluate` returns `None` when the rule
/// does not apply to `req` at all, rather than `Some(0)`, so the breakdown
/// only lists adjustments that actually fired.
pub trait Rule: Send + Sync {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment>;
}

pub struct WaitingTimeRule;

impl Rule for WaitingTimeRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        let minutes = req.waiting_minutes;
        let delta = if minutes >= 180 {
            250
        } else if minutes >= 120 {
            150
        } else if minutes >= 60 {
            100
        } else if minutes > 0 {
            ((minutes as f64 * 0.8).min(40.0)) as i32
        } else {
            return None;
        };
        Some(Adjustment {
            label: "waiting_time",
            delta,
        })
    }
}

pub struct AgeRule;

impl Rule for AgeRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        let age = req.patient_info.age?;
        let delta = if age >= 80 {
            60
        } else if age >= 65 {
            20
        } else if age <= 12 {
            30
        } else {
            return None;
        };
        Some(Adjustment { label: "age", delta })
    }
}

pub struct MedicalHistoryCriticalRule;

impl Rule for MedicalHistoryCriticalRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        req.patient_info.medical_history.critical.then_some(Adjustment {
            label: "medical_history_critical",
            delta: 100,
        })
    }
}

pub struct MedicalHistoryChronicRule;

impl Rule for MedicalHistoryChronicRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        req.patient_info.medical_history.chronic.then_some(Adjustment {
            label: "medical_history_chronic",
            delta: 30,
        })
    }
}

pub struct ConditionCountRule;

impl Rule for ConditionCountRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        let count = req.patient_info.medical_history.conditions.len();
        let delta = if count >= 3 {
            75
        } else if count >= 2 {
            40
        } else {
            return None;
        };
        Some(Adjustment {
            label: "condition_count",
            delta,
        })
    }
}

pub struct NamedConditionRule;

impl Rule for NamedConditionRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        const MODERATE: [&str; 2] = ["diabetes", "hypertension"];
        const SEVERE: [&str; 2] = ["heart disease", "kidney_disease"];

        let mut delta = 0;
        for condition in &req.patient_info.medical_history.conditions {
            let lower = condition.to_lowercase();
            if MODERATE.contains(&lower.as_str()) {
                delta += 20;
            } else if SEVERE.contains(&lower.as_str()) {
                delta += 40;
            }
        }
        (delta > 0).then_some(Adjustment {
            label: "named_condition",
            delta,
        })
    }
}

pub struct UrgencyLevelRule;

impl Rule for UrgencyLevelRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        use crate::request::UrgencyLevel::*;
        let delta = match req.patient_info.urgency_level? {
            Emergency => 200,
            Critical => 150,
            Urgent => 40,
            Moderate => 30,
        };
        Some(Adjustment {
            label: "urgency_level",
            delta,
        })
    }
}

pub struct PregnancyRule;

impl Rule for PregnancyRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        req.patient_info.is_pregnant.then_some(Adjustment {
            label: "is_pregnant",
            delta: 75,
        })
    }
}

pub struct DisabilityRule;

impl Rule for DisabilityRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        req.patient_info.has_disability.then_some(Adjustment {
            label: "has_disability",
            delta: 50,
        })
    }
}

pub struct FollowupUrgencyRule;

impl Rule for FollowupUrgencyRule {
    fn evaluate(&self, req: &PriorityRequest) -> Option<Adjustment> {
        use crate::request::FollowupUrgency::*;
        let delta = match req.patient_info.followup_urgency? {
            Urgent => 75,
            Moderate => 40,
            Routine => 20,
        };
        Some(Adjustment {
            label: "followup_urgency",
            delta,
        })
    }
}

/// The full ordered adjustment table of the spec, in table order so the
/// itemized breakdown reads the same way every time.
pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(WaitingTimeRule),
        Box::new(AgeRule),
        Box::new(MedicalHistoryCriticalRule),
        Box::new(MedicalHistoryChronicRule),
        Box::new(ConditionCountRule),
        Box::new(NamedConditionRule),
        Box::new(UrgencyLevelRule),
        Box::new(PregnancyRule),
        Box::new(DisabilityRule),
        Box::new(FollowupUrgencyRule),
    ]
}

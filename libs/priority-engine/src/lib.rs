pub mod request;
pub mod rules;

pub use request::{FollowupUrgency, MedicalHistory, PatientInfo, PriorityRequest, Source, UrgencyLevel};
pub use rules::{Adjustment, Rule};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_config::{ConfigSource, EngineConfig};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const BASE_SCORE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriorityError {
    #[error("unknown priority source: {0}")]
    InvalidSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    Medium,
    High,
    Emergency,
}

impl PriorityLevel {
    fn from_score(score: i32) -> Self {
        if score >= 1000 {
            PriorityLevel::Emergency
        } else if score >= 700 {
            PriorityLevel::High
        } else if score >= 300 {
            PriorityLevel::Medium
        } else {
            PriorityLevel::Low
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityBreakdown {
    pub base_priority: i32,
    pub adjustments: Vec<Adjustment>,
    pub final_priority: i32,
    pub priority_level: PriorityLevel,
}

struct CacheEntry {
    value: i32,
    expires_at: Instant,
}

/// Deterministic request → priority mapping. Pure with respect to its
/// inputs — the only side effect is the process-local base-score cache,
/// which only ever shortens a config lookup, never changes the answer for
/// a fixed `(source, now)`.
pub struct PriorityEngine {
    config: Arc<dyn ConfigSource>,
    fallback: EngineConfig,
    rules: Vec<Box<dyn Rule>>,
    base_score_cache: RwLock<HashMap<Source, CacheEntry>>,
}

impl PriorityEngine {
    pub fn new(config: Arc<dyn ConfigSource>, fallback: EngineConfig) -> Self {
        Self {
            config,
            fallback,
            rules: rules::default_rules(),
            base_score_cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn compute_priority(
        &self,
        req: &PriorityRequest,
    ) -> Result<PriorityBreakdown, PriorityError> {
        let base_priority = self.base_priority(req.source).await?;

        let adjustments: Vec<Adjustment> = self
            .rules
            .iter()
            .filter_map(|rule| rule.evaluate(req))
            .collect();

        let final_priority = base_priority + adjustments.iter().map(|a| a.delta).sum::<i32>();
        let priority_level = PriorityLevel::from_score(final_priority);

        Ok(PriorityBreakdown {
            base_priority,
            adjustments,
            final_priority,
            priority_level,
        })
    }

    async fn base_priority(&self, source: Source) -> Result<i32, PriorityError> {
        if let Some(entry) = self.base_score_cache.read().await.get(&source) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.value);
            }
        }

        let key = format!("priority.{}.base_score", source.as_str());
        let resolved = match self.config.get(&key).await.and_then(|v| v.parse::<i32>().ok()) {
            Some(v) => v,
            None => {
                let fallback = self.fallback.base_score(source.as_str()).ok_or_else(|| {
                    PriorityError::InvalidSource(source.as_str().to_string())
                })?;
                warn!("no override for {key}, using default base score {fallback}");
                fallback
            }
        };

        debug!("resolved base score for {:?}: {resolved}", source);
        self.base_score_cache.write().await.insert(
            source,
            CacheEntry {
                value: resolved,
                expires_at: Instant::now() + BASE_SCORE_CACHE_TTL,
            },
        );

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PriorityEngine {
        PriorityEngine::new(Arc::new(EngineConfig::from_env()), EngineConfig::from_env())
    }

    #[tokio::test]
    async fn base_priority_by_source_matches_table() {
        let engine = engine();
        let req = PriorityRequest::new(Source::Emergency, PatientInfo::default(), 0);
        let result = engine.compute_priority(&req).await.unwrap();
        assert_eq!(result.base_priority, 1000);
        assert_eq!(result.priority_level, PriorityLevel::Emergency);
    }

    #[tokio::test]
    async fn waiting_minutes_59_vs_60_jumps_to_100() {
        let engine = engine();
        let below = PriorityRequest::new(Source::Walkin, PatientInfo::default(), 59);
        let at = PriorityRequest::new(Source::Walkin, PatientInfo::default(), 60);

        let below_result = engine.compute_priority(&below).await.unwrap();
        let at_result = engine.compute_priority(&at).await.unwrap();

        assert!(below_result.final_priority - below_result.base_priority <= 40);
        assert_eq!(at_result.final_priority - at_result.base_priority, 100);
    }

    #[tokio::test]
    async fn age_64_vs_65_jumps_to_20() {
        let engine = engine();
        let mut younger = PatientInfo::default();
        younger.age = Some(64);
        let mut older = PatientInfo::default();
        older.age = Some(65);

        let younger_req = PriorityRequest::new(Source::Online, younger, 0);
        let older_req = PriorityRequest::new(Source::Online, older, 0);

        let younger_result = engine.compute_priority(&younger_req).await.unwrap();
        let older_result = engine.compute_priority(&older_req).await.unwrap();

        assert_eq!(younger_result.final_priority, younger_result.base_priority);
        assert_eq!(older_result.final_priority - older_result.base_priority, 20);
    }

    #[tokio::test]
    async fn negative_waiting_minutes_clamped_to_zero() {
        let engine = engine();
        let req = PriorityRequest::new(Source::Online, PatientInfo::default(), -45);
        let result = engine.compute_priority(&req).await.unwrap();
        assert_eq!(result.final_priority, result.base_priority);
    }

    #[tokio::test]
    async fn unknown_source_string_does_not_parse() {
        assert_eq!(Source::parse("bogus"), None);
    }

    #[tokio::test]
    async fn compute_priority_is_deterministic() {
        let engine = engine();
        let mut info = PatientInfo::default();
        info.age = Some(70);
        info.is_pregnant = true;
        let req = PriorityRequest::new(Source::Priority, info, 90);

        let first = engine.compute_priority(&req).await.unwrap();
        let second = engine.compute_priority(&req).await.unwrap();
        assert_eq!(first.final_priority, second.final_priority);
        assert_eq!(first.adjustments.len(), second.adjustments.len());
    }

    #[tokio::test]
    async fn multiple_adjustments_compose_additively() {
        let engine = engine();
        let mut info = PatientInfo::default();
        info.age = Some(85);
        info.medical_history.critical = true;
        info.medical_history.conditions = vec!["Diabetes".into(), "Hypertension".into()];
        info.urgency_level = Some(UrgencyLevel::Critical);
        let req = PriorityRequest::new(Source::Online, info, 200);

        let result = engine.compute_priority(&req).await.unwrap();
        // 250 (waiting) + 60 (age) + 100 (critical) + 40 (2 conditions) + 20+20 (named) + 150 (urgency)
        let expected_delta = 250 + 60 + 100 + 40 + 20 + 20 + 150;
        assert_eq!(result.final_priority - result.base_priority, expected_delta);
    }
}

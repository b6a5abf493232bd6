use std::collections::HashMap;
use std::env;

use async_trait::async_trait;
use tracing::warn;

/// A source of configuration key lookups, independent of how the value is
/// actually stored. `EngineConfig` itself is one implementation (env-backed,
/// loaded once at startup); a store-backed implementation layered on top of
/// it lets operators override a handful of keys at runtime without a
/// redeploy.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
}

const DEFAULT_BASE_SCORES: &[(&str, i32)] = &[
    ("emergency", 1000),
    ("priority", 800),
    ("followup", 600),
    ("online", 400),
    ("walkin", 200),
];

const DEFAULT_SLOT_CAPACITY: u32 = 10;
const DEFAULT_CONSULTATION_DURATION_MINUTES: u32 = 15;
const DEFAULT_BUFFER_TIME_MINUTES: u32 = 5;
const DEFAULT_FOLLOWUP_ELIGIBILITY_DAYS: u32 = 30;
const DEFAULT_MAX_REALLOCATION_ATTEMPTS: u32 = 3;

/// Engine-wide configuration loaded once from the process environment. Every
/// field has a safe default; a missing env var is logged at `warn` rather
/// than treated as fatal, mirroring how the rest of the stack tolerates an
/// incomplete `.env` during local development.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_slot_capacity: u32,
    pub consultation_duration_minutes: u32,
    pub buffer_time_minutes: u32,
    pub followup_eligibility_days: u32,
    pub max_reallocation_attempts: u32,
    base_scores: HashMap<String, i32>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let config = Self {
            default_slot_capacity: env_u32("CAPACITY_DEFAULT_SLOT_CAPACITY", DEFAULT_SLOT_CAPACITY),
            consultation_duration_minutes: env_u32(
                "TIMING_CONSULTATION_DURATION",
                DEFAULT_CONSULTATION_DURATION_MINUTES,
            ),
            buffer_time_minutes: env_u32("TIMING_BUFFER_TIME", DEFAULT_BUFFER_TIME_MINUTES),
            followup_eligibility_days: env_u32(
                "BUSINESS_FOLLOWUP_ELIGIBILITY_DAYS",
                DEFAULT_FOLLOWUP_ELIGIBILITY_DAYS,
            ),
            max_reallocation_attempts: env_u32(
                "SYSTEM_MAX_REALLOCATION_ATTEMPTS",
                DEFAULT_MAX_REALLOCATION_ATTEMPTS,
            ),
            base_scores: DEFAULT_BASE_SCORES
                .iter()
                .map(|(source, default)| {
                    let env_key = format!("PRIORITY_{}_BASE_SCORE", source.to_uppercase());
                    (source.to_string(), env_i32(&env_key, *default))
                })
                .collect(),
        };

        config
    }

    /// Default base priority for `source`, `None` if `source` is unknown.
    pub fn base_score(&self, source: &str) -> Option<i32> {
        self.base_scores.get(source).copied()
    }
}

#[async_trait]
impl ConfigSource for EngineConfig {
    async fn get(&self, key: &str) -> Option<String> {
        if let Some(source) = key
            .strip_prefix("priority.")
            .and_then(|rest| rest.strip_suffix(".base_score"))
        {
            return self.base_score(source).map(|v| v.to_string());
        }

        match key {
            "capacity.default_slot_capacity" => Some(self.default_slot_capacity.to_string()),
            "timing.consultation_duration" => Some(self.consultation_duration_minutes.to_string()),
            "timing.buffer_time" => Some(self.buffer_time_minutes.to_string()),
            "business.followup_eligibility_days" => {
                Some(self.followup_eligibility_days.to_string())
            }
            "system.max_reallocation_attempts" => {
                Some(self.max_reallocation_attempts.to_string())
            }
            _ => None,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!("{key} set to a non-numeric value, using default {default}");
            default
        }),
        Err(_) => {
            warn!("{key} not set, using default {default}");
            default
        }
    }
}

fn env_i32(key: &str, default: i32) -> i32 {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!("{key} set to a non-numeric value, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CREDENTIAL_KEY: &str = "gemini_api_key";

/// Models tried in order when no model is pinned.
pub const MODEL_PREFERENCE: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-1.5-flash",
    "gemini-1.5-pro",
];

/// Tunables for one agent session. Durations are stored in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub step_budget: u32,
    pub readiness_poll_ms: u64,
    pub readiness_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub context_window: usize,
    pub body_text_max_chars: usize,
    pub api_base: String,
    pub model_preference: Vec<String>,
    pub model: Option<String>,
    pub credential_key: String,
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            step_budget: 12,
            readiness_poll_ms: 150,
            readiness_timeout_ms: 5_000,
            max_attempts: 3,
            initial_backoff_ms: 300,
            context_window: 6,
            body_text_max_chars: 8_000,
            api_base: DEFAULT_API_BASE.to_string(),
            model_preference: MODEL_PREFERENCE.iter().map(|m| m.to_string()).collect(),
            model: None,
            credential_key: DEFAULT_CREDENTIAL_KEY.to_string(),
            port: 3000,
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `GOAL_PILOT_*` variables (after loading `.env`).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        read_number(&lookup, "GOAL_PILOT_STEP_BUDGET", &mut config.step_budget);
        read_number(&lookup, "GOAL_PILOT_READINESS_POLL_MS", &mut config.readiness_poll_ms);
        read_number(
            &lookup,
            "GOAL_PILOT_READINESS_TIMEOUT_MS",
            &mut config.readiness_timeout_ms,
        );
        read_number(&lookup, "GOAL_PILOT_MAX_ATTEMPTS", &mut config.max_attempts);
        read_number(&lookup, "GOAL_PILOT_BACKOFF_MS", &mut config.initial_backoff_ms);
        read_number(&lookup, "GOAL_PILOT_CONTEXT_WINDOW", &mut config.context_window);
        read_number(&lookup, "GOAL_PILOT_PORT", &mut config.port);

        if let Some(base) = lookup("GOAL_PILOT_API_BASE").filter(|s| !s.trim().is_empty()) {
            config.api_base = base.trim().trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("GOAL_PILOT_MODEL").filter(|s| !s.trim().is_empty()) {
            config.model = Some(model.trim().to_string());
        }
        if let Some(list) = lookup("GOAL_PILOT_MODEL_PREFERENCE") {
            let models: Vec<String> = list
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !models.is_empty() {
                config.model_preference = models;
            }
        }
        if let Some(key) = lookup("GOAL_PILOT_CREDENTIAL_KEY").filter(|s| !s.trim().is_empty()) {
            config.credential_key = key.trim().to_string();
        }

        // A zero budget would make every run a no-op.
        config.step_budget = config.step_budget.max(1);
        config.max_attempts = config.max_attempts.max(1);
        config
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

fn read_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!("ignoring {name}={raw:?}: not a valid number"),
    }
}

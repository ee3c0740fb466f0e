//! Process-local provider health with hysteresis: a provider turns
//! unhealthy after `fail_threshold` consecutive failures inside `window`,
//! stays out for `cooldown`, then gets one probe whose outcome decides.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::HealthConfig;
use crate::models::ProviderId;

#[derive(Debug, Default, Clone)]
struct ProviderHealth {
    consecutive_failures: u32,
    window_start: Option<DateTime<Utc>>,
    unhealthy_until: Option<DateTime<Utc>>,
    /// Cooldown expired, next outcome decides the state anew.
    probing: bool,
}

pub struct HealthChecker {
    state: RwLock<HashMap<ProviderId, ProviderHealth>>,
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn is_healthy(&self, id: ProviderId, now: DateTime<Utc>) -> bool {
        let state = self.state.read().expect("health state poisoned");
        match state.get(&id).and_then(|h| h.unhealthy_until) {
            Some(until) => until <= now,
            None => true,
        }
    }

    pub fn record_success(&self, id: ProviderId) {
        let mut state = self.state.write().expect("health state poisoned");
        state.remove(&id);
    }

    pub fn record_failure(&self, id: ProviderId, now: DateTime<Utc>) {
        let window = ChronoDuration::from_std(self.config.window).unwrap_or_default();
        let cooldown = ChronoDuration::from_std(self.config.cooldown).unwrap_or_default();

        let mut state = self.state.write().expect("health state poisoned");
        let health = state.entry(id).or_default();

        if health.unhealthy_until.is_some_and(|until| until <= now) {
            health.probing = true;
        }

        if health.probing {
            // failed its one probe, straight back out
            health.unhealthy_until = Some(now + cooldown);
            health.probing = false;
            health.consecutive_failures = 0;
            health.window_start = None;
            return;
        }

        match health.window_start {
            Some(start) if now - start <= window => health.consecutive_failures += 1,
            _ => {
                health.window_start = Some(now);
                health.consecutive_failures = 1;
            }
        }

        if health.consecutive_failures >= self.config.fail_threshold {
            health.unhealthy_until = Some(now + cooldown);
            health.consecutive_failures = 0;
            health.window_start = None;
        }
    }
}

//! Runtime configuration. Every knob has a built-in default and may be
//! overridden through a `MAILBRIDGE_`-prefixed environment variable, e.g.
//! `workers.count` becomes `MAILBRIDGE_WORKERS_COUNT`.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {key}, using the default");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            base_delay: env_secs("MAILBRIDGE_RETRY_BASE_DELAY", default.base_delay),
            max_delay: env_secs("MAILBRIDGE_RETRY_MAX_DELAY", default.max_delay),
            max_attempts: env_parse("MAILBRIDGE_RETRY_MAX_ATTEMPTS", default.max_attempts),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    pub send_timeout: Duration,
    /// Dispatcher sleep between empty claims.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 8,
            send_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            count: env_parse("MAILBRIDGE_WORKERS_COUNT", default.count),
            send_timeout: env_secs("MAILBRIDGE_WORKERS_SEND_TIMEOUT", default.send_timeout),
            poll_interval: env_secs("MAILBRIDGE_WORKERS_POLL_INTERVAL", default.poll_interval),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub claim_batch: usize,
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_batch: 16,
            visibility_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            claim_batch: env_parse("MAILBRIDGE_QUEUE_CLAIM_BATCH", default.claim_batch),
            visibility_timeout: env_secs(
                "MAILBRIDGE_QUEUE_VISIBILITY_TIMEOUT",
                default.visibility_timeout,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures within `window` before a provider is unhealthy.
    pub fail_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl HealthConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            fail_threshold: env_parse("MAILBRIDGE_HEALTH_FAIL_THRESHOLD", default.fail_threshold),
            window: env_secs("MAILBRIDGE_HEALTH_WINDOW", default.window),
            cooldown: env_secs("MAILBRIDGE_HEALTH_COOLDOWN", default.cooldown),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub signing_key: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl JwtConfig {
    pub fn from_env() -> Self {
        Self {
            signing_key: std::env::var("MAILBRIDGE_JWT_SIGNING_KEY").unwrap_or_else(|_| {
                warn!("MAILBRIDGE_JWT_SIGNING_KEY not set, generating an ephemeral key");
                uuid::Uuid::new_v4().to_string()
            }),
            access_ttl: env_secs("MAILBRIDGE_JWT_ACCESS_TTL", Duration::from_secs(15 * 60)),
            refresh_ttl: env_secs(
                "MAILBRIDGE_JWT_REFRESH_TTL",
                Duration::from_secs(7 * 24 * 60 * 60),
            ),
        }
    }

    pub fn for_tests(key: &str) -> Self {
        Self {
            signing_key: key.to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

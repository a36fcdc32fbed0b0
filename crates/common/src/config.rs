use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::types::Channel;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (idempotency, render and duplicate caches)
    pub redis_url: String,

    /// Redis connection string for the broker streams (defaults to `redis_url`)
    pub broker_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the enqueue API listens on
    pub api_port: u16,

    /// HS256 secret used to verify bearer tokens. Only the API needs it.
    pub jwt_secret: Option<String>,

    /// Lifetime of a `request_id` → `notification_id` mapping in seconds (default: 24h)
    pub idempotency_ttl_secs: u64,

    /// Base URL of the template service
    pub template_service_url: String,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// OneSignal application id for push delivery
    pub onesignal_app_id: Option<String>,

    /// OneSignal REST API key
    pub onesignal_api_key: Option<String>,

    pub broker: BrokerSettings,
    pub worker: WorkerSettings,
    pub breaker: BreakerSettings,
}

/// Connection and consumption settings for the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// Attempts made at startup before giving up
    pub connect_attempts: u32,
    /// Fixed delay between startup attempts
    pub connect_delay: Duration,
    /// Fixed delay between reconnect attempts once running
    pub reconnect_delay: Duration,
    /// Unacknowledged messages a single consumer may hold
    pub prefetch: usize,
    /// How long a message may sit unacknowledged before another consumer reclaims it
    pub claim_idle: Duration,
    /// How long a single receive call waits for new messages
    pub poll_wait: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_delay: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            prefetch: 1,
            claim_idle: Duration::from_secs(300),
            poll_wait: Duration::from_secs(1),
        }
    }
}

/// Delivery worker policy.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Channels this worker process consumes
    pub channels: Vec<Channel>,
    /// Redeliveries allowed before a message is dead-lettered
    pub max_retries: u32,
    /// Backoff base; the Nth redelivery waits `base * 2^(N-1)`
    pub retry_base_delay: Duration,
    /// TTL of cached template render data
    pub render_cache_ttl_secs: u64,
    /// TTL of processed-message markers
    pub processed_marker_ttl_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            channels: vec![Channel::Email, Channel::Push],
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            render_cache_ttl_secs: 3600,
            processed_marker_ttl_secs: 86400,
        }
    }
}

/// Circuit breaker tuning shared by every breaker in a worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    /// Per-call timeout
    pub timeout: Duration,
    /// Failure percentage within the window that opens the circuit
    pub error_threshold_pct: u32,
    /// Time spent open before a probe is allowed
    pub reset_timeout: Duration,
    /// Length of the rolling statistics window
    pub rolling_window: Duration,
    /// Minimum calls in the window before the percentage is evaluated
    pub volume_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            error_threshold_pct: 50,
            reset_timeout: Duration::from_secs(60),
            rolling_window: Duration::from_secs(30),
            volume_threshold: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            broker_url: std::env::var("BROKER_URL").unwrap_or_else(|_| redis_url.clone()),
            redis_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            api_port: env_or("API_PORT", 3000)?,
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            idempotency_ttl_secs: env_or("IDEMPOTENCY_TTL_SECS", 86400)?,
            template_service_url: std::env::var("TEMPLATE_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            onesignal_app_id: std::env::var("ONESIGNAL_APP_ID").ok(),
            onesignal_api_key: std::env::var("ONESIGNAL_API_KEY").ok(),
            broker: BrokerSettings {
                connect_attempts: env_or("BROKER_CONNECT_ATTEMPTS", 5)?,
                connect_delay: Duration::from_millis(env_or("BROKER_CONNECT_DELAY_MS", 5000)?),
                reconnect_delay: Duration::from_millis(env_or("BROKER_RECONNECT_DELAY_MS", 5000)?),
                prefetch: env_or("WORKER_PREFETCH", 1)?,
                claim_idle: Duration::from_millis(env_or("BROKER_CLAIM_IDLE_MS", 300_000)?),
                poll_wait: Duration::from_millis(env_or("BROKER_POLL_WAIT_MS", 1000)?),
            },
            worker: WorkerSettings {
                channels: parse_channels(
                    &std::env::var("WORKER_CHANNELS").unwrap_or_else(|_| "email,push".to_string()),
                )?,
                max_retries: env_or("WORKER_MAX_RETRIES", 3)?,
                retry_base_delay: Duration::from_millis(env_or("WORKER_RETRY_BASE_MS", 1000)?),
                render_cache_ttl_secs: env_or("RENDER_CACHE_TTL_SECS", 3600)?,
                processed_marker_ttl_secs: env_or("PROCESSED_MARKER_TTL_SECS", 86400)?,
            },
            breaker: BreakerSettings {
                timeout: Duration::from_millis(env_or("BREAKER_TIMEOUT_MS", 10_000)?),
                error_threshold_pct: env_or("BREAKER_ERROR_THRESHOLD_PCT", 50)?,
                reset_timeout: Duration::from_millis(env_or("BREAKER_RESET_TIMEOUT_MS", 60_000)?),
                rolling_window: Duration::from_millis(env_or("BREAKER_ROLLING_WINDOW_MS", 30_000)?),
                volume_threshold: env_or("BREAKER_VOLUME_THRESHOLD", 5)?,
            },
        })
    }
}

/// Read a numeric variable, falling back to `default` when it is unset.
fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> anyhow::Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}",
            key,
            std::any::type_name::<T>()
        )
    })
}

/// Parse a comma-separated channel list such as `email,push`.
pub fn parse_channels(raw: &str) -> anyhow::Result<Vec<Channel>> {
    let mut channels = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let channel: Channel = part
            .parse()
            .map_err(|_| anyhow::anyhow!("WORKER_CHANNELS contains unknown channel '{}'", part))?;
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if channels.is_empty() {
        anyhow::bail!("WORKER_CHANNELS must name at least one channel");
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channels() {
        assert_eq!(
            parse_channels("email, push").unwrap(),
            vec![Channel::Email, Channel::Push]
        );
        assert_eq!(parse_channels("push,push").unwrap(), vec![Channel::Push]);
    }

    #[test]
    fn test_parse_channels_rejects_unknown_and_empty() {
        assert!(parse_channels("email,sms").is_err());
        assert!(parse_channels(" , ").is_err());
    }

    #[test]
    fn test_parse_value_reports_variable() {
        let err = parse_value::<u32>("WORKER_MAX_RETRIES", "three").unwrap_err();
        assert!(err.to_string().contains("WORKER_MAX_RETRIES"));
        assert_eq!(parse_value::<u64>("X", " 42 ").unwrap(), 42);
    }

    #[test]
    fn test_defaults_match_documented_policy() {
        let worker = WorkerSettings::default();
        assert_eq!(worker.max_retries, 3);
        assert_eq!(worker.retry_base_delay, Duration::from_secs(1));

        let broker = BrokerSettings::default();
        assert_eq!(broker.prefetch, 1);
        assert_eq!(broker.connect_attempts, 5);

        let breaker = BreakerSettings::default();
        assert_eq!(breaker.error_threshold_pct, 50);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(60));
    }
}

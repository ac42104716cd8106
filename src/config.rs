use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
}

/// Retry budget, thresholds and batch shape of the verification pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    pub max_attempts: u32,
    /// Minimum oracle confidence (0-100) for a verdict to be acted on.
    pub confirm_threshold: f64,
    pub energy_tolerance: f64,
    pub batch_size: usize,
    pub workers: usize,
    pub worker_prefix: String,
    pub stale_after: Duration,
    pub time_budget: Duration,
    pub interval: Option<Duration>,
    pub start_jitter: Duration,
    pub category_bounds_path: Option<PathBuf>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confirm_threshold: 65.0,
            energy_tolerance: 0.20,
            batch_size: 10,
            workers: 1,
            worker_prefix: "verifier".into(),
            stale_after: Duration::from_secs(15 * 60),
            time_budget: Duration::from_secs(5 * 60),
            interval: None,
            start_jitter: Duration::from_millis(500),
            category_bounds_path: None,
        }
    }
}

impl VerifyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_attempts >= 1, "VERIFY_MAX_ATTEMPTS must be at least 1");
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.confirm_threshold),
            "VERIFY_CONFIRM_THRESHOLD must be within 0-100"
        );
        anyhow::ensure!(
            self.energy_tolerance > 0.0 && self.energy_tolerance.is_finite(),
            "VERIFY_ENERGY_TOLERANCE must be positive"
        );
        anyhow::ensure!(self.batch_size >= 1, "VERIFY_BATCH_SIZE must be at least 1");
        anyhow::ensure!(self.workers >= 1, "VERIFY_WORKERS must be at least 1");
        // Claims must stay fresh for the whole invocation.
        anyhow::ensure!(
            self.stale_after > self.time_budget,
            "VERIFY_STALE_AFTER_SECS must exceed VERIFY_TIME_BUDGET_SECS"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub verify: VerifyConfig,
    pub oracle: OracleConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let d = VerifyConfig::default();

        let verify = VerifyConfig {
            max_attempts: env_or("VERIFY_MAX_ATTEMPTS", d.max_attempts),
            confirm_threshold: env_or("VERIFY_CONFIRM_THRESHOLD", d.confirm_threshold),
            energy_tolerance: env_or("VERIFY_ENERGY_TOLERANCE", d.energy_tolerance),
            batch_size: env_or("VERIFY_BATCH_SIZE", d.batch_size),
            workers: env_or("VERIFY_WORKERS", d.workers),
            worker_prefix: std::env::var("VERIFY_WORKER_PREFIX").unwrap_or(d.worker_prefix),
            stale_after: secs_or("VERIFY_STALE_AFTER_SECS", d.stale_after),
            time_budget: secs_or("VERIFY_TIME_BUDGET_SECS", d.time_budget),
            interval: std::env::var("VERIFY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            start_jitter: Duration::from_millis(env_or("VERIFY_START_JITTER_MS", 500u64)),
            category_bounds_path: std::env::var("CATEGORY_BOUNDS_PATH").ok().map(PathBuf::from),
        };
        verify.validate()?;

        let oracle = OracleConfig {
            base_url: std::env::var("ORACLE_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("ORACLE_API_KEY")?,
            model: std::env::var("ORACLE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            timeout: secs_or("ORACLE_TIMEOUT_SECS", Duration::from_secs(30)),
            temperature: env_or("ORACLE_TEMPERATURE", 0.0f32),
        };

        Ok(Self { database_url, verify, oracle })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

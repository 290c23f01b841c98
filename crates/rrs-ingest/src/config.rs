//! Run configuration for the ingest binary
//!
//! Settings come from an optional `.env.local` / `.env.production` file plus
//! the process environment. A performance profile picks the thread count,
//! batch size and rate-limit strategy; individual `INGEST_*` / `RATE_LIMIT_*`
//! variables override the profile.

use clap::ValueEnum;
use rrs_common::{Result, RrsError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::storage::{RateLimitConfig, RateLimitStrategy, RetryPolicy};

// ============================================================================
// Configuration Constants
// ============================================================================

pub const DEFAULT_DATASET_DIR: &str = "RRS_Dataset";
pub const DEFAULT_ANNOTATIONS_FILE: &str = "qwen_annotations.json";
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
pub const PRODUCTION_FIXED_DELAY_MS: u64 = 100;

const LOCAL_ENV_FILE: &str = ".env.local";
const PRODUCTION_ENV_FILE: &str = ".env.production";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceProfile {
    /// Few threads, adaptive pacing
    Safe,
    /// Single thread, no pacing
    #[default]
    Balanced,
    /// Many threads, adaptive pacing
    Fast,
    /// Environment-dependent legacy settings
    Custom,
}

/// Thread count, batch size and pacing implied by a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSettings {
    pub threads: usize,
    pub batch_size: usize,
    pub rate_limit: RateLimitConfig,
}

impl PerformanceProfile {
    pub fn settings(self, environment: Environment) -> ProfileSettings {
        let max_delay = Duration::from_millis(DEFAULT_MAX_DELAY_MS);
        let adaptive = RateLimitConfig::adaptive(Duration::ZERO, max_delay);

        match self {
            PerformanceProfile::Safe => ProfileSettings {
                threads: 2,
                batch_size: 50,
                rate_limit: adaptive,
            },
            PerformanceProfile::Balanced => ProfileSettings {
                threads: 1,
                batch_size: 50,
                rate_limit: RateLimitConfig::default(),
            },
            PerformanceProfile::Fast => ProfileSettings {
                threads: 12,
                batch_size: 100,
                rate_limit: adaptive,
            },
            PerformanceProfile::Custom => match environment {
                Environment::Production => ProfileSettings {
                    threads: 1,
                    batch_size: 10,
                    rate_limit: RateLimitConfig::fixed(Duration::from_millis(
                        PRODUCTION_FIXED_DELAY_MS,
                    )),
                },
                Environment::Local => ProfileSettings {
                    threads: 16,
                    batch_size: 100,
                    rate_limit: RateLimitConfig::default(),
                },
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub environment: Environment,
    pub profile: PerformanceProfile,
    /// Record-processing workers; also upload workers outside production
    pub threads: usize,
    pub batch_size: usize,
    pub use_temp_storage: bool,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub dataset_paths: Vec<PathBuf>,
    pub annotations_file: PathBuf,
}

impl IngestConfig {
    /// Load the env file for the requested environment, then read settings.
    pub fn from_env(production: bool, profile: PerformanceProfile) -> Result<Self> {
        let environment = load_env_file(Path::new("."), production);
        Self::from_environment(environment, profile)
    }

    /// Read settings from the process environment only.
    pub fn from_environment(environment: Environment, profile: PerformanceProfile) -> Result<Self> {
        let base = profile.settings(environment);
        let mut rate_limit = base.rate_limit;

        if let Some(strategy) = env_parse::<RateLimitStrategy>("RATE_LIMIT_STRATEGY")? {
            rate_limit.strategy = strategy;
        }
        if let Some(ms) = env_parse::<u64>("RATE_LIMIT_INITIAL_DELAY_MS")? {
            rate_limit.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RATE_LIMIT_MAX_DELAY_MS")? {
            rate_limit.max_delay = Duration::from_millis(ms);
        }

        let mut retry = RetryPolicy::default();
        if let Some(attempts) = env_parse::<u32>("UPLOAD_MAX_ATTEMPTS")? {
            retry.max_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("UPLOAD_RETRY_BASE_DELAY_MS")? {
            retry = RetryPolicy::new(retry.max_attempts, Duration::from_millis(ms), retry.backoff_factor);
        }

        let dataset_paths = match std::env::var("DATASET_PATHS") {
            Ok(paths) if !paths.trim().is_empty() => std::env::split_paths(&paths).collect(),
            _ => default_dataset_paths(),
        };

        let annotations_file = std::env::var("ANNOTATIONS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ANNOTATIONS_FILE));

        let config = Self {
            environment,
            profile,
            threads: env_parse("INGEST_THREADS")?.unwrap_or(base.threads),
            batch_size: env_parse("INGEST_BATCH_SIZE")?.unwrap_or(base.batch_size),
            use_temp_storage: env_parse("INGEST_USE_TEMP_STORAGE")?.unwrap_or(false),
            rate_limit,
            retry,
            dataset_paths,
            annotations_file,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(RrsError::config("INGEST_THREADS must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(RrsError::config("INGEST_BATCH_SIZE must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(RrsError::config("UPLOAD_MAX_ATTEMPTS must be greater than 0"));
        }
        if self.rate_limit.max_delay < self.rate_limit.initial_delay {
            return Err(RrsError::config(format!(
                "RATE_LIMIT_MAX_DELAY_MS ({:?}) cannot be below RATE_LIMIT_INITIAL_DELAY_MS ({:?})",
                self.rate_limit.max_delay, self.rate_limit.initial_delay
            )));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Production storage gets strictly sequential uploads.
    pub fn upload_workers(&self) -> usize {
        if self.is_production() {
            1
        } else {
            self.threads
        }
    }
}

/// Load `.env.local` or `.env.production` from `dir`.
///
/// Without a local file the production file is used and the environment is
/// reported as production. Missing files are not an error.
pub fn load_env_file(dir: &Path, production: bool) -> Environment {
    let local = dir.join(LOCAL_ENV_FILE);
    let (path, environment) = if !production && local.exists() {
        (local, Environment::Local)
    } else {
        (dir.join(PRODUCTION_ENV_FILE), Environment::Production)
    };

    match dotenvy::from_path(&path) {
        Ok(()) => debug!(path = %path.display(), "Loaded environment file"),
        Err(e) => debug!(path = %path.display(), error = %e, "No environment file loaded"),
    }
    environment
}

pub fn default_dataset_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(3);
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(DEFAULT_DATASET_DIR));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join("Downloads").join(DEFAULT_DATASET_DIR));
        paths.push(home.join(DEFAULT_DATASET_DIR));
    }
    paths
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RrsError::config(format!("{}='{}': {}", name, value, e))),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "INGEST_THREADS",
        "INGEST_BATCH_SIZE",
        "INGEST_USE_TEMP_STORAGE",
        "RATE_LIMIT_STRATEGY",
        "RATE_LIMIT_INITIAL_DELAY_MS",
        "RATE_LIMIT_MAX_DELAY_MS",
        "UPLOAD_MAX_ATTEMPTS",
        "UPLOAD_RETRY_BASE_DELAY_MS",
        "DATASET_PATHS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_profile_settings() {
        let safe = PerformanceProfile::Safe.settings(Environment::Local);
        assert_eq!((safe.threads, safe.batch_size), (2, 50));
        assert_eq!(safe.rate_limit.strategy, RateLimitStrategy::Adaptive);

        let balanced = PerformanceProfile::Balanced.settings(Environment::Local);
        assert_eq!((balanced.threads, balanced.batch_size), (1, 50));
        assert_eq!(balanced.rate_limit.strategy, RateLimitStrategy::Off);

        let fast = PerformanceProfile::Fast.settings(Environment::Local);
        assert_eq!((fast.threads, fast.batch_size), (12, 100));
    }

    #[test]
    fn test_custom_profile_depends_on_environment() {
        let prod = PerformanceProfile::Custom.settings(Environment::Production);
        assert_eq!((prod.threads, prod.batch_size), (1, 10));
        assert_eq!(prod.rate_limit.strategy, RateLimitStrategy::Fixed);
        assert_eq!(prod.rate_limit.initial_delay, Duration::from_millis(100));

        let local = PerformanceProfile::Custom.settings(Environment::Local);
        assert_eq!((local.threads, local.batch_size), (16, 100));
        assert_eq!(local.rate_limit.strategy, RateLimitStrategy::Off);
    }

    #[test]
    #[serial]
    fn test_env_overrides_profile() {
        clear_env();
        std::env::set_var("INGEST_THREADS", "4");
        std::env::set_var("INGEST_BATCH_SIZE", "25");
        std::env::set_var("INGEST_USE_TEMP_STORAGE", "true");
        std::env::set_var("RATE_LIMIT_STRATEGY", "adaptive");
        std::env::set_var("RATE_LIMIT_INITIAL_DELAY_MS", "50");
        std::env::set_var("UPLOAD_MAX_ATTEMPTS", "3");

        let config =
            IngestConfig::from_environment(Environment::Local, PerformanceProfile::Balanced).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.batch_size, 25);
        assert!(config.use_temp_storage);
        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::Adaptive);
        assert_eq!(config.rate_limit.initial_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_attempts, 3);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        std::env::set_var("INGEST_THREADS", "0");
        assert!(IngestConfig::from_environment(Environment::Local, PerformanceProfile::Fast).is_err());

        std::env::set_var("INGEST_THREADS", "many");
        assert!(IngestConfig::from_environment(Environment::Local, PerformanceProfile::Fast).is_err());

        clear_env();
        std::env::set_var("RATE_LIMIT_INITIAL_DELAY_MS", "9000");
        std::env::set_var("RATE_LIMIT_MAX_DELAY_MS", "1000");
        assert!(IngestConfig::from_environment(Environment::Local, PerformanceProfile::Safe).is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_dataset_paths_from_env() {
        clear_env();
        let joined = std::env::join_paths(["/data/a", "/data/b"]).unwrap();
        std::env::set_var("DATASET_PATHS", &joined);

        let config =
            IngestConfig::from_environment(Environment::Local, PerformanceProfile::Balanced).unwrap();
        assert_eq!(
            config.dataset_paths,
            vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_upload_workers() {
        clear_env();
        let mut config =
            IngestConfig::from_environment(Environment::Local, PerformanceProfile::Fast).unwrap();
        assert_eq!(config.upload_workers(), 12);

        config.environment = Environment::Production;
        assert_eq!(config.upload_workers(), 1);
    }

    #[test]
    fn test_load_env_file_prefers_local() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(load_env_file(tmp.path(), false), Environment::Production);

        std::fs::write(tmp.path().join(LOCAL_ENV_FILE), "").unwrap();
        assert_eq!(load_env_file(tmp.path(), false), Environment::Local);
        assert_eq!(load_env_file(tmp.path(), true), Environment::Production);
    }
}

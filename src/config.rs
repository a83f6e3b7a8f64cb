//! Configuration for beadwork.
//!
//! Every value comes from the process environment (after loading `.env`);
//! unset variables fall back to the defaults below.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub heartbeat: HeartbeatConfig,
    pub message_bus: MessageBusConfig,
    pub knowledge: KnowledgeConfig,
    pub provider_heartbeat: ProviderHeartbeatConfig,
    pub ci_monitor: CiMonitorConfig,
    pub secrets: SecretsConfig,
    pub instance: InstanceConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database: DatabaseConfig::resolve()?,
            heartbeat: HeartbeatConfig::resolve()?,
            message_bus: MessageBusConfig::resolve()?,
            knowledge: KnowledgeConfig::resolve()?,
            provider_heartbeat: ProviderHeartbeatConfig::resolve()?,
            ci_monitor: CiMonitorConfig::resolve()?,
            secrets: SecretsConfig::resolve()?,
            instance: InstanceConfig::resolve()?,
        })
    }
}

/// Which store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Memory,
    LibSql,
    Postgres,
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(DatabaseBackend::Memory),
            "libsql" | "sqlite" => Ok(DatabaseBackend::LibSql),
            "postgres" | "postgresql" => Ok(DatabaseBackend::Postgres),
            other => Err(format!("unknown backend '{}', expected memory|libsql|postgres", other)),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: PathBuf,
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_user: String,
    pub postgres_password: SecretString,
    pub postgres_db: String,
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::LibSql,
            libsql_path: PathBuf::from("./beadwork.db"),
            postgres_host: "localhost".to_string(),
            postgres_port: 5432,
            postgres_user: "beadwork".to_string(),
            postgres_password: SecretString::from(String::new()),
            postgres_db: "beadwork".to_string(),
            pool_size: 10,
        }
    }
}

impl DatabaseConfig {
    /// In-memory store, for tests and dry runs.
    pub fn memory() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            ..Self::default()
        }
    }

    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            backend: parse_optional_env("DATABASE_BACKEND", defaults.backend)?,
            libsql_path: optional_env("LIBSQL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.libsql_path),
            postgres_host: optional_env("POSTGRES_HOST").unwrap_or(defaults.postgres_host),
            postgres_port: parse_optional_env("POSTGRES_PORT", defaults.postgres_port)?,
            postgres_user: optional_env("POSTGRES_USER").unwrap_or(defaults.postgres_user),
            postgres_password: optional_env("POSTGRES_PASSWORD")
                .map(SecretString::from)
                .unwrap_or(defaults.postgres_password),
            postgres_db: optional_env("POSTGRES_DB").unwrap_or(defaults.postgres_db),
            pool_size: parse_optional_env("DATABASE_POOL_SIZE", defaults.pool_size)?,
        })
    }
}

/// Heartbeat loop ("Ralph") configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub max_dispatches_per_beat: usize,
    /// Working agents idle longer than this are reset.
    pub stuck_agent_after: Duration,
    /// Age a transient provider block must exceed before recovery.
    pub provider_block_recovery: Duration,
    /// Age an auth block must exceed before recovery.
    pub auth_block_recovery: Duration,
    /// Run auto-recovery on every Nth beat.
    pub recovery_every_n_beats: u64,
    /// Lease name the loop must hold before dispatching.
    pub lock_name: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_dispatches_per_beat: 50,
            stuck_agent_after: Duration::from_secs(5 * 60),
            provider_block_recovery: Duration::from_secs(30 * 60),
            auth_block_recovery: Duration::from_secs(2 * 60 * 60),
            recovery_every_n_beats: 10,
            lock_name: "ralph".to_string(),
        }
    }
}

impl HeartbeatConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let recovery_every_n_beats =
            parse_optional_env("RECOVERY_EVERY_N_BEATS", defaults.recovery_every_n_beats)?;
        if recovery_every_n_beats == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RECOVERY_EVERY_N_BEATS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            interval: secs_env("HEARTBEAT_INTERVAL_SECS", defaults.interval)?,
            max_dispatches_per_beat: parse_optional_env(
                "MAX_DISPATCHES_PER_BEAT",
                defaults.max_dispatches_per_beat,
            )?,
            stuck_agent_after: minutes_env("STUCK_AGENT_MINUTES", defaults.stuck_agent_after)?,
            provider_block_recovery: minutes_env(
                "PROVIDER_BLOCK_RECOVERY_MINUTES",
                defaults.provider_block_recovery,
            )?,
            auth_block_recovery: minutes_env(
                "AUTH_BLOCK_RECOVERY_MINUTES",
                defaults.auth_block_recovery,
            )?,
            recovery_every_n_beats,
            lock_name: defaults.lock_name,
        })
    }
}

/// Agent message bus configuration.
#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    /// Per-agent history capacity.
    pub history_cap: usize,
    /// Capacity of each subscription channel.
    pub subscription_buffer: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            history_cap: 1000,
            subscription_buffer: 256,
        }
    }
}

impl MessageBusConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            history_cap: parse_optional_env("MESSAGE_HISTORY_CAP", defaults.history_cap)?,
            subscription_buffer: defaults.subscription_buffer,
        })
    }
}

/// Lesson retrieval tuning.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub half_life_days: f64,
    pub relevance_weight: f64,
    pub similarity_weight: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            half_life_days: 7.0,
            relevance_weight: 0.3,
            similarity_weight: 0.7,
        }
    }
}

impl KnowledgeConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let half_life_days = parse_optional_env("LESSON_HALF_LIFE_DAYS", defaults.half_life_days)?;
        if half_life_days <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "LESSON_HALF_LIFE_DAYS".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(Self {
            half_life_days,
            relevance_weight: parse_optional_env(
                "LESSON_RELEVANCE_WEIGHT",
                defaults.relevance_weight,
            )?,
            similarity_weight: parse_optional_env(
                "LESSON_SIMILARITY_WEIGHT",
                defaults.similarity_weight,
            )?,
        })
    }
}

/// Provider probing configuration.
#[derive(Debug, Clone)]
pub struct ProviderHeartbeatConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub activity_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for ProviderHeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            activity_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(120),
        }
    }
}

impl ProviderHeartbeatConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            interval: secs_env("PROVIDER_HEARTBEAT_SECS", defaults.interval)?,
            ..defaults
        })
    }
}

/// CI monitor configuration. The monitor is off unless a repo is set.
#[derive(Debug, Clone)]
pub struct CiMonitorConfig {
    pub interval: Duration,
    pub repo: Option<String>,
    /// Project that receives filed beads.
    pub project_id: String,
}

impl Default for CiMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            repo: None,
            project_id: String::new(),
        }
    }
}

impl CiMonitorConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            interval: secs_env("CI_MONITOR_INTERVAL_SECS", defaults.interval)?,
            repo: optional_env("CI_MONITOR_REPO"),
            project_id: optional_env("CI_MONITOR_PROJECT").unwrap_or(defaults.project_id),
        })
    }
}

/// Secrets configuration.
#[derive(Debug, Clone, Default)]
pub struct SecretsConfig {
    /// Master key for at-rest encryption. Hex or raw, at least 32 bytes.
    pub master_key: Option<SecretString>,
}

impl SecretsConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            master_key: optional_env("SECRETS_MASTER_KEY").map(SecretString::from),
        })
    }
}

/// Identity of this orchestrator process.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub lock_ttl: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

impl InstanceConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lock_ttl = secs_env("LOCK_TTL_SECS", defaults.lock_ttl)?;
        if lock_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "LOCK_TTL_SECS".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(Self {
            instance_id: optional_env("INSTANCE_ID").unwrap_or(defaults.instance_id),
            lock_ttl,
        })
    }
}

// ==================== Helpers ====================

/// Read an env var, treating empty as unset.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_optional_env(key, default.as_secs()).map(Duration::from_secs)
}

fn minutes_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_optional_env(key, default.as_secs() / 60).map(|m| Duration::from_secs(m * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.interval, Duration::from_secs(10));
        assert_eq!(hb.max_dispatches_per_beat, 50);
        assert_eq!(hb.stuck_agent_after, Duration::from_secs(300));
        assert_eq!(hb.provider_block_recovery, Duration::from_secs(1800));
        assert_eq!(hb.auth_block_recovery, Duration::from_secs(7200));
        assert_eq!(MessageBusConfig::default().history_cap, 1000);

        let k = KnowledgeConfig::default();
        assert_eq!(k.half_life_days, 7.0);
        assert_eq!(k.relevance_weight, 0.3);
        assert_eq!(k.similarity_weight, 0.7);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Postgres".parse::<DatabaseBackend>(), Ok(DatabaseBackend::Postgres));
        assert_eq!("sqlite".parse::<DatabaseBackend>(), Ok(DatabaseBackend::LibSql));
        assert!("oracle".parse::<DatabaseBackend>().is_err());
    }

    #[test]
    fn test_parse_optional_env_reports_key() {
        // SAFETY: test-local variable name, not read by other tests.
        unsafe { std::env::set_var("BEADWORK_TEST_BAD_NUMBER", "ten") };
        let err = parse_optional_env("BEADWORK_TEST_BAD_NUMBER", 10usize).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "BEADWORK_TEST_BAD_NUMBER"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(parse_optional_env("BEADWORK_TEST_UNSET_NUMBER", 7usize).unwrap(), 7);
    }
}

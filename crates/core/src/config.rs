use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_list(profile: &str, key: &str, default: &[&str]) -> Vec<String> {
    match profiled_env_opt(profile, key) {
        Some(v) => parse_list(&v),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Splits a comma-separated list, trimming blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub pipeline: PipelineConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `REGSYNC_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("REGSYNC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
            registry: RegistryConfig::from_env_profiled(p),
            pipeline: PipelineConfig::from_env_profiled(p),
            sync: SyncConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:  host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  storage:   data_dir={}", self.storage.data_dir.display());
        tracing::info!(
            "  registry:  url={}, page_size={}, timeout={}s, retries={}",
            self.registry.base_url,
            self.registry.page_size,
            self.registry.timeout_secs,
            self.registry.max_retries
        );
        tracing::info!(
            "  pipeline:  entity={}, subtypes={}, workers={}, fetch_concurrency={}",
            self.pipeline.entity,
            self.pipeline.subtypes.join(","),
            self.pipeline.workers,
            self.pipeline.fetch_concurrency
        );
        tracing::info!(
            "  sync:      window_months={}, batch_size={}",
            self.sync.window_months,
            self.sync.batch_size
        );
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full URL; takes precedence over the individual fields.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            database_url: profiled_env_opt(p, "DATABASE_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "regsync"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.database_url.is_some() || self.username.is_some()
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn enriched_dir(&self) -> PathBuf {
        self.data_dir.join("enriched")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.data_dir.join("control")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.data_dir.join("pending")
    }

    pub fn incidents_dir(&self) -> PathBuf {
        self.data_dir.join("incidents")
    }

    pub fn changesets_dir(&self) -> PathBuf {
        self.data_dir.join("changesets")
    }
}

// ── Remote registry ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub base_url: String,
    pub page_size: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RegistryConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_or(p, "REGISTRY_BASE_URL", "http://localhost:8080/api"),
            page_size: profiled_env_u32(p, "REGISTRY_PAGE_SIZE", 1000),
            timeout_secs: profiled_env_u64(p, "REGISTRY_TIMEOUT_SECS", 30),
            max_retries: profiled_env_u32(p, "REGISTRY_MAX_RETRIES", 5),
            backoff_ms: profiled_env_u64(p, "REGISTRY_BACKOFF_MS", 500),
            max_backoff_ms: profiled_env_u64(p, "REGISTRY_MAX_BACKOFF_MS", 30_000),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub entity: String,
    pub subtypes: Vec<String>,
    /// Upper bound on concurrent record fetches inside one Extract unit.
    pub fetch_concurrency: usize,
    pub workers: usize,
    pub record_max_retries: u32,
}

impl PipelineConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            entity: profiled_env_or(p, "PIPELINE_ENTITY", crate::unit::DEFAULT_ENTITY),
            subtypes: profiled_env_list(p, "PIPELINE_SUBTYPES", crate::unit::DEFAULT_SUBTYPES),
            fetch_concurrency: profiled_env_usize(p, "PIPELINE_FETCH_CONCURRENCY", 8),
            workers: profiled_env_usize(p, "PIPELINE_WORKERS", 4),
            record_max_retries: profiled_env_u32(p, "PIPELINE_RECORD_MAX_RETRIES", 3),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entity: crate::unit::DEFAULT_ENTITY.to_string(),
            subtypes: crate::unit::DEFAULT_SUBTYPES.iter().map(|s| s.to_string()).collect(),
            fetch_concurrency: 8,
            workers: 4,
            record_max_retries: 3,
        }
    }
}

// ── Reconciliation ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub window_months: u32,
    pub batch_size: usize,
    pub sum_tolerance: f64,
}

impl SyncConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            window_months: profiled_env_u32(p, "SYNC_WINDOW_MONTHS", 48),
            batch_size: profiled_env_usize(p, "SYNC_BATCH_SIZE", 500),
            sum_tolerance: profiled_env_opt(p, "SYNC_SUM_TOLERANCE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1e-2),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_months: 48,
            batch_size: 500,
            sum_tolerance: 1e-2,
        }
    }
}

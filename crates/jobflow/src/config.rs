//! Environment-driven configuration, following the same `dotenvy` + fallback-key pattern used
//! throughout this ecosystem for small services.

use crate::repository::ClaimSort;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub poll_interval_ms: u64,
    pub default_lock_lifetime_secs: i64,
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    pub default_lock_limit: usize,
    pub max_db_connections: u32,
    pub fork_mode: bool,
    pub sort_by_priority_first: bool,
    pub worker_name: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database_url: env_or_fallback("JOBFLOW_DATABASE_URL", "DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost/jobflow".to_string()),
            poll_interval_ms: env_or_fallback("JOBFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(5_000),
            default_lock_lifetime_secs: env_or_fallback("JOBFLOW_LOCK_LIFETIME_SECS", "LOCK_LIFETIME_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(600),
            default_concurrency: env_or_fallback("JOBFLOW_CONCURRENCY", "CONCURRENCY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            max_concurrency: env_or_fallback("JOBFLOW_MAX_CONCURRENCY", "MAX_CONCURRENCY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),
            default_lock_limit: env_or_fallback("JOBFLOW_LOCK_LIMIT", "LOCK_LIMIT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            max_db_connections: env_or_fallback("JOBFLOW_MAX_DB_CONNECTIONS", "MAX_DB_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            fork_mode: env_bool("JOBFLOW_FORK_MODE", false),
            sort_by_priority_first: env_bool("JOBFLOW_SORT_BY_PRIORITY", false),
            worker_name: env_or_fallback("JOBFLOW_WORKER_NAME", "WORKER_NAME")
                .unwrap_or_else(|| "jobflow-worker".to_string()),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_lock_lifetime: chrono::Duration::seconds(self.default_lock_lifetime_secs),
            default_concurrency: self.default_concurrency,
            max_concurrency: self.max_concurrency,
            default_lock_limit: self.default_lock_limit,
            poll_interval: std::time::Duration::from_millis(self.poll_interval_ms),
            sort: if self.sort_by_priority_first {
                ClaimSort::PriorityThenNextRun
            } else {
                ClaimSort::NextRunThenPriority
            },
            name: self.worker_name.clone(),
        }
    }
}

/// Read `primary`, falling back to `fallback` if unset, matching the teacher-ecosystem convention
/// of supporting both an app-prefixed and a generic env var name.
fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary).ok().or_else(|| std::env::var(fallback).ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

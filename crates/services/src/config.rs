//! Sync and timing knobs, overridable from the environment.

use std::env;
use std::time::Duration;

/// Tunables for the persistence pipeline and the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Quiet period before a scheduled remote write fires.
    pub debounce: Duration,
    /// Inline retries after the first failed attempt on a 5xx response.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Outbox entries older than this are dropped at the next sweep.
    pub outbox_max_age: Duration,
    /// Outbox entries that reached this retry count are dropped at the next sweep.
    pub outbox_max_retries: u32,
    pub outbox_sweep_interval: Duration,
    /// Window during which a reset session id cannot be restored.
    pub abandon_guard: Duration,
    /// Instruction countdown armed when a section auto-advances; zero starts it directly.
    pub instruction_seconds: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(800),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(4),
            outbox_max_age: Duration::from_secs(5 * 60),
            outbox_max_retries: 3,
            outbox_sweep_interval: Duration::from_secs(30),
            abandon_guard: Duration::from_secs(5),
            instruction_seconds: 0,
        }
    }
}

impl SyncSettings {
    /// Defaults with `EXAM_SYNC_*`, `EXAM_OUTBOX_*` and `EXAM_INSTRUCTION_SECS` overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(ms) = env_u64("EXAM_SYNC_DEBOUNCE_MS") {
            settings.debounce = Duration::from_millis(ms);
        }
        if let Some(retries) = env_u64("EXAM_SYNC_MAX_RETRIES") {
            settings.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(secs) = env_u64("EXAM_OUTBOX_MAX_AGE_SECS") {
            settings.outbox_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("EXAM_OUTBOX_SWEEP_SECS") {
            settings.outbox_sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("EXAM_INSTRUCTION_SECS") {
            settings.instruction_seconds = u32::try_from(secs).unwrap_or(u32::MAX);
        }
        settings
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

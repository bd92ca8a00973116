//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled-in default and an env override parsed with
//! `env_parse`. Unparseable values fall back to the default rather than
//! failing startup. `SyncConfig::default()` never reads the environment so
//! tests get deterministic timing.

use std::time::Duration;

const DEFAULT_DRAG_THROTTLE_MS: u64 = 8;
const DEFAULT_DRAG_DEBOUNCE_MS: u64 = 50;
const DEFAULT_DRAG_FAST_VELOCITY: f64 = 1.0;
const DEFAULT_EPHEMERAL_STALE_MS: i64 = 1000;
const DEFAULT_SMOOTHING_BLEND: f64 = 0.2;
const DEFAULT_CURSOR_THROTTLE_MS: u64 = 50;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_HISTORY_CAPACITY: usize = 50;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_SHAPE_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// ENGINE
// =============================================================================

/// Tuning knobs for the client-side coordination engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    /// Minimum spacing between immediate ephemeral writes for fast drags.
    pub drag_throttle: Duration,
    /// Quiet period before the settled ephemeral write fires.
    pub drag_debounce: Duration,
    /// Velocity (px/ms) at or above which the base throttle applies.
    pub drag_fast_velocity: f64,
    /// Age after which an ephemeral position is ignored by consumers.
    pub ephemeral_stale_ms: i64,
    /// Smoothstep progress added per animation tick.
    pub smoothing_blend: f64,
    /// Minimum spacing between outgoing cursor updates.
    pub cursor_throttle: Duration,
    /// Presence refresh period.
    pub heartbeat_interval: Duration,
    /// Maximum retained history operations.
    pub history_capacity: usize,
    /// Relay request timeout for remote stores.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drag_throttle: Duration::from_millis(DEFAULT_DRAG_THROTTLE_MS),
            drag_debounce: Duration::from_millis(DEFAULT_DRAG_DEBOUNCE_MS),
            drag_fast_velocity: DEFAULT_DRAG_FAST_VELOCITY,
            ephemeral_stale_ms: DEFAULT_EPHEMERAL_STALE_MS,
            smoothing_blend: DEFAULT_SMOOTHING_BLEND,
            cursor_throttle: Duration::from_millis(DEFAULT_CURSOR_THROTTLE_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            drag_throttle: Duration::from_millis(env_parse("DRAG_THROTTLE_MS", DEFAULT_DRAG_THROTTLE_MS)),
            drag_debounce: Duration::from_millis(env_parse("DRAG_DEBOUNCE_MS", DEFAULT_DRAG_DEBOUNCE_MS)),
            drag_fast_velocity: env_parse("DRAG_FAST_VELOCITY", DEFAULT_DRAG_FAST_VELOCITY),
            ephemeral_stale_ms: env_parse("EPHEMERAL_STALE_MS", DEFAULT_EPHEMERAL_STALE_MS),
            smoothing_blend: env_parse("SMOOTHING_BLEND", DEFAULT_SMOOTHING_BLEND),
            cursor_throttle: Duration::from_millis(env_parse("CURSOR_THROTTLE_MS", DEFAULT_CURSOR_THROTTLE_MS)),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )),
            history_capacity: env_parse("HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY),
            request_timeout: Duration::from_millis(env_parse("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)),
        }
    }
}

// =============================================================================
// RELAY
// =============================================================================

/// Relay server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    /// Postgres URL. `None` runs the relay purely in memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub shape_flush_interval: Duration,
    /// Per-connection outbound frame queue depth.
    pub client_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            shape_flush_interval: Duration::from_millis(DEFAULT_SHAPE_FLUSH_INTERVAL_MS),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            shape_flush_interval: Duration::from_millis(env_parse(
                "SHAPE_FLUSH_INTERVAL_MS",
                DEFAULT_SHAPE_FLUSH_INTERVAL_MS,
            )),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_missing_returns_default() {
        let val: usize = env_parse("__CANVAS_SYNC_TEST_MISSING__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn env_parse_present_valid() {
        unsafe { std::env::set_var("__CANVAS_SYNC_TEST_VALID__", "99") };
        let val: u64 = env_parse("__CANVAS_SYNC_TEST_VALID__", 0);
        assert_eq!(val, 99);
        unsafe { std::env::remove_var("__CANVAS_SYNC_TEST_VALID__") };
    }

    #[test]
    fn env_parse_present_invalid_returns_default() {
        unsafe { std::env::set_var("__CANVAS_SYNC_TEST_INVALID__", "fast") };
        let val: f64 = env_parse("__CANVAS_SYNC_TEST_INVALID__", 0.5);
        assert!((val - 0.5).abs() < f64::EPSILON);
        unsafe { std::env::remove_var("__CANVAS_SYNC_TEST_INVALID__") };
    }

    #[test]
    fn sync_defaults_match_constants() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.drag_throttle, Duration::from_millis(8));
        assert_eq!(cfg.drag_debounce, Duration::from_millis(50));
        assert_eq!(cfg.ephemeral_stale_ms, 1000);
        assert_eq!(cfg.cursor_throttle, Duration::from_millis(50));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.history_capacity, 50);
        assert!((cfg.smoothing_blend - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn server_defaults_are_in_memory() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 3000);
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.client_channel_capacity, 256);
    }
}

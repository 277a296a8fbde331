//! Environment-driven orchestrator configuration.
//!
//! Everything here has a working default so `chaos scenario ...` runs with
//! no setup beyond a node binary on PATH. Role-tuning variables that the
//! node-under-test reads itself (publish retries, settle times, receive
//! windows) are not parsed here; spawned roles inherit the environment
//! verbatim.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Orchestrator knobs, resolved once at startup.
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Node-under-test binary (name on PATH or absolute path).
    pub node_bin: String,
    /// Parent directory for per-run artifact directories.
    pub out_dir: PathBuf,
    /// Whether the background resource sampler runs.
    pub metrics: bool,
    pub metrics_interval: Duration,
    /// Restart the relay with SIGKILL instead of SIGTERM in the line
    /// scenario (crash-like mid-run failure).
    pub relay_hard_kill: bool,
    /// Pause the subscriber for this long during the pair scenario
    /// (SIGSTOP/SIGCONT); zero disables the pause.
    pub sub_pause: Duration,
    /// Readiness polling budget per role.
    pub ready_attempts: u32,
    pub ready_interval: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            node_bin: "gossip-node".to_string(),
            out_dir: PathBuf::from("target/chaos-runs"),
            metrics: true,
            metrics_interval: Duration::from_millis(500),
            relay_hard_kill: false,
            sub_pause: Duration::ZERO,
            ready_attempts: 50,
            ready_interval: Duration::from_millis(200),
        }
    }
}

impl ChaosConfig {
    /// Build a config from `CHAOS_*` environment variables, falling back to
    /// defaults. Malformed values are warned about and ignored rather than
    /// aborting the run.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            node_bin: std::env::var("CHAOS_NODE_BIN").unwrap_or(defaults.node_bin),
            out_dir: std::env::var("CHAOS_OUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.out_dir),
            metrics: env_bool("CHAOS_METRICS").unwrap_or(defaults.metrics),
            metrics_interval: Duration::from_millis(
                env_u64("CHAOS_METRICS_INTERVAL_MS")
                    .unwrap_or(defaults.metrics_interval.as_millis() as u64),
            ),
            relay_hard_kill: env_bool("CHAOS_RELAY_HARD_KILL").unwrap_or(false),
            sub_pause: Duration::from_secs(env_u64("CHAOS_SUB_PAUSE_SECS").unwrap_or(0)),
            ready_attempts: env_u64("CHAOS_READY_ATTEMPTS")
                .map(|v| v as u32)
                .unwrap_or(defaults.ready_attempts),
            ready_interval: Duration::from_millis(
                env_u64("CHAOS_READY_INTERVAL_MS")
                    .unwrap_or(defaults.ready_interval.as_millis() as u64),
            ),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {}={:?}: not a non-negative integer", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!("ignoring {}={:?}: not a boolean", name, other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_chaos_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("CHAOS_") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_need_no_environment() {
        clear_chaos_env();
        let cfg = ChaosConfig::from_env();
        assert_eq!(cfg.node_bin, "gossip-node");
        assert_eq!(cfg.out_dir, PathBuf::from("target/chaos-runs"));
        assert!(cfg.metrics);
        assert_eq!(cfg.metrics_interval, Duration::from_millis(500));
        assert!(!cfg.relay_hard_kill);
        assert_eq!(cfg.sub_pause, Duration::ZERO);
    }

    #[test]
    #[serial]
    fn environment_overrides_apply() {
        clear_chaos_env();
        std::env::set_var("CHAOS_NODE_BIN", "/opt/bin/node-under-test");
        std::env::set_var("CHAOS_OUT_DIR", "/tmp/chaos");
        std::env::set_var("CHAOS_METRICS", "0");
        std::env::set_var("CHAOS_RELAY_HARD_KILL", "1");
        std::env::set_var("CHAOS_SUB_PAUSE_SECS", "3");

        let cfg = ChaosConfig::from_env();
        assert_eq!(cfg.node_bin, "/opt/bin/node-under-test");
        assert_eq!(cfg.out_dir, PathBuf::from("/tmp/chaos"));
        assert!(!cfg.metrics);
        assert!(cfg.relay_hard_kill);
        assert_eq!(cfg.sub_pause, Duration::from_secs(3));
        clear_chaos_env();
    }

    #[test]
    #[serial]
    fn malformed_values_fall_back_to_defaults() {
        clear_chaos_env();
        std::env::set_var("CHAOS_METRICS_INTERVAL_MS", "soon");
        std::env::set_var("CHAOS_RELAY_HARD_KILL", "maybe");

        let cfg = ChaosConfig::from_env();
        assert_eq!(cfg.metrics_interval, Duration::from_millis(500));
        assert!(!cfg.relay_hard_kill);
        clear_chaos_env();
    }
}

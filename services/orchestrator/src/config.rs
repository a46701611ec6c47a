//! Configuration for the orchestrator.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional TOML file, and `ORBIT_*` environment variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use orbit_reconcile::{BackoffPolicy, RestartPolicy};
use serde::{Deserialize, Serialize};

/// Environment variable prefix.
const ENV_PREFIX: &str = "ORBIT_";

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Expected interval between isolate heartbeats.
    pub heartbeat_period_ms: u64,

    /// Silence after which a Running isolate is declared Lost.
    pub heartbeat_timeout_ms: u64,

    /// Sweep interval; half the heartbeat period when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,

    /// Interval of the periodic retry of unplaced components.
    pub rescan_interval_ms: u64,

    /// Deadline of a placement command.
    pub command_timeout_ms: u64,

    /// Half-life of isolate crash counts.
    pub crash_half_life_ms: u64,

    /// Number of acknowledgement latencies averaged per isolate.
    pub latency_window: usize,

    /// Latency scoring 0.5 on the responsiveness criterion.
    pub latency_reference_ms: u64,

    /// Responsiveness score of an isolate with no samples.
    pub neutral_responsiveness: f64,

    /// Distance score of an isolate off the preferred node.
    pub distance_base: f64,

    pub weights: CriteriaWeights,

    pub restart: RestartConfig,

    /// Capacity of the inbound event channel.
    pub mailbox_size: usize,

    /// Capacity of the subscription broadcast channel.
    pub event_buffer: usize,

    /// Log level (trace, debug, info, warn, error), used when RUST_LOG is unset.
    pub log_level: String,
}

/// Weights of the built-in criteria.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaWeights {
    pub distance: f64,
    pub reliability: f64,
    pub responsiveness: f64,
    pub crash_affinity: f64,
}

impl Default for CriteriaWeights {
    fn default() -> Self {
        Self {
            distance: 1.0,
            reliability: 1.0,
            responsiveness: 1.0,
            crash_affinity: 0.5,
        }
    }
}

/// Restart supervision settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            max_restarts: policy.max_restarts,
            restart_window_ms: millis(policy.window),
            base_ms: millis(policy.backoff.base),
            max_ms: millis(policy.backoff.max),
            jitter: policy.backoff.jitter,
        }
    }
}

impl RestartConfig {
    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            window: Duration::from_millis(self.restart_window_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.base_ms),
                max: Duration::from_millis(self.max_ms),
                jitter: self.jitter,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: 1_000,
            heartbeat_timeout_ms: 3_000,
            sweep_interval_ms: None,
            rescan_interval_ms: 5_000,
            command_timeout_ms: 2_000,
            crash_half_life_ms: 600_000,
            latency_window: 16,
            latency_reference_ms: 100,
            neutral_responsiveness: 0.5,
            distance_base: 0.5,
            weights: CriteriaWeights::default(),
            restart: RestartConfig::default(),
            mailbox_size: 1024,
            event_buffer: 256,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Config::load`] with an explicit variable lookup.
    pub fn load_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config from {:?}", path))
    }

    /// Overrides fields from `lookup("ORBIT_<KEY>")`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let env = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        set(&env, "HEARTBEAT_PERIOD_MS", &mut self.heartbeat_period_ms)?;
        set(&env, "HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms)?;
        if let Some(raw) = env("SWEEP_INTERVAL_MS") {
            self.sweep_interval_ms = Some(parse("SWEEP_INTERVAL_MS", &raw)?);
        }
        set(&env, "RESCAN_INTERVAL_MS", &mut self.rescan_interval_ms)?;
        set(&env, "COMMAND_TIMEOUT_MS", &mut self.command_timeout_ms)?;
        set(&env, "CRASH_HALF_LIFE_MS", &mut self.crash_half_life_ms)?;
        set(&env, "LATENCY_WINDOW", &mut self.latency_window)?;
        set(&env, "LATENCY_REFERENCE_MS", &mut self.latency_reference_ms)?;
        set(&env, "NEUTRAL_RESPONSIVENESS", &mut self.neutral_responsiveness)?;
        set(&env, "DISTANCE_BASE", &mut self.distance_base)?;

        set(&env, "WEIGHT_DISTANCE", &mut self.weights.distance)?;
        set(&env, "WEIGHT_RELIABILITY", &mut self.weights.reliability)?;
        set(&env, "WEIGHT_RESPONSIVENESS", &mut self.weights.responsiveness)?;
        set(&env, "WEIGHT_CRASH_AFFINITY", &mut self.weights.crash_affinity)?;

        set(&env, "MAX_RESTARTS", &mut self.restart.max_restarts)?;
        set(&env, "RESTART_WINDOW_MS", &mut self.restart.restart_window_ms)?;
        set(&env, "RESTART_BASE_MS", &mut self.restart.base_ms)?;
        set(&env, "RESTART_MAX_MS", &mut self.restart.max_ms)?;
        set(&env, "RESTART_JITTER", &mut self.restart.jitter)?;

        set(&env, "MAILBOX_SIZE", &mut self.mailbox_size)?;
        set(&env, "EVENT_BUFFER", &mut self.event_buffer)?;
        if let Some(level) = env("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Rejects settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("distance", self.weights.distance),
            ("reliability", self.weights.reliability),
            ("responsiveness", self.weights.responsiveness),
            ("crash_affinity", self.weights.crash_affinity),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                bail!("criterion weight '{name}' must be a non-negative number, got {weight}");
            }
        }
        if self.heartbeat_period_ms == 0 {
            bail!("heartbeat_period_ms must be positive");
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_period_ms {
            bail!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_period_ms ({})",
                self.heartbeat_timeout_ms,
                self.heartbeat_period_ms
            );
        }
        if self.sweep_interval_ms == Some(0) || self.rescan_interval_ms == 0 {
            bail!("sweep and rescan intervals must be positive");
        }
        if self.command_timeout_ms == 0 {
            bail!("command_timeout_ms must be positive");
        }
        if self.latency_window == 0 {
            bail!("latency_window must be positive");
        }
        for (name, value) in [
            ("neutral_responsiveness", self.neutral_responsiveness),
            ("distance_base", self.distance_base),
            ("restart.jitter", self.restart.jitter),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if self.mailbox_size == 0 || self.event_buffer == 0 {
            bail!("mailbox_size and event_buffer must be positive");
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        let ms = self
            .sweep_interval_ms
            .unwrap_or(self.heartbeat_period_ms / 2)
            .max(1);
        Duration::from_millis(ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn crash_half_life(&self) -> Duration {
        Duration::from_millis(self.crash_half_life_ms)
    }

    pub fn latency_reference(&self) -> Duration {
        Duration::from_millis(self.latency_reference_ms)
    }
}

fn set<T>(env: &impl Fn(&str) -> Option<String>, name: &str, field: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env(name) {
        *field = parse(name, &raw)?;
    }
    Ok(())
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {ENV_PREFIX}{name} '{raw}': {e}"))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.restart.policy(), RestartPolicy::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("ORBIT_HEARTBEAT_TIMEOUT_MS", "5000"),
                ("ORBIT_WEIGHT_DISTANCE", "4.5"),
                ("ORBIT_SWEEP_INTERVAL_MS", "250"),
                ("ORBIT_LOG_LEVEL", "debug"),
                ("UNRELATED", "1"),
            ]))
            .unwrap();
        assert_eq!(config.heartbeat_timeout_ms, 5000);
        assert_eq!(config.weights.distance, 4.5);
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_env_parse_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(lookup(&[("ORBIT_LATENCY_WINDOW", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("ORBIT_LATENCY_WINDOW"));
    }

    #[test]
    fn test_toml_partial() {
        let config: Config = toml::from_str(
            r#"
            heartbeat_period_ms = 200
            heartbeat_timeout_ms = 900

            [weights]
            distance = 3.0

            [restart]
            max_restarts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_period_ms, 200);
        assert_eq!(config.weights.distance, 3.0);
        assert_eq!(config.weights.reliability, 1.0);
        assert_eq!(config.restart.max_restarts, 2);
        assert_eq!(config.command_timeout_ms, 2000);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_layers_env_over_file() {
        let path = std::env::temp_dir().join(format!("orbit-config-{}.toml", std::process::id()));
        std::fs::write(&path, "heartbeat_period_ms = 200\nheartbeat_timeout_ms = 900\n").unwrap();

        let config =
            Config::load_with(Some(&path), lookup(&[("ORBIT_HEARTBEAT_TIMEOUT_MS", "1200")])).unwrap();
        assert_eq!(config.heartbeat_period_ms, 200);
        assert_eq!(config.heartbeat_timeout_ms, 1200);

        // The merged result is validated, not just the file.
        let err = Config::load_with(Some(&path), lookup(&[("ORBIT_HEARTBEAT_TIMEOUT_MS", "100")]));
        std::fs::remove_file(&path).unwrap();
        assert!(err.is_err());

        let defaults = Config::load_with(None, lookup(&[])).unwrap();
        assert_eq!(defaults.heartbeat_timeout_ms, Config::default().heartbeat_timeout_ms);
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let mut config = Config::default();
        config.weights.responsiveness = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_timeout_not_above_period() {
        let mut config = Config::default();
        config.heartbeat_timeout_ms = config.heartbeat_period_ms;
        assert!(config.validate().is_err());
    }
}

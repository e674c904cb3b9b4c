//! Typed configuration for a hive run.
//!
//! Every section has defaults, so an empty or missing `hive.toml` is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::WorkerId;
use crate::orchestration::Role;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HiveConfig {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    pub count: u32,
    /// Delay between claim attempts when nothing is claimable.
    pub poll_interval_ms: u64,
    /// Longest a worker keeps polling without claiming before it exits.
    pub max_wait_seconds: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 5,
            poll_interval_ms: 500,
            max_wait_seconds: 120,
        }
    }
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub window_size: usize,
    pub failure_threshold: f64,
    /// Samples required in the window before a level can pause.
    pub min_samples: usize,
    /// Failures required in the window before a level can pause.
    pub min_failures: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 10,
            failure_threshold: 0.5,
            min_samples: 3,
            min_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssignmentConfig {
    pub balance_by_level: bool,
    /// Minutes of work a worker can absorb when rebalancing.
    pub capacity_minutes: u32,
    /// Roles carried by individual workers.
    pub roles: Vec<WorkerRoles>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerRoles {
    pub worker: WorkerId,
    pub roles: Vec<Role>,
}

impl AssignmentConfig {
    /// Roles per worker, merging repeated entries.
    pub fn role_map(&self) -> BTreeMap<WorkerId, Vec<Role>> {
        let mut map: BTreeMap<WorkerId, Vec<Role>> = BTreeMap::new();
        for entry in &self.roles {
            let roles = map.entry(entry.worker).or_default();
            for role in &entry.roles {
                if !roles.contains(role) {
                    roles.push(*role);
                }
            }
        }
        map
    }
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            balance_by_level: true,
            capacity_minutes: 60,
            roles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_seconds: 30,
            max_backoff_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernanceConfig {
    pub stale_timeout_seconds: u64,
    /// Multiple of the stale timeout after which an unchanged narrative stalls.
    pub stall_multiplier: f64,
    pub charter_path: Option<PathBuf>,
    /// Compare narratives ignoring digits (step counters, percentages).
    pub digit_insensitive_narrative: bool,
    /// How often a running scheduler checks worker pulses.
    pub pulse_interval_ms: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            stale_timeout_seconds: 120,
            stall_multiplier: 2.5,
            charter_path: None,
            digit_insensitive_narrative: false,
            pulse_interval_ms: 30_000,
        }
    }
}

impl GovernanceConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }

    pub fn narrative_stall_after(&self) -> Duration {
        Duration::from_secs_f64(self.stale_timeout_seconds as f64 * self.stall_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    pub defer_merge_to_ship: bool,
    pub gates_at_ship_only: bool,
    pub target_branch: String,
    pub branch_prefix: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            defer_merge_to_ship: false,
            gates_at_ship_only: false,
            target_branch: "main".to_string(),
            branch_prefix: "hive".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// Directory holding state, heartbeat and escalation files.
    pub dir: Option<PathBuf>,
    pub lock_timeout_ms: u64,
    /// Lock files older than this are considered abandoned.
    pub stale_lock_seconds: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock_timeout_ms: 5_000,
            stale_lock_seconds: 30,
        }
    }
}

impl StateConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_seconds)
    }

    /// Configured directory with `~/` expanded, or `~/.hive/state`.
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(HiveConfig::hive_dir()?.join("state")),
        }
    }
}

impl HiveConfig {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "HiveConfig::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            workers = config.workers.count,
            defer_merge = config.merge.defer_merge_to_ship,
            "Config loaded"
        );
        Ok(config)
    }

    /// Load from `~/.hive/hive.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::config_path()?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "Creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Reject values no run can work with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(Error::Validation("workers.count must be at least 1".to_string()));
        }
        if self.backpressure.window_size == 0 {
            return Err(Error::Validation(
                "backpressure.window_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backpressure.failure_threshold) {
            return Err(Error::Validation(format!(
                "backpressure.failure_threshold {} is outside 0..=1",
                self.backpressure.failure_threshold
            )));
        }
        if self.governance.stall_multiplier <= 0.0 {
            return Err(Error::Validation(
                "governance.stall_multiplier must be positive".to_string(),
            ));
        }
        if let Some(id) = self
            .assignment
            .roles
            .iter()
            .map(|entry| entry.worker)
            .find(|id| id.0 >= self.workers.count)
        {
            return Err(Error::Validation(format!(
                "assignment.roles names worker {} but only {} workers are configured",
                id, self.workers.count
            )));
        }
        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

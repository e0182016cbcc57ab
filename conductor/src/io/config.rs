//! Conductor configuration stored in `conductor.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::healing::HealingConfig;
use crate::io::cost::FlatCostEstimator;
use crate::orchestrator::OrchestratorConfig;
use crate::queue::QueueConfig;
use crate::watchdog::WatchdogConfig;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conductor.toml";

/// Conductor configuration (TOML).
///
/// Edited by humans; missing fields default to the values below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    pub queue: QueueSection,
    pub executor: ExecutorSection,
    pub healing: HealingSection,
    pub watchdog: WatchdogSection,
    pub notifier: NotifierSection,
    pub commands: CommandsSection,
    pub cost: FlatCostEstimator,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSection {
    /// Maximum number of tasks in PROCESSING at once.
    pub concurrency_limit: usize,
    /// Reject submissions beyond this many pending tasks. Unlimited when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<usize>,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_pending: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorSection {
    /// Wall-clock limit for a direct capability call.
    pub timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealingSection {
    pub max_iterations: u32,
    /// Consecutive identical failures tolerated before aborting.
    pub max_repeat: u32,
    pub max_cost: f64,
    /// Wall-clock limit for each capability call inside the loop.
    pub iteration_timeout_secs: u64,
    pub verify_capability: String,
    pub diagnose_capability: String,
    pub fix_capability: String,
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_repeat: 2,
            max_cost: 1.0,
            iteration_timeout_secs: 300,
            verify_capability: "run_checks".to_string(),
            diagnose_capability: "diagnose".to_string(),
            fix_capability: "generate_fix".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogSection {
    pub interval_secs: u64,
    /// Silence after which an in-progress task is declared lost.
    pub stall_timeout_secs: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            stall_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifierSection {
    /// Events buffered per subscriber before the oldest are dropped.
    pub buffer: usize,
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsSection {
    /// Working directory for spawned capability commands.
    pub workdir: PathBuf,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Capability name to argv (e.g. `run_checks = ["just", "ci"]`).
    pub capabilities: BTreeMap<String, Vec<String>>,
}

impl Default for CommandsSection {
    fn default() -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            "run_checks".to_string(),
            vec!["just".to_string(), "ci".to_string()],
        );
        Self {
            workdir: PathBuf::from("."),
            output_limit_bytes: 100_000,
            capabilities,
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue.concurrency_limit == 0 {
            return Err(anyhow!("queue.concurrency_limit must be > 0"));
        }
        if self.queue.max_pending == Some(0) {
            return Err(anyhow!("queue.max_pending must be > 0 when set"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.healing.max_iterations == 0 {
            return Err(anyhow!("healing.max_iterations must be > 0"));
        }
        if self.healing.max_repeat == 0 {
            return Err(anyhow!("healing.max_repeat must be > 0"));
        }
        if !self.healing.max_cost.is_finite() || self.healing.max_cost < 0.0 {
            return Err(anyhow!("healing.max_cost must be a non-negative number"));
        }
        if self.healing.iteration_timeout_secs == 0 {
            return Err(anyhow!("healing.iteration_timeout_secs must be > 0"));
        }
        for (key, name) in [
            ("healing.verify_capability", &self.healing.verify_capability),
            ("healing.diagnose_capability", &self.healing.diagnose_capability),
            ("healing.fix_capability", &self.healing.fix_capability),
        ] {
            if name.trim().is_empty() {
                return Err(anyhow!("{key} must be non-empty"));
            }
        }
        if self.watchdog.interval_secs == 0 {
            return Err(anyhow!("watchdog.interval_secs must be > 0"));
        }
        // A task inside one long capability call records no steps; the
        // watchdog must not mistake that for a stall.
        let longest_call = self
            .executor
            .timeout_secs
            .max(self.healing.iteration_timeout_secs);
        if self.watchdog.stall_timeout_secs <= longest_call {
            return Err(anyhow!(
                "watchdog.stall_timeout_secs ({}) must exceed the longest capability timeout ({longest_call})",
                self.watchdog.stall_timeout_secs
            ));
        }
        if self.notifier.buffer == 0 {
            return Err(anyhow!("notifier.buffer must be > 0"));
        }
        if self.commands.output_limit_bytes == 0 {
            return Err(anyhow!("commands.output_limit_bytes must be > 0"));
        }
        for (name, argv) in &self.commands.capabilities {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!(
                    "commands.capabilities.{name} must be a non-empty array"
                ));
            }
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency_limit: self.queue.concurrency_limit,
            max_pending: self.queue.max_pending,
        }
    }

    pub fn healing_config(&self) -> HealingConfig {
        HealingConfig {
            max_iterations: self.healing.max_iterations,
            max_repeat: self.healing.max_repeat,
            max_cost: self.healing.max_cost,
            iteration_timeout: Duration::from_secs(self.healing.iteration_timeout_secs),
            verify_capability: self.healing.verify_capability.clone(),
            diagnose_capability: self.healing.diagnose_capability.clone(),
            fix_capability: self.healing.fix_capability.clone(),
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_secs(self.watchdog.interval_secs),
            stall_timeout: Duration::from_secs(self.watchdog.stall_timeout_secs),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            executor_timeout: Duration::from_secs(self.executor.timeout_secs),
            healing: self.healing_config(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

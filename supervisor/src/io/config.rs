//! Supervisor configuration stored in `supervisor.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::classifier::{ClassifierRule, FailureClassifier, default_rules};

/// Supervisor configuration (TOML).
///
/// Intended to be edited by operators. Missing sections and fields fall back
/// to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    pub paths: PathsConfig,
    pub launch: LaunchConfig,
    pub runtimes: RuntimesConfig,
    pub installer: InstallerConfig,
    pub detector: DetectorConfig,
    pub classifier: ClassifierConfig,
    pub monitor: MonitorConfig,
    pub reaper: ReaperConfig,
    pub sampler: SamplerConfig,
    pub plans: BTreeMap<String, PlanConfig>,
    pub tenants: BTreeMap<String, TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// One `<tenant>_<name>.log` per hosted script.
    pub logs_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            logs_dir: PathBuf::from("logs"),
            ledger_path: PathBuf::from("data/scripts.json"),
            backup_dir: PathBuf::from("backups"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchConfig {
    /// First startle window after spawn.
    pub startle_primary_ms: u64,
    /// Second, shorter window catching fast-fail patterns.
    pub startle_secondary_ms: u64,
    /// Pause between a dependency install and the next attempt.
    pub retry_delay_ms: u64,
    /// Pause between stop and launch on a manual restart.
    pub restart_delay_ms: u64,
    /// Characters of log tail read for crash classification.
    pub log_tail_chars: usize,
    /// Characters of log tail kept in crash diagnostics.
    pub diagnostic_tail_chars: usize,
    /// Environment variable carrying the tenant's script secret.
    pub secret_env: String,
    /// Entry files tried, in order, after a first-attempt crash.
    pub alternate_entries: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            startle_primary_ms: 5_000,
            startle_secondary_ms: 3_000,
            retry_delay_ms: 1_000,
            restart_delay_ms: 2_000,
            log_tail_chars: 2_000,
            diagnostic_tail_chars: 500,
            secret_env: "BOT_TOKEN".to_string(),
            alternate_entries: strings(&["app.py", "main.py", "bot.py", "run.py", "index.js", "app.js"]),
        }
    }
}

impl LaunchConfig {
    pub fn startle_primary(&self) -> Duration {
        Duration::from_millis(self.startle_primary_ms)
    }

    pub fn startle_secondary(&self) -> Duration {
        Duration::from_millis(self.startle_secondary_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Interpreter argv prefixes; the entry path is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimesConfig {
    pub python: Vec<String>,
    pub node: Vec<String>,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            python: strings(&["python3", "-u"]),
            node: strings(&["node"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerConfig {
    /// Package installer argv for runtime A; `-r <manifest>` or `<package>` is appended.
    pub pip: Vec<String>,
    /// Manifest install argv for runtime B.
    pub npm_manifest: Vec<String>,
    /// Single-package install argv for runtime B; `<package>` is appended.
    pub npm_module: Vec<String>,
    pub python_manifest: String,
    pub node_manifest: String,
    /// Runtime B manifest installs are skipped while this directory exists.
    pub node_cache_dir: String,
    pub manifest_timeout_secs: u64,
    pub module_timeout_secs: u64,
    /// Truncate captured installer output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Extra import-name -> package-name entries, merged over the built-in table.
    pub module_map: BTreeMap<String, String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            pip: strings(&["python3", "-m", "pip", "install", "--quiet"]),
            npm_manifest: strings(&["npm", "install", "--production"]),
            npm_module: strings(&["npm", "install"]),
            python_manifest: "requirements.txt".to_string(),
            node_manifest: "package.json".to_string(),
            node_cache_dir: "node_modules".to_string(),
            manifest_timeout_secs: 300,
            module_timeout_secs: 120,
            output_limit_bytes: 64_000,
            module_map: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Canonical runtime A entry names, most preferred first.
    pub python_entries: Vec<String>,
    /// Canonical runtime B entry names, most preferred first.
    pub node_entries: Vec<String>,
    pub python_keywords: Vec<String>,
    pub node_keywords: Vec<String>,
    /// A heuristic candidate needs at least this many keyword hits.
    pub keyword_threshold: usize,
    /// Bytes of each candidate read by the content heuristic.
    pub prefix_bytes: usize,
    /// Subdirectory levels below the work directory that are scanned.
    pub max_depth: usize,
    /// Directory names never descended into.
    pub skip_dirs: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            python_entries: strings(&[
                "main.py",
                "app.py",
                "bot.py",
                "run.py",
                "start.py",
                "server.py",
                "index.py",
                "__main__.py",
            ]),
            node_entries: strings(&[
                "index.js", "app.js", "bot.js", "main.js", "server.js", "start.js", "run.js",
            ]),
            python_keywords: strings(&[
                "infinity_polling",
                "polling()",
                "bot.polling",
                "app.run(",
                "if __name__",
                "telebot.TeleBot",
                "Bot(token",
            ]),
            node_keywords: strings(&[
                "require(",
                "app.listen",
                "bot.launch",
                "client.login",
                "express()",
            ]),
            keyword_threshold: 2,
            prefix_bytes: 5_000,
            max_depth: 1,
            skip_dirs: strings(&["node_modules", "__pycache__", ".git", ".venv", "venv"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Ordered crash-log rules; the first match wins.
    pub rules: Vec<ClassifierRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Pause before an automatic relaunch.
    pub recovery_backoff_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Dead records older than this are released by the cleanup sweep.
    pub stale_after_secs: u64,
    pub expiry_interval_secs: u64,
    pub backup_interval_secs: u64,
    /// Newest ledger backups kept.
    pub backup_keep: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            recovery_backoff_secs: 5,
            cleanup_interval_secs: 300,
            stale_after_secs: 300,
            expiry_interval_secs: 3_600,
            backup_interval_secs: 86_400,
            backup_keep: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaperConfig {
    /// Collective grace period for descendants after the terminate signal.
    pub child_grace_ms: u64,
    /// Grace period for the root process after the terminate signal.
    pub root_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            child_grace_ms: 3_000,
            root_grace_ms: 3_000,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplerConfig {
    /// CPU measurement window; raised to the platform minimum when shorter.
    pub cpu_window_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { cpu_window_ms: 300 }
    }
}

/// Plan-derived permissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanConfig {
    /// Absent means unbounded.
    #[serde(default)]
    pub max_scripts: Option<u32>,
    #[serde(default)]
    pub auto_restart: bool,
}

/// Subscription state of one tenant, keyed by tenant id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TenantConfig {
    pub plan: String,
    pub lifetime: bool,
    pub subscription_end: Option<DateTime<Utc>>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            plan: FREE_PLAN.to_string(),
            lifetime: false,
            subscription_end: None,
        }
    }
}

/// Plan that is active without a subscription.
pub const FREE_PLAN: &str = "free";

/// Built-in plan table, used when the config declares no plans.
pub fn default_plans() -> BTreeMap<String, PlanConfig> {
    let plan = |max_scripts: Option<u32>, auto_restart: bool| PlanConfig {
        max_scripts,
        auto_restart,
    };
    BTreeMap::from([
        (FREE_PLAN.to_string(), plan(Some(1), false)),
        ("starter".to_string(), plan(Some(2), true)),
        ("basic".to_string(), plan(Some(5), true)),
        ("pro".to_string(), plan(Some(15), true)),
        ("enterprise".to_string(), plan(Some(50), true)),
        ("lifetime".to_string(), plan(None, true)),
    ])
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.launch.startle_primary_ms == 0 || self.launch.startle_secondary_ms == 0 {
            return Err(anyhow!("launch startle windows must be > 0"));
        }
        if self.launch.log_tail_chars == 0 || self.launch.diagnostic_tail_chars == 0 {
            return Err(anyhow!("launch tail sizes must be > 0"));
        }
        for (name, argv) in [
            ("runtimes.python", &self.runtimes.python),
            ("runtimes.node", &self.runtimes.node),
            ("installer.pip", &self.installer.pip),
            ("installer.npm_manifest", &self.installer.npm_manifest),
            ("installer.npm_module", &self.installer.npm_module),
        ] {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        if self.installer.manifest_timeout_secs == 0 || self.installer.module_timeout_secs == 0 {
            return Err(anyhow!("installer timeouts must be > 0"));
        }
        if self.detector.prefix_bytes == 0 || self.detector.keyword_threshold == 0 {
            return Err(anyhow!("detector prefix_bytes and keyword_threshold must be > 0"));
        }
        if self.monitor.interval_secs == 0
            || self.monitor.cleanup_interval_secs == 0
            || self.monitor.expiry_interval_secs == 0
            || self.monitor.backup_interval_secs == 0
        {
            return Err(anyhow!("monitor intervals must be > 0"));
        }
        if self.reaper.poll_interval_ms == 0 {
            return Err(anyhow!("reaper.poll_interval_ms must be > 0"));
        }
        FailureClassifier::new(&self.classifier.rules)?;
        for (tenant, cfg) in &self.tenants {
            tenant
                .parse::<u64>()
                .map_err(|_| anyhow!("tenant key {tenant:?} must be a numeric id"))?;
            if !self.plans().contains_key(&cfg.plan) {
                return Err(anyhow!("tenant {tenant} uses unknown plan {:?}", cfg.plan));
            }
        }
        Ok(())
    }

    /// Declared plans, or the built-in table when none are declared.
    pub fn plans(&self) -> BTreeMap<String, PlanConfig> {
        if self.plans.is_empty() {
            default_plans()
        } else {
            self.plans.clone()
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

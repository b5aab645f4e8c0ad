//! Dependency installer adapter (pip / npm).
//!
//! Every invocation is best-effort: failures come back as
//! [`InstallOutcome::Failed`] and are logged, never raised.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::text::tail_chars;
use crate::core::types::RuntimeKind;
use crate::io::config::InstallerConfig;
use crate::io::process::run_helper;

/// Characters of installer output kept in a failure reason.
const FAILURE_TAIL_CHARS: usize = 300;

/// Import names whose distribution package is named differently.
const BUILTIN_MODULE_MAP: &[(&str, &str)] = &[
    ("telebot", "pytelegrambotapi"),
    ("telegram", "python-telegram-bot"),
    ("pyrogram", "pyrogram"),
    ("telethon", "telethon"),
    ("aiogram", "aiogram"),
    ("PIL", "Pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("bs4", "beautifulsoup4"),
    ("dotenv", "python-dotenv"),
    ("yaml", "pyyaml"),
    ("aiohttp", "aiohttp"),
    ("numpy", "numpy"),
    ("pandas", "pandas"),
    ("requests", "requests"),
    ("flask", "flask"),
    ("fastapi", "fastapi"),
    ("motor", "motor"),
    ("pymongo", "pymongo"),
    ("httpx", "httpx"),
    ("cryptography", "cryptography"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Nothing to do (no manifest, or dependencies already present).
    Skipped,
    Failed(String),
}

impl InstallOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, InstallOutcome::Failed(_))
    }
}

/// Abstraction over package installation so launch tests can record calls
/// instead of running pip or npm.
pub trait DependencyInstaller: Send + Sync {
    /// Install everything the work directory's manifest declares.
    fn install_manifest(&self, work_dir: &Path, runtime: RuntimeKind) -> InstallOutcome;

    /// Install one module named by a crash log.
    fn install_module(&self, work_dir: &Path, runtime: RuntimeKind, module: &str) -> InstallOutcome;
}

/// Installer that shells out to the configured pip and npm commands.
pub struct CommandInstaller {
    cfg: InstallerConfig,
    module_map: BTreeMap<String, String>,
}

impl CommandInstaller {
    pub fn new(cfg: InstallerConfig) -> Self {
        let mut module_map: BTreeMap<String, String> = BUILTIN_MODULE_MAP
            .iter()
            .map(|(module, package)| (module.to_string(), package.to_string()))
            .collect();
        module_map.extend(cfg.module_map.clone());
        Self { cfg, module_map }
    }

    /// Distribution package for a runtime A import name. Exact match first,
    /// then case-insensitive, then the import name itself.
    pub fn python_package(&self, module: &str) -> String {
        if let Some(package) = self.module_map.get(module) {
            return package.clone();
        }
        self.module_map
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(module))
            .map_or_else(|| module.to_string(), |(_, package)| package.clone())
    }

    fn run(&self, argv: &[String], extra: &[&str], work_dir: &Path, timeout_secs: u64) -> InstallOutcome {
        let Some((program, args)) = argv.split_first() else {
            return InstallOutcome::Failed("empty installer command".to_string());
        };
        let mut cmd = Command::new(program);
        cmd.args(args).args(extra).current_dir(work_dir);

        match run_helper(cmd, Duration::from_secs(timeout_secs), self.cfg.output_limit_bytes) {
            Ok(output) if output.succeeded() => InstallOutcome::Installed,
            Ok(output) if output.timed_out => {
                InstallOutcome::Failed(format!("timed out after {timeout_secs}s"))
            }
            Ok(output) => InstallOutcome::Failed(
                tail_chars(output.failure_text().trim(), FAILURE_TAIL_CHARS).to_string(),
            ),
            Err(err) => InstallOutcome::Failed(format!("{err:#}")),
        }
    }
}

impl DependencyInstaller for CommandInstaller {
    #[instrument(skip_all, fields(work_dir = %work_dir.display(), runtime = runtime.label()))]
    fn install_manifest(&self, work_dir: &Path, runtime: RuntimeKind) -> InstallOutcome {
        let outcome = match runtime {
            RuntimeKind::Python => {
                let manifest = work_dir.join(&self.cfg.python_manifest);
                if !manifest.is_file() {
                    return InstallOutcome::Skipped;
                }
                let manifest = manifest.to_string_lossy().into_owned();
                self.run(
                    &self.cfg.pip,
                    &["-r", manifest.as_str()],
                    work_dir,
                    self.cfg.manifest_timeout_secs,
                )
            }
            RuntimeKind::Node => {
                if !work_dir.join(&self.cfg.node_manifest).is_file()
                    || work_dir.join(&self.cfg.node_cache_dir).exists()
                {
                    return InstallOutcome::Skipped;
                }
                self.run(
                    &self.cfg.npm_manifest,
                    &[],
                    work_dir,
                    self.cfg.manifest_timeout_secs,
                )
            }
        };
        match &outcome {
            InstallOutcome::Failed(reason) => warn!(reason = %reason, "manifest install failed"),
            _ => info!("manifest dependencies installed"),
        }
        outcome
    }

    #[instrument(skip_all, fields(work_dir = %work_dir.display(), runtime = runtime.label(), module = %module))]
    fn install_module(&self, work_dir: &Path, runtime: RuntimeKind, module: &str) -> InstallOutcome {
        let outcome = match runtime {
            RuntimeKind::Python => {
                let package = self.python_package(module);
                info!(package = %package, "installing missing module");
                self.run(&self.cfg.pip, &[package.as_str()], work_dir, self.cfg.module_timeout_secs)
            }
            RuntimeKind::Node => {
                info!("installing missing module");
                self.run(&self.cfg.npm_module, &[module], work_dir, self.cfg.module_timeout_secs)
            }
        };
        if let InstallOutcome::Failed(reason) = &outcome {
            warn!(reason = %reason, "could not resolve dependency");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer() -> CommandInstaller {
        let mut cfg = InstallerConfig::default();
        cfg.module_map
            .insert("Crypto".to_string(), "pycryptodome".to_string());
        CommandInstaller::new(cfg)
    }

    #[test]
    fn maps_import_names_to_packages() {
        let installer = installer();
        assert_eq!(installer.python_package("telebot"), "pytelegrambotapi");
        assert_eq!(installer.python_package("PIL"), "Pillow");
        assert_eq!(installer.python_package("pil"), "Pillow");
        assert_eq!(installer.python_package("Crypto"), "pycryptodome");
        assert_eq!(installer.python_package("requests"), "requests");
        assert_eq!(installer.python_package("unknown_mod"), "unknown_mod");
    }

    #[test]
    fn manifest_install_skips_without_manifest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let installer = installer();
        assert_eq!(
            installer.install_manifest(temp.path(), RuntimeKind::Python),
            InstallOutcome::Skipped
        );
        assert_eq!(
            installer.install_manifest(temp.path(), RuntimeKind::Node),
            InstallOutcome::Skipped
        );
    }

    #[test]
    fn node_manifest_install_skips_when_cache_exists() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("package.json"), "{}").expect("write manifest");
        std::fs::create_dir(temp.path().join("node_modules")).expect("cache dir");
        assert_eq!(
            installer().install_manifest(temp.path(), RuntimeKind::Node),
            InstallOutcome::Skipped
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = InstallerConfig::default();
        cfg.pip = vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 1".to_string()];
        let installer = CommandInstaller::new(cfg);
        let outcome = installer.install_module(temp.path(), RuntimeKind::Python, "requests");
        assert_eq!(outcome, InstallOutcome::Failed("boom".to_string()));
        assert!(!outcome.succeeded());
    }

    #[cfg(unix)]
    #[test]
    fn successful_command_installs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = InstallerConfig::default();
        cfg.npm_module = vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        let installer = CommandInstaller::new(cfg);
        assert!(installer
            .install_module(temp.path(), RuntimeKind::Node, "express")
            .succeeded());
    }

    #[test]
    fn missing_program_is_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = InstallerConfig::default();
        cfg.pip = vec!["definitely-not-a-real-installer-xyz".to_string()];
        let installer = CommandInstaller::new(cfg);
        assert!(!installer
            .install_module(temp.path(), RuntimeKind::Python, "requests")
            .succeeded());
    }
}

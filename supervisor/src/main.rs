//! `supervisor` CLI: inspect hosted scripts and run the supervisor daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use supervisor::core::types::{ScriptId, TenantId};
use supervisor::exit_codes;
use supervisor::io::config::{SupervisorConfig, load_config, write_config};
use supervisor::io::detector::Detector;
use supervisor::io::entitlement::PlanEntitlement;
use supervisor::io::installer::CommandInstaller;
use supervisor::io::ledger::{JsonLedger, Ledger};
use supervisor::io::logs::{log_path, read_tail};
use supervisor::io::notifier::LogNotifier;
use supervisor::launcher::Collaborators;
use supervisor::logging;
use supervisor::supervisor::Supervisor;
use supervisor::tasks::StopSignal;

const DEFAULT_CONFIG: &str = "supervisor.toml";
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(
    name = "supervisor",
    version,
    about = "Process supervisor for hosted tenant scripts"
)]
struct Cli {
    /// Path to the supervisor config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the detected entry point of a file or directory as JSON.
    Detect { path: PathBuf },
    /// Print ledger entries.
    List {
        /// Only scripts of this tenant.
        #[arg(long)]
        tenant: Option<u64>,
    },
    /// Print the tail of a script's log.
    Logs { script_id: u64 },
    /// Run the supervisor until Ctrl-C.
    Serve {
        /// Script ids to launch after startup.
        #[arg(long = "launch")]
        launch: Vec<u64>,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Detect { path } => cmd_detect(&cli.config, &path),
        Command::List { tenant } => cmd_list(&cli.config, tenant),
        Command::Logs { script_id } => cmd_logs(&cli.config, script_id),
        Command::Serve { launch } => {
            logging::init("info");
            cmd_serve(&cli.config, &launch)
        }
    }
}

fn cmd_init(config: &Path, force: bool) -> Result<i32> {
    if config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config.display());
    }
    write_config(config, &SupervisorConfig::default())?;
    println!("wrote {}", config.display());
    Ok(exit_codes::OK)
}

fn cmd_detect(config: &Path, path: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let detector = Detector::new(cfg.detector)?;
    match detector.detect(path) {
        Some(result) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("serialize detection")?
            );
            Ok(exit_codes::OK)
        }
        None => {
            let candidates = detector.candidates(path);
            eprintln!("no runnable entry point in {}", path.display());
            for candidate in candidates {
                eprintln!("  {candidate}");
            }
            Ok(exit_codes::NO_ENTRY)
        }
    }
}

fn cmd_list(config: &Path, tenant: Option<u64>) -> Result<i32> {
    let cfg = load_config(config)?;
    let ledger = JsonLedger::new(&cfg.paths.ledger_path);
    let scripts = ledger.list_scripts(tenant.map(TenantId))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&scripts).context("serialize scripts")?
    );
    Ok(exit_codes::OK)
}

fn cmd_logs(config: &Path, script_id: u64) -> Result<i32> {
    let cfg = load_config(config)?;
    let ledger = JsonLedger::new(&cfg.paths.ledger_path);
    let entry = ledger
        .get_script(ScriptId(script_id))?
        .with_context(|| format!("script {} not found", ScriptId(script_id)))?;
    let path = log_path(&cfg.paths.logs_dir, &entry.key());
    let tail = read_tail(&path, cfg.launch.log_tail_chars)?;
    if tail.trim().is_empty() {
        println!("No output");
    } else {
        println!("{tail}");
    }
    Ok(exit_codes::OK)
}

fn cmd_serve(config: &Path, launch: &[u64]) -> Result<i32> {
    let cfg = load_config(config)?;
    let deps = Collaborators {
        ledger: Arc::new(JsonLedger::new(&cfg.paths.ledger_path)),
        entitlement: Arc::new(PlanEntitlement::from_config(&cfg)),
        notifier: Arc::new(LogNotifier),
        installer: Arc::new(CommandInstaller::new(cfg.installer.clone())),
    };
    let mut supervisor = Supervisor::new(cfg, deps)?;

    let stop = Arc::new(StopSignal::new());
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        eprintln!("\nShutdown signal received...");
        handler_stop.stop();
    })
    .context("install signal handler")?;

    for (script_id, outcome) in supervisor.resume()? {
        match outcome {
            Ok(outcome) => info!(script = %script_id, outcome = ?outcome, "resumed"),
            Err(err) => warn!(script = %script_id, err = %err, "resume failed"),
        }
    }
    for &id in launch {
        let script_id = ScriptId(id);
        if supervisor.is_running(script_id) {
            continue;
        }
        let result = supervisor
            .entry(script_id)
            .and_then(|entry| supervisor.launch(script_id, entry.tenant));
        match result {
            Ok(outcome) => info!(script = %script_id, outcome = ?outcome, "launched"),
            Err(err) => warn!(script = %script_id, err = %err, "launch failed"),
        }
    }

    supervisor.start_background()?;
    info!("supervisor running; press Ctrl-C to stop");
    while !stop.wait(SHUTDOWN_POLL) {}

    supervisor.shutdown();
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["supervisor", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn parse_serve_with_launch_ids() {
        let cli = Cli::parse_from([
            "supervisor",
            "serve",
            "--launch",
            "3",
            "--launch",
            "5",
            "--config",
            "/etc/sup.toml",
        ]);
        match cli.command {
            Command::Serve { launch } => assert_eq!(launch, vec![3, 5]),
            _ => panic!("expected serve"),
        }
        assert_eq!(cli.config, PathBuf::from("/etc/sup.toml"));
    }

    #[test]
    fn detect_reports_missing_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let code = cmd_detect(&temp.path().join("none.toml"), temp.path()).expect("detect");
        assert_eq!(code, exit_codes::NO_ENTRY);
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("supervisor.toml");
        assert_eq!(cmd_init(&path, false).expect("init"), exit_codes::OK);
        assert!(cmd_init(&path, false).is_err());
        assert_eq!(cmd_init(&path, true).expect("force"), exit_codes::OK);
    }
}

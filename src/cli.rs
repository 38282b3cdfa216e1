use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

use hostwarden::config::Config;
use hostwarden::lifecycle::install_crash_hook;
use hostwarden::logging::init_logging;
use hostwarden::registry::UpdateAction;
use hostwarden::scan::{scan_file, ScanReport};
use hostwarden::Daemon;

#[derive(Parser)]
#[command(name = "hostwarden")]
#[command(author, version, about = "Blocks hosts that brute-force sshd via hosts.deny")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the monitoring daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the monitoring daemon
    Stop,

    /// Replay a log file and show what would be blocked
    Check {
        /// Log file to read from the beginning
        file: PathBuf,
    },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Table row for check output
#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Line")]
    line: usize,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Count")]
    count: u64,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Result")]
    result: String,
}

/// Table row for tracked hosts
#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Attempts")]
    attempts: u64,
    #[tabled(rename = "Committed")]
    committed: bool,
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Start { foreground } => cmd_start(config, foreground, cli.debug),
        Commands::Stop => {
            init_logging(&config.general.log_level, cli.debug, false)?;
            cmd_stop(config)
        }
        Commands::Check { file } => {
            init_logging(&config.general.log_level, cli.debug, false)?;
            cmd_check(&file)
        }
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

fn cmd_start(config: Config, foreground: bool, debug: bool) -> Result<()> {
    if !foreground {
        // Check if already running
        let pid_path = config.pid_path();
        if pid_path.exists() {
            let pid_str = std::fs::read_to_string(&pid_path)?;
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                let proc_path = format!("/proc/{}", pid);
                if Path::new(&proc_path).exists() {
                    anyhow::bail!("Daemon already running with PID {}", pid);
                }
            }
        }

        println!("Starting hostwarden daemon...");

        // Fork before any runtime threads exist
        let daemonize = daemonize::Daemonize::new()
            .pid_file(&pid_path)
            .chown_pid_file(true)
            .working_directory("/");

        if let Err(e) = daemonize.start() {
            anyhow::bail!("Failed to daemonize: {}", e);
        }
    } else {
        println!("Starting hostwarden in foreground mode...");
    }

    let use_syslog = !foreground && config.general.syslog;
    init_logging(&config.general.log_level, debug, use_syslog)?;
    install_crash_hook(config.notify.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let pid_path = config.pid_path();
    let result = runtime.block_on(Daemon::new(config).run());
    if let Err(e) = &result {
        tracing::error!(fatal = true, "Daemon failed: {:#}", e);
    }

    if !foreground {
        let _ = std::fs::remove_file(&pid_path);
    }
    result
}

fn cmd_stop(config: Config) -> Result<()> {
    let pid_path = config.pid_path();

    if !pid_path.exists() {
        println!("Daemon is not running (no PID file found)");
        return Ok(());
    }

    let pid_str = std::fs::read_to_string(&pid_path)?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .context("Invalid PID in pid file")?;

    // Send SIGTERM
    unsafe {
        if libc::kill(pid, libc::SIGTERM) == 0 {
            println!("Sent stop signal to daemon (PID {})", pid);
        } else {
            println!("Failed to send signal to PID {} (process may have exited)", pid);
            std::fs::remove_file(&pid_path)?;
        }
    }

    Ok(())
}

fn cmd_check(file: &Path) -> Result<()> {
    let report = scan_file(file, Utc::now())
        .with_context(|| format!("Failed to read {}", file.display()))?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &ScanReport) {
    println!(
        "{} {} line(s), {} failure event(s)",
        "Scanned".bold(),
        report.lines,
        report.events.len()
    );

    if report.events.is_empty() {
        println!("No sshd failures found");
        return;
    }

    let rows: Vec<EventRow> = report
        .events
        .iter()
        .map(|e| EventRow {
            line: e.line_number,
            address: e.attempt.address.clone(),
            count: e.attempt.count,
            source: if e.continuation {
                "repeat".to_string()
            } else {
                "direct".to_string()
            },
            result: match e.action {
                UpdateAction::Commit => "blocked".to_string(),
                UpdateAction::InsertRequired => "new".to_string(),
                UpdateAction::Updated => "counted".to_string(),
            },
        })
        .collect();
    println!("{}", Table::new(rows));

    let hosts: Vec<HostRow> = report
        .hosts
        .iter()
        .map(|h| HostRow {
            address: h.address.clone(),
            attempts: h.attempts,
            committed: h.committed,
        })
        .collect();
    println!("\n{}", "Tracked hosts".bold());
    println!("{}", Table::new(hosts));

    if report.blocked.is_empty() {
        println!("\n{}", "No host would be blocked".green());
    } else {
        println!("\n{}", "Would block:".red().bold());
        for address in &report.blocked {
            println!("  {}", address.red());
        }
    }
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

//! kflash - Entry Point
//!
//! Builds and flashes Klipper firmware for USB-attached MCU boards,
//! keeping the host service safe across the whole run.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use async_trait::async_trait;
use colored::Colorize;
use tracing::{error, info};

use kflash::discovery::ByIdScanner;
use kflash::errors::FlashError;
use kflash::exec::SystemRunner;
use kflash::flash::batch::BatchOrchestrator;
use kflash::flash::cancel::CancelToken;
use kflash::flash::config_check::Configurator;
use kflash::flash::orchestrator::DeviceOrchestrator;
use kflash::http::moonraker::MoonrakerClient;
use kflash::logs::{init_logging, LogOptions};
use kflash::models::{
    BatchReport, DeviceProfile, FlashResult, OutcomeKind, PhaseOutcome, RunStatus,
};
use kflash::storage::config_cache::ConfigCache;
use kflash::storage::layout::StorageLayout;
use kflash::storage::registry::Registry;
use kflash::utils::{expand_home, version_info};

/// Runs `make menuconfig` interactively in the firmware tree and returns
/// the resulting config
struct MenuconfigSession {
    klipper_dir: PathBuf,
}

#[async_trait]
impl Configurator for MenuconfigSession {
    async fn configure(&self, device: &DeviceProfile) -> Result<String, FlashError> {
        println!(
            "{}",
            format!("Configuring '{}' (make menuconfig)...", device.name).cyan()
        );
        let status = tokio::process::Command::new("make")
            .arg("menuconfig")
            .current_dir(&self.klipper_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(FlashError::ConfigError(
                "menuconfig exited without saving".to_string(),
            ));
        }
        Ok(tokio::fs::read_to_string(self.klipper_dir.join(".config")).await?)
    }
}

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        let version = version_info();
        println!("{}", serde_json::to_string_pretty(&version).unwrap());
        return;
    }

    if let Err(e) = init_logging(LogOptions::default()) {
        println!("Failed to initialize logging: {e}");
    }

    let layout = StorageLayout::default();
    let registry = Registry::new(layout.clone());
    let cache = ConfigCache::new(layout);

    let data = match registry.load().await {
        Ok(data) => data,
        Err(e) => {
            error!("Unable to read device registry: {e}");
            std::process::exit(1);
        }
    };
    let global = data.global.clone().clamped();

    if cli_args.contains_key("list-devices") {
        list_devices(&data.devices);
        return;
    }

    let runner = SystemRunner;
    let scanner = ByIdScanner::default();
    let moonraker = match MoonrakerClient::new(&global.moonraker_url) {
        Ok(client) => Some(client),
        Err(e) => {
            info!("Moonraker client unavailable: {e}");
            None
        }
    };
    let status = moonraker
        .as_ref()
        .map(|c| c as &dyn kflash::http::moonraker::StatusClient);

    let skip_interactive = cli_args.contains_key("skip-menuconfig");
    let menuconfig = MenuconfigSession {
        klipper_dir: expand_home(&global.klipper_dir),
    };
    let configurator = (!skip_interactive).then_some(&menuconfig as &dyn Configurator);

    let orchestrator = DeviceOrchestrator::new(
        &registry,
        &cache,
        &runner,
        &scanner,
        status,
        configurator,
        global.clone(),
    );

    // Ctrl-C cancels countdowns and in-flight runs; an open service scope
    // still restarts the service
    let cancel = CancelToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Cancelling...".yellow());
            signal_token.cancel();
        }
    });

    if let Some(key) = cli_args.get("device") {
        match orchestrator.run(key, skip_interactive, &cancel).await {
            Ok(result) => {
                print_result(&result);
                std::process::exit(exit_code(&result));
            }
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }

    if cli_args.contains_key("all") {
        let keys = select_keys(&data.devices, &cli_args);
        if keys.is_empty() {
            println!("{}", "No devices selected".yellow());
            return;
        }

        let batch = BatchOrchestrator::new(&orchestrator, &registry, &runner, status);
        match batch.run_all(&keys, skip_interactive, &cancel).await {
            Ok(report) => {
                print_report(&report);
                std::process::exit(if report.all_passed() { 0 } else { 1 });
            }
            Err(FlashError::UserCancelled) => {
                println!("{}", "Batch cancelled before any device was touched".yellow());
                std::process::exit(130);
            }
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }

    print_usage();
}

/// Batch key selection: all registered keys, optionally narrowed by
/// --include-device or pruned by --exclude-device (comma-separated)
fn select_keys(
    devices: &std::collections::BTreeMap<String, DeviceProfile>,
    cli_args: &HashMap<String, String>,
) -> Vec<String> {
    let excluded: Vec<&str> = cli_args
        .get("exclude-device")
        .map(|v| v.split(',').map(str::trim).collect())
        .unwrap_or_default();
    let included: Vec<&str> = cli_args
        .get("include-device")
        .map(|v| v.split(',').map(str::trim).collect())
        .unwrap_or_default();

    devices
        .keys()
        .filter(|key| included.is_empty() || included.contains(&key.as_str()))
        .filter(|key| !excluded.contains(&key.as_str()))
        .cloned()
        .collect()
}

fn list_devices(devices: &std::collections::BTreeMap<String, DeviceProfile>) {
    if devices.is_empty() {
        println!("No devices registered");
        return;
    }
    for profile in devices.values() {
        let flag = if profile.flashable {
            "flashable".green()
        } else {
            "disabled".red()
        };
        println!(
            "{:<16} {:<24} {:<12} [{}]",
            profile.key.bold(),
            profile.name,
            profile.mcu,
            flag
        );
    }
}

fn phase_line(outcome: &PhaseOutcome) -> String {
    let marker = match outcome.kind {
        OutcomeKind::Ok => "ok".green(),
        OutcomeKind::Warned => "warn".yellow(),
        OutcomeKind::Blocked => "blocked".red(),
        OutcomeKind::Failed => "failed".red(),
    };
    format!("  [{}] {}: {}", marker, outcome.phase, outcome.message)
}

fn print_result(result: &FlashResult) {
    let heading = match result.status {
        RunStatus::Success => format!("{} flashed", result.device_key).green().bold(),
        RunStatus::Failed => format!("{} failed", result.device_key).red().bold(),
        RunStatus::Blocked => format!("{} blocked", result.device_key).red().bold(),
        RunStatus::Skipped => format!("{} skipped", result.device_key).yellow().bold(),
    };
    println!("{heading} ({:.1}s)", result.elapsed.as_secs_f64());
    for outcome in &result.phases {
        println!("{}", phase_line(outcome));
        if let Some(context) = &outcome.context {
            for step in &context.recovery {
                println!("      {step}");
            }
        }
    }
}

fn print_report(report: &BatchReport) {
    for result in &report.results {
        print_result(result);
    }
    println!(
        "\n{}: {} succeeded, {} failed, {} blocked, {} skipped",
        "Batch summary".bold(),
        report.succeeded.to_string().green(),
        report.failed.to_string().red(),
        report.blocked,
        report.skipped
    );
    if let Some(warning) = &report.restart_warning {
        println!("{}", warning.red().bold());
    }
}

fn exit_code(result: &FlashResult) -> i32 {
    match result.status {
        RunStatus::Success | RunStatus::Skipped => 0,
        RunStatus::Failed | RunStatus::Blocked => 1,
    }
}

fn print_usage() {
    let version = version_info();
    println!("kflash {} ({})", version.version, version.git_hash);
    println!();
    println!("Usage:");
    println!("  kflash --device=KEY [--skip-menuconfig]   Flash one registered device");
    println!("  kflash --all [--skip-menuconfig]          Flash all flashable devices");
    println!("          [--include-device=a,b] [--exclude-device=c]");
    println!("  kflash --list-devices                     Show the device registry");
    println!("  kflash --version                          Print version information");
}

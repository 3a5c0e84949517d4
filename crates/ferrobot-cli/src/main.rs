//! `ferrobot` – runs a robot from a TOML configuration file.
//!
//! The binary:
//!
//! 1. Loads runtime [`settings`] and installs tracing.
//! 2. Builds a robot over the simulated model registry and applies the
//!    config file.
//! 3. Polls the file and re-applies it whenever its contents change.
//! 4. On **Ctrl-C**, stops every actuator, closes every resource and exits.
//!
//! Usage: `ferrobot [CONFIG]` (default `robot.toml`, or `FERROBOT_CONFIG`).
//!
//! The binary has no network transport. Its dialer only reaches robots
//! registered in the same process, and it registers none, so every
//! `[[remotes]]` entry is reported as unreachable and left failed.

mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use ferrobot_kernel::ApplyReport;
use ferrobot_remote::LoopbackDialer;
use ferrobot_resource::sim_registry::SimRegistry;
use ferrobot_runtime::{LocalRobot, RobotOptions};
use ferrobot_types::{ExtrasByName, ResourceState, RobotConfig, RobotError};
use tracing::{info, warn};

use settings::Settings;

const COMPONENT_SUBTYPES: &[&str] = &[
    "arm",
    "base",
    "board",
    "camera",
    "encoder",
    "gripper",
    "motor",
    "movement_sensor",
    "sensor",
    "servo",
];
const SERVICE_SUBTYPES: &[&str] = &["navigation", "slam", "vision"];

fn main() -> ExitCode {
    let arg = std::env::args().nth(1);
    let settings = match settings::load(arg.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Settings error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    // ── Structured logging ────────────────────────────────────────────────
    // Installed before the runtime exists; the exporter does not need one.
    let _telemetry = ferrobot_runtime::telemetry::init_tracing(&settings.service_name);

    print_banner();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Shutdown error".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), RobotError> {
    let robot = build_robot(&settings);
    let path = settings.config_path.clone();

    println!("  Config file   {}", path.display().to_string().bold());
    println!("  Poll interval {} ms", settings.poll_interval_ms);
    println!();

    let mut last_seen = read_config(&path).await;
    match &last_seen {
        Some(raw) => apply(&robot, raw).await,
        None => println!(
            "  {} {} not found; waiting for it to appear.",
            "!".yellow().bold(),
            path.display()
        ),
    }

    // ── Hot reload / shutdown ─────────────────────────────────────────────
    let mut ticker = tokio::time::interval(settings.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
                }
                break;
            }
            _ = ticker.tick() => {
                let current = read_config(&path).await;
                if current.is_some() && current != last_seen {
                    info!(path = %path.display(), "config file changed");
                    if let Some(raw) = &current {
                        apply(&robot, raw).await;
                    }
                    last_seen = current;
                }
            }
        }
    }

    println!();
    println!("{}", "  Ctrl-C received – stopping robot …".yellow().bold());
    let stopped = robot.manager().stop_all(&ExtrasByName::new()).await;
    match &stopped {
        Ok(()) => println!("{}", "  ✓ All actuators stopped.".green()),
        Err(e) => println!("  {} {}", "✗ Stop failed:".red(), e),
    }
    robot.close().await?;
    println!("{}", "  ✓ All resources closed.".green());
    stopped
}

fn build_robot(settings: &Settings) -> Arc<LocalRobot> {
    let registry = COMPONENT_SUBTYPES
        .iter()
        .fold(SimRegistry::builder(), |b, subtype| b.with_component(subtype));
    let (registry, _probe) = SERVICE_SUBTYPES
        .iter()
        .fold(registry, |b, subtype| b.with_service(subtype))
        .with_catalog()
        .build();
    let options = RobotOptions {
        build_timeout: settings.build_timeout(),
    };
    LocalRobot::new(Arc::new(registry), Arc::new(LoopbackDialer::new()), options)
}

/// Remote declarations the in-process dialer cannot reach.
fn unreachable_remotes(config: &RobotConfig) -> Vec<String> {
    config.remotes.iter().map(|r| format!("{} ({})", r.name, r.address)).collect()
}

async fn read_config(path: &std::path::Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

/// Parse and apply one revision of the config file. Errors are printed and
/// the robot keeps running on what it already has.
async fn apply(robot: &LocalRobot, raw: &str) {
    let config = match ferrobot_kernel::config::parse(raw) {
        Ok(c) => c,
        Err(e) => {
            println!("  {} {}", "✗ Config rejected:".red().bold(), e);
            return;
        }
    };
    for remote in unreachable_remotes(&config) {
        warn!(remote = %remote, "no transport for remotes in this binary");
        println!(
            "  {} remote {} cannot be dialed from this binary",
            "!".yellow().bold(),
            remote
        );
    }
    match robot.reconfigure(config).await {
        Ok(report) => print_report(&report),
        Err(e) => println!("  {} {}", "✗ Applied with errors:".yellow().bold(), e),
    }
    print_status(robot).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_report(report: &ApplyReport) {
    if report.is_noop() && report.failed.is_empty() {
        println!("  {}", "No changes.".dimmed());
        return;
    }
    let line = |label: &str, names: &[ferrobot_types::ResourceName]| {
        if !names.is_empty() {
            let joined: Vec<String> = names.iter().map(ToString::to_string).collect();
            println!("  {:<13}{}", label, joined.join(", "));
        }
    };
    line("built", &report.built);
    line("rebuilt", &report.rebuilt);
    line("reconfigured", &report.reconfigured);
    line("removed", &report.removed);
    line("pending", &report.pending);
    line("dormant", &report.dormant);
    for (name, error) in &report.failed {
        println!("  {:<13}{} ({})", "failed".red(), name, error);
    }
}

async fn print_status(robot: &LocalRobot) {
    let statuses = match robot.manager().status(&[]).await {
        Ok(s) => s,
        Err(e) => {
            println!("  {} {}", "Status unavailable:".yellow(), e);
            return;
        }
    };
    println!();
    for status in statuses {
        let state = match status.state {
            ResourceState::Ready => "ready".green(),
            ResourceState::Configuring => "configuring".cyan(),
            ResourceState::Pending => "pending".yellow(),
            ResourceState::Unhealthy => "unhealthy".red(),
            ResourceState::Disconnected => "disconnected".magenta(),
        };
        match status.error {
            Some(error) => println!(
                "    • {} {} {}",
                status.name.to_string().bold(),
                state,
                error.dimmed()
            ),
            None => println!("    • {} {}", status.name.to_string().bold(), state),
        }
    }
    println!();
}

fn print_banner() {
    println!();
    println!("{}", r#"    ___                 __        __ "#.bold().cyan());
    println!("{}", r#"   / _/__ ___________  / /  ___  / /_"#.bold().cyan());
    println!("{}", r#"  / _/ -_) __/ __/ _ \/ _ \/ _ \/ __/"#.bold().cyan());
    println!("{}", r#" /_/ \__/_/ /_/  \___/_.__/\___/\__/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "ferrobot".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot resource runtime");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_declared_remote_is_reported_unreachable() {
        let config = ferrobot_kernel::config::parse(
            r#"
[[remotes]]
name = "foo"
address = "foo.local:8080"
"#,
        )
        .unwrap();
        assert_eq!(unreachable_remotes(&config), vec!["foo (foo.local:8080)"]);
        assert!(unreachable_remotes(&RobotConfig::default()).is_empty());
    }

    #[tokio::test]
    async fn declared_remote_is_left_failed() {
        let robot = build_robot(&Settings::default());
        let mut config = ferrobot_kernel::config::parse(
            r#"
[[remotes]]
name = "foo"
address = "foo.local"

[[components]]
name = "arm1"
api = "rdk:component:arm"
model = "rdk:builtin:fake"
"#,
        )
        .unwrap();
        config.remotes[0].dial_attempts = 1;
        let report = robot.reconfigure(config).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(robot.manager().resource_names().len(), 1);
        robot.close().await.unwrap();
    }
}

//! sriov-plugin - Docker network plugin for SR-IOV
//!
//! Hands SR-IOV virtual functions to containers, with per-network VLAN
//! tagging and reference-counted PF lifecycle.

mod cli;
mod error;
mod hw;
mod manifest;
mod plugin;
mod sriov;

use cli::{Cli, Commands};
use error::Result;
use hw::sysfs::PfInfo;
use hw::{SimulatedSriov, SriovControl, SysfsSriov};
use manifest::{Backend, PluginConfig};
use sriov::SriovDriver;

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    // Commands that don't require config
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = manifest::load_or_default(cli.config.as_deref())?;
    init_logging(&config, cli.debug);

    match cli.command {
        Commands::Serve => serve(config),
        Commands::Check => check(&config),
        Commands::Devices { json } => devices(&config, json),
        // Already handled above
        Commands::Completion { .. } => unreachable!(),
    }
}

/// Install the global tracing subscriber
///
/// RUST_LOG wins over `--debug`, which wins over the configured level.
fn init_logging(config: &PluginConfig, debug: bool) {
    let level = if debug {
        "debug"
    } else {
        config.plugin.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_backend(config: &PluginConfig) -> Arc<dyn SriovControl> {
    match config.plugin.backend {
        Backend::Sysfs => Arc::new(SysfsSriov::new(
            config.plugin.sysfs_root.clone(),
            config.plugin.ip_command.clone(),
            config.discovery.clone(),
        )),
        Backend::Simulated => Arc::new(
            config
                .simulated
                .iter()
                .fold(SimulatedSriov::new(), |hw, pf| hw.with_pf(&pf.name, pf.vfs)),
        ),
    }
}

fn serve(config: PluginConfig) -> Result<()> {
    if config.plugin.backend == Backend::Sysfs && !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, SR-IOV changes through sysfs will likely fail");
    }

    let driver = Arc::new(SriovDriver::from_settings(
        build_backend(&config),
        &config.plugin,
    ));
    let socket = config.socket_path();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = driver.backend(),
        vlan_policy = ?config.plugin.vlan_policy,
        option_parsing = ?config.plugin.option_parsing,
        "Starting sriov-plugin"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(plugin::serve(&socket, driver, shutdown_signal()))
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

fn check(config: &PluginConfig) -> Result<()> {
    // Configuration was already validated on load
    println!("Configuration is valid.");

    println!("\nPlugin:");
    println!("  Name: {}", config.plugin.name);
    println!("  Socket: {}", config.socket_path().display());
    println!("  Backend: {:?}", config.plugin.backend);
    println!("  VLAN policy: {:?}", config.plugin.vlan_policy);
    println!("  Option parsing: {:?}", config.plugin.option_parsing);

    match config.plugin.backend {
        Backend::Sysfs => {
            let net = config.plugin.sysfs_root.join("class/net");
            let status = if net.exists() { "exists" } else { "missing" };
            println!("\nSysfs: {} ({})", net.display(), status);
            println!(
                "Discovery: {} attempts, {}-{}ms backoff",
                config.discovery.max_attempts,
                config.discovery.base_delay_ms,
                config.discovery.max_delay_ms
            );
        }
        Backend::Simulated => {
            println!("\nSimulated devices:");
            for pf in &config.simulated {
                println!("  {}: {} VFs", pf.name, pf.vfs);
            }
        }
    }

    Ok(())
}

fn devices(config: &PluginConfig, json: bool) -> Result<()> {
    let pfs: Vec<PfInfo> = match config.plugin.backend {
        Backend::Sysfs => SysfsSriov::new(
            config.plugin.sysfs_root.clone(),
            config.plugin.ip_command.clone(),
            config.discovery.clone(),
        )
        .list_capable()?,
        Backend::Simulated => config
            .simulated
            .iter()
            .map(|pf| PfInfo {
                name: pf.name.clone(),
                total_vfs: pf.vfs,
                num_vfs: 0,
            })
            .collect(),
    };

    if json {
        let data: Vec<serde_json::Value> = pfs
            .iter()
            .map(|pf| {
                serde_json::json!({
                    "name": pf.name,
                    "total_vfs": pf.total_vfs,
                    "num_vfs": pf.num_vfs,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{:<16} {:<10} {:<10}", "NAME", "TOTAL_VFS", "NUM_VFS");
        println!("{}", "-".repeat(36));
        for pf in &pfs {
            println!("{:<16} {:<10} {:<10}", pf.name, pf.total_vfs, pf.num_vfs);
        }
    }

    Ok(())
}

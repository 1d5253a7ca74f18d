use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use plugin_vmhost::config::Config;
use plugin_vmhost::dispatch::Host;
use plugin_vmhost::error::Result;
use plugin_vmhost::network::Allocator;
use plugin_vmhost::pool::{maintenance, PrewarmPool};
use plugin_vmhost::registry::JsonFileRegistry;
use plugin_vmhost::vm::VmSupervisor;

#[derive(Parser)]
#[command(name = "plugin-vmhost")]
#[command(about = "Runs plugins in isolated Firecracker microVMs and dispatches action hooks")]
struct Cli {
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host: sweep orphans, restore active plugins, and serve the
    /// expiry sweeper until interrupted.
    Serve,
    /// Install a plugin package (zip of plugin.json + rootfs.ext4).
    Install {
        #[arg(value_name = "ZIP_PATH")]
        zip_path: PathBuf,
    },
    /// Activate an installed plugin: boot it, health-gate it, pause it.
    Activate { slug: String },
    /// Deactivate an active plugin: snapshot it and stop its VM.
    Deactivate { slug: String },
    /// Dispatch an action hook with a JSON payload to every active plugin
    /// that declares it.
    Dispatch { hook: String, payload: String },
    /// Print the registry's current view of every installed plugin.
    Status,
}

async fn load_config(path: &str) -> Result<Config> {
    if PathBuf::from(path).is_file() {
        Config::load_from_file(path).await
    } else {
        Ok(Config::default())
    }
}

async fn build_host(config: Config) -> Result<Host> {
    let registry = Arc::new(JsonFileRegistry::load(config.data.registry_path()).await?);
    let allocator = Arc::new(Allocator::new(config.network.clone())?);
    let supervisor = Arc::new(VmSupervisor::new(
        config.firecracker.binary_path.clone(),
        config.firecracker.socket_dir.clone(),
    ));
    let pool = Arc::new(PrewarmPool::new(Duration::from_secs(config.pool.max_age_seconds)));

    Ok(Host::new(config, registry, allocator, supervisor, pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    config.validate()?;

    match cli.command {
        Commands::Serve => {
            let sweep_interval = Duration::from_secs(config.pool.sweep_interval_seconds);
            let host = build_host(config).await?;
            host.startup_cleanup().await?;

            let _sweeper = maintenance::spawn_sweeper(
                host.pool(),
                host.supervisor(),
                host.allocator(),
                sweep_interval,
            );

            info!("plugin-vmhost serving, sweeping pool every {sweep_interval:?}");
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        }
        Commands::Install { zip_path } => {
            let host = build_host(config).await?;
            let manifest = host.install(&zip_path).await?;
            info!("installed {} v{}", manifest.slug, manifest.version);
        }
        Commands::Activate { slug } => {
            let host = build_host(config).await?;
            host.activate(&slug).await?;
            info!("activated {slug}");
        }
        Commands::Deactivate { slug } => {
            let host = build_host(config).await?;
            host.deactivate(&slug).await?;
            info!("deactivated {slug}");
        }
        Commands::Dispatch { hook, payload } => {
            let host = build_host(config).await?;
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let report = host.execute(&hook, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let registry = JsonFileRegistry::load(config.data.registry_path()).await?;
            use plugin_vmhost::registry::PluginRegistry;
            let plugins = registry.list().await;
            for plugin in plugins {
                println!(
                    "{}\tv{}\t{:?}\t{:?}\t{}",
                    plugin.slug,
                    plugin.manifest.version,
                    plugin.status,
                    plugin.assigned_ip,
                    plugin.last_health.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(())
}

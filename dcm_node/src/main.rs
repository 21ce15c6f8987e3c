use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use tracing::{error, info};

use rt_kaffee_dcm_node::cli::{Cli, Commands};
use rt_kaffee_dcm_node::pipeline::Pipeline;
use rt_kaffee_dcm_node::sender::SendEngine;
use rt_kaffee_dcm_node::{Config, Service};
use rt_kaffee_common::Validate;

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let level = cli.log_level();
    tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_target(true)
        .with_max_level(level)
        .init();

    match cli.command {
        Commands::Generate => {
            let sample = Config::sample();
            let toml =
                toml::to_string_pretty(&sample).expect("sample configuration must serialize");
            println!("{toml}");
            Ok(())
        }
        Commands::Show { config } => {
            let config = load_config(config)?;
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| anyhow!("{e}"))?
            );
            Ok(())
        }
        Commands::Start { config } => {
            let config = load_config(config)?;
            let service = Service::start(config)?;
            let stop = service.stop_flag();
            {
                let stop = Arc::clone(&stop);
                ctrlc::set_handler(move || {
                    info!("Shutdown requested");
                    stop.store(true, Ordering::SeqCst);
                })
                .map_err(|e| anyhow!("unable to install signal handler: {e}"))?;
            }
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            service.shutdown();
            Ok(())
        }
        Commands::Import { config } => {
            let config = load_config(config)?;
            config.validate()?;
            config.create_dirs()?;
            let sender = Arc::new(SendEngine::new(
                config.general.local_ae_title.clone(),
                config.failed_dir(),
            ));
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let pipeline = Pipeline::new(&config, sender, stop);
            let imported = pipeline.import()?;
            info!("Import finished: {imported} file(s) processed");
            // drains pending forwarding jobs before returning
            pipeline.shutdown();
            Ok(())
        }
    }
}

/// Uses the given configuration path or falls back to `config.toml` next
/// to the executable.
fn config_path_or_default(config: Option<String>) -> Result<PathBuf, anyhow::Error> {
    if let Some(config) = config {
        return Ok(PathBuf::from(config));
    }
    let exe = std::env::current_exe().map_err(|e| {
        error!("{e:#?}");
        anyhow!("failed to locate the current executable")
    })?;
    exe.parent()
        .ok_or_else(|| anyhow!("executable has no parent directory"))
        .map(|p| p.join("config.toml"))
}

fn load_config(config: Option<String>) -> Result<Config, anyhow::Error> {
    let path = config_path_or_default(config)?;
    Ok(Config::from_file(path)?)
}

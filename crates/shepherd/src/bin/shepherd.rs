//! Shepherd CLI
//!
//! Usage:
//!   shepherd start                  # start all configured services
//!   shepherd start ollama_server    # start one service
//!   shepherd stop                   # stop everything, clear state
//!   shepherd status                 # reconciled status of the fleet
//!   shepherd consul-discover        # list registry entries

use shepherd::cli::{Action, ManagerArgs};
use shepherd::config::ServiceFile;
use shepherd::runtime::Orchestrator;
use shepherd::state;
use std::path::PathBuf;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: ManagerArgs = argh::from_env();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    // A relative config path is tried as given, then under the base dir.
    let mut config_path = PathBuf::from(&args.config);
    if !config_path.exists() && config_path.is_relative() {
        let fallback = state::shepherd_home().join(&config_path);
        if fallback.exists() {
            config_path = fallback;
        }
    }

    log::info!("loading configuration: {}", config_path.display());
    let file = match ServiceFile::from_file(&config_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut orchestrator = match Orchestrator::new(&file) {
        Ok(o) => o,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    // SIGINT/SIGTERM trigger an orderly stop of the start sequence.
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("received interrupt, shutting down...");
        let _ = shutdown_tx.send(());
    })
    .expect("Error setting Ctrl+C handler");

    let success = match args.action {
        Action::Start(start) => match start.service {
            Some(name) => match orchestrator.start_service(&name).await {
                Ok(()) => {
                    println!("Started {}", name);
                    true
                }
                Err(e) => {
                    log::error!("{}", e);
                    false
                }
            },
            None => {
                let report = orchestrator.start_all(&shutdown_rx).await;
                if shutdown_rx.has_changed().unwrap_or(false) {
                    orchestrator.stop_all().await;
                    false
                } else {
                    print!("{}", report);
                    report.success()
                }
            }
        },
        Action::Stop(stop) => match stop.service {
            Some(name) => match orchestrator.stop_service(&name).await {
                Ok(()) => {
                    println!("Stopped {}", name);
                    true
                }
                Err(e) => {
                    log::error!("{}", e);
                    false
                }
            },
            None => {
                let report = orchestrator.stop_all().await;
                println!("Stopped {} service(s)", report.stopped);
                for (name, error) in &report.failures {
                    println!("  ! {}: {}", name, error);
                }
                report.success()
            }
        },
        Action::Status(_) => {
            let report = orchestrator.status().await;
            print!("{}", report);
            true
        }
        Action::Restart(_) => {
            let (stop, start) = orchestrator.restart_all(&shutdown_rx).await;
            print!("{}", start);
            stop.success() && start.success()
        }
        Action::ConsulRegister(_) => orchestrator.register_all().await,
        Action::ConsulUnregister(_) => orchestrator.deregister_all().await,
        Action::ConsulDiscover(discover) => {
            let entries = orchestrator.discover(discover.service.as_deref()).await;
            println!("Discovered {} service(s)", entries.len());
            for entry in &entries {
                println!(
                    "  * {} ({}) {}:{} tags=[{}]",
                    entry.name,
                    entry.service_id,
                    entry.host,
                    entry.port,
                    entry.tags.join(", ")
                );
            }
            true
        }
    };

    std::process::exit(if success { 0 } else { 1 });
}

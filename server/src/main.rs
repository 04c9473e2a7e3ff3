use clap::Parser;
use log::{error, info};
use server::install::{accept_eula, Paths};
use server::orchestrator::{listen_for_signals, spawn_console_reader};
use server::{Lifecycle, Orchestrator, Settings};

/// Parses settings, prepares the working directories, then runs the
/// lifecycle loop until shutdown or a fatal error.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::parse();

    let paths = Paths::new(&settings.root);
    paths.create_directories()?;
    accept_eula(&paths.minecraft, settings.eula)?;
    if !settings.eula {
        info!("EULA not accepted; set EULA=true to let the server start");
    }

    let orchestrator = Orchestrator::new();
    tokio::spawn(listen_for_signals(orchestrator.clone()));
    let mut console = spawn_console_reader();

    let lifecycle = Lifecycle::new(settings, orchestrator);
    match lifecycle.run(&mut console).await {
        Ok(()) => {
            info!("Shut down cleanly");
            // stdin reader would otherwise keep the runtime alive
            std::process::exit(0);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

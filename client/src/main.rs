use clap::Parser;
use client::{ping_server_with, PingOptions};
use log::{error, info};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query a server's status", long_about = None)]
struct Args {
    /// Server host to ping
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "25565")]
    port: u16,

    /// Settle time in milliseconds before the response counts as complete
    #[arg(short, long, default_value = "100")]
    settle: u64,

    /// Print the full status document as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let options = PingOptions {
        settle: Duration::from_millis(args.settle),
        ..PingOptions::default()
    };

    info!("Pinging {}:{}", args.host, args.port);

    let status = match ping_server_with(&args.host, args.port, &options).await {
        Ok(status) => status,
        Err(e) => {
            error!("Ping failed: {}", e);
            std::process::exit(1);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{} (protocol {})", status.version.name, status.version.protocol);
        println!("{}", status.description.text());
        println!("{} / {} players online", status.players.online, status.players.max);
        for player in &status.players.sample {
            println!("  {} ({})", player.name, player.id);
        }
    }

    Ok(())
}

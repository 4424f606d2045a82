use anyhow::Result;
use clap::Parser;

mod cli;
mod client;

use cli::{Cli, Commands};
use fleet_config::FleetConfig;
use fleet_supervisor::serve::{ServeOptions, run_serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { bind, config } => {
            run_serve(ServeOptions {
                bind,
                port: cli.port,
                config_path: config.unwrap_or_else(FleetConfig::default_path),
            })
            .await
        }
        Commands::Status => client::print_json(cli.port, "status").await,
        Commands::Tools => client::print_json(cli.port, "tools").await,
        Commands::Start { target } => client::post(cli.port, &format!("start/{target}")).await,
        Commands::Stop { target } => client::post(cli.port, &format!("stop/{target}")).await,
        Commands::Kill => client::post(cli.port, "kill").await,
    }
}

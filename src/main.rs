use airband_relay::cli::{Cli, Commands};
use airband_relay::config::AppConfig;
use airband_relay::manager::{ChannelManager, shutdown_signal};
use airband_relay::radio::Designator;
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = load_config(&cli)?;
            let manager = ChannelManager::from_config(config)?;
            tracing::info!(version = %airband_relay::version_string(), "airband-relay starting");
            manager.run(shutdown_signal()).await?;
        }
        Commands::CheckConfig => {
            let config = load_config(&cli)?;
            let manager = ChannelManager::from_config(config)?;
            println!("{}", manager.configuration_summary());
            println!("Configuration OK");
        }
        Commands::Designator { code } => {
            let designator = Designator::decode(&code)?;
            println!("Designator:  {}", designator.code);
            println!("Bandwidth:   {} Hz", designator.bandwidth_hz);
            println!(
                "Modulation:  {} ({})",
                designator.modulation_type, designator.description
            );
            println!("Output gain: {}", designator.output_gain());
        }
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?
        .with_env_overrides();

    if let Some(timeout) = cli.ptt_timeout {
        config.ptt_timeout_ms = timeout.as_millis() as u64;
    }
    Ok(config)
}

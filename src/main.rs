use clap::Parser;
use gridpilot::cli::client::ApiClient;
use gridpilot::cli::output::{print_error, print_item, print_kv, print_success, OutputMode};
use gridpilot::cli::{self, Cli, Commands};
use gridpilot::config::AppConfig;
use gridpilot::error::Result;
use std::path::PathBuf;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, load_config, run_controller};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        print_error(&format!("error: {e}"));
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mode = OutputMode::from_json_flag(cli.json);

    match cli.command {
        Commands::Run {
            mode: start_mode,
            venue,
            no_api,
        } => {
            let mut config = load_config(&cli.config_dir)?;
            if let Some(start_mode) = start_mode {
                config.controller.mode = start_mode;
            }
            if let Some(venue) = venue {
                config.venue.kind = venue;
            }
            init_logging(&config.logging);
            run_controller(&cli.config_dir, config, !no_api).await?;
        }
        Commands::CheckConfig => {
            init_logging_simple();
            let config = AppConfig::load_from(&cli.config_dir)?;
            match config.validate() {
                Ok(()) => {
                    if mode == OutputMode::Json {
                        print_item(&config)?;
                    } else {
                        print_success("configuration is valid");
                        print_kv("mode", config.controller.mode);
                        print_kv("venue", config.venue.kind);
                        print_kv("cycle", format!("{}s", config.controller.cycle_interval_secs));
                        print_kv("strategy", format!("{:?}", config.optimizer.strategy));
                        print_kv("daily loss cap", config.risk.max_daily_loss);
                    }
                }
                Err(problems) => {
                    for problem in &problems {
                        print_error(problem);
                    }
                    return Err(gridpilot::PilotError::Validation(format!(
                        "{} problem(s) in configuration",
                        problems.len()
                    )));
                }
            }
        }
        Commands::Levels {
            scenarios,
            symbol,
            side,
        } => {
            init_logging_simple();
            let path = match scenarios {
                Some(path) => path,
                None => AppConfig::load_from(&cli.config_dir)?
                    .levels
                    .scenarios_path
                    .unwrap_or_else(|| PathBuf::from("config/scenarios.toml")),
            };
            cli::levels::run(&path, symbol, side, mode).await?;
        }
        Commands::Ctl {
            url,
            token,
            operator,
            command,
        } => {
            init_logging_simple();
            let client = ApiClient::new(&url, token, operator)?;
            cli::ctl::run(&client, command, mode).await?;
        }
    }
    Ok(())
}

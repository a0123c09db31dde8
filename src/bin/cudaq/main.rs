use clap::{CommandFactory, Parser};
use std::process::ExitCode;

mod cli;
mod commands;
mod logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cudaq::parse();

    if let cli::Commands::Completion { shell } = args.command {
        let mut cmd = cli::Cudaq::command();
        clap_complete::generate(shell, &mut cmd, "cudaq", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let config = match commands::resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:?}");
            return ExitCode::from(2);
        }
    };

    // Only the dispatcher writes a log file
    let log_dir = matches!(args.command, cli::Commands::Run(_)).then_some(config.log_dir.as_path());
    let _guard = match logging::init(args.verbosity, log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:?}");
            return ExitCode::from(2);
        }
    };

    match commands::handle_commands(args.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

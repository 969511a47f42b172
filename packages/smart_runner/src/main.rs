use clap::Parser;
use std::process::ExitCode;
use tracing::error;

use smart_runner::cli::{self, Cli, Commands, EXIT_LAUNCH_FAILURE};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    cli::init_logging(args.debug);

    let result = match args.command {
        Commands::Run(run) => match cli::run::run_command(run).await {
            Ok(code) => return ExitCode::from(code),
            Err(e) => {
                error!("Failed to start: {:#}", e);
                return ExitCode::from(EXIT_LAUNCH_FAILURE);
            }
        },
        Commands::Status(status) => cli::operator::status_command(status),
        Commands::Ack(ack) => cli::operator::ack_command(ack),
        Commands::Send(send) => cli::operator::send_command(send),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("smart-runner: {e:#}");
            ExitCode::FAILURE
        }
    }
}

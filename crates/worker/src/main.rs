use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod handlers;
mod signals;

fn main() -> ExitCode {
    // A missing .env file is fine; the environment may be set another way.
    let _ = dotenvy::dotenv();
    let cli = cli::Cli::parse();
    jobsync_observability::init();

    // One sequential worker per process; scale out by running more processes.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "jobsync failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

use anyhow::Result;
use clap::Parser;

mod agent;
mod cli;
mod commands;
mod config;
mod error;
mod platform;
mod retention;
mod seal;
#[cfg(test)]
mod test_support;

use cli::{Args, Commands};
use commands::utils::init_agent_logging;
use commands::{SetupRequest, run_cleanup};
use config::AgentPaths;

fn main() {
    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    let paths = AgentPaths::resolve(args.home.as_deref())?;

    init_agent_logging(&paths, args.verbose);

    // Invoked by the daily or one-shot cleanup task
    if args.cleanup {
        return Ok(run_cleanup(&paths, args.mode, args.task_name.as_deref()));
    }

    match args.command.unwrap_or(Commands::Run) {
        Commands::Setup {
            api_url,
            device_id,
            device_token,
            portal_url,
            active_interval,
            idle_interval,
        } => commands::agent::setup(
            &paths,
            SetupRequest {
                api_url,
                device_id,
                device_token,
                portal_url,
                active_interval,
                idle_interval,
            },
        )?,
        Commands::Run => commands::agent::run(paths)?,
        Commands::Status => commands::agent::status(&paths)?,
    }

    Ok(0)
}

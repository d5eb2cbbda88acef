//! `intake`: partner data-intake run orchestrator.
//!
//! Exit codes: 0 when a command did what was asked (including runs that
//! suspend or are rejected), 1 when a run ends `failed` or a command hits an
//! infrastructure error, 2 for protocol violations.
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod approval;
mod audit;
mod cli;
mod config;
mod context;
mod error;
mod evidence;
mod orchestrator;
mod plan;
mod run;
mod share;
#[cfg(test)]
mod testing;
mod tool;
mod util;
mod watch;
mod workflow;

use cli::{Command, RootArgs};
use workflow::Outcome;

fn init_tracing(verbose: bool) {
    let default = if verbose { "intake=debug" } else { "intake=info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let args = RootArgs::parse();
    init_tracing(args.verbose);
    let root = args.root;
    let result = match args.command {
        Command::Run(args) => workflow::run_start(&root, args),
        Command::Resume(args) => workflow::run_resume(&root, args),
        Command::Watch(args) => workflow::run_watch(&root, args),
        Command::Status(args) => workflow::run_status(&root, args),
        Command::Decide(args) => workflow::run_decide(&root, args),
        Command::Review(args) => workflow::run_review(&root, args),
        Command::Abandon(args) => workflow::run_abandon(&root, args),
        Command::Share(args) => workflow::run_share(&root, args),
    };
    match result {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::RunFailed) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            if error::protocol_violation(&err).is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

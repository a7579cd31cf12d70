use std::process::ExitCode;

use clap::Parser;
use reliable_udp_sender::config::{Args, Config};
use reliable_udp_sender::coordinator;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::from_args(args);

    match coordinator::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sender error: {e}");
            ExitCode::FAILURE
        }
    }
}

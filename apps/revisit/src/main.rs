mod cli;
mod commands;
mod logging;

use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let options = cli::parse();
    if let Err(error) = logging::init(options.log_json) {
        eprintln!("revisit: failed to initialize logging: {error}");
        return ExitCode::FAILURE;
    }

    match commands::run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(code = error.code, "{}", error.message);
            eprintln!("revisit: {error}");
            ExitCode::FAILURE
        }
    }
}

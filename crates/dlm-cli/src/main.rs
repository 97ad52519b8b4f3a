use dlm_core::logging;

mod cli;

use crate::cli::CliCommand;

fn main() {
    if let Err(e) = logging::init_logging() {
        eprintln!("dlm: log file unavailable ({}), using stderr", e);
        logging::init_logging_stderr();
    }

    if let Err(err) = CliCommand::run_from_args() {
        eprintln!("dlm error: {:#}", err);
        std::process::exit(1);
    }
}

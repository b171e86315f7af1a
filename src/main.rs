use std::process::ExitCode;

use clap::Parser;
use ftpfetch::cli::Cli;
use ftpfetch::report::EXIT_FATAL;

fn main() -> ExitCode {
    let cli = Cli::parse();
    // flushes the log file on exit
    let _log_guard = match ftpfetch::logging::init_tracing(cli.verbose, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    tracing::debug!("[main] {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    ExitCode::from(ftpfetch::commands::run(&cli))
}

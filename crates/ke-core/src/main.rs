use clap::Parser;
use std::io::Write;

use ke_core::cli::{self, Cli};
use ke_core::exit_codes::ExitCode;
use ke_core::logging;

fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init_logging(cli.global.log_level.as_deref(), cli.global.log_json) {
        eprintln!("{err}");
        std::process::exit(ExitCode::ConfigError.as_i32());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let code = match cli::run(cli, &mut out) {
        Ok(()) => ExitCode::Ok,
        Err(err) => {
            tracing::debug!(error = %err, "command failed");
            eprintln!("{}", cli::error_payload(&err));
            err.exit_code()
        }
    };
    let _ = out.flush();
    std::process::exit(code.as_i32());
}

//! CLI entrypoint for the Switchboard plugin host.
//!
//! The binary delegates to [`switchboard_host::run`], which loads
//! configuration, starts the configured plugins and runs one command.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    switchboard_host::run(std::env::args_os(), &mut stdout, &mut stderr)
}

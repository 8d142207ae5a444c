//! Entry point of the reference event plugin.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stderr = io::stderr().lock();
    switchboard_event_plugin::run(std::env::args_os(), &mut stderr)
}

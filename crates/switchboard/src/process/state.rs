//! Lifecycle state of a plugin child process.

use std::process::{Child, ExitStatus};

/// State of a spawned plugin.
///
/// A [`super::PluginProcess`] is only handed out once the handshake and the
/// first ping have succeeded, so the machine starts in `Running`.
#[derive(Debug)]
pub(super) enum ProcessState {
    /// The child is running and owns its pipes.
    Running {
        /// Child process handle.
        child: Child,
    },
    /// The child has been killed or has exited.
    Stopped {
        /// Exit status observed when the child was reaped.
        status: Option<ExitStatus>,
    },
}


impl ProcessState {
    /// Moves the child out, leaving `Stopped` without a status.
    ///
    /// Returns `None` when the process was already stopped.
    pub(super) fn take_child(&mut self) -> Option<Child> {
        match std::mem::replace(self, Self::Stopped { status: None }) {
            Self::Running { child } => Some(child),
            stopped @ Self::Stopped { .. } => {
                *self = stopped;
                None
            }
        }
    }
}

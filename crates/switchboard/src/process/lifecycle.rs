//! Termination helpers shared by the spawn path and `kill`.

use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::PROCESS_TARGET;

/// How long a plugin may take to exit on its own once its channel closed.
const GRACE_PERIOD: Duration = Duration::from_millis(200);

const REAP_POLL: Duration = Duration::from_millis(10);

/// Polls `child` until it exits or `budget` elapses.
pub(super) fn wait_for_exit(child: &mut Child, budget: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + budget;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Terminates and reaps `child`.
///
/// A plugin whose channel has been closed normally exits by itself, so the
/// child gets a short grace period before it is killed.
pub(super) fn terminate_child(plugin: &str, child: &mut Child) -> Option<ExitStatus> {
    if let Some(status) = wait_for_exit(child, GRACE_PERIOD) {
        debug!(target: PROCESS_TARGET, plugin, ?status, "plugin exited");
        return Some(status);
    }
    if let Err(err) = child.kill() {
        warn!(target: PROCESS_TARGET, plugin, error = %err, "failed to kill plugin");
    }
    match child.wait() {
        Ok(status) => {
            debug!(target: PROCESS_TARGET, plugin, ?status, "plugin killed");
            Some(status)
        }
        Err(err) => {
            warn!(target: PROCESS_TARGET, plugin, error = %err, "failed to reap plugin");
            None
        }
    }
}

/// Kills the child on drop unless startup completed.
#[derive(Debug)]
pub(super) struct ChildGuard<'a> {
    plugin: &'a str,
    child: Option<Child>,
}

impl<'a> ChildGuard<'a> {
    pub(super) const fn new(plugin: &'a str, child: Child) -> Self {
        Self {
            plugin,
            child: Some(child),
        }
    }

    pub(super) const fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Exit code of a child that is exiting anyway, if it does so promptly.
    pub(super) fn exit_code(&mut self, budget: Duration) -> Option<i32> {
        self.child
            .as_mut()
            .and_then(|child| wait_for_exit(child, budget))
            .and_then(|status| status.code())
    }

    /// Hands the child over to the caller.
    pub(super) fn disarm(mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(target: PROCESS_TARGET, plugin = self.plugin, "killing partially started plugin");
            if let Err(err) = child.kill() {
                debug!(target: PROCESS_TARGET, plugin = self.plugin, error = %err, "kill failed");
            }
            if let Err(err) = child.wait() {
                debug!(target: PROCESS_TARGET, plugin = self.plugin, error = %err, "reap failed");
            }
        }
    }
}

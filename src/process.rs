//! Shutdown escalation shared by node and wallet handles.

use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Interrupt the child, give it the grace period, then kill it.
///
/// Runs synchronously so it can double as the drop-guard path; the grace
/// period blocks the calling thread for at most three seconds. Failures are
/// logged as warnings and never raised: once this returns, either the
/// process has exited or SIGKILL has been delivered, and the goal (no
/// orphaned process) is met either way.
pub(crate) fn shutdown_child(label: &str, child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    debug!("interrupting {} (pid {})", label, pid);
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!("failed to interrupt {} (pid {}): {}", label, pid, err);
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited with {}", label, status);
                return;
            }
            Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
            Err(err) => {
                warn!("failed to poll {}: {}", label, err);
                break;
            }
        }
    }

    warn!("{} ignored the interrupt, killing it", label);
    if let Err(err) = child.start_kill() {
        warn!("failed to kill {}: {}", label, err);
        return;
    }

    // SIGKILL cannot be refused; wait for the reap so no zombie remains.
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited with {}", label, status);
                return;
            }
            Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
            Err(err) => {
                warn!("failed to reap {}: {}", label, err);
                return;
            }
        }
    }
}

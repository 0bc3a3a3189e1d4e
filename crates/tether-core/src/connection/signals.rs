//! Process-group signalling and parent signal forwarding.
//!
//! Children are spawned as process-group leaders so a single signal to
//! `-pgid` reaches every grandchild the vendor CLI starts.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ActiveSlot;

/// Send SIGTERM to the group led by `pid`, falling back to the pid itself.
pub(crate) fn terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "graceful termination is unsupported on this platform");
        false
    }
}

/// Send SIGKILL to the group led by `pid`, falling back to the pid itself.
pub(crate) fn force_kill(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "forced termination is unsupported on this platform");
        false
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!(pid, "pid out of range for signalling");
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: kill(2) has no memory-safety preconditions; pid is a child we
    // spawned with process_group(0), so -pid names its group.
    let ret = unsafe { libc::kill(-pid, signal) };
    if ret == 0 {
        debug!(pid, signal, "signalled process group");
        return true;
    }

    warn!(pid, signal, "process group signal failed, signalling the process");
    // SAFETY: as above.
    let ret = unsafe { libc::kill(pid, signal) };
    if ret != 0 {
        debug!(pid, signal, "process already gone");
    }
    ret == 0
}

/// Forwards SIGINT/SIGTERM received by this process to the active child's
/// group. Dropping it stops forwarding.
#[derive(Debug)]
pub(crate) struct SignalForwarder {
    task: JoinHandle<()>,
}

impl SignalForwarder {
    #[cfg(unix)]
    pub(crate) fn install(active: Arc<ActiveSlot>) -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate_sig = signal(SignalKind::terminate())?;

        let task = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    got = interrupt.recv() => match got {
                        Some(()) => "SIGINT",
                        None => break,
                    },
                    got = terminate_sig.recv() => match got {
                        Some(()) => "SIGTERM",
                        None => break,
                    },
                };
                match active.pid() {
                    Some(pid) => {
                        warn!(signal = name, pid, "forwarding signal to agent process group");
                        terminate(pid);
                    }
                    None => debug!(signal = name, "signal received with no active agent process"),
                }
            }
        });
        Ok(Self { task })
    }

    #[cfg(not(unix))]
    pub(crate) fn install(active: Arc<ActiveSlot>) -> std::io::Result<Self> {
        let task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if let Some(pid) = active.pid() {
                    warn!(pid, "ctrl-c received with an active agent process");
                    terminate(pid);
                }
            }
        });
        Ok(Self { task })
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

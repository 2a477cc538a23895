//! Process lifecycle management for command modules
//!
//! External module commands may start their own children (a shell running a
//! converter, a converter running a formatter). A timeout must stop all of
//! them, not just the direct child.
//!
//! # Solution
//! - Spawn every module command as the leader of its own process group
//! - Ask the kernel to SIGTERM the command if docflow itself dies
//! - On timeout, SIGTERM the whole group, wait a grace period, then SIGKILL
//! - The group is gone once no member is left other than zombies; a reaped
//!   or zombie leader alone proves nothing
//!
//! Interrupts (SIGINT/SIGTERM/SIGHUP) never cut a module short: the first one
//! raises a stop flag checked between modules, a second one exits immediately
//! and the next load records the running module as interrupted.

use std::io;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Default time between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How long to wait for the group to disappear once SIGKILL was sent
const KILL_SETTLE: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Send a signal to an entire process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::killpg(Pid::from_raw(pgid as i32), signal)
}

/// True while any process other than zombies is left in the group.
///
/// `killpg(pgid, 0)` still succeeds for a group holding only zombies, so the
/// members are looked up in `/proc` when it is available.
pub fn group_alive(pgid: u32) -> bool {
    match signal::killpg(Pid::from_raw(pgid as i32), None) {
        Err(Errno::ESRCH) => return false,
        Err(_) | Ok(()) => {}
    }
    match live_members(pgid) {
        Some(members) => members > 0,
        None => true,
    }
}

/// Non-zombie processes in group `pgid`, `None` if `/proc` is unreadable
fn live_members(pgid: u32) -> Option<usize> {
    let pgid = pgid.to_string();
    let entries = std::fs::read_dir("/proc").ok()?;
    let count = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter(|stat| {
            // Fields after the parenthesised command: state, ppid, pgrp
            let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            fields.len() > 2 && fields[2] == pgid && !matches!(fields[0], "Z" | "X")
        })
        .count();
    Some(count)
}

/// Terminate the process group led by `leader`.
///
/// Sends SIGTERM to the group, reaps the leader and waits up to
/// `grace_period` for every member to exit, then SIGKILLs whatever is left.
/// Works the same whether or not the leader has already been reaped. Returns
/// true if the group went away within the grace period.
pub fn terminate_group(leader: &mut Child, grace_period: Duration) -> bool {
    let pgid = leader.id();
    match send_signal_to_group(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            let _ = leader.wait();
            return true;
        }
        Err(e) => tracing::debug!(pgid, error = %e, "SIGTERM to process group failed"),
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        let _ = leader.try_wait();
        if !group_alive(pgid) {
            let _ = leader.wait();
            tracing::debug!(pgid, "process group terminated gracefully");
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(pgid, "process group did not terminate, sending SIGKILL");
    kill_group(pgid);
    let _ = leader.wait();

    let start = Instant::now();
    while group_alive(pgid) && start.elapsed() < KILL_SETTLE {
        std::thread::sleep(POLL_INTERVAL);
    }
    false
}

/// SIGKILL every member of a group; an empty group is not an error
pub fn kill_group(pgid: u32) {
    match send_signal_to_group(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::error!(pgid, error = %e, "SIGKILL to process group failed"),
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers and return the stop flag they raise.
///
/// The first signal sets the flag. A second signal while the flag is set
/// terminates the process.
pub fn install_interrupt_flag() -> io::Result<Arc<AtomicBool>> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM, SIGHUP] {
        // Order matters: the shutdown check must see the flag from the previous signal
        flag::register_conditional_shutdown(sig, 128 + sig, Arc::clone(&stop))?;
        flag::register(sig, Arc::clone(&stop))?;
    }
    tracing::debug!("interrupt handlers installed");
    Ok(stop)
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as the leader of a new process group that receives
    /// SIGTERM if the parent dies
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

//! Child process plumbing: signalling, deadline waits and kill-on-drop.

use std::io;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use galileo_core::ExitStatus;
use tracing::{debug, warn};

/// How a supervised wait ended.
#[derive(Debug)]
pub(crate) enum Exit {
    Natural(std::process::ExitStatus),
    Deadline { forced: bool },
}

/// Puts the spawned process at the head of its own process group, so the
/// whole tree it forks can be signalled at once.
#[cfg(unix)]
pub(crate) fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub(crate) fn isolate(_cmd: &mut Command) {}

/// Owns a child spawned through [`isolate`] and kills its process group if
/// dropped before being reaped, so an unwinding branch never leaves a process
/// behind.
pub(crate) struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    pub(crate) fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub(crate) fn id(&self) -> u32 {
        self.child.as_ref().map(Child::id).unwrap_or_default()
    }

    /// Waits for exit. Once `deadline` passes the child is asked to terminate,
    /// and killed if it is still alive `grace` later.
    pub(crate) fn wait_until(
        &mut self,
        deadline: Option<Instant>,
        grace: Duration,
        poll: Duration,
    ) -> io::Result<Exit> {
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Err(io::Error::new(io::ErrorKind::Other, "child already reaped")),
        };
        loop {
            if let Some(status) = child.try_wait()? {
                self.child = None;
                return Ok(Exit::Natural(status));
            }
            let now = Instant::now();
            match deadline {
                Some(at) if now >= at => break,
                Some(at) => thread::sleep(poll.min(at - now)),
                None => thread::sleep(poll),
            }
        }

        let pid = child.id();
        debug!(pid, "deadline reached, requesting termination");
        if let Err(err) = request_termination(child) {
            debug!(pid, error = %err, "termination request not delivered");
        }
        let grace_deadline = Instant::now().checked_add(grace);
        loop {
            if child.try_wait()?.is_some() {
                self.child = None;
                // Descendants that outlived the leader's graceful exit.
                sweep_group(pid);
                return Ok(Exit::Deadline { forced: false });
            }
            let now = Instant::now();
            match grace_deadline {
                Some(at) if now >= at => break,
                Some(at) => thread::sleep(poll.min(at - now)),
                None => thread::sleep(poll),
            }
        }

        warn!(pid, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing");
        force_kill(child);
        child.wait()?;
        self.child = None;
        Ok(Exit::Deadline { forced: true })
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            force_kill(child);
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> io::Result<()> {
    signal_group(child.id(), libc::SIGTERM)
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    if signal_group(child.id(), libc::SIGKILL).is_err() {
        // Fails only if the child was reaped in between.
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn sweep_group(pgid: u32) {
    // ESRCH when the group is already empty.
    let _ = signal_group(pgid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn sweep_group(_pgid: u32) {}

/// Spawn failures that mean the host is out of process or memory capacity,
/// as opposed to a bad command.
#[cfg(unix)]
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

#[cfg(not(unix))]
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
}

#[cfg(unix)]
pub(crate) fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitStatus::Exited { code },
        (None, Some(signal)) => ExitStatus::Signaled { signal },
        (None, None) => ExitStatus::Exited { code: -1 },
    }
}

#[cfg(not(unix))]
pub(crate) fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    ExitStatus::Exited {
        code: status.code().unwrap_or(-1),
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::process::Stdio;

    fn spawn(script: &str) -> ChildGuard {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script).stdin(Stdio::null());
        isolate(&mut cmd);
        ChildGuard::new(cmd.spawn().expect("spawn sh"))
    }

    /// Zombies count as gone: an orphan waits on whatever reaps for pid 1.
    fn is_alive(pid: u32) -> bool {
        if send_signal(pid, 0).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    pub(crate) fn wait_for_pid_file(path: &std::path::Path) -> u32 {
        let started = Instant::now();
        loop {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            assert!(started.elapsed() < Duration::from_secs(5), "pid file never written");
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub(crate) fn assert_gone(pid: u32) {
        let started = Instant::now();
        while is_alive(pid) {
            assert!(
                started.elapsed() < Duration::from_secs(2),
                "descendant {} outlived its group",
                pid
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub(crate) fn pid_file(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "galileo_{}_{}_{}.pid",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn natural_exit_reports_code() {
        let mut guard = spawn("exit 7");
        let exit = guard
            .wait_until(None, Duration::from_millis(100), Duration::from_millis(5))
            .expect("wait");
        match exit {
            Exit::Natural(status) => {
                assert_eq!(exit_status(status), ExitStatus::Exited { code: 7 })
            }
            other => panic!("expected natural exit, got {:?}", other),
        }
    }

    #[test]
    fn deadline_terminates_gracefully() {
        let mut guard = spawn("exec sleep 5");
        let started = Instant::now();
        let exit = guard
            .wait_until(
                Some(started + Duration::from_millis(100)),
                Duration::from_secs(2),
                Duration::from_millis(5),
            )
            .expect("wait");
        assert!(matches!(exit, Exit::Deadline { forced: false }), "{:?}", exit);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn ignored_sigterm_escalates_to_kill() {
        let mut guard = spawn("trap '' TERM; while :; do sleep 0.05; done");
        let started = Instant::now();
        let exit = guard
            .wait_until(
                Some(started + Duration::from_millis(50)),
                Duration::from_millis(200),
                Duration::from_millis(5),
            )
            .expect("wait");
        assert!(matches!(exit, Exit::Deadline { forced: true }), "{:?}", exit);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn signal_exit_is_reported_as_signal() {
        let mut guard = spawn("kill -9 $$");
        match guard
            .wait_until(None, Duration::from_millis(100), Duration::from_millis(5))
            .expect("wait")
        {
            Exit::Natural(status) => assert_eq!(
                exit_status(status),
                ExitStatus::Signaled {
                    signal: libc::SIGKILL
                }
            ),
            other => panic!("expected natural exit, got {:?}", other),
        }
    }

    #[test]
    fn deadline_stops_forked_descendants() {
        let pid_path = pid_file("deadline");
        let mut guard = spawn(&format!(
            "sleep 30 & echo $! > {}; wait",
            pid_path.display()
        ));
        let grandchild = wait_for_pid_file(&pid_path);
        let exit = guard
            .wait_until(
                Some(Instant::now() + Duration::from_millis(50)),
                Duration::from_millis(500),
                Duration::from_millis(5),
            )
            .expect("wait");
        assert!(matches!(exit, Exit::Deadline { .. }), "{:?}", exit);
        assert_gone(grandchild);
        let _ = std::fs::remove_file(pid_path);
    }

    #[test]
    fn dropping_guard_kills_the_group() {
        let pid_path = pid_file("drop");
        let guard = spawn(&format!(
            "sleep 30 & echo $! > {}; wait",
            pid_path.display()
        ));
        let grandchild = wait_for_pid_file(&pid_path);
        drop(guard);
        assert_gone(grandchild);
        let _ = std::fs::remove_file(pid_path);
    }

    #[test]
    fn resource_errors_are_classified() {
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(
            libc::EAGAIN
        )));
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(
            libc::ENOENT
        )));
    }
}

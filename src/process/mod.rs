//! Process lifecycle tracking for supervised services.
//!
//! Each launched service runs in its own session (via `setsid`) so the
//! whole process tree can be signalled as a group. Termination escalates
//! from SIGTERM through a bounded wait to SIGKILL, and is not considered
//! complete until previously owned ports are confirmed released, since a
//! lingering listener is the usual cause of "port already in use" on
//! relaunch.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use crate::ports;

/// How long to wait after SIGTERM before escalating to SIGKILL.
const GRACEFUL_WAIT: Duration = Duration::from_secs(5);
/// Bounded retries while waiting for a killed process's ports to free up.
const PORT_RELEASE_RETRIES: u32 = 3;
const PORT_RELEASE_DELAY: Duration = Duration::from_millis(500);
/// Poll step while waiting for a detached (no handle) process to die.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// A tracked OS process and the set of ports it owns.
#[derive(Debug)]
pub struct ProcessEntry {
    pub pid: u32,
    pub owned_ports: HashSet<u16>,
    handle: Option<Child>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, ProcessEntry>,
    /// Launch order, so teardown can run in reverse.
    order: Vec<String>,
}

/// Registry of launched service processes, keyed by service name.
///
/// Termination is idempotent: calling `terminate` for a name that is no
/// longer tracked succeeds, which makes it safe from both the sequencer's
/// failure-unwind path and an explicit shutdown.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

fn lock(m: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a service process without blocking on it.
    ///
    /// The child is placed in a new session so that later signals reach
    /// its entire process tree, not just the immediate child.
    ///
    /// # Returns
    /// The child's pid.
    pub fn launch(
        &self,
        name: &str,
        command: &[String],
        env: &[(String, String)],
        cwd: &Path,
        owned_ports: &[u16],
    ) -> Result<u32> {
        let (program, args) = command
            .split_first()
            .context("service command must not be empty")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New session so the whole tree is one signalable group.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{program}' for service '{name}'"))?;
        let pid = child.id();

        tracing::debug!(service = name, pid, "process launched");

        let mut inner = lock(&self.inner);
        inner.entries.insert(
            name.to_string(),
            ProcessEntry {
                pid,
                owned_ports: owned_ports.iter().copied().collect(),
                handle: Some(child),
            },
        );
        inner.order.push(name.to_string());

        Ok(pid)
    }

    /// The pid of a tracked service, if any.
    pub fn pid(&self, name: &str) -> Option<u32> {
        lock(&self.inner).entries.get(name).map(|e| e.pid)
    }

    /// Check whether a tracked service process has exited, without blocking.
    ///
    /// Returns the exit status if the process is gone. Reaps the zombie as
    /// a side effect.
    pub fn check_exit(&self, name: &str) -> Option<ExitStatus> {
        let mut inner = lock(&self.inner);
        let entry = inner.entries.get_mut(name)?;
        match entry.handle.as_mut()?.try_wait() {
            Ok(status) => status,
            Err(_) => None,
        }
    }

    /// Liveness poll for a tracked service.
    pub fn is_alive(&self, name: &str) -> bool {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(name) else {
            return false;
        };
        match entry.handle.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => is_process_alive(entry.pid),
        }
    }

    /// Terminate a tracked service: SIGTERM, bounded wait, then SIGKILL on
    /// the process group, followed by port-release verification.
    ///
    /// # Returns
    /// `Ok(true)` once the process is dead and its ports are confirmed
    /// free; `Ok(false)` if a port is still held after bounded retries.
    /// An unknown name is a no-op success.
    pub fn terminate(&self, name: &str) -> Result<bool> {
        let entry = {
            let mut inner = lock(&self.inner);
            inner.order.retain(|n| n != name);
            inner.entries.remove(name)
        };
        let Some(mut entry) = entry else {
            return Ok(true);
        };

        let pid = entry.pid;
        tracing::debug!(service = name, pid, "terminating");

        signal_group(pid, TermSignal::Term);

        let exited = match entry.handle.as_mut() {
            Some(child) => child
                .wait_timeout(GRACEFUL_WAIT)
                .with_context(|| format!("wait failed for service '{name}'"))?
                .is_some(),
            None => poll_until_dead(pid, GRACEFUL_WAIT),
        };

        if !exited {
            tracing::warn!(service = name, pid, "did not exit on SIGTERM, escalating");
            signal_group(pid, TermSignal::Kill);
            if let Some(child) = entry.handle.as_mut() {
                let _ = child.wait();
            } else {
                poll_until_dead(pid, GRACEFUL_WAIT);
            }
        }

        let ports: Vec<u16> = entry.owned_ports.iter().copied().collect();
        Ok(verify_ports_released(&ports))
    }

    /// Terminate every tracked service in reverse launch order.
    ///
    /// A failure to kill one process never prevents attempting the rest.
    ///
    /// # Returns
    /// The names that were attempted, in teardown order.
    pub fn terminate_all(&self) -> Vec<String> {
        let names: Vec<String> = {
            let inner = lock(&self.inner);
            inner.order.iter().rev().cloned().collect()
        };
        for name in &names {
            if let Err(e) = self.terminate(name) {
                tracing::warn!(service = %name, error = %e, "termination failed");
            }
        }
        names
    }

    /// Names of currently tracked services in launch order.
    pub fn tracked(&self) -> Vec<String> {
        lock(&self.inner).order.clone()
    }
}

enum TermSignal {
    Term,
    Kill,
}

/// Signal a process group, falling back to the single process if the
/// group signal fails (the child may not have reached setsid yet).
#[cfg(unix)]
fn signal_group(pid: u32, sig: TermSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match sig {
        TermSignal::Term => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    let group = Pid::from_raw(-(pid as i32));
    if kill(group, signal).is_err() {
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: TermSignal) {}

/// Check if a process with the given pid is alive.
///
/// Sends signal 0, which performs the existence/permission check without
/// delivering anything.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Terminate a process we have no `Child` handle for (e.g. recorded in the
/// discovery store by a previous launcher run). Same escalation policy as
/// `ProcessRegistry::terminate`.
pub fn terminate_detached(pid: u32, owned_ports: &[u16]) -> bool {
    signal_group(pid, TermSignal::Term);
    if !poll_until_dead(pid, GRACEFUL_WAIT) {
        signal_group(pid, TermSignal::Kill);
        poll_until_dead(pid, GRACEFUL_WAIT);
    }
    verify_ports_released(owned_ports)
}

fn poll_until_dead(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(LIVENESS_POLL);
    }
    !is_process_alive(pid)
}

/// Confirm that previously owned ports are free again, retrying a bounded
/// number of times. The kernel can hold a closed listener briefly.
fn verify_ports_released(owned_ports: &[u16]) -> bool {
    if owned_ports.is_empty() {
        return true;
    }
    for attempt in 0..PORT_RELEASE_RETRIES {
        if owned_ports.iter().all(|&p| ports::is_available(p)) {
            return true;
        }
        if attempt + 1 < PORT_RELEASE_RETRIES {
            thread::sleep(PORT_RELEASE_DELAY);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn nonexistent_process_is_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    #[serial]
    fn launch_and_terminate_tracks_lifecycle() {
        let registry = ProcessRegistry::new();
        let pid = registry
            .launch("svc", &sh("sleep 30"), &[], Path::new("."), &[])
            .unwrap();

        assert!(registry.is_alive("svc"));
        assert_eq!(registry.pid("svc"), Some(pid));
        assert!(registry.check_exit("svc").is_none());

        assert!(registry.terminate("svc").unwrap());
        assert!(!registry.is_alive("svc"));
        assert_eq!(registry.pid("svc"), None);
    }

    #[test]
    #[serial]
    fn terminate_is_idempotent() {
        let registry = ProcessRegistry::new();
        registry
            .launch("svc", &sh("sleep 30"), &[], Path::new("."), &[])
            .unwrap();

        assert!(registry.terminate("svc").unwrap());
        // Second call has nothing to do and still succeeds.
        assert!(registry.terminate("svc").unwrap());
        assert!(registry.terminate("never-launched").unwrap());
    }

    #[test]
    #[serial]
    fn terminate_escalates_past_sigterm_ignorers() {
        let registry = ProcessRegistry::new();
        registry
            .launch(
                "stubborn",
                &sh("trap '' TERM; sleep 60"),
                &[],
                Path::new("."),
                &[],
            )
            .unwrap();

        // Give the shell a moment to install its trap.
        thread::sleep(Duration::from_millis(200));

        assert!(registry.terminate("stubborn").unwrap());
        assert!(!registry.is_alive("stubborn"));
    }

    #[test]
    #[serial]
    fn immediate_exit_is_observable() {
        let registry = ProcessRegistry::new();
        registry
            .launch("crasher", &sh("exit 3"), &[], Path::new("."), &[])
            .unwrap();

        thread::sleep(Duration::from_millis(200));

        let status = registry.check_exit("crasher").expect("should have exited");
        assert_eq!(status.code(), Some(3));
        assert!(!registry.is_alive("crasher"));
    }

    #[test]
    #[serial]
    fn terminate_all_runs_in_reverse_launch_order() {
        let registry = ProcessRegistry::new();
        for name in ["first", "second", "third"] {
            registry
                .launch(name, &sh("sleep 30"), &[], Path::new("."), &[])
                .unwrap();
        }

        let order = registry.terminate_all();
        assert_eq!(order, vec!["third", "second", "first"]);
        assert!(registry.tracked().is_empty());
    }

    #[test]
    fn env_and_cwd_are_applied() {
        let registry = ProcessRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), b"").unwrap();

        registry
            .launch(
                "envcheck",
                &sh("test \"$CASCADE_TEST\" = yes && test -f marker"),
                &[("CASCADE_TEST".to_string(), "yes".to_string())],
                dir.path(),
                &[],
            )
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        let status = registry.check_exit("envcheck").expect("should have run");
        assert!(status.success());
    }
}

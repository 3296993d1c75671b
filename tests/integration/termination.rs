//! Termination of processes recorded by a previous run, where no
//! `Child` handle exists anymore. This is the `down` command's path.

use std::net::TcpListener;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::TempDir;

use cascade::process;

use crate::helpers::free_port;

/// Spawn a process that is not our child, the way a pid read back from
/// the discovery store would be: the shell backgrounds a sleep, writes
/// its pid, and exits.
fn spawn_orphan(dir: &TempDir) -> u32 {
    let pidfile = dir.path().join("pid");
    let mut shell = Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 30 & echo $! > {}", pidfile.display()))
        .spawn()
        .unwrap();
    shell.wait().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(text) = std::fs::read_to_string(&pidfile) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "orphan pid never appeared");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
#[serial]
fn detached_termination_kills_recorded_pid() {
    let dir = TempDir::new().unwrap();
    let pid = spawn_orphan(&dir);
    assert!(process::is_process_alive(pid));

    assert!(process::terminate_detached(pid, &[]));
    assert!(!process::is_process_alive(pid));
}

#[test]
#[serial]
fn detached_termination_is_safe_on_dead_pid() {
    let dir = TempDir::new().unwrap();
    let pid = spawn_orphan(&dir);
    assert!(process::terminate_detached(pid, &[]));

    // The pid is already gone; a second pass must not error or hang.
    assert!(process::terminate_detached(pid, &[]));
}

#[test]
#[serial]
fn held_port_is_reported_unreleased() {
    let dir = TempDir::new().unwrap();
    let pid = spawn_orphan(&dir);

    // Someone else still holds the port the record claims; the kill
    // succeeds but port verification must report the conflict.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let held = listener.local_addr().unwrap().port();

    assert!(!process::terminate_detached(pid, &[held]));
    assert!(!process::is_process_alive(pid));

    drop(listener);
    assert!(process::terminate_detached(pid, &[free_port()]));
}

//! Port probing: TCP availability tests and port-owner resolution.
//!
//! The supervisor uses these checks in two places: before launching a
//! service (to detect port conflicts early) and after terminating one (to
//! confirm the listener is actually gone before declaring the port free).

use std::net::TcpListener;

/// A process found to own a TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub pid: u32,
    /// Short command name, when resolvable.
    pub name: Option<String>,
}

impl std::fmt::Display for ProcessDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "pid {}, {}", self.pid, name),
            None => write!(f, "pid {}", self.pid),
        }
    }
}

/// Check whether a TCP port can be bound on the loopback interface.
///
/// A successful bind-and-drop means the port is free. This is the same
/// test the services themselves will perform, so it is authoritative for
/// "port already in use" purposes.
pub fn is_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Ask the OS for a currently free TCP port.
///
/// Used by dynamic-port mode to reassign a service whose configured port
/// is taken. The port is released before this returns, so a race with
/// another process is possible but rare on a developer machine.
pub fn find_free_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .and_then(|listener| listener.local_addr().ok())
        .map(|addr| addr.port())
}

/// Resolve which process owns a listening TCP port, if any.
#[cfg(target_os = "linux")]
pub fn find_owner(port: u16) -> Option<ProcessDescriptor> {
    linux::find_owner(port)
}

/// Resolve which process owns a listening TCP port, if any.
#[cfg(not(target_os = "linux"))]
pub fn find_owner(port: u16) -> Option<ProcessDescriptor> {
    lsof::find_owner(port)
}

#[cfg(target_os = "linux")]
mod linux {
    use super::ProcessDescriptor;
    use std::fs;

    const TCP_LISTEN: &str = "0A";

    /// Walk /proc/net/tcp{,6} for a listening socket on `port`, then scan
    /// /proc/<pid>/fd for the process holding that socket inode.
    pub fn find_owner(port: u16) -> Option<ProcessDescriptor> {
        let inode = socket_inode(port)?;
        let pid = pid_for_inode(&inode)?;
        Some(ProcessDescriptor {
            pid,
            name: process_name(pid),
        })
    }

    fn socket_inode(port: u16) -> Option<String> {
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let Ok(content) = fs::read_to_string(table) else {
                continue;
            };
            for line in content.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    continue;
                }
                // local_address is "HEXADDR:HEXPORT"
                let local_port = fields[1]
                    .rsplit(':')
                    .next()
                    .and_then(|hex| u16::from_str_radix(hex, 16).ok());
                if local_port == Some(port) {
                    return Some(fields[9].to_string());
                }
            }
        }
        None
    }

    fn pid_for_inode(inode: &str) -> Option<u32> {
        let target = format!("socket:[{inode}]");
        let proc_entries = fs::read_dir("/proc").ok()?;
        for entry in proc_entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link.to_string_lossy() == target {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }

    fn process_name(pid: u32) -> Option<String> {
        fs::read_to_string(format!("/proc/{pid}/comm"))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

#[cfg(not(target_os = "linux"))]
mod lsof {
    use super::ProcessDescriptor;
    use std::process::Command;

    /// Fall back to `lsof` where /proc is not available (macOS, BSDs).
    pub fn find_owner(port: u16) -> Option<ProcessDescriptor> {
        let output = Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let pid = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()?
            .trim()
            .parse::<u32>()
            .ok()?;
        Some(ProcessDescriptor {
            pid,
            name: process_name(pid),
        })
    }

    fn process_name(pid: u32) -> Option<String> {
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "comm="])
            .output()
            .ok()?;
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

//! Terminate whatever holds a TCP port, but only if it is one of ours.
//!
//! Lookup and termination sit behind [`PortLookup`] so the safety rule can be
//! tested without touching real processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A process listening on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortOwner {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillPortOutcome {
    pub success: bool,
    pub message: String,
}

#[async_trait]
pub trait PortLookup: Send + Sync {
    /// Processes with a listening TCP socket on `port`.
    async fn listeners_on(&self, port: u16) -> io::Result<Vec<PortOwner>>;

    async fn terminate(&self, pid: u32) -> Result<(), String>;
}

/// `lsof` on unix, `netstat -ano` on Windows, `sysinfo` for names and kills.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortLookup;

#[async_trait]
impl PortLookup for SystemPortLookup {
    async fn listeners_on(&self, port: u16) -> io::Result<Vec<PortOwner>> {
        let found = if cfg!(windows) {
            let output = Command::new("netstat").arg("-ano").output().await?;
            parse_netstat(&String::from_utf8_lossy(&output.stdout), port)
                .into_iter()
                .map(|pid| (pid, None))
                .collect()
        } else {
            let output = Command::new("lsof")
                .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-Fpc"])
                .output()
                .await?;
            // lsof exits 1 when nothing matches.
            parse_lsof(&String::from_utf8_lossy(&output.stdout))
        };

        let pids: Vec<Pid> = found.iter().map(|(pid, _)| Pid::from_u32(*pid)).collect();
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing(),
        );

        Ok(found
            .into_iter()
            .map(|(pid, fallback)| {
                let name = sys
                    .process(Pid::from_u32(pid))
                    .map(|p| p.name().to_string_lossy().into_owned())
                    .or(fallback)
                    .unwrap_or_else(|| "unknown".to_string());
                PortOwner { pid, name }
            })
            .collect())
    }

    async fn terminate(&self, pid: u32) -> Result<(), String> {
        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        let process = sys
            .process(target)
            .ok_or_else(|| "process not found".to_string())?;
        if process.kill() {
            Ok(())
        } else {
            Err("kill signal was not delivered".to_string())
        }
    }
}

/// `(pid, command)` pairs from `lsof -F pc` output.
pub fn parse_lsof(output: &str) -> Vec<(u32, Option<String>)> {
    let mut found: Vec<(u32, Option<String>)> = Vec::new();
    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            if let Ok(pid) = pid.trim().parse() {
                found.push((pid, None));
            }
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(last) = found.last_mut() {
                last.1 = Some(command.trim().to_string());
            }
        }
    }
    found
}

/// Pids of `LISTENING` TCP rows bound to `port` in `netstat -ano` output.
pub fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [proto, local, _remote, state, pid] = cols.as_slice() else {
            continue;
        };
        if !proto.eq_ignore_ascii_case("tcp") || *state != "LISTENING" || !local.ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = pid.parse::<u32>() {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Whether `candidate` names the same program as `host`.
pub fn is_host_process(candidate: &str, host: &str) -> bool {
    let host = normalize_name(host);
    !host.is_empty() && normalize_name(candidate) == host
}

/// File stem of the running executable.
pub fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "scratchpad".to_string())
}

/// Look up the owners of `port` and terminate those that are `host_process`.
pub async fn kill_port(lookup: &dyn PortLookup, host_process: &str, port: u16) -> KillPortOutcome {
    let owners = match lookup.listeners_on(port).await {
        Ok(owners) => owners,
        Err(e) => {
            warn!(port, error = %e, "Port lookup failed");
            return KillPortOutcome {
                success: false,
                message: format!("Failed to look up port {port}: {e}"),
            };
        }
    };

    // One line per process, even if it listens on several addresses.
    let owners: BTreeMap<u32, String> = owners.into_iter().map(|o| (o.pid, o.name)).collect();
    if owners.is_empty() {
        return KillPortOutcome {
            success: false,
            message: format!("No process is listening on port {port}"),
        };
    }

    let own_pid = std::process::id();
    let mut lines = Vec::with_capacity(owners.len());
    for (pid, name) in owners {
        if pid == own_pid {
            lines.push(format!("skip {name} (PID {pid}) - the engine itself"));
        } else if !is_host_process(&name, host_process) {
            debug!(port, pid, %name, "Refusing to kill unrelated process");
            lines.push(format!("skip {name} (PID {pid}) - not the host process"));
        } else {
            match lookup.terminate(pid).await {
                Ok(()) => {
                    info!(port, pid, %name, "Terminated port owner");
                    lines.push(format!("terminated {name} (PID {pid})"));
                }
                Err(e) => lines.push(format!("failed to terminate PID {pid}: {e}")),
            }
        }
    }

    KillPortOutcome {
        success: true,
        message: lines.join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeLookup {
        owners: Vec<PortOwner>,
        killed: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PortLookup for FakeLookup {
        async fn listeners_on(&self, _port: u16) -> io::Result<Vec<PortOwner>> {
            Ok(self.owners.clone())
        }

        async fn terminate(&self, pid: u32) -> Result<(), String> {
            self.killed.lock().push(pid);
            Ok(())
        }
    }

    fn owner(pid: u32, name: &str) -> PortOwner {
        PortOwner {
            pid,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_refuses_unrelated_process() {
        let lookup = FakeLookup {
            owners: vec![owner(4242, "postgres")],
            ..Default::default()
        };
        let outcome = kill_port(&lookup, "scratchpad", 5432).await;
        assert!(outcome.success);
        assert_eq!(outcome.message, "skip postgres (PID 4242) - not the host process");
        assert!(lookup.killed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_kills_matching_process_once() {
        let lookup = FakeLookup {
            owners: vec![owner(7, "Scratchpad.exe"), owner(7, "Scratchpad.exe"), owner(8, "node")],
            ..Default::default()
        };
        let outcome = kill_port(&lookup, "scratchpad", 3000).await;
        assert!(outcome.message.contains("terminated Scratchpad.exe (PID 7)"));
        assert!(outcome.message.contains("skip node (PID 8)"));
        assert_eq!(*lookup.killed.lock(), vec![7]);
    }

    #[tokio::test]
    async fn test_free_port() {
        let lookup = FakeLookup::default();
        let outcome = kill_port(&lookup, "scratchpad", 3000).await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "No process is listening on port 3000");
    }

    #[test]
    fn test_parse_lsof() {
        let out = "p123\ncnode\np456\ncscratchpad\n";
        assert_eq!(
            parse_lsof(out),
            vec![(123, Some("node".into())), (456, Some("scratchpad".into()))]
        );
        assert!(parse_lsof("").is_empty());
    }

    #[test]
    fn test_parse_netstat() {
        let out = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:3000           0.0.0.0:0              LISTENING       1200
  TCP    [::]:3000              [::]:0                 LISTENING       1200
  TCP    0.0.0.0:30000          0.0.0.0:0              LISTENING       1300
  TCP    127.0.0.1:3000         127.0.0.1:5000         ESTABLISHED     1400
";
        assert_eq!(parse_netstat(out, 3000), vec![1200]);
    }

    #[test]
    fn test_name_matching() {
        assert!(is_host_process("Scratchpad.EXE", "scratchpad"));
        assert!(is_host_process("scratchpad", "scratchpad.exe"));
        assert!(!is_host_process("scratchpad-helper", "scratchpad"));
        assert!(!is_host_process("anything", ""));
    }
}

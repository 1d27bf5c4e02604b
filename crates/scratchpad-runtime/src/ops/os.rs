//! Host information for the guest `os` module and `process`.

use rquickjs::{Ctx, Function, Object};
use serde::Serialize;
use sysinfo::{
    CpuRefreshKind, MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System,
};

/// Node-style platform name (`darwin`, `linux`, `win32`).
pub fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Node-style architecture name (`x64`, `arm64`, ...).
pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

pub fn os_type() -> &'static str {
    match std::env::consts::OS {
        "macos" => "Darwin",
        "linux" => "Linux",
        "windows" => "Windows_NT",
        _ => "Unknown",
    }
}

pub fn eol() -> &'static str {
    if cfg!(windows) { "\r\n" } else { "\n" }
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub model: String,
    pub speed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OsInfo {
    pub hostname: String,
    pub homedir: String,
    pub tmpdir: String,
    pub platform: &'static str,
    pub arch: &'static str,
    #[serde(rename = "type")]
    pub os_type: &'static str,
    pub release: String,
    pub version: String,
    pub totalmem: u64,
    pub freemem: u64,
    pub uptime: u64,
    pub loadavg: [f64; 3],
    pub cpus: Vec<CpuInfo>,
    pub endianness: &'static str,
    pub eol: &'static str,
}

/// Snapshot of host facts. Memory figures are in bytes.
pub fn info() -> OsInfo {
    let mut sys = System::new_with_specifics(
        RefreshKind::nothing()
            .with_memory(MemoryRefreshKind::everything())
            .with_cpu(CpuRefreshKind::everything()),
    );
    sys.refresh_memory();
    let load = System::load_average();

    OsInfo {
        hostname: System::host_name().unwrap_or_else(|| "localhost".to_string()),
        homedir: dirs::home_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
        tmpdir: std::env::temp_dir().to_string_lossy().into_owned(),
        platform: platform(),
        arch: arch(),
        os_type: os_type(),
        release: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        version: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        totalmem: sys.total_memory(),
        freemem: sys.available_memory(),
        uptime: System::uptime(),
        loadavg: [load.one, load.five, load.fifteen],
        cpus: sys
            .cpus()
            .iter()
            .map(|cpu| CpuInfo {
                model: cpu.brand().to_string(),
                speed: cpu.frequency(),
            })
            .collect(),
        endianness: if cfg!(target_endian = "big") { "BE" } else { "LE" },
        eol: eol(),
    }
}

/// Resident set size of this process, in bytes.
pub fn resident_memory() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid)
        .map(|p| p.memory())
        .unwrap_or(0)
}

pub(crate) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "osInfo",
        Function::new(ctx.clone(), |ctx: Ctx<'js>| -> rquickjs::Result<String> {
            serde_json::to_string(&info()).map_err(|e| super::throw(&ctx, e))
        })?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_names() {
        assert!(["linux", "darwin", "win32", "freebsd", "openbsd", "netbsd", "android", "ios"]
            .contains(&platform()));
        assert!(!arch().is_empty());
        assert_ne!(arch(), "x86_64");
    }

    #[test]
    fn test_info_shape() {
        let info = info();
        assert!(info.totalmem > 0);
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("type").is_some());
        assert_eq!(json["eol"], eol());
    }
}

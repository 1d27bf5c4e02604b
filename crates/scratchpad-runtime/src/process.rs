//! The guest `process` object.
//!
//! Static facts (platform, pid, env snapshot) are captured when the session
//! is created. Writes to `process.stdout` and `process.stderr` go through the
//! same [`LogEmitter`] as the console, one log line per `write` call.

use crate::console::{LogChannel, LogEmitter};
use crate::ops::os;
use rquickjs::function::Opt;
use rquickjs::{Coerced, Ctx, Function, Object};
use std::ffi::OsString;
use std::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Split an elapsed duration into Node's `[seconds, nanoseconds]` pair,
/// optionally relative to an earlier pair.
pub fn hrtime_pair(elapsed_nanos: u128, previous: Option<&[f64]>) -> [f64; 2] {
    let mut nanos = elapsed_nanos;
    if let Some(&[secs, sub]) = previous {
        let before = (secs.max(0.0) as u128) * NANOS_PER_SEC + sub.max(0.0) as u128;
        nanos = nanos.saturating_sub(before);
    }
    [
        (nanos / NANOS_PER_SEC) as f64,
        (nanos % NANOS_PER_SEC) as f64,
    ]
}

/// One stream write becomes one line; a single trailing newline is dropped.
fn stream_line(text: &str) -> &str {
    text.strip_suffix('\n')
        .map(|t| t.strip_suffix('\r').unwrap_or(t))
        .unwrap_or(text)
}

fn create_stream<'js>(
    ctx: &Ctx<'js>,
    emitter: &LogEmitter,
    channel: LogChannel,
    fd: u8,
) -> rquickjs::Result<Object<'js>> {
    let stream = Object::new(ctx.clone())?;
    let emitter = emitter.clone();
    stream.set(
        "write",
        Function::new(ctx.clone(), move |chunk: Coerced<String>| -> bool {
            emitter.emit(channel, stream_line(&chunk.0));
            true
        })?
        .with_name("write")?,
    )?;
    stream.set("isTTY", false)?;
    stream.set("fd", fd)?;
    stream.set("columns", 80)?;
    Ok(stream)
}

/// Host environment as strings. Bytes that are not valid UTF-8 become U+FFFD.
fn env_snapshot(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Vec<(String, String)> {
    vars.into_iter()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

/// Build `process`. Event and lifecycle methods are added by the bootstrap.
pub(crate) fn create_process<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    emitter: &LogEmitter,
    started: Instant,
) -> rquickjs::Result<Object<'js>> {
    let process = Object::new(ctx.clone())?;

    let env = Object::new(ctx.clone())?;
    for (key, value) in env_snapshot(std::env::vars_os()) {
        env.set(key, value)?;
    }
    process.set("env", env)?;

    let version = format!("v{}", env!("CARGO_PKG_VERSION"));
    let versions = Object::new(ctx.clone())?;
    versions.set("scratchpad", env!("CARGO_PKG_VERSION"))?;
    versions.set("quickjs", "2024-01-13")?;

    process.set("title", "scratchpad")?;
    process.set("version", version)?;
    process.set("versions", versions)?;
    process.set("platform", os::platform())?;
    process.set("arch", os::arch())?;
    process.set("pid", std::process::id())?;
    process.set("argv", vec!["scratchpad", "script"])?;
    process.set("execArgv", Vec::<String>::new())?;
    process.set("exitCode", rquickjs::Undefined)?;

    process.set(
        "cwd",
        Function::new(ctx.clone(), || -> String {
            std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "/".to_string())
        })?
        .with_name("cwd")?,
    )?;

    process.set(
        "hrtime",
        Function::new(ctx.clone(), move |previous: Opt<Vec<f64>>| -> Vec<f64> {
            hrtime_pair(started.elapsed().as_nanos(), previous.0.as_deref()).to_vec()
        })?
        .with_name("hrtime")?,
    )?;

    host.set(
        "hrtimeNs",
        Function::new(ctx.clone(), move || -> f64 {
            started.elapsed().as_nanos() as f64
        })?,
    )?;

    process.set(
        "uptime",
        Function::new(ctx.clone(), move || -> f64 {
            started.elapsed().as_secs_f64()
        })?
        .with_name("uptime")?,
    )?;

    process.set(
        "memoryUsage",
        Function::new(ctx.clone(), |ctx: Ctx<'js>| -> rquickjs::Result<Object<'js>> {
            let usage = Object::new(ctx)?;
            usage.set("rss", os::resident_memory() as f64)?;
            // QuickJS heap figures are not exposed per context.
            usage.set("heapTotal", 0)?;
            usage.set("heapUsed", 0)?;
            usage.set("external", 0)?;
            usage.set("arrayBuffers", 0)?;
            Ok(usage)
        })?
        .with_name("memoryUsage")?,
    )?;

    process.set("stdout", create_stream(ctx, emitter, LogChannel::Stdout, 1)?)?;
    process.set("stderr", create_stream(ctx, emitter, LogChannel::Stderr, 2)?)?;

    Ok(process)
}

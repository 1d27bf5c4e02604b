//! Native host functions behind the builtin modules.
//!
//! Each submodule exposes plain Rust functions plus a `register` that
//! installs them on the host object handed to the JS glue.

pub mod crypto;
pub mod encoding;
pub mod fs;
pub mod net;
pub mod os;
pub mod url;
pub mod zlib;

use rquickjs::{Ctx, Exception, Object};
use std::fmt::Display;
use thiserror::Error;

/// Failures of host operations. Surfaced to guest code as thrown errors.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("Invalid input: {0}")]
    Decode(String),

    #[error("Digest method not supported: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Random generation failed: {0}")]
    Random(String),

    #[error("{code}: {description}, {syscall} '{path}'")]
    Fs {
        code: &'static str,
        description: String,
        syscall: &'static str,
        path: String,
    },

    #[error("zlib: {0}")]
    Zlib(String),
}

/// Throw `err` as a JS `Error` in `ctx`.
pub(crate) fn throw<E: Display>(ctx: &Ctx<'_>, err: E) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

/// Install every context-independent host op.
pub(crate) fn register_all<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    encoding::register(ctx, host)?;
    fs::register(ctx, host)?;
    os::register(ctx, host)?;
    crypto::register(ctx, host)?;
    zlib::register(ctx, host)?;
    url::register(ctx, host)?;
    Ok(())
}

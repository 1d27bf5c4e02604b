//! Compression for the guest `zlib` module.

use super::OpError;
use super::encoding::{binary_to_bytes, bytes_to_binary};
use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use rquickjs::{Ctx, Function, Object};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZlibOp {
    Gzip,
    Gunzip,
    Deflate,
    Inflate,
    DeflateRaw,
    InflateRaw,
}

impl ZlibOp {
    pub fn parse(name: &str) -> Result<Self, OpError> {
        match name {
            "gzip" => Ok(Self::Gzip),
            "gunzip" => Ok(Self::Gunzip),
            "deflate" => Ok(Self::Deflate),
            "inflate" => Ok(Self::Inflate),
            "deflateRaw" => Ok(Self::DeflateRaw),
            "inflateRaw" => Ok(Self::InflateRaw),
            other => Err(OpError::Zlib(format!("unknown operation {other}"))),
        }
    }
}

pub fn process(op: ZlibOp, input: &[u8], level: u32) -> Result<Vec<u8>, OpError> {
    let level = Compression::new(level.min(9));
    let mut out = Vec::new();
    let result = match op {
        ZlibOp::Gzip => GzEncoder::new(input, level).read_to_end(&mut out),
        ZlibOp::Gunzip => GzDecoder::new(input).read_to_end(&mut out),
        ZlibOp::Deflate => ZlibEncoder::new(input, level).read_to_end(&mut out),
        ZlibOp::Inflate => ZlibDecoder::new(input).read_to_end(&mut out),
        ZlibOp::DeflateRaw => DeflateEncoder::new(input, level).read_to_end(&mut out),
        ZlibOp::InflateRaw => DeflateDecoder::new(input).read_to_end(&mut out),
    };
    result.map_err(|e| OpError::Zlib(e.to_string()))?;
    Ok(out)
}

pub(crate) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "zlibProcess",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, op: String, data: String, level: f64| -> rquickjs::Result<String> {
                let op = ZlibOp::parse(&op).map_err(|e| super::throw(&ctx, e))?;
                let level = if level.is_finite() && level >= 0.0 { level as u32 } else { 6 };
                let out = process(op, &binary_to_bytes(&data), level).map_err(|e| super::throw(&ctx, e))?;
                Ok(bytes_to_binary(&out))
            },
        )?,
    )?;
    Ok(())
}

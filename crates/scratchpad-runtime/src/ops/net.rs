//! Host bindings for the guest `net` and `http` modules.

use super::encoding::binary_to_bytes;
use crate::http::HttpManager;
use crate::net::{NetError, NetManager};
use rquickjs::{Ctx, Function, Object};
use std::io::ErrorKind;
use std::rc::Rc;

/// Node-style text for a failed `listen`.
pub fn listen_error(err: &NetError, host: &str, port: u16) -> String {
    let host = if host.is_empty() { "::" } else { host };
    match err {
        NetError::Io(e) if e.kind() == ErrorKind::AddrInUse => {
            format!("listen EADDRINUSE: address already in use {host}:{port}")
        }
        NetError::Io(e) if e.kind() == ErrorKind::PermissionDenied => {
            format!("listen EACCES: permission denied {host}:{port}")
        }
        NetError::Io(e) if e.kind() == ErrorKind::AddrNotAvailable => {
            format!("listen EADDRNOTAVAIL: address not available {host}:{port}")
        }
        other => format!("listen: {other} {host}:{port}"),
    }
}

fn port_arg(port: f64) -> Option<u16> {
    (port.is_finite() && port >= 0.0 && port <= f64::from(u16::MAX) && port.fract() == 0.0)
        .then_some(port as u16)
}

pub(crate) fn register<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    net: Rc<NetManager>,
    http: Rc<HttpManager>,
) -> rquickjs::Result<()> {
    let manager = net.clone();
    host.set(
        "netListen",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, hostname: String, port: f64| -> rquickjs::Result<String> {
                let port = port_arg(port)
                    .ok_or_else(|| super::throw(&ctx, format!("RangeError: invalid port {port}")))?;
                let info = manager
                    .listen(&hostname, port)
                    .map_err(|e| super::throw(&ctx, listen_error(&e, &hostname, port)))?;
                serde_json::to_string(&info).map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    let manager = net.clone();
    host.set(
        "netClose",
        Function::new(ctx.clone(), move |id: u32| manager.close_server(id))?,
    )?;

    let manager = net.clone();
    host.set(
        "netConnect",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, hostname: String, port: f64| -> rquickjs::Result<u32> {
                let port = port_arg(port)
                    .ok_or_else(|| super::throw(&ctx, format!("RangeError: invalid port {port}")))?;
                Ok(manager.connect(&hostname, port))
            },
        )?,
    )?;

    let manager = net.clone();
    host.set(
        "netWrite",
        Function::new(ctx.clone(), move |id: u32, data: String| {
            manager.write(id, binary_to_bytes(&data)).is_ok()
        })?,
    )?;

    let manager = net.clone();
    host.set(
        "netEnd",
        Function::new(ctx.clone(), move |id: u32| manager.end(id).is_ok())?,
    )?;

    let manager = net;
    host.set(
        "netDestroy",
        Function::new(ctx.clone(), move |id: u32| manager.destroy(id).is_ok())?,
    )?;

    let manager = http.clone();
    host.set(
        "httpListen",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, hostname: String, port: f64| -> rquickjs::Result<String> {
                let port = port_arg(port)
                    .ok_or_else(|| super::throw(&ctx, format!("RangeError: invalid port {port}")))?;
                let info = manager
                    .listen(&hostname, port)
                    .map_err(|e| super::throw(&ctx, listen_error(&e, &hostname, port)))?;
                serde_json::to_string(&info).map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    let manager = http.clone();
    host.set(
        "httpClose",
        Function::new(ctx.clone(), move |id: u32| manager.close_server(id))?,
    )?;

    let manager = http.clone();
    host.set(
        "httpRequest",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: u32| -> rquickjs::Result<Option<String>> {
                manager
                    .request(id)
                    .map(|view| serde_json::to_string(&view))
                    .transpose()
                    .map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    let manager = http;
    host.set(
        "httpRespond",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: u32, status: u16, headers: String, body: String| -> rquickjs::Result<bool> {
                let headers: Vec<(String, String)> =
                    serde_json::from_str(&headers).map_err(|e| super::throw(&ctx, e))?;
                Ok(manager.respond(id, status, headers, binary_to_bytes(&body)))
            },
        )?,
    )?;

    Ok(())
}

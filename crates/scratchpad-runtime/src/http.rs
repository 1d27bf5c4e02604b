//! HTTP/1.1 servers behind the guest `http` module.
//!
//! Each request is parked in a pending map and announced to the worker; the
//! JS handler later reads it and answers through [`HttpManager::respond`].

use crate::net::{NetEvent, NetResult, ServerInfo, resolve_addr};
use crate::ops::encoding::bytes_to_binary;
use crate::tracker::{BoundListener, CloseMode, ListenerId, ServerTracker};
use crate::worker::HostEvent;
use bytes::Bytes;
use crossbeam_channel::Sender;
use dashmap::DashMap;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub type RequestId = u32;

/// Response body type used by guest HTTP servers.
pub type HttpBody = BoxBody<Bytes, Infallible>;

pub fn full_body(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn plain_response(status: StatusCode, text: &'static str) -> Response<HttpBody> {
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response
}

pub fn error_500() -> Response<HttpBody> {
    plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

/// A request waiting for the guest handler.
struct PendingRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    remote: SocketAddr,
    responder: Option<oneshot::Sender<Response<HttpBody>>>,
}

type PendingMap = Arc<DashMap<RequestId, PendingRequest>>;

/// Request data as handed to JavaScript. Body is a binary string.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub remote_address: String,
    pub remote_port: u16,
}

pub struct HttpManager {
    tracker: Arc<ServerTracker>,
    pending: PendingMap,
    next_id: Arc<AtomicU32>,
    events: Sender<HostEvent>,
}

impl HttpManager {
    pub fn new(tracker: Arc<ServerTracker>, events: Sender<HostEvent>) -> Self {
        Self {
            tracker,
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            events,
        }
    }

    /// Bind an HTTP server and start serving it.
    pub fn listen(&self, host: &str, port: u16) -> NetResult<ServerInfo> {
        let addr = resolve_addr(host, port)?;
        let bound = self.tracker.listen_http(addr)?;
        let info = ServerInfo::from(&bound);

        let _ = self.events.send(HostEvent::Net(NetEvent::Listening {
            server_id: bound.id,
            address: info.address.clone(),
            port: info.port,
            family: if bound.local_addr.is_ipv4() { "IPv4" } else { "IPv6" },
        }));

        let service = GuestHttpService {
            server_id: bound.id,
            pending: self.pending.clone(),
            next_id: self.next_id.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(accept_loop(bound, service, self.events.clone()));

        Ok(info)
    }

    /// Hand a pending request to the guest. The responder stays parked.
    pub fn request(&self, request_id: RequestId) -> Option<RequestView> {
        let pending = self.pending.get(&request_id)?;
        Some(RequestView {
            method: pending.method.as_str().to_string(),
            url: pending.url.clone(),
            headers: pending.headers.clone(),
            body: bytes_to_binary(&pending.body),
            remote_address: pending.remote.ip().to_string(),
            remote_port: pending.remote.port(),
        })
    }

    /// Complete a pending request. Returns `false` if it was already answered.
    pub fn respond(
        &self,
        request_id: RequestId,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> bool {
        let Some((_, mut pending)) = self.pending.remove(&request_id) else {
            return false;
        };
        let Some(responder) = pending.responder.take() else {
            return false;
        };
        let response = build_response(status, &headers, body).unwrap_or_else(|e| {
            warn!(request_id, error = %e, "Invalid response from handler");
            error_500()
        });
        responder.send(response).is_ok()
    }

    pub fn close_server(&self, server_id: ListenerId) -> bool {
        self.tracker.close(server_id, CloseMode::Graceful)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Drop every unanswered request of the previous context.
    pub fn reset(&self) {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!(count, "Dropped pending HTTP requests of previous run");
        }
    }
}

fn build_response(
    status: u16,
    headers: &[(String, String)],
    body: Vec<u8>,
) -> Result<Response<HttpBody>, http::Error> {
    let mut builder = Response::builder().status(StatusCode::from_u16(status)?);
    for (name, value) in headers {
        builder = builder.header(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    builder.body(full_body(body))
}

/// Hyper service that parks requests for the guest handler.
#[derive(Clone)]
struct GuestHttpService {
    server_id: ListenerId,
    pending: PendingMap,
    next_id: Arc<AtomicU32>,
    events: Sender<HostEvent>,
}

impl GuestHttpService {
    fn with_remote(self, remote: SocketAddr) -> ConnectionService {
        ConnectionService {
            inner: self,
            remote,
        }
    }
}

#[derive(Clone)]
struct ConnectionService {
    inner: GuestHttpService,
    remote: SocketAddr,
}

impl Service<Request<Incoming>> for ConnectionService {
    type Response = Response<HttpBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let GuestHttpService {
            server_id,
            pending,
            next_id,
            events,
        } = self.inner.clone();
        let remote = self.remote;

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!(server_id, error = %e, "Failed to read request body");
                    return Ok(plain_response(StatusCode::BAD_REQUEST, "Bad Request"));
                }
            };

            let headers = parts
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();

            let (response_tx, response_rx) = oneshot::channel();
            let request_id = next_id.fetch_add(1, Ordering::Relaxed);
            pending.insert(
                request_id,
                PendingRequest {
                    method: parts.method,
                    url: parts.uri.to_string(),
                    headers,
                    body,
                    remote,
                    responder: Some(response_tx),
                },
            );

            if let Err(e) = events.send(HostEvent::HttpRequest {
                server_id,
                request_id,
            }) {
                tracing::error!(server_id, request_id, error = %e, "Failed to send HTTP event to worker");
                pending.remove(&request_id);
                return Ok(error_500());
            }

            match response_rx.await {
                Ok(response) => Ok(response),
                Err(_) => {
                    warn!(server_id, request_id, "Request handler dropped without responding");
                    Ok(error_500())
                }
            }
        })
    }
}

async fn accept_loop(bound: BoundListener, service: GuestHttpService, events: Sender<HostEvent>) {
    let BoundListener {
        id: server_id,
        listener,
        mut shutdown,
        closed,
        ..
    } = bound;
    let mut connections = JoinSet::new();

    let mode = loop {
        tokio::select! {
            mode = &mut shutdown => break mode.unwrap_or(CloseMode::Force),
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let service = service.clone().with_remote(peer_addr);
                        connections.spawn(async move {
                            if let Err(e) = http1::Builder::new()
                                .keep_alive(true)
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(server_id, peer = %peer_addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        let _ = events.send(HostEvent::Net(NetEvent::ServerError {
                            server_id,
                            error: e.to_string(),
                        }));
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    drop(listener);
    match mode {
        CloseMode::Force => connections.shutdown().await,
        CloseMode::Graceful => connections.detach_all(),
    }
    drop(closed);

    debug!(server_id, ?mode, "HTTP server stopped");
    let _ = events.send(HostEvent::Net(NetEvent::ServerClose { server_id }));
}

//! HTTP transport for the evaluation server.
//!
//! Wraps `tiny_http`. Routes:
//!
//! | Method | Path             | Response                      |
//! |--------|------------------|-------------------------------|
//! | GET    | `/ping`          | `{"message":"pong"}`          |
//! | GET    | `/models`        | list of model descriptors     |
//! | GET    | `/models/{name}` | one descriptor                |
//! | POST   | `/eval`          | encrypted result or error     |
//!
//! Every error body is `{"kind": ..., "detail": ...}`.

use std::borrow::Cow;
use std::io::Read;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use heval_client::protocol::{ErrorBody, ErrorKind, PingResponse};
use serde::Serialize;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::service::EvaluationService;

/// HTTP evaluation server.
pub struct HttpServer {
    server: Server,
    max_body_bytes: usize,
}

struct Reply {
    status: u16,
    body: Vec<u8>,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Reply { status, body },
            Err(e) => Reply::error(ErrorKind::Internal, 500, format!("encoding response: {}", e)),
        }
    }

    fn error(kind: ErrorKind, status: u16, detail: String) -> Self {
        let body = ErrorBody { kind, detail };
        Reply {
            status,
            body: serde_json::to_vec(&body).unwrap_or_else(|_| br#"{"kind":"Internal","detail":""}"#.to_vec()),
        }
    }
}

impl HttpServer {
    /// Bind to `addr`, e.g. "127.0.0.1:8000" or "127.0.0.1:0" for an
    /// ephemeral port.
    pub fn new(addr: &str) -> Result<Self> {
        let server =
            Server::http(addr).map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;
        Ok(Self {
            server,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Reject request bodies larger than `limit` bytes with 413.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Serve with `workers` threads pulling from the shared listener.
    /// Returns once every worker has been unblocked.
    pub fn serve(&self, service: &EvaluationService, workers: usize) {
        let workers = workers.max(1);
        log::info!("serving on {:?} with {} workers", self.addr(), workers);
        std::thread::scope(|scope| {
            for id in 0..workers {
                scope.spawn(move || loop {
                    match self.server.recv() {
                        Ok(request) => self.respond(request, service),
                        Err(e) => {
                            log::debug!("worker {} stopping: {}", id, e);
                            break;
                        }
                    }
                });
            }
        });
    }

    /// Wake one blocked worker so it can exit. Call once per worker to
    /// make [`serve`](Self::serve) return.
    pub fn unblock(&self) {
        self.server.unblock();
    }

    /// Handle exactly one request, then return. Used for testing.
    pub fn handle_one(&self, service: &EvaluationService) -> Result<()> {
        let request = self
            .server
            .recv()
            .map_err(|e| anyhow::anyhow!("recv failed: {}", e))?;
        self.respond(request, service);
        Ok(())
    }

    /// The bound address (useful when binding to port 0).
    pub fn addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    fn respond(&self, mut request: Request, service: &EvaluationService) {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.url().split('?').next().unwrap_or("").to_string();

        let reply = route(&mut request, &method, &path, service, self.max_body_bytes);
        let elapsed = started.elapsed();
        log::info!(
            "{} {} -> {} in {:.1}ms",
            method,
            path,
            reply.status,
            elapsed.as_secs_f64() * 1e3
        );

        let mut response = Response::from_data(reply.body).with_status_code(StatusCode(reply.status));
        if let Ok(h) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response.add_header(h);
        }
        let process_time = format!("{:.6}", elapsed.as_secs_f64());
        if let Ok(h) = Header::from_bytes(&b"X-Process-Time"[..], process_time.as_bytes()) {
            response.add_header(h);
        }
        if let Err(e) = request.respond(response) {
            // Client went away; nothing left to do for this request.
            log::debug!("respond failed: {}", e);
        }
    }
}

fn route(
    request: &mut Request,
    method: &Method,
    path: &str,
    service: &EvaluationService,
    max_body_bytes: usize,
) -> Reply {
    match (method, path) {
        (Method::Get, "/ping") => Reply::json(
            200,
            &PingResponse {
                message: "pong".into(),
            },
        ),
        (Method::Get, "/models") | (Method::Get, "/models/") => {
            Reply::json(200, &service.list_models())
        }
        (Method::Get, p) if model_name(p).is_some() => {
            let name = match decode_model_name(model_name(p).unwrap_or_default()) {
                Ok(name) => name,
                Err(reply) => return reply,
            };
            match service.describe_model(&name) {
                Ok(desc) => Reply::json(200, &desc),
                Err(e) => Reply::error(e.kind, e.kind.http_status(), e.detail),
            }
        }
        (Method::Post, "/eval") => match read_body(request, max_body_bytes) {
            Ok(body) => match service.handle_eval(&body) {
                Ok(resp) => Reply::json(200, &resp),
                Err(e) => Reply::error(e.kind, e.kind.http_status(), e.detail),
            },
            Err(reply) => reply,
        },
        (_, "/ping") | (_, "/models") | (_, "/models/") | (_, "/eval") => Reply::error(
            ErrorKind::BadRequest,
            405,
            format!("method {} not allowed on {}", method, path),
        ),
        (_, p) if model_name(p).is_some() => Reply::error(
            ErrorKind::BadRequest,
            405,
            format!("method {} not allowed on {}", method, path),
        ),
        _ => Reply::error(
            ErrorKind::BadRequest,
            404,
            format!("no route for {} {}", method, path),
        ),
    }
}

/// `{name}` of `/models/{name}`.
fn model_name(path: &str) -> Option<&str> {
    path.strip_prefix("/models/")
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Percent-decode a path segment into a registry name.
fn decode_model_name(raw: &str) -> Result<Cow<'_, str>, Reply> {
    urlencoding::decode(raw).map_err(|e| {
        Reply::error(
            ErrorKind::BadRequest,
            400,
            format!("model name {} is not valid UTF-8: {}", raw, e),
        )
    })
}

fn read_body(request: &mut Request, limit: usize) -> Result<Vec<u8>, Reply> {
    let too_large = || {
        Reply::error(
            ErrorKind::BadRequest,
            413,
            format!("request body exceeds {} bytes", limit),
        )
    };
    if request.body_length().is_some_and(|n| n > limit) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| Reply::error(ErrorKind::BadRequest, 400, format!("read error: {}", e)))?;
    if body.len() > limit {
        return Err(too_large());
    }
    Ok(body)
}

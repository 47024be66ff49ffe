//! Each POST carries `id`/`at`/`dt`/`st` query parameters; a missing `id` opens a fresh `Conn`
//! (`OnOpen`), the body is delivered as one `OnTraffic`, and the handler's response buffer is
//! flushed back on the same HTTP response (spec §4.1 "HTTP long-poll"). A per-id `TimeLimiter`
//! rejects repeated failed handshakes independent of the handshake's own fd-keyed limiter
//! (SPEC_FULL.md §4).
//!
//! Grounded on `original_source/pkg/socket/engine/custom/http/{http,conn}.go`. Uses `axum`, the
//! pack's idiomatic HTTP server crate (see `other_examples/`).

use super::{open_conn, Engine, IoTable};
use crate::conn::{Fd, IdType};
use crate::error::GatewayError;
use crate::event::ConnIo;
use crate::limiter::TimeLimiter;
use crate::server::Gateway;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use futures::future::BoxFuture;
use hashbrown::HashMap as HbHashMap;
use slog::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_LIMITER_INTERVAL_SECS: u64 = 10;

pub struct HttpLongPollEngine {
    gateway: Arc<Gateway>,
    listen_addr: String,
    cancel: CancellationToken,
    io_table: Arc<IoTable>,
    by_id: RwLock<HbHashMap<String, Fd>>,
    id_limiter: TimeLimiter,
}

impl HttpLongPollEngine {
    pub fn new(gateway: Arc<Gateway>, listen_addr: String) -> Arc<HttpLongPollEngine> {
        Arc::new(HttpLongPollEngine {
            gateway,
            listen_addr,
            cancel: CancellationToken::new(),
            io_table: Arc::new(IoTable::new()),
            by_id: RwLock::new(HbHashMap::new()),
            id_limiter: TimeLimiter::new(Duration::from_secs(DEFAULT_LIMITER_INTERVAL_SECS)),
        })
    }

    fn conn_for_id(self: &Arc<Self>, id: &str) -> Arc<crate::conn::ConnContext> {
        if let Some(fd) = self.by_id.read().unwrap().get(id).copied() {
            if let Some(ctx) = self.gateway.registry.get_fd_conn(fd) {
                return ctx;
            }
        }
        let ctx = open_conn(&self.gateway, None, None);
        self.gateway.registry.bind_id(&ctx, IdType::Custom("HTTP".to_string()), id.to_string());
        self.by_id.write().unwrap().insert(id.to_string(), ctx.fd);
        let io: Arc<dyn ConnIo> = Arc::new(HttpIdleIo);
        self.io_table.insert(ctx.clone(), io);
        ctx
    }
}

async fn handle_post(
    State(engine): State<Arc<HttpLongPollEngine>>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Vec<u8>, StatusCode> {
    let id = params.get("id").cloned().unwrap_or_default();
    if id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    if !engine.id_limiter.access(&id) {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let ctx = engine.conn_for_id(&id);
    let response_io = Arc::new(HttpResponseIo {
        buffer: Arc::new(Mutex::new(Vec::new())),
    });

    engine.gateway.event.on_traffic(ctx, response_io.as_ref(), &body).await;

    let flushed = std::mem::take(&mut *response_io.buffer.lock().unwrap());
    Ok(flushed)
}

#[async_trait::async_trait]
impl Engine for HttpLongPollEngine {
    async fn run(self: Arc<Self>) {
        let app = Router::new().route("/longpoll", post(handle_post)).with_state(self.clone());

        let listener = match tokio::net::TcpListener::bind(&self.listen_addr).await {
            Ok(l) => l,
            Err(err) => {
                warn!(self.gateway.log, "http long-poll bind failed"; "addr" => self.listen_addr.as_str(), "error" => %err);
                return;
            }
        };
        info!(self.gateway.log, "listening"; "addr" => self.listen_addr.as_str(), "transport" => "http_long_poll");

        self.gateway.register_io_table(self.io_table.clone());
        let io_table = self.io_table.clone();
        self.gateway.spawn_tick_loop(move || io_table.snapshot());

        let cancel = self.cancel.clone();
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
        if let Err(err) = serve.await {
            warn!(self.gateway.log, "http long-poll server error"; "error" => %err);
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Placeholder `ConnIo` installed in the io table between requests, so the heartbeat ticker
/// (spec §5) can still reap an idle long-poll id; it has no live socket to write to.
struct HttpIdleIo;

impl ConnIo for HttpIdleIo {
    fn write(&self, _bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Per-request `ConnIo`: any bytes the dispatcher writes during this one `OnTraffic` call are
/// buffered and flushed back as the HTTP response body (spec §4.1).
struct HttpResponseIo {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl ConnIo for HttpResponseIo {
    fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
        self.buffer.lock().unwrap().extend_from_slice(&bytes);
        Box::pin(async { Ok(()) })
    }

    fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
        Box::pin(async { Ok(()) })
    }
}

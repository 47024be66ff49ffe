//! HTTP upgrade then a framed reader delivering one complete text/binary message per
//! `OnTraffic` (spec §4.1 "WSS"); control frames (ping/pong/close) are absorbed by the engine
//! and never surfaced to the dispatch pipeline.
//!
//! Grounded on `original_source/pkg/socket/engine/custom/{websocket,wssconn}.go`. Uses
//! `tokio-tungstenite`, the pack's idiomatic async websocket crate.

use super::{open_conn, Engine, IoTable};
use crate::error::GatewayError;
use crate::event::ConnIo;
use crate::server::Gateway;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use slog::{debug, info, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

pub struct WssEngine {
    gateway: Arc<Gateway>,
    listen_addr: String,
    cancel: CancellationToken,
    io_table: Arc<IoTable>,
}

impl WssEngine {
    pub fn new(gateway: Arc<Gateway>, listen_addr: String) -> Arc<WssEngine> {
        Arc::new(WssEngine {
            gateway,
            listen_addr,
            cancel: CancellationToken::new(),
            io_table: Arc::new(IoTable::new()),
        })
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, remote_addr: std::net::SocketAddr) {
        let local_addr = stream.local_addr().ok();
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                debug!(self.gateway.log, "websocket upgrade failed"; "error" => %err);
                return;
            }
        };

        let ctx = open_conn(&self.gateway, local_addr, Some(remote_addr));
        ctx.upgraded.store(true, std::sync::atomic::Ordering::Relaxed);

        let (sink, mut stream) = ws_stream.split();
        let io: Arc<dyn ConnIo> = Arc::new(WssConnIo {
            sink: Arc::new(AsyncMutex::new(sink)),
        });
        self.io_table.insert(ctx.clone(), io.clone());

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    self.gateway.event.on_traffic(ctx.clone(), io.as_ref(), text.as_bytes()).await;
                }
                Ok(Message::Binary(bytes)) => {
                    self.gateway.event.on_traffic(ctx.clone(), io.as_ref(), &bytes).await;
                }
                // Ping/Pong/Close are handled by tungstenite's read loop itself; nothing to
                // surface to the dispatcher (spec §4.1).
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(err) => {
                    debug!(self.gateway.log, "websocket read error"; "fd" => ctx.fd, "error" => %err);
                    break;
                }
            }
        }

        self.io_table.remove(ctx.fd);
        self.gateway.event.on_close(ctx).await;
    }
}

#[async_trait::async_trait]
impl Engine for WssEngine {
    async fn run(self: Arc<Self>) {
        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(l) => l,
            Err(err) => {
                warn!(self.gateway.log, "wss bind failed"; "addr" => self.listen_addr.as_str(), "error" => %err);
                return;
            }
        };
        info!(self.gateway.log, "listening"; "addr" => self.listen_addr.as_str(), "transport" => "wss");

        self.gateway.register_io_table(self.io_table.clone());
        let io_table = self.io_table.clone();
        self.gateway.spawn_tick_loop(move || io_table.snapshot());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let engine = self.clone();
                            tokio::spawn(engine.handle_conn(stream, remote_addr));
                        }
                        Err(err) => warn!(self.gateway.log, "wss accept error"; "error" => %err),
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

struct WssConnIo {
    sink: Arc<AsyncMutex<futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>,
}

impl ConnIo for WssConnIo {
    /// Frame writers (gorilla-style in the original) are not concurrent-safe, hence the
    /// internal lock (spec §5 "Shared-resource policy").
    fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
        let sink = self.sink.clone();
        Box::pin(async move {
            let mut guard = sink.lock().await;
            guard.send(Message::Binary(bytes)).await.map_err(|_| GatewayError::InternalErr)
        })
    }

    fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
        let sink = self.sink.clone();
        Box::pin(async move {
            let mut guard = sink.lock().await;
            let _ = guard.send(Message::Close(None)).await;
            Ok(())
        })
    }

    fn is_message_oriented(&self) -> bool {
        true
    }
}

//! Classic accept-loop plus one reader task per socket (spec §4.1 "TCP"). Framing is left
//! entirely to the codec; the engine only delivers raw chunks as `OnTraffic`.
//!
//! Grounded on `original_source/pkg/socket/engine/net/tcp.go`, adapted from the teacher's
//! mio-evented accept loop (`neutronium::net::endpoint::Endpoint::sync`) into one `tokio::task`
//! per connection.

use super::{open_conn, Engine, IoTable};
use crate::error::GatewayError;
use crate::event::ConnIo;
use crate::server::Gateway;
use futures::future::BoxFuture;
use slog::{debug, info, o, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 64 * 1024;

pub struct TcpEngine {
    gateway: Arc<Gateway>,
    listen_addr: String,
    cancel: CancellationToken,
    io_table: Arc<IoTable>,
}

impl TcpEngine {
    pub fn new(gateway: Arc<Gateway>, listen_addr: String) -> Arc<TcpEngine> {
        Arc::new(TcpEngine {
            gateway,
            listen_addr,
            cancel: CancellationToken::new(),
            io_table: Arc::new(IoTable::new()),
        })
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, remote_addr: std::net::SocketAddr) {
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr().ok();
        let (mut reader, writer) = stream.into_split();

        let ctx = open_conn(&self.gateway, local_addr, Some(remote_addr));
        let io: Arc<dyn ConnIo> = Arc::new(TcpConnIo {
            writer: Arc::new(AsyncMutex::new(writer)),
            closed: AtomicBool::new(false),
        });
        self.io_table.insert(ctx.clone(), io.clone());

        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    debug!(self.gateway.log, "tcp read error"; "fd" => ctx.fd, "error" => %err);
                    break;
                }
            };
            self.gateway.event.on_traffic(ctx.clone(), io.as_ref(), &buf[..n]).await;
        }

        self.io_table.remove(ctx.fd);
        self.gateway.event.on_close(ctx).await;
    }
}

#[async_trait::async_trait]
impl Engine for TcpEngine {
    async fn run(self: Arc<Self>) {
        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(l) => l,
            Err(err) => {
                warn!(self.gateway.log, "tcp bind failed"; "addr" => self.listen_addr.as_str(), "error" => %err);
                return;
            }
        };

        let log = self.gateway.log.new(o!("component" => "tcp-engine"));
        info!(log, "listening"; "addr" => self.listen_addr.as_str());

        self.gateway.register_io_table(self.io_table.clone());
        let io_table = self.io_table.clone();
        let gateway = self.gateway.clone();
        gateway.spawn_tick_loop(move || io_table.snapshot());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let engine = self.clone();
                            tokio::spawn(engine.handle_conn(stream, remote_addr));
                        }
                        Err(err) => {
                            warn!(log, "tcp accept error"; "error" => %err);
                        }
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

struct TcpConnIo {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    closed: AtomicBool,
}

impl ConnIo for TcpConnIo {
    fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let mut guard = writer.lock().await;
            guard.write_all(&bytes).await.map_err(|_| GatewayError::InternalErr)
        })
    }

    fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
        self.closed.store(true, Ordering::Relaxed);
        let writer = self.writer.clone();
        Box::pin(async move {
            let mut guard = writer.lock().await;
            let _ = guard.shutdown().await;
            Ok(())
        })
    }
}

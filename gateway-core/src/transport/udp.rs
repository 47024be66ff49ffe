//! Single read loop on the bound socket (spec §4.1 "UDP"). Connections are derived from the
//! remote address by default, or from a user-supplied `identify_provider` (device ids embedded
//! in the payload, useful behind NAT/broadcast). Two write modes: unicast reply to the
//! datagram's source, or broadcast to a configured address.
//!
//! Grounded on `original_source/pkg/socket/engine/net/udp.go`.

use super::{open_conn, Engine, IoTable};
use crate::conn::Fd;
use crate::error::GatewayError;
use crate::event::ConnIo;
use crate::server::Gateway;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use slog::{info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Derives a per-datagram identifier from its payload; the default identity is the remote
/// address (spec §4.1). A protocol embedding a device id ahead of NAT/broadcast can override
/// this to key connections by that id instead.
pub type IdentifyProvider = dyn Fn(&[u8]) -> Option<String> + Send + Sync;

pub enum UdpMode {
    Unicast,
    /// Write path dials a fixed broadcast address instead of replying to the datagram's source;
    /// the broadcast socket option is set at bind time (spec §4.1: platform-indirected on
    /// Windows vs. Linux/macOS/BSD, both reached through `UdpSocket::set_broadcast`).
    Broadcast { addr: SocketAddr },
}

pub struct UdpEngine {
    gateway: Arc<Gateway>,
    listen_addr: String,
    mode: UdpMode,
    identify: Option<Arc<IdentifyProvider>>,
    cancel: CancellationToken,
    io_table: Arc<IoTable>,
    /// Maps a derived identity back to its allocated fd so repeat datagrams from the same
    /// source reuse the same `ConnContext` instead of opening a new one every time.
    by_identity: RwLock<HashMap<String, Fd>>,
}

impl UdpEngine {
    pub fn new(gateway: Arc<Gateway>, listen_addr: String, mode: UdpMode, identify: Option<Arc<IdentifyProvider>>) -> Arc<UdpEngine> {
        Arc::new(UdpEngine {
            gateway,
            listen_addr,
            mode,
            identify,
            cancel: CancellationToken::new(),
            io_table: Arc::new(IoTable::new()),
            by_identity: RwLock::new(HashMap::new()),
        })
    }

    fn identity_of(&self, remote: SocketAddr, bytes: &[u8]) -> String {
        if let Some(provider) = &self.identify {
            if let Some(id) = provider(bytes) {
                return id;
            }
        }
        remote.to_string()
    }

    async fn conn_for(self: &Arc<Self>, socket: &Arc<UdpSocket>, remote: SocketAddr, identity: &str) -> (Arc<crate::conn::ConnContext>, Arc<dyn ConnIo>) {
        if let Some(fd) = self.by_identity.read().unwrap().get(identity).copied() {
            if let Some(io) = self.io_table.get(fd) {
                if let Some(ctx) = self.gateway.registry.get_fd_conn(fd) {
                    return (ctx, io);
                }
            }
        }

        let local_addr = socket.local_addr().ok();
        let ctx = open_conn(&self.gateway, local_addr, Some(remote));
        let io: Arc<dyn ConnIo> = Arc::new(UdpConnIo {
            socket: socket.clone(),
            target: match &self.mode {
                UdpMode::Unicast => remote,
                UdpMode::Broadcast { addr } => *addr,
            },
            gateway: self.gateway.clone(),
            engine: self.clone(),
            identity: identity.to_string(),
            ctx: ctx.clone(),
        });
        self.io_table.insert(ctx.clone(), io.clone());
        self.by_identity.write().unwrap().insert(identity.to_string(), ctx.fd);
        (ctx, io)
    }
}

#[async_trait::async_trait]
impl Engine for UdpEngine {
    async fn run(self: Arc<Self>) {
        let socket = match UdpSocket::bind(&self.listen_addr).await {
            Ok(s) => s,
            Err(err) => {
                warn!(self.gateway.log, "udp bind failed"; "addr" => self.listen_addr.as_str(), "error" => %err);
                return;
            }
        };

        if matches!(self.mode, UdpMode::Broadcast { .. }) {
            // Platform-indirected broadcast option (spec §4.1): `set_broadcast` is the same
            // call on Linux/macOS/BSD and Windows, std/tokio already hide the platform branch.
            if let Err(err) = socket.set_broadcast(true) {
                warn!(self.gateway.log, "failed to enable broadcast"; "error" => %err);
            }
        }

        let socket = Arc::new(socket);
        info!(self.gateway.log, "listening"; "addr" => self.listen_addr.as_str(), "transport" => "udp");

        self.gateway.register_io_table(self.io_table.clone());
        let io_table = self.io_table.clone();
        self.gateway.spawn_tick_loop(move || io_table.snapshot());

        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, remote)) => {
                            let identity = self.identity_of(remote, &buf[..n]);
                            let (ctx, io) = self.conn_for(&socket, remote, &identity).await;
                            self.gateway.event.on_traffic(ctx, io.as_ref(), &buf[..n]).await;
                        }
                        Err(err) => warn!(self.gateway.log, "udp recv error"; "error" => %err),
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

struct UdpConnIo {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    gateway: Arc<Gateway>,
    engine: Arc<UdpEngine>,
    identity: String,
    ctx: Arc<crate::conn::ConnContext>,
}

impl ConnIo for UdpConnIo {
    fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
        let socket = self.socket.clone();
        let target = self.target;
        Box::pin(async move { socket.send_to(&bytes, target).await.map(|_| ()).map_err(|_| GatewayError::InternalErr) })
    }

    /// UDP has no per-peer socket to shut down; a "close" instead reaps the pseudo-connection
    /// from the engine's identity map, the io table, and the registry (spec §4.1: "Connections
    /// are reaped by the ticker when idle").
    fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
        let gateway = self.gateway.clone();
        let engine = self.engine.clone();
        let identity = self.identity.clone();
        let ctx = self.ctx.clone();
        Box::pin(async move {
            engine.by_identity.write().unwrap().remove(&identity);
            engine.io_table.remove(ctx.fd);
            gateway.event.on_close(ctx).await;
            Ok(())
        })
    }
}

//! Per-transport I/O engines, each producing a uniform [`ConnContext`]/[`ConnIo`] pair for the
//! shared dispatch pipeline in [`crate::event`] (spec §4.1).
//!
//! Grounded on `original_source/pkg/socket/engine/{net,custom}/*.go` for the per-transport
//! accept/read loops, adapted from the teacher's mio-evented `neutronium::net::endpoint::Endpoint`
//! into `tokio` tasks (SPEC_FULL.md §5): one task per accepted connection for TCP/WSS, one
//! dispatch task per inbound datagram/request/message for UDP/HTTP/MQTT.

pub mod http_long_poll;
pub mod mqtt;
pub mod tcp;
pub mod udp;
pub mod wss;

use crate::conn::{ConnContext, Fd};
use crate::event::ConnIo;
use crate::server::Gateway;
use hashbrown::HashMap;
use std::sync::{Arc, RwLock};

/// `Run(ctx, server, event, type, port, config)` / `Stop()` (spec §4.1). Each transport takes
/// ownership of its listener task and exposes cooperative shutdown through the cancellation
/// token threaded in at construction.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    async fn run(self: Arc<Self>);
    fn stop(&self);
}

/// Shared bookkeeping every engine needs to hand a freshly accepted connection to the gateway:
/// allocates the fd, builds the `ConnContext`, and fires `OnOpen`.
pub fn open_conn(
    gateway: &Arc<Gateway>,
    local_addr: Option<std::net::SocketAddr>,
    remote_addr: Option<std::net::SocketAddr>,
) -> Arc<ConnContext> {
    let fd = gateway.registry.allocate_fd();
    let ctx = Arc::new(ConnContext::new(fd, local_addr, remote_addr));
    gateway.event.on_open(ctx.clone());
    ctx
}

/// Tracks the `(ConnContext, ConnIo)` pairs live on one engine instance, feeding both the
/// heartbeat ticker (spec §5) and any registry lookups that need to reach the owning socket.
#[derive(Default)]
pub struct IoTable {
    inner: RwLock<HashMap<Fd, (Arc<ConnContext>, Arc<dyn ConnIo>)>>,
}

impl IoTable {
    pub fn new() -> Self {
        IoTable::default()
    }

    pub fn insert(&self, ctx: Arc<ConnContext>, io: Arc<dyn ConnIo>) {
        self.inner.write().unwrap().insert(ctx.fd, (ctx, io));
    }

    pub fn remove(&self, fd: Fd) {
        self.inner.write().unwrap().remove(&fd);
    }

    pub fn get(&self, fd: Fd) -> Option<Arc<dyn ConnIo>> {
        self.inner.read().unwrap().get(&fd).map(|(_, io)| io.clone())
    }

    pub fn snapshot(&self) -> Vec<(Arc<ConnContext>, Arc<dyn ConnIo>)> {
        self.inner.read().unwrap().values().cloned().collect()
    }
}

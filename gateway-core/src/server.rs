//! `Gateway`: wires the registry, groups, action manager, limiters, session manager, discovery
//! and event dispatcher into one handle transports hold onto (spec §3 "Gateway instance").
//! Grounded on `original_source/pkg/socket/server.go`'s `Server` struct (the single object
//! every engine and RPC service is built around) and the teacher's `Channel::new`/
//! `Authenticator::new` constructor style for child-logger wiring.

use crate::action::{Manager as ActionManager, RemoteCaller};
use crate::config::GatewayConfig;
use crate::conn::Fd;
use crate::discovery::{Discovery, PeerGateways};
use crate::event::{ConnIo, GatewayEvent};
use crate::group::Groups;
use crate::limiter::TimeLimiter;
use crate::registry::ConnRegistry;
use crate::session::SessionManager;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use slog::{o, Logger};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct Gateway {
    pub config: GatewayConfig,
    pub log: Logger,
    pub registry: Arc<ConnRegistry>,
    pub groups: Arc<Groups>,
    pub actions: Arc<ActionManager>,
    pub handshake_limiter: Arc<TimeLimiter>,
    pub sessions: Arc<SessionManager>,
    pub discovery: Arc<dyn Discovery>,
    pub peer_gateways: Arc<PeerGateways>,
    pub event: Arc<GatewayEvent>,
    /// Every transport engine's io table, consulted by the control-plane RPC services (spec
    /// §4.8) to reach a connection's socket by fd regardless of which engine owns it.
    io_tables: RwLock<Vec<Arc<crate::transport::IoTable>>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        log: &Logger,
        remote_caller: Arc<dyn RemoteCaller>,
        discovery: Arc<dyn Discovery>,
    ) -> Gateway {
        let log = log.new(o!("component" => "gateway", "name" => config.name.clone()));

        let registry = Arc::new(ConnRegistry::new());
        let groups = Arc::new(Groups::new());
        let actions = Arc::new(ActionManager::new(config.name.clone(), remote_caller));
        let handshake_limiter = Arc::new(TimeLimiter::new(Duration::from_secs(1)));
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(300)));
        let peer_gateways = Arc::new(PeerGateways::new());

        let rsa_private_key = config
            .rsa_private_key_path
            .as_deref()
            .and_then(|path| load_rsa_private_key(path, &log));

        let event = Arc::new(GatewayEvent::new(
            registry.clone(),
            groups.clone(),
            actions.clone(),
            handshake_limiter.clone(),
            rsa_private_key.map(Arc::new),
            &log,
        ));

        Gateway {
            config,
            log,
            registry,
            groups,
            actions,
            handshake_limiter,
            sessions,
            discovery,
            peer_gateways,
            event,
            io_tables: RwLock::new(Vec::new()),
        }
    }

    /// Registers one engine's io table so control-plane RPCs (`DisconnectTarget`,
    /// `BroadcastGroup`, `SendMessage`) can reach its connections by fd (spec §4.8).
    pub fn register_io_table(&self, table: Arc<crate::transport::IoTable>) {
        self.io_tables.write().unwrap().push(table);
    }

    /// Finds the `ConnIo` owning `fd` across every registered engine.
    pub fn find_io(&self, fd: Fd) -> Option<Arc<dyn ConnIo>> {
        self.io_tables.read().unwrap().iter().find_map(|table| table.get(fd))
    }

    /// Registers one remote action entry, the sink `discovery`'s handler-table watch callback
    /// feeds into (spec §4.7 #1).
    pub fn register_remote_action(&self, host: &str, action_id: u32, name: &str, flb: u32) {
        self.actions.register_remote_action(host, action_id, name, flb);
    }

    pub fn unregister_host(&self, host: &str) {
        self.actions.unregister_remote_action(host);
    }

    /// Watches both discovery prefixes (spec §4.7) and keeps the action table / peer set
    /// updated as entries come and go. The channel name scopes both key prefixes.
    pub fn watch_discovery(self: &Arc<Self>, channel: &str) {
        let hdl_prefix = format!("socket-hdl@{}", channel);
        let gw_prefix = format!("socket-gw@{}", channel);

        let gateway = self.clone();
        self.discovery.watch(
            &hdl_prefix,
            Arc::new(move |event| {
                if let crate::discovery::WatchEvent::Put { key, value } = &event {
                    if let Some(entry) = crate::discovery::parse_handler_key(key, value) {
                        gateway.register_remote_action(&entry.host, entry.action_id, &entry.name, entry.flb);
                    }
                }
                if let crate::discovery::WatchEvent::Delete { key } = &event {
                    if let Some(entry) = crate::discovery::parse_handler_key(key, "") {
                        gateway.unregister_host(&entry.host);
                    }
                }
            }),
        );

        let peers = self.peer_gateways.clone();
        self.discovery.watch(
            &gw_prefix,
            Arc::new(move |event| match event {
                crate::discovery::WatchEvent::Put { key, .. } => {
                    if let Some(entry) = crate::discovery::parse_gateway_key(&key) {
                        peers.add(entry.host);
                    }
                }
                crate::discovery::WatchEvent::Delete { key } => {
                    if let Some(entry) = crate::discovery::parse_gateway_key(&key) {
                        peers.remove(&entry.host);
                    }
                }
            }),
        );
    }

    /// Spawns the heartbeat/auth-ttl ticker (spec §5). `live_conns` is supplied by the owning
    /// transport set since only it knows each connection's `ConnIo`.
    pub fn spawn_tick_loop<F>(self: &Arc<Self>, live_conns: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Vec<(Arc<crate::conn::ConnContext>, Arc<dyn crate::event::ConnIo>)> + Send + Sync + 'static,
    {
        let gateway = self.clone();
        let interval = self.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                gateway.event.on_tick(live_conns()).await;
            }
        })
    }
}

fn load_rsa_private_key(path: &str, log: &Logger) -> Option<RsaPrivateKey> {
    match std::fs::read_to_string(path) {
        Ok(pem) => match RsaPrivateKey::from_pkcs8_pem(&pem) {
            Ok(key) => Some(key),
            Err(err) => {
                slog::error!(log, "failed to parse RSA private key"; "path" => path, "error" => %err);
                None
            }
        },
        Err(err) => {
            slog::error!(log, "failed to read RSA private key file"; "path" => path, "error" => %err);
            None
        }
    }
}

//! Service-discovery watchers for the remote action table and the peer-gateway set
//! (spec §4.7). Grounded on `original_source/socket.go::watch()` (key-prefix parsing,
//! idempotent add/remove callbacks). The registry-center client itself (etcd/consul) is an
//! external collaborator — only the trait and an in-memory test double live here.

use hashbrown::HashSet;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

/// A registry-center client capable of watching a key prefix and registering a TTL'd key.
/// Implementations must call back at least once per distinct live key (idempotent additions).
pub trait Discovery: Send + Sync {
    fn watch(&self, prefix: &str, callback: Arc<dyn Fn(WatchEvent) + Send + Sync>);
    fn register(&self, key: &str, value: &str, ttl_secs: u64);
}

/// Parsed remote-action handler-watch entry: `.../socket-hdl@<channel>/<endType>/<id>/<host>/
/// <action-id> = action-name[|flb-port]` (spec §4.7 #1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerEntry {
    pub channel: String,
    pub end_type: String,
    pub host: String,
    pub action_id: u32,
    pub name: String,
    pub flb: u32,
}

pub fn parse_handler_key(key: &str, value: &str) -> Option<HandlerEntry> {
    // .../socket-hdl@<channel>/<endType>/<id>/<host>/<action-id>
    let marker = "socket-hdl@";
    let idx = key.find(marker)?;
    let rest = &key[idx + marker.len()..];
    let mut parts = rest.split('/');
    let channel = parts.next()?.to_string();
    let end_type = parts.next()?.to_string();
    let _id = parts.next()?;
    let host = parts.next()?.to_string();
    let action_id: u32 = parts.next()?.parse().ok()?;

    let (name, flb) = match value.split_once('|') {
        Some((name, flb)) => (name.to_string(), flb.parse().unwrap_or(0)),
        None => (value.to_string(), 0),
    };

    Some(HandlerEntry {
        channel,
        end_type,
        host,
        action_id,
        name,
        flb,
    })
}

/// Parsed peer-gateway entry: `.../socket-gw@<channel>/<endType>/<host>` (spec §4.7 #2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEntry {
    pub channel: String,
    pub end_type: String,
    pub host: String,
}

pub fn parse_gateway_key(key: &str) -> Option<GatewayEntry> {
    let marker = "socket-gw@";
    let idx = key.find(marker)?;
    let rest = &key[idx + marker.len()..];
    let mut parts = rest.split('/');
    let channel = parts.next()?.to_string();
    let end_type = parts.next()?.to_string();
    let host = parts.next()?.to_string();
    Some(GatewayEntry {
        channel,
        end_type,
        host,
    })
}

/// Tracks the peer-gateway set with idempotent add/remove, for cross-gateway disconnect
/// broadcasts (spec §4.7 #2, glossary "Channel").
#[derive(Default)]
pub struct PeerGateways {
    hosts: RwLock<HashSet<String>>,
}

impl PeerGateways {
    pub fn new() -> Self {
        PeerGateways::default()
    }

    pub fn add(&self, host: String) {
        self.hosts.write().unwrap().insert(host);
    }

    pub fn remove(&self, host: &str) {
        self.hosts.write().unwrap().remove(host);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.hosts.read().unwrap().iter().cloned().collect()
    }
}

/// In-memory `Discovery` implementation for tests and local single-gateway runs.
#[derive(Default)]
pub struct InMemoryDiscovery {
    entries: RwLock<hashbrown::HashMap<String, String>>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        InMemoryDiscovery::default()
    }

    pub fn put(&self, key: &str, value: &str) {
        self.entries.write().unwrap().insert(key.to_string(), value.to_string());
    }
}

impl Discovery for InMemoryDiscovery {
    fn watch(&self, prefix: &str, callback: Arc<dyn Fn(WatchEvent) + Send + Sync>) {
        for (key, value) in self.entries.read().unwrap().iter() {
            if key.starts_with(prefix) {
                callback(WatchEvent::Put {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    fn register(&self, key: &str, value: &str, _ttl_secs: u64) {
        self.put(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handler_key_with_flb_suffix() {
        let entry = parse_handler_key(
            "/app/socket-hdl@main/tcp/42/10.0.0.1:7001/100",
            "orders|7001",
        )
        .unwrap();
        assert_eq!(entry.channel, "main");
        assert_eq!(entry.host, "10.0.0.1:7001");
        assert_eq!(entry.action_id, 100);
        assert_eq!(entry.name, "orders");
        assert_eq!(entry.flb, 7001);
    }

    #[test]
    fn parses_handler_key_without_flb_suffix() {
        let entry = parse_handler_key("/app/socket-hdl@main/tcp/42/10.0.0.1:7001/100", "orders").unwrap();
        assert_eq!(entry.flb, 0);
    }

    #[test]
    fn parses_gateway_key() {
        let entry = parse_gateway_key("/app/socket-gw@main/tcp/10.0.0.2:9000").unwrap();
        assert_eq!(entry.channel, "main");
        assert_eq!(entry.host, "10.0.0.2:9000");
    }

    #[test]
    fn peer_gateway_add_is_idempotent() {
        let peers = PeerGateways::new();
        peers.add("h1".to_string());
        peers.add("h1".to_string());
        assert_eq!(peers.snapshot(), vec!["h1".to_string()]);
    }
}

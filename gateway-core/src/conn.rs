//! The per-connection mutable context (spec §3, §9 "Mutable connection context").
//!
//! Modeled as a tagged struct with explicit optional fields rather than an opaque map, per the
//! design note; dynamic lookup stays limited to the per-action flb override table.

use flux::contract::Authentication;
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

pub type Fd = u64;

/// Reserved id types every connection may be bound under (spec §3: "reserved types `UID`,
/// `TARGET`, `SN`"). Custom types are also supported by engines that need them (e.g. doc
/// server attributes use their own scheme, out of scope here).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdType {
    Uid,
    Target,
    Sn,
    Custom(String),
}

impl IdType {
    pub fn as_str(&self) -> &str {
        match self {
            IdType::Uid => "UID",
            IdType::Target => "TARGET",
            IdType::Sn => "SN",
            IdType::Custom(name) => name.as_str(),
        }
    }

    pub fn key(&self, value: &str) -> String {
        format!("{}:{}", self.as_str(), value)
    }
}

/// Handshake/auth state machine (spec §4.4): `FRESH -> KEY-EXCHANGED -> AUTHED`.
#[derive(Debug, Clone)]
pub enum ConnState {
    Fresh,
    KeyExchanged(Instant),
    Authed,
}

/// An authenticated user record (spec §3: "numeric id, display name, and string attributes").
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: u64,
    pub name: String,
    pub attributes: HashMap<String, String>,
}

/// Mutable, per-connection optional state (spec §9): coder state, crypto key, heartbeat-interval
/// override, close-reason, and per-action flb overrides. Guarded by a single mutex since these
/// fields are written both by the owning engine task and by control-plane RPC handlers.
#[derive(Default)]
pub struct ConnOptional {
    pub coder_name: Option<String>,
    pub aes_key: Option<[u8; 32]>,
    pub heartbeat_interval: Option<std::time::Duration>,
    pub close_reason: Option<String>,
    pub flb_overrides: HashMap<u32, u32>,
}

pub struct ConnContext {
    pub fd: Fd,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: u64,
    pub last_active_at: Mutex<u64>,
    pub state: Mutex<ConnState>,
    pub ids: Mutex<HashMap<IdType, String>>,
    pub user: Mutex<Option<AuthUser>>,
    pub auth: Mutex<Option<Authentication>>,
    pub optional: Mutex<ConnOptional>,
    pub upgraded: std::sync::atomic::AtomicBool,
    /// The codec selected from the first post-handshake packet's tag byte (spec §4.2), and the
    /// leftover bytes from the last partial frame, both cached per-connection.
    pub codec: Mutex<Option<crate::codec::Codec>>,
    pub leftover: Mutex<Vec<u8>>,
}

impl ConnContext {
    pub fn new(fd: Fd, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Self {
        let now = flux::time::timestamp_secs();
        ConnContext {
            fd,
            local_addr,
            remote_addr,
            connected_at: now,
            last_active_at: Mutex::new(now),
            state: Mutex::new(ConnState::Fresh),
            ids: Mutex::new(HashMap::new()),
            user: Mutex::new(None),
            auth: Mutex::new(None),
            optional: Mutex::new(ConnOptional::default()),
            upgraded: std::sync::atomic::AtomicBool::new(false),
            codec: Mutex::new(None),
            leftover: Mutex::new(Vec::new()),
        }
    }

    pub fn touch(&self) {
        *self.last_active_at.lock().unwrap() = flux::time::timestamp_secs();
    }

    pub fn last_active_elapsed_secs(&self) -> u64 {
        flux::time::timestamp_secs().saturating_sub(*self.last_active_at.lock().unwrap())
    }

    pub fn is_authed(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), ConnState::Authed)
    }

    pub fn bind_id(&self, id_type: IdType, value: String) {
        self.ids.lock().unwrap().insert(id_type, value);
    }

    pub fn unbind_id(&self, id_type: &IdType) {
        self.ids.lock().unwrap().remove(id_type);
    }

    pub fn id(&self, id_type: &IdType) -> Option<String> {
        self.ids.lock().unwrap().get(id_type).cloned()
    }

    pub fn bound_ids(&self) -> Vec<(IdType, String)> {
        self.ids
            .lock()
            .unwrap()
            .iter()
            .map(|(t, v)| (t.clone(), v.clone()))
            .collect()
    }
}

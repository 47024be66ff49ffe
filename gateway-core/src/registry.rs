//! The connection registry (spec §4.6): `fd -> Conn`, `IdManager`, proxy-target bindings.
//!
//! Grounded on `original_source/pkg/socket/server.go` (`connections`, `connIdBinds` sync maps,
//! `BindId`/`UnbindId`/`addConn`/`delConn`) and the teacher's `neutronium::net::endpoint`
//! slab/free-list allocation pattern for fds.

use crate::conn::{ConnContext, Fd, IdType};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// `id-string -> ordered set of fd` with idempotent insert and GC-on-empty delete (spec §3).
#[derive(Default)]
pub struct IdManager {
    inner: RwLock<HashMap<String, IndexSet<Fd>>>,
}

impl IdManager {
    pub fn new() -> Self {
        IdManager::default()
    }

    /// Idempotent: binding the same (id, fd) pair twice is a no-op the second time.
    pub fn bind(&self, id: &str, fd: Fd) {
        self.inner
            .write()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(IndexSet::new)
            .insert(fd);
    }

    /// Removes `fd` from `id`'s set; drops the key entirely once the set is empty (GC-on-empty).
    pub fn unbind(&self, id: &str, fd: Fd) {
        let mut inner = self.inner.write().unwrap();
        if let Some(set) = inner.get_mut(id) {
            set.shift_remove(&fd);
            if set.is_empty() {
                inner.remove(id);
            }
        }
    }

    /// Snapshot read: returns a copy so callers never hold the lock across further work.
    pub fn get(&self, id: &str) -> Vec<Fd> {
        self.inner
            .read()
            .unwrap()
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .get(id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }
}

/// `fd -> Conn` plus the three id/group/proxy structures that hang off it (spec §4.6).
pub struct ConnRegistry {
    next_fd: AtomicU64,
    conns: RwLock<HashMap<Fd, Arc<ConnContext>>>,
    ids: IdManager,
    /// target -> set of local fds proxying for it (spec glossary: "Proxy target").
    proxy_targets: RwLock<HashMap<String, IndexSet<Fd>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        ConnRegistry {
            next_fd: AtomicU64::new(1),
            conns: RwLock::new(HashMap::new()),
            ids: IdManager::new(),
            proxy_targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn allocate_fd(&self) -> Fd {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a freshly-opened connection to the global map (spec invariant #2: fd>0 and opened).
    pub fn add_conn(&self, ctx: Arc<ConnContext>) {
        debug_assert!(ctx.fd > 0);
        self.conns.write().unwrap().insert(ctx.fd, ctx);
    }

    pub fn get_fd_conn(&self, fd: Fd) -> Option<Arc<ConnContext>> {
        self.conns.read().unwrap().get(&fd).cloned()
    }

    /// Removes every bound id and every group membership before dropping the `fd->conn` entry
    /// (spec §4.6: "only then is the fd->conn entry deleted").
    pub fn del_conn(&self, fd: Fd, groups: &crate::group::Groups) {
        if let Some(ctx) = self.conns.read().unwrap().get(&fd).cloned() {
            for (id_type, value) in ctx.bound_ids() {
                self.ids.unbind(&id_type.key(&value), fd);
            }
        }
        groups.leave_all(fd);
        self.conns.write().unwrap().remove(&fd);
    }

    pub fn bind_id(&self, ctx: &ConnContext, id_type: IdType, value: String) {
        self.ids.bind(&id_type.key(&value), ctx.fd);
        ctx.bind_id(id_type, value);
    }

    pub fn unbind_id(&self, ctx: &ConnContext, id_type: &IdType) {
        if let Some(value) = ctx.id(id_type) {
            self.ids.unbind(&id_type.key(&value), ctx.fd);
        }
        ctx.unbind_id(id_type);
    }

    /// Stale fds are garbage-collected on read (spec §4.6).
    pub fn get_id_conn(&self, id_type: &IdType, value: &str) -> Vec<Arc<ConnContext>> {
        let key = id_type.key(value);
        let fds = self.ids.get(&key);
        let mut live = Vec::with_capacity(fds.len());
        for fd in fds {
            match self.get_fd_conn(fd) {
                Some(ctx) => live.push(ctx),
                None => self.ids.unbind(&key, fd),
            }
        }
        live
    }

    pub fn bind_proxy_target(&self, target: &str, fd: Fd) {
        self.proxy_targets
            .write()
            .unwrap()
            .entry(target.to_string())
            .or_insert_with(IndexSet::new)
            .insert(fd);
    }

    pub fn unbind_proxy_target(&self, target: &str, fd: Fd) {
        let mut inner = self.proxy_targets.write().unwrap();
        if let Some(set) = inner.get_mut(target) {
            set.shift_remove(&fd);
            if set.is_empty() {
                inner.remove(target);
            }
        }
    }

    pub fn proxy_fds_for(&self, target: &str) -> Vec<Fd> {
        self.proxy_targets
            .read()
            .unwrap()
            .get(target)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_is_idempotent() {
        let ids = IdManager::new();
        ids.bind("TARGET:dev-7", 5);
        ids.bind("TARGET:dev-7", 5);
        assert_eq!(ids.get("TARGET:dev-7"), vec![5]);
    }

    #[test]
    fn unbind_last_fd_gcs_the_entry() {
        let ids = IdManager::new();
        ids.bind("TARGET:dev-7", 5);
        ids.unbind("TARGET:dev-7", 5);
        assert!(ids.get("TARGET:dev-7").is_empty());
        assert!(!ids.exists("TARGET:dev-7"));
    }

    #[test]
    fn stale_fd_is_gced_on_read() {
        let registry = ConnRegistry::new();
        let ctx = Arc::new(ConnContext::new(1, None, None));
        registry.add_conn(ctx.clone());
        registry.bind_id(&ctx, IdType::Target, "dev-9".to_string());

        // Simulate the conn disappearing from the registry without going through del_conn.
        registry.conns.write().unwrap().remove(&1);

        assert!(registry.get_id_conn(&IdType::Target, "dev-9").is_empty());
        assert!(!registry.ids.exists(&IdType::Target.key("dev-9")));
    }
}

//! Named groups of connections with concurrent broadcast fan-out (spec §3, §4.8).
//!
//! Grounded on `original_source/pkg/group/group.go` (`Groups`/`Group`, lazy creation, goroutine
//! pool + wait-group broadcast); the goroutine pool is replaced with a bounded
//! `FuturesUnordered` fan-out per SPEC_FULL.md §5.

use crate::conn::Fd;
use futures::stream::{FuturesUnordered, StreamExt};
use hashbrown::HashMap;
use std::sync::RwLock;

const BROADCAST_CONCURRENCY: usize = 64;

#[derive(Default)]
pub struct Group {
    members: RwLock<HashMap<Fd, String>>,
}

impl Group {
    pub fn join(&self, fd: Fd, member_id: String) {
        self.members.write().unwrap().insert(fd, member_id);
    }

    pub fn leave(&self, fd: Fd) {
        self.members.write().unwrap().remove(&fd);
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().unwrap().is_empty()
    }

    pub fn members(&self) -> Vec<(Fd, String)> {
        self.members
            .read()
            .unwrap()
            .iter()
            .map(|(fd, id)| (*fd, id.clone()))
            .collect()
    }

    /// Broadcasts to every member matching `id_filter` (or all members when `None`), running
    /// `send` for each concurrently, bounded, and waiting for all sends before returning.
    pub async fn broadcast<F, Fut>(&self, id_filter: Option<&str>, send: F) -> usize
    where
        F: Fn(Fd, String) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let targets: Vec<(Fd, String)> = self
            .members()
            .into_iter()
            .filter(|(_, id)| match id_filter {
                Some(filter) => filter == id,
                None => true,
            })
            .collect();

        let mut delivered = 0usize;
        let mut tasks = FuturesUnordered::new();
        let mut iter = targets.into_iter();

        for (fd, id) in iter.by_ref().take(BROADCAST_CONCURRENCY) {
            tasks.push(send(fd, id));
        }

        while let Some(ok) = tasks.next().await {
            if ok {
                delivered += 1;
            }
            if let Some((fd, id)) = iter.next() {
                tasks.push(send(fd, id));
            }
        }

        delivered
    }
}

/// Lazily-created named groups (spec §3: "created lazily on first reference").
#[derive(Default)]
pub struct Groups {
    groups: RwLock<HashMap<String, std::sync::Arc<Group>>>,
}

impl Groups {
    pub fn new() -> Self {
        Groups::default()
    }

    pub fn get_or_create(&self, name: &str) -> std::sync::Arc<Group> {
        if let Some(group) = self.groups.read().unwrap().get(name) {
            return group.clone();
        }
        self.groups
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| std::sync::Arc::new(Group::default()))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Every connection leaves every group it belongs to on close (spec §3).
    pub fn leave_all(&self, fd: Fd) {
        for group in self.groups.read().unwrap().values() {
            group.leave(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_respects_id_filter() {
        let groups = Groups::new();
        let g = groups.get_or_create("lobby");
        g.join(1, "alice".to_string());
        g.join(2, "bob".to_string());

        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let delivered_clone = delivered.clone();
        let count = g
            .broadcast(Some("alice"), move |fd, id| {
                let delivered = delivered_clone.clone();
                async move {
                    delivered.lock().unwrap().push((fd, id));
                    true
                }
            })
            .await;

        assert_eq!(count, 1);
        assert_eq!(delivered.lock().unwrap().as_slice(), &[(1, "alice".to_string())]);
    }

    #[test]
    fn leave_all_removes_from_every_group() {
        let groups = Groups::new();
        let a = groups.get_or_create("a");
        let b = groups.get_or_create("b");
        a.join(1, "x".to_string());
        b.join(1, "x".to_string());

        groups.leave_all(1);

        assert!(a.is_empty());
        assert!(b.is_empty());
    }
}

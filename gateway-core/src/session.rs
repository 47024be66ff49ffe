//! Per-target TTL session registry (spec §4.8 `Conn::SessionId`), distinct from
//! `flux::session`'s symmetric-key carrier — see SPEC_FULL.md §9 "Session concept split".
//! Grounded on `original_source/pkg/socket/session.go`.

use hashbrown::HashMap;
use rand::RngCore;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Session {
    id: String,
    expire_at: Instant,
    refcount: u32,
}

pub struct SessionManager {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        SessionManager {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn gen_session_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Returns the active (non-expired) session id for `target`, if any.
    pub fn get_active(&self, target: &str) -> Option<String> {
        let sessions = self.sessions.read().unwrap();
        sessions.get(target).and_then(|s| {
            if Instant::now() < s.expire_at {
                Some(s.id.clone())
            } else {
                None
            }
        })
    }

    /// Creates (or refreshes, incrementing the refcount) a session for `target`.
    pub fn new_session(&self, target: &str) -> String {
        let mut sessions = self.sessions.write().unwrap();
        let now = Instant::now();
        match sessions.get_mut(target) {
            Some(existing) if now < existing.expire_at => {
                existing.refcount += 1;
                existing.expire_at = now + self.ttl;
                existing.id.clone()
            }
            _ => {
                let id = Self::gen_session_id();
                sessions.insert(
                    target.to_string(),
                    Session {
                        id: id.clone(),
                        expire_at: now + self.ttl,
                        refcount: 1,
                    },
                );
                id
            }
        }
    }

    pub fn add_num(&self, target: &str, delta: i32) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(target) {
            session.refcount = (session.refcount as i32 + delta).max(0) as u32;
        }
    }

    /// Deletes the session outright once its refcount reaches zero.
    pub fn delete(&self, target: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get(target) {
            if session.refcount == 0 {
                sessions.remove(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_refreshes_an_active_one() {
        let mgr = SessionManager::new(Duration::from_secs(60));
        let first = mgr.new_session("dev-7");
        let second = mgr.new_session("dev-7");
        assert_eq!(first, second);
    }

    #[test]
    fn expired_session_is_not_returned() {
        let mgr = SessionManager::new(Duration::from_millis(10));
        mgr.new_session("dev-7");
        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.get_active("dev-7").is_none());
    }
}

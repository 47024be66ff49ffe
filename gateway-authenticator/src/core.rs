//! Account bookkeeping backing the gateway's `Handler::Authenticate` remote action (spec §4.5
//! "remote action handler", §4.4 "handshake"). Grounded on the teacher's
//! `server/services/authenticator/src/core.rs` serial-key/ban lookup; the connection-token
//! crypto it built on top (`flux::session`, `ConnectionToken`) is dropped here because the
//! gateway already derives and holds the session's symmetric key itself (SPEC_FULL.md §4.4) —
//! this service only has to decide whether an id may connect and what `Authentication` it
//! carries.

use chrono::{DateTime, Utc};
use flux::logging;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Ban {
    pub created: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub reason: String,
}

impl Ban {
    fn is_active(&self) -> bool {
        match self.expiry {
            Some(expiry) => expiry > Utc::now(),
            None => true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct UserInfo {
    pub id: u64,
    pub created: DateTime<Utc>,
    pub ban: Option<Ban>,
}

impl UserInfo {
    pub fn new(id: u64) -> UserInfo {
        UserInfo {
            id,
            created: Utc::now(),
            ban: None,
        }
    }
}

pub enum Decision {
    Ok { user_id: u64 },
    Banned(Ban),
    NotFound,
}

/// Looks up a client-supplied serial key against a loaded user table and reports whether it may
/// proceed. Users are loaded once at startup (spec §6: config/user files are static inputs, no
/// admin surface in scope).
pub struct Authenticator {
    users: RwLock<HashMap<String, UserInfo>>,
    log: logging::Logger,
}

impl Authenticator {
    pub fn new(users: HashMap<String, UserInfo>, log: &logging::Logger) -> Authenticator {
        Authenticator {
            users: RwLock::new(users),
            log: log.new(logging::o!("component" => "authenticator")),
        }
    }

    pub fn authenticate(&self, serial_key: &str) -> Decision {
        logging::debug!(self.log, "authenticate"; "key" => Self::protect_key(serial_key));
        let users = self.users.read().unwrap();
        match users.get(serial_key) {
            Some(info) => match &info.ban {
                Some(ban) if ban.is_active() => {
                    logging::info!(self.log, "authenticate"; "result" => "banned", "id" => info.id);
                    Decision::Banned(ban.clone())
                }
                _ => {
                    logging::info!(self.log, "authenticate"; "result" => "ok", "id" => info.id);
                    Decision::Ok { user_id: info.id }
                }
            },
            None => {
                logging::info!(self.log, "authenticate"; "result" => "notfound");
                Decision::NotFound
            }
        }
    }

    fn protect_key(serial_key: &str) -> String {
        let visible = 8;
        serial_key
            .chars()
            .enumerate()
            .map(|(idx, chr)| if idx + visible < serial_key.len() { '*' } else { chr })
            .collect()
    }
}

//! Action dispatcher: local handlers, remote table with flb routing, and the raw-protocol
//! round-trip (spec §4.5). Grounded on
//! `original_source/service/action/{manager,action,option}.go` — the teacher has no
//! multi-backend action router of its own.

use crate::conn::ConnContext;
use crate::error::GatewayError;
use futures::future::BoxFuture;
use gateway_proto::v1::{AuthenticateRequest, AuthenticateResponse, HandleRequest, HandleResponse, RawRequest, RawResponse};
use hashbrown::{HashMap, HashSet};
use prost::Message;
use std::sync::{Arc, RwLock};

pub type ActionId = u32;

/// Reserved action ids (spec §4.3).
pub const ACTION_PING: ActionId = 1;
pub const ACTION_PONG: ActionId = 2;
pub const ACTION_AUTH_REQ: ActionId = 3;
pub const ACTION_AUTH_RESP: ActionId = 4;
pub const ACTION_CLOSE: ActionId = 0;

/// The sentinel returned by an authenticate backend meaning "skip symmetric crypto for this
/// target" (spec §4.4).
pub const NO_CERT: &str = "NO_CERT";

pub enum HandlerOutcome {
    Reply(ActionId, Vec<u8>),
    NoReply,
}

pub trait LocalHandler: Send + Sync {
    fn call(&self, ctx: Arc<ConnContext>, data: Vec<u8>) -> BoxFuture<'static, Result<HandlerOutcome, GatewayError>>;
}

/// Abstracts the outbound `Handle`/`Authenticate`/`Raw` RPC calls to a remote server host, so
/// the manager can be unit tested without a running tonic client (see `rpc::remote`).
pub trait RemoteCaller: Send + Sync {
    fn handle(&self, host: String, req: HandleRequest) -> BoxFuture<'static, Result<HandleResponse, GatewayError>>;
    fn authenticate(
        &self,
        host: String,
        req: AuthenticateRequest,
    ) -> BoxFuture<'static, Result<AuthenticateResponse, GatewayError>>;
    fn raw(&self, host: String, req: RawRequest) -> BoxFuture<'static, Result<RawResponse, GatewayError>>;
}

/// Strips a trailing `:port` off a registered `host:port` address, leaving the bare host/ip
/// used to key flb buckets (spec §4.5, `service/action/manager.go::getFlbServers`).
fn host_without_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

#[derive(Clone)]
struct RemoteEntry {
    name: String,
    flb: u32,
}

/// `action-id -> local handler` (exclusive with remote — local wins) plus
/// `action-id -> mapping(server-host -> (action-name, flb-number))` with a reverse index
/// `server-host -> set of action-id` for bulk removal (spec §3 "ActionTable").
pub struct Manager {
    locals: RwLock<HashMap<ActionId, Arc<dyn LocalHandler>>>,
    remotes: RwLock<HashMap<ActionId, HashMap<String, RemoteEntry>>>,
    hosts_index: RwLock<HashMap<String, HashSet<ActionId>>>,
    /// `"user"` / `"device"` / ... -> action id registered to handle that authenticate type.
    authenticate_actions: RwLock<HashMap<String, ActionId>>,
    /// raw protocol tag -> action id registered to handle that protocol (spec §4.5).
    raw_actions: RwLock<HashMap<String, ActionId>>,
    close_action: RwLock<Option<ActionId>>,
    gateway_name: String,
    remote_caller: Arc<dyn RemoteCaller>,
}

impl Manager {
    pub fn new(gateway_name: String, remote_caller: Arc<dyn RemoteCaller>) -> Self {
        Manager {
            locals: RwLock::new(HashMap::new()),
            remotes: RwLock::new(HashMap::new()),
            hosts_index: RwLock::new(HashMap::new()),
            authenticate_actions: RwLock::new(HashMap::new()),
            raw_actions: RwLock::new(HashMap::new()),
            close_action: RwLock::new(None),
            gateway_name,
            remote_caller,
        }
    }

    pub fn register_handler_action(&self, id: ActionId, handler: Arc<dyn LocalHandler>) {
        self.locals.write().unwrap().insert(id, handler);
    }

    pub fn set_close_action(&self, id: ActionId) {
        *self.close_action.write().unwrap() = Some(id);
    }

    /// `name` may carry a type prefix identifying a special-purpose action: `authenticate:
    /// user,device` registers this action id as the authenticate handler for both `user` and
    /// `device`; `raw:mqtt` registers it as the raw-protocol handler for `mqtt` (spec §4.1/§4.5,
    /// grounded on `manager.go::initType`).
    pub fn register_remote_action(&self, host: &str, id: ActionId, name: &str, flb: u32) {
        if let Some(types) = name.strip_prefix("authenticate:") {
            let mut table = self.authenticate_actions.write().unwrap();
            for ty in types.split(',') {
                table.insert(ty.trim().to_string(), id);
            }
        } else if let Some(protocol) = name.strip_prefix("raw:") {
            self.raw_actions.write().unwrap().insert(protocol.trim().to_string(), id);
        }

        self.remotes
            .write()
            .unwrap()
            .entry(id)
            .or_insert_with(HashMap::new)
            .insert(
                host.to_string(),
                RemoteEntry {
                    name: name.to_string(),
                    flb,
                },
            );
        self.hosts_index
            .write()
            .unwrap()
            .entry(host.to_string())
            .or_insert_with(HashSet::new)
            .insert(id);
    }

    /// Purges every action advertised by `host` (spec §4.7: "purge all actions from that host").
    pub fn unregister_remote_action(&self, host: &str) {
        if let Some(ids) = self.hosts_index.write().unwrap().remove(host) {
            let mut remotes = self.remotes.write().unwrap();
            for id in ids {
                if let Some(hosts) = remotes.get_mut(&id) {
                    hosts.remove(host);
                    if hosts.is_empty() {
                        remotes.remove(&id);
                    }
                }
            }
        }
    }

    pub fn has_action(&self, id: ActionId) -> bool {
        self.locals.read().unwrap().contains_key(&id) || self.remotes.read().unwrap().contains_key(&id)
    }

    /// flb host selection (spec §4.5): candidates addressed as `host:flb-port` *instead of*
    /// their natural `host:port` (`service/action/manager.go::getFlbServers`), so two servers
    /// sharing an flb port collapse to one bucket before the lexicographic sort; `index = fd mod
    /// N` (random when `fd <= 0`), with a per-connection override key `flb-<action-id>`.
    fn select_remote_host(&self, id: ActionId, fd: u64, flb_override: Option<u32>) -> Option<String> {
        let remotes = self.remotes.read().unwrap();
        let hosts = remotes.get(&id)?;
        if hosts.is_empty() {
            return None;
        }

        let mut by_key: HashMap<String, String> = HashMap::new();
        for (host, entry) in hosts.iter() {
            let key = format!("{}:{}", host_without_port(host), entry.flb);
            by_key.insert(key, host.clone());
        }

        let mut keyed: Vec<(String, String)> = by_key.into_iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(flb) = flb_override {
            if let Some((_, host)) = keyed.iter().find(|(key, _)| key.ends_with(&format!(":{}", flb))) {
                return Some(host.clone());
            }
        }

        let index = if fd == 0 {
            use rand::Rng;
            rand::thread_rng().gen_range(0..keyed.len())
        } else {
            (fd as usize) % keyed.len()
        };
        keyed.get(index).map(|(_, host)| host.clone())
    }

    /// The main per-envelope dispatch entrypoint (spec §4.5 steps 1-4).
    pub async fn dispatch(
        &self,
        ctx: Arc<ConnContext>,
        action_id: ActionId,
        data: Vec<u8>,
        format: &str,
    ) -> Result<Option<(ActionId, Vec<u8>)>, GatewayError> {
        if !self.has_action(action_id) {
            return Err(GatewayError::NoActionHandler);
        }

        let local = self.locals.read().unwrap().get(&action_id).cloned();
        if let Some(handler) = local {
            return match handler.call(ctx, data).await? {
                HandlerOutcome::Reply(action, bytes) => Ok(Some((action, bytes))),
                HandlerOutcome::NoReply => Ok(None),
            };
        }

        let flb_override = ctx.optional.lock().unwrap().flb_overrides.get(&action_id).copied();
        let host = self
            .select_remote_host(action_id, ctx.fd, flb_override)
            .ok_or(GatewayError::NoActionHandler)?;

        let bind_ids: Vec<String> = ctx
            .bound_ids()
            .into_iter()
            .map(|(t, v)| t.key(&v))
            .collect();
        let user_id = ctx.user.lock().unwrap().as_ref().map(|u| u.id);
        let target = ctx.id(&crate::conn::IdType::Target);

        let response = self
            .remote_caller
            .handle(
                host,
                HandleRequest {
                    action_id,
                    package: data,
                    gateway: self.gateway_name.clone(),
                    fd: ctx.fd,
                    bind_ids,
                    format: format.to_string(),
                    user_id,
                    target,
                },
            )
            .await?;

        if response.action_id > 0 {
            Ok(Some((response.action_id, response.package)))
        } else {
            Ok(None)
        }
    }

    /// Calls the authenticate action registered for `auth_type` (local wins over remote, same
    /// as normal dispatch) and returns `(key-or-NO_CERT, Authentication)` on success.
    pub async fn authenticate(
        &self,
        ctx: Arc<ConnContext>,
        fd: u64,
        auth_type: &str,
        id: &str,
        secret: &str,
    ) -> Result<AuthenticateResponse, GatewayError> {
        let action_id = *self
            .authenticate_actions
            .read()
            .unwrap()
            .get(auth_type)
            .ok_or(GatewayError::NoActionHandler)?;

        if let Some(handler) = self.locals.read().unwrap().get(&action_id).cloned() {
            let req = AuthenticateRequest {
                gateway: self.gateway_name.clone(),
                fd,
                r#type: auth_type.to_string(),
                id: id.to_string(),
                secret: secret.to_string(),
            };
            let encoded = req.encode_to_vec();
            return match handler.call(ctx, encoded).await? {
                HandlerOutcome::Reply(_, bytes) => {
                    AuthenticateResponse::decode(bytes.as_slice()).map_err(|_| GatewayError::InternalErr)
                }
                HandlerOutcome::NoReply => Err(GatewayError::NoAuth),
            };
        }

        let host = self
            .select_remote_host(action_id, fd, None)
            .ok_or(GatewayError::NoActionHandler)?;
        self.remote_caller
            .authenticate(
                host,
                AuthenticateRequest {
                    gateway: self.gateway_name.clone(),
                    fd,
                    r#type: auth_type.to_string(),
                    id: id.to_string(),
                    secret: secret.to_string(),
                },
            )
            .await
    }

    /// The raw-protocol round trip (spec §4.5 "Raw protocol path"): wraps the payload, calls
    /// `raw:<protocol>`, re-enters `dispatch` for a non-zero response action, then re-wraps the
    /// second-round response back through the raw handler to produce wire bytes.
    pub async fn raw(
        &self,
        ctx: Arc<ConnContext>,
        protocol: &str,
        action_id: ActionId,
        data: Vec<u8>,
        format: &str,
    ) -> Result<RawResponse, GatewayError> {
        let raw_action = *self
            .raw_actions
            .read()
            .unwrap()
            .get(protocol)
            .ok_or(GatewayError::NoActionHandler)?;

        let response = self.call_raw_handler(raw_action, ctx.clone(), action_id, data).await?;

        if response.data.is_empty() {
            return Ok(response);
        }

        // A non-zero action id embedded by the raw handler triggers a second dispatch round.
        if let Some((second_action, second_data)) = self.dispatch(ctx.clone(), action_id, response.data.clone(), format).await? {
            let wrapped = self.call_raw_handler(raw_action, ctx, second_action, second_data).await?;
            return Ok(wrapped);
        }

        Ok(response)
    }

    async fn call_raw_handler(
        &self,
        raw_action: ActionId,
        ctx: Arc<ConnContext>,
        action_id: ActionId,
        data: Vec<u8>,
    ) -> Result<RawResponse, GatewayError> {
        let req = RawRequest { action_id, data };
        if let Some(handler) = self.locals.read().unwrap().get(&raw_action).cloned() {
            let encoded = req.encode_to_vec();
            return match handler.call(ctx, encoded).await? {
                HandlerOutcome::Reply(_, bytes) => {
                    RawResponse::decode(bytes.as_slice()).map_err(|_| GatewayError::InternalErr)
                }
                HandlerOutcome::NoReply => Ok(RawResponse {
                    data: Vec::new(),
                    sub_actions: Vec::new(),
                }),
            };
        }
        let host = self
            .select_remote_host(raw_action, ctx.fd, None)
            .ok_or(GatewayError::NoActionHandler)?;
        self.remote_caller.raw(host, req).await
    }

    /// Every remote host that advertises the close action, called in parallel, best-effort,
    /// waiting for all before returning (spec §4.5 "Close dispatch", testable property #8).
    pub async fn dispatch_close(&self, ctx: Arc<ConnContext>) {
        let close_action = match *self.close_action.read().unwrap() {
            Some(id) => id,
            None => return,
        };

        if let Some(handler) = self.locals.read().unwrap().get(&close_action).cloned() {
            let _ = handler.call(ctx.clone(), Vec::new()).await;
        }

        let hosts: Vec<String> = self
            .remotes
            .read()
            .unwrap()
            .get(&close_action)
            .map(|hosts| hosts.keys().cloned().collect())
            .unwrap_or_default();

        let bind_ids: Vec<String> = ctx.bound_ids().into_iter().map(|(t, v)| t.key(&v)).collect();
        let futures: Vec<_> = hosts
            .into_iter()
            .map(|host| {
                let bind_ids = bind_ids.clone();
                let gateway = self.gateway_name.clone();
                let fd = ctx.fd;
                let caller = self.remote_caller.clone();
                async move {
                    let _ = caller
                        .handle(
                            host,
                            HandleRequest {
                                action_id: close_action,
                                package: Vec::new(),
                                gateway,
                                fd,
                                bind_ids,
                                format: "proto".to_string(),
                                user_id: None,
                                target: None,
                            },
                        )
                        .await;
                }
            })
            .collect();

        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnContext;

    struct NoopCaller;
    impl RemoteCaller for NoopCaller {
        fn handle(&self, _host: String, _req: HandleRequest) -> BoxFuture<'static, Result<HandleResponse, GatewayError>> {
            Box::pin(async { Err(GatewayError::NoActionHandler) })
        }
        fn authenticate(
            &self,
            _host: String,
            _req: AuthenticateRequest,
        ) -> BoxFuture<'static, Result<AuthenticateResponse, GatewayError>> {
            Box::pin(async { Err(GatewayError::NoActionHandler) })
        }
        fn raw(&self, _host: String, _req: RawRequest) -> BoxFuture<'static, Result<RawResponse, GatewayError>> {
            Box::pin(async { Err(GatewayError::NoActionHandler) })
        }
    }

    fn manager() -> Manager {
        Manager::new("gw-1".to_string(), Arc::new(NoopCaller))
    }

    #[test]
    fn flb_routing_is_deterministic_on_fd() {
        let mgr = manager();
        mgr.register_remote_action("h1:7001", 100, "orders", 7001);
        mgr.register_remote_action("h2:7001", 100, "orders", 7002);
        mgr.register_remote_action("h3:7001", 100, "orders", 7003);

        // sorted flb keys: "h1:7001", "h2:7002", "h3:7003" -> index 5 % 3 = 2
        let host = mgr.select_remote_host(100, 5, None).unwrap();
        assert_eq!(host, "h3:7001");
    }

    #[test]
    fn flb_override_wins_over_fd_routing() {
        let mgr = manager();
        mgr.register_remote_action("h1:7001", 100, "orders", 7001);
        mgr.register_remote_action("h2:7001", 100, "orders", 7002);
        mgr.register_remote_action("h3:7001", 100, "orders", 7003);

        let host = mgr.select_remote_host(100, 5, Some(7001)).unwrap();
        assert_eq!(host, "h1:7001");
    }

    #[test]
    fn flb_key_ignores_natural_port_so_shared_flb_collapses() {
        let mgr = manager();
        // Same bare host, different natural ports, same flb -> one bucket (spec §4 "flb key
        // construction"), unlike the natural `host:port` which would keep them distinct.
        mgr.register_remote_action("10.0.0.1:9001", 200, "orders", 500);
        mgr.register_remote_action("10.0.0.1:9002", 200, "orders", 500);

        let host = mgr.select_remote_host(200, 0, None).unwrap();
        assert!(host == "10.0.0.1:9001" || host == "10.0.0.1:9002");

        // Only one flb bucket exists for action 200, so fd-based routing never has two
        // candidates to pick between.
        let hosts_for_action: std::collections::HashSet<_> =
            (0..10u64).map(|fd| mgr.select_remote_host(200, fd, None).unwrap()).collect();
        assert_eq!(hosts_for_action.len(), 1);
    }

    #[test]
    fn unregister_purges_all_actions_for_host() {
        let mgr = manager();
        mgr.register_remote_action("h1:7001", 100, "orders", 7001);
        mgr.register_remote_action("h1:7001", 101, "items", 7001);
        mgr.unregister_remote_action("h1:7001");

        assert!(!mgr.has_action(100));
        assert!(!mgr.has_action(101));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_action() {
        let mgr = manager();
        let ctx = Arc::new(ConnContext::new(1, None, None));
        let result = mgr.dispatch(ctx, 999, Vec::new(), "proto").await;
        assert!(matches!(result, Err(GatewayError::NoActionHandler)));
    }
}

//! The handshake/auth state machine and the per-connection dispatch pipeline (spec §4.3, §4.4,
//! §4.5, §7). Grounded on `original_source/service/eventhandler/event.go` (the canonical
//! dispatch pipeline: `initCodec`/`codecDecode`/`actionDecode`/`authCheck`/`decrypt`/dispatch/
//! `gatewayErrorResponse`) and the teacher's `neutronium::net::channel::Channel` for the
//! `ChannelState`-shaped handshake state machine this reuses as `ConnState`.

use crate::action::{Manager as ActionManager, ACTION_AUTH_REQ, ACTION_AUTH_RESP, ACTION_PING, ACTION_PONG, NO_CERT};
use crate::codec::Codec;
use crate::conn::{AuthUser, ConnContext, ConnState};
use crate::error::GatewayError;
use crate::group::Groups;
use crate::limiter::TimeLimiter;
use crate::registry::ConnRegistry;
use base64::{engine::general_purpose::STANDARD, Engine};
use flux::contract::{Authentication, HandshakeSecret};
use futures::future::BoxFuture;
use rsa::RsaPrivateKey;
use serde_derive::Deserialize;
use slog::{debug, info, o};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
struct AuthReqBody {
    token: String,
}

/// Bounded timestamp skew for the RSA-sealed handshake secret (spec §4.4, default ±60s).
const DEFAULT_TIMESTAMP_SKEW_SECS: u64 = 60;

/// Per-connection socket write/close, implemented by each transport engine.
pub trait ConnIo: Send + Sync {
    fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>>;
    fn close(&self, reason: &str) -> BoxFuture<'static, Result<(), GatewayError>>;
    /// `true` for message-boundary transports (WSS) where framing is always 1:1 with a read.
    fn is_message_oriented(&self) -> bool {
        false
    }
}

pub struct GatewayEvent {
    pub registry: Arc<ConnRegistry>,
    pub groups: Arc<Groups>,
    pub actions: Arc<ActionManager>,
    pub handshake_limiter: Arc<TimeLimiter>,
    pub rsa_private_key: Option<Arc<RsaPrivateKey>>,
    pub log: slog::Logger,
    pub heartbeat_interval: Duration,
    pub auth_ttl: Duration,
    pub timestamp_skew_secs: u64,
}

impl GatewayEvent {
    pub fn new(
        registry: Arc<ConnRegistry>,
        groups: Arc<Groups>,
        actions: Arc<ActionManager>,
        handshake_limiter: Arc<TimeLimiter>,
        rsa_private_key: Option<Arc<RsaPrivateKey>>,
        log: &slog::Logger,
    ) -> Self {
        GatewayEvent {
            registry,
            groups,
            actions,
            handshake_limiter,
            rsa_private_key,
            log: log.new(o!("component" => "event")),
            heartbeat_interval: Duration::from_secs(30),
            auth_ttl: Duration::from_secs(30),
            timestamp_skew_secs: DEFAULT_TIMESTAMP_SKEW_SECS,
        }
    }

    pub fn on_open(&self, ctx: Arc<ConnContext>) {
        self.registry.add_conn(ctx.clone());
        debug!(self.log, "connection opened"; "fd" => ctx.fd);
    }

    pub async fn on_close(&self, ctx: Arc<ConnContext>) {
        self.actions.dispatch_close(ctx.clone()).await;
        self.registry.del_conn(ctx.fd, &self.groups);
        info!(self.log, "connection closed"; "fd" => ctx.fd);
    }

    /// One `OnTraffic` delivery: strips a leading proxy-protocol preamble when still `FRESH`,
    /// runs the handshake on the first packet, then frames/decrypts/dispatches/re-encrypts for
    /// every complete frame found in `bytes` (spec §4.1, multiple frames processed in order).
    pub async fn on_traffic(&self, ctx: Arc<ConnContext>, io: &dyn ConnIo, bytes: &[u8]) {
        ctx.touch();

        let bytes = match &*ctx.state.lock().unwrap() {
            ConnState::Fresh => strip_proxy_protocol(bytes),
            _ => bytes.to_vec(),
        };

        let is_fresh = matches!(&*ctx.state.lock().unwrap(), ConnState::Fresh);
        if is_fresh {
            self.handle_handshake(&ctx, io, &bytes).await;
            return;
        }

        let codec_ready = ctx.codec.lock().unwrap().is_some();
        if !codec_ready {
            if bytes.is_empty() {
                return;
            }
            let codec = Codec::select(bytes[0], io.is_message_oriented());
            *ctx.codec.lock().unwrap() = Some(codec);
            self.process_frames(&ctx, io, &bytes[1..]).await;
            return;
        }

        self.process_frames(&ctx, io, &bytes).await;
    }

    async fn process_frames(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, bytes: &[u8]) {
        let frames = {
            let mut codec_guard = ctx.codec.lock().unwrap();
            let codec = codec_guard.as_mut().expect("codec selected before process_frames");
            let mut leftover = ctx.leftover.lock().unwrap();
            let mut frames = Vec::new();
            let remainder = codec.framer.unmarshal(std::mem::take(&mut *leftover), bytes, &mut |f| frames.push(f));
            *leftover = remainder;
            frames
        };

        for frame in frames {
            self.handle_frame(ctx, io, frame).await;
        }
    }

    async fn handle_frame(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, frame: Vec<u8>) {
        let plain = match self.decrypt_if_needed(ctx, &frame) {
            Ok(p) => p,
            Err(_) => {
                self.reply_error(ctx, io, GatewayError::DecryptErr, 0).await;
                return;
            }
        };

        let (action_id, data) = {
            let codec_guard = ctx.codec.lock().unwrap();
            let codec = codec_guard.as_ref().expect("codec selected");
            match codec.package.decode(&plain) {
                Ok(pair) => pair,
                Err(_) => {
                    drop(codec_guard);
                    self.reply_error(ctx, io, GatewayError::PackageErr, 0).await;
                    return;
                }
            }
        };

        if action_id == ACTION_PING {
            self.reply(ctx, io, ACTION_PONG, &encode_pong()).await;
            return;
        }

        if action_id == ACTION_AUTH_REQ {
            self.handle_auth_req(ctx, io, &data).await;
            return;
        }

        if !ctx.is_authed() {
            self.reply_error(ctx, io, GatewayError::NoAuth, action_id).await;
            return;
        }

        let auth = ctx.auth.lock().unwrap().clone();
        let result = if let Some(auth) = auth.filter(|a| a.is_raw()) {
            self.actions
                .raw(ctx.clone(), auth.protocol.as_deref().unwrap_or(""), action_id, data, "proto")
                .await
                .map(|r| {
                    if r.data.is_empty() {
                        None
                    } else {
                        Some((action_id, r.data))
                    }
                })
        } else {
            self.actions.dispatch(ctx.clone(), action_id, data, "proto").await
        };

        match result {
            Ok(Some((resp_action, resp_data))) => self.reply(ctx, io, resp_action, &resp_data).await,
            Ok(None) => {}
            Err(err) => self.reply_error(ctx, io, err, action_id).await,
        }
    }

    async fn handle_auth_req(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, data: &[u8]) {
        let token = match serde_json::from_slice::<AuthReqBody>(data) {
            Ok(body) => body.token,
            Err(_) => String::from_utf8_lossy(data).to_string(),
        };

        match self.actions.authenticate(ctx.clone(), ctx.fd, "user", &token, "").await {
            Ok(resp) if resp.ok => {
                let user_id = resp.auth.as_ref().and_then(|a| a.user_id).unwrap_or(0);
                *ctx.user.lock().unwrap() = Some(AuthUser {
                    id: user_id,
                    name: String::new(),
                    attributes: Default::default(),
                });
                self.registry.bind_id(ctx, crate::conn::IdType::Uid, user_id.to_string());
                *ctx.state.lock().unwrap() = ConnState::Authed;
                self.reply(ctx, io, ACTION_AUTH_RESP, &encode_auth_resp(true, user_id)).await;
            }
            _ => self.reply(ctx, io, ACTION_AUTH_RESP, &encode_auth_resp(false, 0)).await,
        }
    }

    /// FRESH -> KEY-EXCHANGED: parses `type@id@format::secret`, RSA-opens the handshake
    /// secret, calls the authenticate action, and writes the 3-byte status reply (spec §4.4).
    async fn handle_handshake(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let header_end = match text.find("::") {
            Some(idx) => idx,
            None => {
                let _ = io.close("malformed handshake").await;
                return;
            }
        };
        let header = &text[..header_end];
        let secret_b64 = &text[header_end + 2..];

        let mut header_parts = header.splitn(3, '@');
        let (kind, id, _format) = match (header_parts.next(), header_parts.next(), header_parts.next()) {
            (Some(k), Some(i), Some(f)) => (k.to_string(), i.to_string(), f.to_string()),
            _ => {
                let _ = io.close("malformed handshake").await;
                return;
            }
        };

        if !self.handshake_limiter.access(&id) {
            let _ = io.write(b"222".to_vec()).await;
            let _ = io.close("handshake rate limited").await;
            return;
        }

        let rsa_key = match self.decode_handshake_secret(secret_b64) {
            Ok(key) => key,
            Err(reject) => {
                if reject {
                    self.handshake_limiter.hit(&id);
                    let _ = io.write(b"222".to_vec()).await;
                    let _ = io.close("handshake secret invalid").await;
                    return;
                }
                None
            }
        };

        let auth_secret = rsa_key.map(|k| STANDARD.encode(k)).unwrap_or_default();
        let auth_response = self.actions.authenticate(ctx.clone(), ctx.fd, &kind, &id, &auth_secret).await;

        let (authentication, effective_key) = match auth_response {
            Ok(resp) if resp.ok => {
                let key = if resp.key == NO_CERT {
                    None
                } else if !resp.key.is_empty() {
                    STANDARD.decode(&resp.key).ok().and_then(|v| v.try_into().ok())
                } else {
                    None
                };
                let auth = resp.auth.map(|a| Authentication {
                    kind: a.kind,
                    id: a.id,
                    iid: a.iid,
                    sn: a.sn,
                    company_id: a.company_id,
                    user_id: a.user_id,
                    protocol: a.protocol,
                });
                (auth, key)
            }
            _ => {
                self.handshake_limiter.hit(&id);
                let _ = io.write(b"222".to_vec()).await;
                let _ = io.close("authenticate rejected").await;
                return;
            }
        };

        self.handshake_limiter.release(&id);

        // The authenticate action supplying an `Authentication` record means the target/device
        // identity is already established (spec §4.4); a user identity supplied this way needs
        // no further `AuthReq` round trip, so the connection is AUTHED immediately. Only when
        // no `Authentication` comes back (a bare user handshake) does the client still have to
        // send `AuthReq` to reach AUTHED (handled in `handle_auth_req`).
        let authed = authentication.is_some();
        if let Some(auth) = authentication {
            self.registry.bind_id(ctx, crate::conn::IdType::Target, auth.id.clone());
            if let Some(sn) = &auth.sn {
                self.registry.bind_id(ctx, crate::conn::IdType::Sn, sn.clone());
            }
            *ctx.auth.lock().unwrap() = Some(auth);
        }

        let status: &[u8] = match &effective_key {
            Some(key) => {
                ctx.optional.lock().unwrap().aes_key = Some(*key);
                b"111"
            }
            None => b"000",
        };
        let _ = io.write(status.to_vec()).await;
        *ctx.state.lock().unwrap() = if authed {
            ConnState::Authed
        } else {
            ConnState::KeyExchanged(std::time::Instant::now())
        };

        info!(self.log, "handshake complete"; "fd" => ctx.fd, "id" => id.as_str(), "crypto" => effective_key.is_some());
    }

    /// Returns `Ok(Some(aes_key))` for a valid sealed secret, `Ok(None)` for an empty (security
    /// off) secret, or `Err(should_reject)` when parsing/decryption/skew validation fails.
    fn decode_handshake_secret(&self, secret_b64: &str) -> Result<Option<[u8; 32]>, bool> {
        if secret_b64.is_empty() {
            return Ok(None);
        }
        let rsa_key = self.rsa_private_key.as_ref().ok_or(true)?;
        let sealed = STANDARD.decode(secret_b64.trim()).map_err(|_| true)?;
        let opened = flux::crypto::rsa_open(rsa_key, &sealed).map_err(|_| true)?;
        let secret = HandshakeSecret::read(&opened[..]).map_err(|_| true)?;

        let now = flux::time::timestamp_secs();
        let skew = now.abs_diff(secret.timestamp);
        if skew > self.timestamp_skew_secs {
            return Err(true);
        }
        Ok(Some(secret.aes_key))
    }

    fn decrypt_if_needed(&self, ctx: &ConnContext, frame: &[u8]) -> Result<Vec<u8>, GatewayError> {
        match ctx.optional.lock().unwrap().aes_key {
            Some(key) => flux::crypto::aes_decrypt(&key, frame).ok_or(GatewayError::DecryptErr),
            None => Ok(frame.to_vec()),
        }
    }

    fn encrypt_if_needed(&self, ctx: &ConnContext, plain: &[u8]) -> Vec<u8> {
        match ctx.optional.lock().unwrap().aes_key {
            Some(key) => flux::crypto::aes_encrypt(&key, plain),
            None => plain.to_vec(),
        }
    }

    /// Encodes `data` under `action` through `ctx`'s selected codec (encrypting if a symmetric
    /// key was exchanged) and writes the framed bytes out — the same pipeline `reply` uses for
    /// dispatch responses, exposed for control-plane sends (`Group::BroadcastGroup`,
    /// `Message::SendMessage`, spec §4.8) that originate outside the read loop. Silently
    /// no-ops if the connection has no codec selected yet (pre-handshake).
    pub async fn send(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, action: u32, data: &[u8]) {
        self.reply(ctx, io, action, data).await;
    }

    async fn reply(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, action: u32, data: &[u8]) {
        let framed = {
            let codec_guard = ctx.codec.lock().unwrap();
            let codec = match codec_guard.as_ref() {
                Some(c) => c,
                None => return,
            };
            let envelope = codec.package.encode(action, data);
            let sealed = self.encrypt_if_needed(ctx, &envelope);
            codec.framer.marshal(&sealed)
        };
        let _ = io.write(framed).await;
    }

    async fn reply_error(&self, ctx: &Arc<ConnContext>, io: &dyn ConnIo, status: GatewayError, trigger_action: u32) {
        self.reply(ctx, io, 0, &encode_gateway_error(status, trigger_action)).await;
    }

    /// Heartbeat / auth-ttl ticker (spec §5): closes connections idle beyond their effective
    /// heartbeat interval, or unauthenticated beyond `auth_ttl`.
    pub async fn on_tick(&self, conns: Vec<(Arc<ConnContext>, Arc<dyn ConnIo>)>) {
        for (ctx, io) in conns {
            let interval = ctx
                .optional
                .lock()
                .unwrap()
                .heartbeat_interval
                .unwrap_or(self.heartbeat_interval);

            if ctx.last_active_elapsed_secs() > interval.as_secs() {
                ctx.optional.lock().unwrap().close_reason = Some("close by heartbeat checker".to_string());
                let _ = io.close("close by heartbeat checker").await;
                continue;
            }

            let unauthed_too_long = matches!(&*ctx.state.lock().unwrap(), ConnState::KeyExchanged(since) if since.elapsed() > self.auth_ttl);
            if unauthed_too_long {
                let _ = io.close("close by auth ttl").await;
            }
        }
    }
}

fn encode_pong() -> Vec<u8> {
    use gateway_proto::v1::Pong;
    use prost::Message;
    Pong {
        sent_at: flux::time::timestamp_secs(),
    }
    .encode_to_vec()
}

fn encode_auth_resp(ok: bool, user_id: u64) -> Vec<u8> {
    use gateway_proto::v1::AuthResp;
    use prost::Message;
    AuthResp {
        ok,
        user_id,
        user_name: String::new(),
    }
    .encode_to_vec()
}

fn encode_gateway_error(status: GatewayError, trigger_action: u32) -> Vec<u8> {
    use gateway_proto::v1::gateway_error::Status;
    use gateway_proto::v1::GatewayError as WireGatewayError;
    use prost::Message;

    let status = match status {
        GatewayError::PackageErr => Status::PackageErr,
        GatewayError::DecryptErr => Status::DecryptErr,
        GatewayError::ActionErr => Status::ActionErr,
        GatewayError::NoActionHandler => Status::NoActionHandler,
        GatewayError::NoAuth => Status::NoAuth,
        GatewayError::InternalErr => Status::InternalErr,
    };

    WireGatewayError {
        status: status as i32,
        trigger_action,
    }
    .encode_to_vec()
}

/// Strips a PPv1 (`PROXY ...\r\n`) or PPv2 (12-byte magic + descriptor + length + payload)
/// proxy-protocol preamble if present (spec §4.4, §6). Conservative per the Open Question
/// decision in DESIGN.md: a preamble split across reads is not buffered, only the first read
/// is inspected.
fn strip_proxy_protocol(bytes: &[u8]) -> Vec<u8> {
    const PP2_MAGIC: [u8; 12] = [0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a];

    if bytes.starts_with(b"PROXY ") {
        if let Some(pos) = bytes.windows(2).position(|w| w == b"\r\n") {
            return bytes[pos + 2..].to_vec();
        }
        return bytes.to_vec();
    }

    if bytes.starts_with(&PP2_MAGIC) && bytes.len() >= 16 {
        let length = u16::from_be_bytes([bytes[14], bytes[15]]) as usize;
        let total = 16 + length;
        if bytes.len() >= total {
            return bytes[total..].to_vec();
        }
    }

    bytes.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{HandlerOutcome, LocalHandler};
    use gateway_proto::v1::{
        AuthenticateRequest, AuthenticateResponse, Authentication as WireAuthentication, HandleRequest, HandleResponse,
        RawRequest, RawResponse,
    };
    use prost::Message;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn strips_ppv1_preamble() {
        let mut packet = b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\n".to_vec();
        packet.extend_from_slice(b"rest of the payload");
        let stripped = strip_proxy_protocol(&packet);
        assert_eq!(stripped, b"rest of the payload".to_vec());
    }

    #[test]
    fn leaves_non_proxy_bytes_untouched() {
        let packet = b"plain payload".to_vec();
        assert_eq!(strip_proxy_protocol(&packet), packet);
    }

    struct NoopCaller;
    impl crate::action::RemoteCaller for NoopCaller {
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

    /// A local authenticate handler standing in for a device auth backend: always succeeds and
    /// supplies a complete `Authentication` (no user `AuthReq` follow-up needed).
    struct DeviceAuthHandler;
    impl LocalHandler for DeviceAuthHandler {
        fn call(&self, _ctx: Arc<ConnContext>, _data: Vec<u8>) -> BoxFuture<'static, Result<HandlerOutcome, GatewayError>> {
            Box::pin(async {
                let resp = AuthenticateResponse {
                    ok: true,
                    key: NO_CERT.to_string(),
                    auth: Some(WireAuthentication {
                        kind: "device".to_string(),
                        id: "dev-7".to_string(),
                        iid: None,
                        sn: Some("SN-7".to_string()),
                        company_id: None,
                        user_id: None,
                        protocol: None,
                    }),
                };
                Ok(HandlerOutcome::Reply(0, resp.encode_to_vec()))
            })
        }
    }

    #[derive(Default)]
    struct FakeIo {
        written: Arc<StdMutex<Vec<Vec<u8>>>>,
        closed: Arc<StdMutex<bool>>,
    }

    impl ConnIo for FakeIo {
        fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
            let written = self.written.clone();
            Box::pin(async move {
                written.lock().unwrap().push(bytes);
                Ok(())
            })
        }

        fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
            let closed = self.closed.clone();
            Box::pin(async move {
                *closed.lock().unwrap() = true;
                Ok(())
            })
        }
    }

    fn test_event() -> GatewayEvent {
        let actions = ActionManager::new("gw-test".to_string(), Arc::new(NoopCaller));
        actions.register_handler_action(900, Arc::new(DeviceAuthHandler));
        actions.register_remote_action("authenticator-1", 900, "authenticate:device", 0);

        let log = slog::Logger::root(slog::Discard, slog::o!());
        GatewayEvent::new(
            Arc::new(ConnRegistry::new()),
            Arc::new(Groups::new()),
            Arc::new(actions),
            Arc::new(TimeLimiter::new(Duration::from_secs(1))),
            None,
            &log,
        )
    }

    /// A successful device handshake supplies the identity up front (spec §4.4) and must reach
    /// AUTHED directly, not stay stuck in KEY-EXCHANGED waiting on an `AuthReq` that will never
    /// come over this transport.
    #[tokio::test]
    async fn successful_device_handshake_reaches_authed() {
        let event = test_event();
        let ctx = Arc::new(ConnContext::new(1, None, None));
        let io = FakeIo::default();

        event.handle_handshake(&ctx, &io, b"device@dev-7@proto::").await;

        assert!(matches!(&*ctx.state.lock().unwrap(), ConnState::Authed));
        assert_eq!(ctx.id(&crate::conn::IdType::Target), Some("dev-7".to_string()));
        assert_eq!(ctx.id(&crate::conn::IdType::Sn), Some("SN-7".to_string()));
        assert_eq!(io.written.lock().unwrap().as_slice(), &[b"000".to_vec()]);
        assert!(!*io.closed.lock().unwrap());
    }

    /// An expired handshake secret must reject with `222` and close, never falling through to
    /// authenticate/bind/state-transition on the now-dead connection.
    #[tokio::test]
    async fn expired_handshake_secret_rejects_and_stops() {
        let event = test_event();
        let ctx = Arc::new(ConnContext::new(1, None, None));
        let io = FakeIo::default();

        // No RSA private key configured, so any non-empty secret is undecodable and rejected.
        event.handle_handshake(&ctx, &io, b"device@dev-7@proto::not-valid-base64!!").await;

        assert!(matches!(&*ctx.state.lock().unwrap(), ConnState::Fresh));
        assert!(ctx.id(&crate::conn::IdType::Target).is_none());
        assert_eq!(io.written.lock().unwrap().as_slice(), &[b"222".to_vec()]);
        assert!(*io.closed.lock().unwrap());
    }
}

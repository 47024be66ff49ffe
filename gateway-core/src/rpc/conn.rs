//! `Conn` service: per-connection introspection and target session lookup (spec §4.8).
//!
//! Grounded on `original_source/service/proto/impl/conn.go`.

use crate::config::SocketType;
use crate::conn::IdType;
use crate::server::Gateway;
use gateway_proto::v1::conn_server::Conn;
use gateway_proto::v1::{InfoRequest, InfoResponse, SessionIdRequest, SessionIdResponse};
use std::sync::Arc;
use tonic::{Request, Response, Status};

fn socket_type_name(ty: SocketType) -> &'static str {
    match ty {
        SocketType::Tcp => "tcp",
        SocketType::Udp => "udp",
        SocketType::Wss => "wss",
        SocketType::HttpLongPoll => "http_long_poll",
        SocketType::Mqtt => "mqtt",
    }
}

pub struct ConnService {
    gateway: Arc<Gateway>,
}

impl ConnService {
    pub fn new(gateway: Arc<Gateway>) -> ConnService {
        ConnService { gateway }
    }
}

#[tonic::async_trait]
impl Conn for ConnService {
    async fn info(&self, request: Request<InfoRequest>) -> Result<Response<InfoResponse>, Status> {
        let req = request.into_inner();
        let ctx = match self.gateway.registry.get_fd_conn(req.fd) {
            Some(ctx) => ctx,
            None => {
                return Ok(Response::new(InfoResponse {
                    found: false,
                    ..Default::default()
                }))
            }
        };

        let user_id = ctx.user.lock().unwrap().as_ref().map(|u| u.id).unwrap_or(0);
        Ok(Response::new(InfoResponse {
            found: true,
            local_addr: ctx.local_addr.map(|a| a.to_string()).unwrap_or_default(),
            remote_addr: ctx.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            connected_at: ctx.connected_at,
            socket_type: socket_type_name(self.gateway.config.socket_type).to_string(),
            user_id,
            target: ctx.id(&IdType::Target).unwrap_or_default(),
        }))
    }

    async fn session_id(&self, request: Request<SessionIdRequest>) -> Result<Response<SessionIdResponse>, Status> {
        let req = request.into_inner();
        let session_id = self.gateway.sessions.get_active(&req.target);
        let found = session_id.is_some();
        Ok(Response::new(SessionIdResponse {
            session_id: session_id.unwrap_or_default(),
            found,
        }))
    }
}

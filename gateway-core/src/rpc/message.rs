//! `Message` service: direct send by fd or bound id, with proxy-target fallback (spec §4.8).
//!
//! Grounded on `original_source/service/proto/impl/message.go`.

use super::pick_payload;
use crate::conn::IdType;
use crate::server::Gateway;
use gateway_proto::v1::message_server::Message;
use gateway_proto::v1::send_message_request::Target;
use gateway_proto::v1::{SendMessageRequest, SendMessageResponse};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct MessageService {
    gateway: Arc<Gateway>,
}

impl MessageService {
    pub fn new(gateway: Arc<Gateway>) -> MessageService {
        MessageService { gateway }
    }
}

fn parse_id_type(raw: &str) -> IdType {
    match raw {
        "UID" => IdType::Uid,
        "TARGET" => IdType::Target,
        "SN" => IdType::Sn,
        other => IdType::Custom(other.to_string()),
    }
}

#[tonic::async_trait]
impl Message for MessageService {
    async fn send_message(&self, request: Request<SendMessageRequest>) -> Result<Response<SendMessageResponse>, Status> {
        let req = request.into_inner();
        if req.action == 0 {
            return Err(Status::invalid_argument("action is required"));
        }

        let fd = match req.target {
            Some(Target::Fd(fd)) if fd > 0 => Some(fd),
            Some(Target::Id(id_target)) => {
                let id_type = parse_id_type(&id_target.id_type);
                let direct = self.gateway.registry.get_id_conn(&id_type, &id_target.id_value);
                direct
                    .first()
                    .map(|ctx| ctx.fd)
                    // Falls back to a proxy target bound for this id when no live connection
                    // owns it directly (spec §4.8 "Message ... with proxy-target fallback").
                    .or_else(|| self.gateway.registry.proxy_fds_for(&id_target.id_value).first().copied())
            }
            _ => None,
        };

        let fd = match fd {
            Some(fd) => fd,
            None => return Err(Status::not_found("connection not found or not supported")),
        };

        let ctx = match self.gateway.registry.get_fd_conn(fd) {
            Some(ctx) => ctx,
            None => return Err(Status::not_found("connection not found or not supported")),
        };
        let io = match self.gateway.find_io(fd) {
            Some(io) => io,
            None => return Err(Status::not_found("connection not found or not supported")),
        };

        let payload = match pick_payload(&ctx, &req.pb_bytes, &req.json_bytes) {
            Some(p) => p.to_vec(),
            None => return Err(Status::failed_precondition("connection has no codec selected yet")),
        };

        self.gateway.event.send(&ctx, io.as_ref(), req.action, &payload).await;
        Ok(Response::new(SendMessageResponse { delivered: true }))
    }
}

//! `Bind` service: id<->fd bindings, proxy-target bindings, target-scoped disconnect (spec §4.8).
//!
//! Grounded on `original_source/service/proto/impl/bind.go`.

use crate::conn::IdType;
use crate::server::Gateway;
use gateway_proto::v1::bind_server::Bind;
use gateway_proto::v1::{
    BindExistRequest, BindExistResponse, BindIdRequest, BindIdResponse, BindProxyTargetRequest, BindProxyTargetResponse,
    DisconnectTargetRequest, DisconnectTargetResponse, TargetBindIdRequest, TargetBindIdResponse, UnBindIdRequest,
    UnBindIdResponse, UnbindProxyTargetRequest, UnbindProxyTargetResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

fn parse_id_type(raw: &str) -> IdType {
    match raw {
        "UID" => IdType::Uid,
        "TARGET" => IdType::Target,
        "SN" => IdType::Sn,
        other => IdType::Custom(other.to_string()),
    }
}

pub struct BindService {
    gateway: Arc<Gateway>,
}

impl BindService {
    pub fn new(gateway: Arc<Gateway>) -> BindService {
        BindService { gateway }
    }
}

#[tonic::async_trait]
impl Bind for BindService {
    async fn bind_id(&self, request: Request<BindIdRequest>) -> Result<Response<BindIdResponse>, Status> {
        let req = request.into_inner();
        if req.id_type.is_empty() || req.id_value.is_empty() {
            return Err(Status::invalid_argument("id_type and id_value are required"));
        }
        let ctx = self
            .gateway
            .registry
            .get_fd_conn(req.fd)
            .ok_or_else(|| Status::not_found("connection not found"))?;
        self.gateway.registry.bind_id(&ctx, parse_id_type(&req.id_type), req.id_value);
        Ok(Response::new(BindIdResponse {}))
    }

    async fn un_bind_id(&self, request: Request<UnBindIdRequest>) -> Result<Response<UnBindIdResponse>, Status> {
        let req = request.into_inner();
        if req.id_type.is_empty() {
            return Err(Status::invalid_argument("id_type is required"));
        }
        let ctx = self
            .gateway
            .registry
            .get_fd_conn(req.fd)
            .ok_or_else(|| Status::not_found("connection not found"))?;
        self.gateway.registry.unbind_id(&ctx, &parse_id_type(&req.id_type));
        Ok(Response::new(UnBindIdResponse {}))
    }

    async fn bind_exist(&self, request: Request<BindExistRequest>) -> Result<Response<BindExistResponse>, Status> {
        let req = request.into_inner();
        let exists = !self.gateway.registry.get_id_conn(&parse_id_type(&req.id_type), &req.id_value).is_empty();
        Ok(Response::new(BindExistResponse { exists }))
    }

    /// Closes every connection currently bound to `TARGET:<target>` (spec §4.8). The actual
    /// `OnClose` fires from the owning engine's read loop once the write half shuts down, so this
    /// only triggers the close, it doesn't fan out `on_close` itself.
    async fn disconnect_target(
        &self,
        request: Request<DisconnectTargetRequest>,
    ) -> Result<Response<DisconnectTargetResponse>, Status> {
        let req = request.into_inner();
        if req.target.is_empty() {
            return Ok(Response::new(DisconnectTargetResponse { closed_count: 0 }));
        }
        let conns = self.gateway.registry.get_id_conn(&IdType::Target, &req.target);
        let mut closed = 0u32;
        for ctx in conns {
            if let Some(io) = self.gateway.find_io(ctx.fd) {
                if io.close("disconnect_target").await.is_ok() {
                    closed += 1;
                }
            }
        }
        Ok(Response::new(DisconnectTargetResponse { closed_count: closed }))
    }

    async fn bind_proxy_target(
        &self,
        request: Request<BindProxyTargetRequest>,
    ) -> Result<Response<BindProxyTargetResponse>, Status> {
        let req = request.into_inner();
        if req.target.is_empty() {
            return Err(Status::invalid_argument("target is required"));
        }
        self.gateway.registry.bind_proxy_target(&req.target, req.fd);
        Ok(Response::new(BindProxyTargetResponse {}))
    }

    async fn unbind_proxy_target(
        &self,
        request: Request<UnbindProxyTargetRequest>,
    ) -> Result<Response<UnbindProxyTargetResponse>, Status> {
        let req = request.into_inner();
        self.gateway.registry.unbind_proxy_target(&req.target, req.fd);
        Ok(Response::new(UnbindProxyTargetResponse {}))
    }

    async fn target_bind_id(&self, request: Request<TargetBindIdRequest>) -> Result<Response<TargetBindIdResponse>, Status> {
        let req = request.into_inner();
        let conns = self.gateway.registry.get_id_conn(&IdType::Target, &req.target);
        let id_value = conns.first().and_then(|ctx| ctx.id(&parse_id_type(&req.bind_type)));
        let found = id_value.is_some();
        Ok(Response::new(TargetBindIdResponse {
            id_value: id_value.unwrap_or_default(),
            found,
        }))
    }
}

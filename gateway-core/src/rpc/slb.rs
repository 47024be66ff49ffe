//! `Slb` service: per-connection action flb overrides (spec §4.8).
//!
//! Grounded on `original_source/service/proto/impl/slb.go`.

use crate::server::Gateway;
use gateway_proto::v1::slb_server::Slb;
use gateway_proto::v1::{SetActionSlbRequest, SetActionSlbResponse};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct SlbService {
    gateway: Arc<Gateway>,
}

impl SlbService {
    pub fn new(gateway: Arc<Gateway>) -> SlbService {
        SlbService { gateway }
    }
}

#[tonic::async_trait]
impl Slb for SlbService {
    async fn set_action_slb(&self, request: Request<SetActionSlbRequest>) -> Result<Response<SetActionSlbResponse>, Status> {
        let req = request.into_inner();
        if req.fd == 0 {
            return Err(Status::invalid_argument("fd is required"));
        }
        if req.action == 0 || req.flb == 0 {
            return Ok(Response::new(SetActionSlbResponse {}));
        }
        let ctx = self
            .gateway
            .registry
            .get_fd_conn(req.fd)
            .ok_or_else(|| Status::not_found("connection not found"))?;
        ctx.optional.lock().unwrap().flb_overrides.insert(req.action, req.flb);
        Ok(Response::new(SetActionSlbResponse {}))
    }
}

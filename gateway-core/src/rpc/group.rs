//! `Group` service: membership and broadcast (spec §4.8).
//!
//! Grounded on `original_source/service/proto/impl/group.go`.

use super::pick_payload;
use crate::server::Gateway;
use gateway_proto::v1::group_server::Group;
use gateway_proto::v1::{BroadcastGroupRequest, BroadcastGroupResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct GroupService {
    gateway: Arc<Gateway>,
}

impl GroupService {
    pub fn new(gateway: Arc<Gateway>) -> GroupService {
        GroupService { gateway }
    }
}

#[tonic::async_trait]
impl Group for GroupService {
    async fn join_group(&self, request: Request<JoinGroupRequest>) -> Result<Response<JoinGroupResponse>, Status> {
        let req = request.into_inner();
        if req.group.is_empty() || req.member_id.is_empty() {
            return Err(Status::invalid_argument("group and member_id are required"));
        }
        self.gateway.groups.get_or_create(&req.group).join(req.fd, req.member_id);
        Ok(Response::new(JoinGroupResponse {}))
    }

    async fn leave_group(&self, request: Request<LeaveGroupRequest>) -> Result<Response<LeaveGroupResponse>, Status> {
        let req = request.into_inner();
        if req.group.is_empty() {
            return Err(Status::invalid_argument("group is required"));
        }
        if let Some(group) = self.gateway.groups.get(&req.group) {
            group.leave(req.fd);
        }
        Ok(Response::new(LeaveGroupResponse {}))
    }

    async fn broadcast_group(
        &self,
        request: Request<BroadcastGroupRequest>,
    ) -> Result<Response<BroadcastGroupResponse>, Status> {
        let req = request.into_inner();
        if req.group.is_empty() {
            return Err(Status::invalid_argument("group is required"));
        }
        if req.action == 0 {
            return Err(Status::invalid_argument("action is required"));
        }

        let group = match self.gateway.groups.get(&req.group) {
            Some(group) => group,
            None => return Ok(Response::new(BroadcastGroupResponse { delivered_count: 0 })),
        };

        let gateway = self.gateway.clone();
        let action = req.action;
        let pb_bytes = req.pb_bytes;
        let json_bytes = req.json_bytes;
        let id_filter = req.id_filter.clone();

        let delivered = group
            .broadcast(id_filter.as_deref(), move |fd, member_id| {
                let gateway = gateway.clone();
                let pb_bytes = pb_bytes.clone();
                let json_bytes = json_bytes.clone();
                async move {
                    let ctx = match gateway.registry.get_fd_conn(fd) {
                        Some(ctx) => ctx,
                        None => return false,
                    };
                    let io = match gateway.find_io(fd) {
                        Some(io) => io,
                        None => return false,
                    };
                    let payload = match pick_payload(&ctx, &pb_bytes, &json_bytes) {
                        Some(p) => p.to_vec(),
                        None => return false,
                    };
                    gateway.event.send(&ctx, io.as_ref(), action, &payload).await;
                    let _ = member_id;
                    true
                }
            })
            .await;

        Ok(Response::new(BroadcastGroupResponse {
            delivered_count: delivered as u32,
        }))
    }
}

use std::sync::Arc;

use rkv_consensus::CommandLog;
use rkv_proto::v1::{
    kv_service_server::KvService, GetRequest, GetResponse, PutAppendRequest, PutAppendResponse,
};
use tonic::{Request, Response, Status};

use crate::convert::{kv_to_status, proto_write_mode, response_header};
use crate::replica::KvReplica;

pub struct KvServiceImpl<L> {
    replica: Arc<KvReplica<L>>,
    node_id: u64,
}

impl<L: CommandLog> KvServiceImpl<L> {
    pub fn new(replica: Arc<KvReplica<L>>, node_id: u64) -> Self {
        KvServiceImpl { replica, node_id }
    }
}

#[tonic::async_trait]
impl<L: CommandLog> KvService for KvServiceImpl<L> {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let value = self
            .replica
            .get(req.client_id, req.op_no, &req.key)
            .await
            .map_err(kv_to_status)?;

        match value {
            None => Err(Status::not_found(format!("key '{}' not found", req.key))),
            Some(value) => Ok(Response::new(GetResponse {
                header: Some(response_header(self.node_id, self.replica.current_term().await)),
                value,
            })),
        }
    }

    async fn put_append(
        &self,
        request: Request<PutAppendRequest>,
    ) -> Result<Response<PutAppendResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let mode = proto_write_mode(req.mode)?;
        self.replica
            .put_append(req.client_id, req.op_no, &req.key, &req.value, mode)
            .await
            .map_err(kv_to_status)?;

        Ok(Response::new(PutAppendResponse {
            header: Some(response_header(self.node_id, self.replica.current_term().await)),
        }))
    }
}

mod convert;
mod kv_service;
mod pending;
mod replica;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rkv_consensus::CommandLog;
use rkv_proto::v1::kv_service_server::KvServiceServer;
use tonic_reflection::server::Builder as ReflectionBuilder;

use kv_service::KvServiceImpl;

pub use convert::{LEADER_ADDR_METADATA, RETRYABLE_METADATA};
pub use replica::{KvReplica, ReplicaConfig};

/// Serve the client API until `shutdown` resolves.
pub async fn serve_client<L: CommandLog>(
    addr: SocketAddr,
    replica: Arc<KvReplica<L>>,
    node_id: u64,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(rkv_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(KvServiceServer::new(KvServiceImpl::new(replica, node_id)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await?;
    tracing::info!(%addr, "client gRPC server stopped");
    Ok(())
}

use rkv_proto::v1::{PutAppendMode, ResponseHeader};
use rkv_types::{KvError, Term, WriteMode};
use tonic::metadata::MetadataValue;
use tonic::Status;

pub const LEADER_ADDR_METADATA: &str = "rkv-leader-addr";
/// Present when the client should resend the same `(client_id, op_no)`.
pub const RETRYABLE_METADATA: &str = "rkv-retryable";

pub fn proto_write_mode(raw: i32) -> Result<WriteMode, Status> {
    match PutAppendMode::try_from(raw) {
        Ok(PutAppendMode::Put) => Ok(WriteMode::Put),
        Ok(PutAppendMode::Append) => Ok(WriteMode::Append),
        Err(_) => Err(Status::invalid_argument(format!("unknown put/append mode {raw}"))),
    }
}

pub fn response_header(node_id: u64, term: Term) -> ResponseHeader {
    ResponseHeader { node_id, raft_term: term }
}

pub fn kv_to_status(err: KvError) -> Status {
    let retryable = err.is_retryable();
    tracing::debug!(error = %err, retryable, "request failed");
    let mut status = match &err {
        KvError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(addr) = leader {
                if let Ok(val) = MetadataValue::try_from(addr.as_str()) {
                    status.metadata_mut().insert(LEADER_ADDR_METADATA, val);
                }
            }
            status
        }
        KvError::Timeout => Status::deadline_exceeded(err.to_string()),
        KvError::ShuttingDown => Status::unavailable(err.to_string()),
        KvError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        KvError::Storage(_) | KvError::Consensus(_) => Status::internal(err.to_string()),
    };
    if retryable {
        status.metadata_mut().insert(RETRYABLE_METADATA, MetadataValue::from_static("true"));
    }
    status
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;

    #[test]
    fn not_leader_carries_hint() {
        let status = kv_to_status(KvError::NotLeader { leader: Some("10.0.0.2:7000".into()) });
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(
            status.metadata().get(LEADER_ADDR_METADATA).unwrap().to_str().unwrap(),
            "10.0.0.2:7000"
        );

        let status = kv_to_status(KvError::not_leader());
        assert!(status.metadata().get(LEADER_ADDR_METADATA).is_none());
    }

    #[test]
    fn only_routing_errors_are_marked_retryable() {
        for err in [KvError::not_leader(), KvError::Timeout] {
            let status = kv_to_status(err);
            assert_eq!(status.metadata().get(RETRYABLE_METADATA).unwrap(), "true");
        }
        for err in [KvError::ShuttingDown, KvError::InvalidArgument("old op".into())] {
            assert!(kv_to_status(err).metadata().get(RETRYABLE_METADATA).is_none());
        }
    }

    #[test]
    fn error_codes() {
        assert_eq!(kv_to_status(KvError::Timeout).code(), Code::DeadlineExceeded);
        assert_eq!(kv_to_status(KvError::ShuttingDown).code(), Code::Unavailable);
        assert_eq!(kv_to_status(KvError::InvalidArgument("x".into())).code(), Code::InvalidArgument);
        assert_eq!(kv_to_status(KvError::Storage("disk".into())).code(), Code::Internal);
    }

    #[test]
    fn write_modes() {
        assert_eq!(proto_write_mode(PutAppendMode::Append as i32).unwrap(), WriteMode::Append);
        assert_eq!(proto_write_mode(0).unwrap(), WriteMode::Put);
        assert_eq!(proto_write_mode(7).unwrap_err().code(), Code::InvalidArgument);
    }
}

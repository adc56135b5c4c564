//! The coordinator's gRPC surface and the node-to-node Raft transport.
//!
//! Writes on a follower are not proxied: the handler returns `NotLeader`
//! with the leader's address and the client retries there. Reads are served
//! from local state with no read-index barrier; they may trail the leader
//! by the replication window.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::cluster::NodeInfo;
use crate::command::Command;
use crate::errors::CoordError;
use crate::fsm::StateMachine;
use crate::raft::{ConsensusNode, RaftInstance, TypeConfig};
use crate::value::Value;
use crate::watch::{WatchEvent, WatchHub};

/// Generated protobuf types and service stubs.
pub mod proto {
    tonic::include_proto!("clustermeta");
}

use proto::coordinator_server::{Coordinator, CoordinatorServer};
use proto::raft_transport_server::{RaftTransport, RaftTransportServer};

pub const ENCODING_JSON: &str = "json";
pub const ENCODING_YAML: &str = "yaml";

// ── Proto conversions ─────────────────────────────────────────────────────────

impl From<NodeInfo> for proto::Node {
    fn from(node: NodeInfo) -> proto::Node {
        proto::Node {
            id: node.id,
            metadata: Some(proto::Metadata {
                bind_addr: node.metadata.bind_addr,
                grpc_addr: node.metadata.grpc_addr,
                http_addr: node.metadata.http_addr,
                leader: node.metadata.leader,
            }),
        }
    }
}

impl From<proto::Node> for NodeInfo {
    fn from(node: proto::Node) -> NodeInfo {
        let meta = node.metadata.unwrap_or_default();
        NodeInfo {
            id: node.id,
            metadata: crate::cluster::NodeMeta {
                bind_addr: meta.bind_addr,
                grpc_addr: meta.grpc_addr,
                http_addr: meta.http_addr,
                leader: meta.leader,
            },
        }
    }
}

/// Serializes a tree value for the wire.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, CoordError> {
    serde_json::to_vec(&value.to_json()).map_err(CoordError::internal)
}

/// Parses an opaque wire payload according to its declared encoding.
pub fn decode_value(payload: &[u8], encoding: &str) -> Result<Value, CoordError> {
    match encoding {
        "" | ENCODING_JSON => Value::parse_json(payload),
        ENCODING_YAML => Value::parse_yaml(payload),
        other => Err(CoordError::bad_encoding(format!(
            "unknown value encoding {:?}",
            other
        ))),
    }
}

/// Converts a hub event into its wire form.
fn encode_event(event: WatchEvent) -> Result<proto::Event, CoordError> {
    Ok(match event {
        WatchEvent::Set {
            path,
            value,
            revision,
        } => proto::Event {
            kind: proto::EventKind::Set as i32,
            path,
            value: encode_value(&value)?,
            encoding: ENCODING_JSON.to_string(),
            revision,
            missed: 0,
        },
        WatchEvent::Delete { path, revision } => proto::Event {
            kind: proto::EventKind::Delete as i32,
            path,
            revision,
            ..Default::default()
        },
        WatchEvent::Lagging { missed } => proto::Event {
            kind: proto::EventKind::Lagging as i32,
            missed,
            ..Default::default()
        },
    })
}

// ── Deadlines ─────────────────────────────────────────────────────────────────

/// Parses the caller's `grpc-timeout` metadata ("5S", "500m", ...), if any.
fn caller_deadline<T>(req: &Request<T>) -> Option<Duration> {
    let raw = req.metadata().get("grpc-timeout")?.to_str().ok()?;
    if raw.len() < 2 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(n * 3600)),
        "M" => Some(Duration::from_secs(n * 60)),
        "S" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_millis(n)),
        "u" => Some(Duration::from_micros(n)),
        "n" => Some(Duration::from_nanos(n)),
        _ => None,
    }
}

/// Runs `fut` under the caller's deadline. A proposal already submitted to
/// Raft is not recalled; it still applies even when the caller gave up.
async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> Result<T, CoordError>
where
    F: std::future::Future<Output = Result<T, CoordError>>,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| CoordError::Deadline)?,
        None => fut.await,
    }
}

// ── Coordinator service ───────────────────────────────────────────────────────

/// Server-side implementation of the `Coordinator` service.
#[derive(Clone)]
pub struct CoordinatorService {
    consensus: Arc<ConsensusNode>,
    sm: Arc<StateMachine>,
    hub: Arc<WatchHub>,
}

impl CoordinatorService {
    pub fn new(
        consensus: Arc<ConsensusNode>,
        sm: Arc<StateMachine>,
        hub: Arc<WatchHub>,
    ) -> CoordinatorService {
        CoordinatorService { consensus, sm, hub }
    }

    /// Propagates an apply-time error back to the proposer.
    fn check_applied(resp: crate::command::CommandResponse) -> Result<(), CoordError> {
        match resp.error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn join(&self, req: Request<proto::JoinRequest>) -> Result<Response<proto::Ack>, Status> {
        let deadline = caller_deadline(&req);
        let node: NodeInfo = req
            .into_inner()
            .node
            .ok_or_else(|| Status::invalid_argument("missing node"))?
            .into();
        if node.id.is_empty() {
            return Err(Status::invalid_argument("missing node id"));
        }

        with_deadline(deadline, self.consensus.handle_join(node)).await?;
        Ok(Response::new(proto::Ack {}))
    }

    async fn leave(
        &self,
        req: Request<proto::LeaveRequest>,
    ) -> Result<Response<proto::Ack>, Status> {
        let deadline = caller_deadline(&req);
        let id = req.into_inner().id;
        if id.is_empty() {
            return Err(Status::invalid_argument("missing node id"));
        }

        with_deadline(deadline, self.consensus.handle_leave(&id)).await?;
        Ok(Response::new(proto::Ack {}))
    }

    async fn get_node(
        &self,
        req: Request<proto::GetNodeRequest>,
    ) -> Result<Response<proto::GetNodeResponse>, Status> {
        let id = req.into_inner().id;
        let node = self.sm.get_node(&id)?;
        Ok(Response::new(proto::GetNodeResponse {
            node: Some(node.into()),
        }))
    }

    async fn get_cluster(
        &self,
        _req: Request<proto::GetClusterRequest>,
    ) -> Result<Response<proto::GetClusterResponse>, Status> {
        let nodes = self.sm.nodes().into_iter().map(Into::into).collect();
        Ok(Response::new(proto::GetClusterResponse { nodes }))
    }

    async fn set(&self, req: Request<proto::KeyValue>) -> Result<Response<proto::Ack>, Status> {
        let deadline = caller_deadline(&req);
        let kv = req.into_inner();
        let value = decode_value(&kv.value, &kv.encoding)?;

        let resp = with_deadline(
            deadline,
            self.consensus.propose(Command::SetKv {
                path: kv.path,
                value,
                merge: kv.merge,
            }),
        )
        .await?;
        Self::check_applied(resp)?;
        Ok(Response::new(proto::Ack {}))
    }

    async fn get(
        &self,
        req: Request<proto::GetRequest>,
    ) -> Result<Response<proto::GetResponse>, Status> {
        let path = req.into_inner().path;
        let value = self.sm.get(&path)?;
        Ok(Response::new(proto::GetResponse {
            value: encode_value(&value)?,
            encoding: ENCODING_JSON.to_string(),
        }))
    }

    async fn delete(
        &self,
        req: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::Ack>, Status> {
        let deadline = caller_deadline(&req);
        let path = req.into_inner().path;

        let resp = with_deadline(
            deadline,
            self.consensus.propose(Command::DeleteKv { path }),
        )
        .await?;
        Self::check_applied(resp)?;
        Ok(Response::new(proto::Ack {}))
    }

    type WatchStream = ReceiverStream<Result<proto::Event, Status>>;

    async fn watch(
        &self,
        _req: Request<proto::WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut subscription = self.hub.subscribe();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let wire = match encode_event(event) {
                    Ok(e) => Ok(e),
                    Err(e) => {
                        error!(error = %e, "dropping unencodable watch event");
                        continue;
                    }
                };
                if tx.send(wire).await.is_err() {
                    // Client went away; the subscription drops on return.
                    debug!("watch client disconnected");
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn snapshot(
        &self,
        _req: Request<proto::SnapshotRequest>,
    ) -> Result<Response<proto::Ack>, Status> {
        if !self.consensus.is_leader() {
            return Err(self.consensus.not_leader().into());
        }
        self.consensus.trigger_snapshot().await?;
        Ok(Response::new(proto::Ack {}))
    }
}

// ── Raft transport service ────────────────────────────────────────────────────

/// Unwraps the JSON payload of each transport RPC and hands it to the local
/// Raft instance.
#[derive(Clone)]
pub struct RaftTransportService {
    raft: RaftInstance,
}

impl RaftTransportService {
    pub fn new(raft: RaftInstance) -> RaftTransportService {
        RaftTransportService { raft }
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportService {
    async fn append_entries(
        &self,
        req: Request<proto::RaftMessage>,
    ) -> Result<Response<proto::RaftMessage>, Status> {
        let rpc: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&req.into_inner().payload)
                .map_err(|e| Status::invalid_argument(format!("bad AppendEntries payload: {e}")))?;

        let resp = self
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(format!("append_entries: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(proto::RaftMessage { payload }))
    }

    async fn vote(
        &self,
        req: Request<proto::RaftMessage>,
    ) -> Result<Response<proto::RaftMessage>, Status> {
        let rpc: openraft::raft::VoteRequest<crate::raft::NodeId> =
            serde_json::from_slice(&req.into_inner().payload)
                .map_err(|e| Status::invalid_argument(format!("bad Vote payload: {e}")))?;

        let resp = self
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(format!("vote: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(proto::RaftMessage { payload }))
    }

    async fn install_snapshot(
        &self,
        req: Request<proto::RaftMessage>,
    ) -> Result<Response<proto::RaftMessage>, Status> {
        let rpc: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&req.into_inner().payload).map_err(|e| {
                Status::invalid_argument(format!("bad InstallSnapshot payload: {e}"))
            })?;

        let resp = self
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(format!("install_snapshot: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(proto::RaftMessage { payload }))
    }
}

// ── Server startup ────────────────────────────────────────────────────────────

/// Serves the public coordinator service until the shutdown signal fires.
pub async fn serve_coordinator(
    addr: String,
    service: CoordinatorService,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), CoordError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| CoordError::internal(format!("invalid grpc address {addr:?}: {e}")))?;

    info!(%addr, "coordinator service starting");
    Server::builder()
        .add_service(CoordinatorServer::new(service))
        .serve_with_shutdown(addr, async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(CoordError::internal)
}

/// Serves the Raft peer transport on the bind address.
pub async fn serve_raft_transport(
    addr: String,
    service: RaftTransportService,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), CoordError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| CoordError::internal(format!("invalid bind address {addr:?}: {e}")))?;

    info!(%addr, "raft transport starting");
    Server::builder()
        .add_service(RaftTransportServer::new(service))
        .serve_with_shutdown(addr, async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(CoordError::internal)
}

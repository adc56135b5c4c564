//! Client-side wrapper for the coordinator service.
//!
//! Followers do not proxy writes; they answer `NotLeader` with the leader's
//! address. The join/leave helpers here own that retry loop so callers see
//! a single call.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::cluster::NodeInfo;
use crate::errors::CoordError;
use crate::server::proto;
use crate::server::proto::coordinator_client::CoordinatorClient as GrpcClient;
use crate::server::{decode_value, encode_value, ENCODING_JSON};
use crate::value::Value;

const REDIRECT_ATTEMPTS: usize = 10;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A connected coordinator client.
#[derive(Debug)]
pub struct CoordinatorClient {
    addr: String,
    inner: GrpcClient<Channel>,
}

fn as_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

impl CoordinatorClient {
    /// Dials `addr` and performs the TCP handshake up front, so connection
    /// failures surface here rather than on the first call.
    pub async fn connect(addr: &str) -> Result<CoordinatorClient, CoordError> {
        let endpoint = Endpoint::from_shared(as_uri(addr))
            .map_err(CoordError::internal)?
            .connect_timeout(Duration::from_secs(3));
        let channel = endpoint.connect().await.map_err(CoordError::unavailable)?;
        Ok(CoordinatorClient {
            addr: addr.to_string(),
            inner: GrpcClient::new(channel),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn join(&mut self, node: &NodeInfo) -> Result<(), CoordError> {
        self.inner
            .join(proto::JoinRequest {
                node: Some(node.clone().into()),
            })
            .await
            .map(|_| ())
            .map_err(CoordError::from)
    }

    pub async fn leave(&mut self, id: &str) -> Result<(), CoordError> {
        self.inner
            .leave(proto::LeaveRequest { id: id.to_string() })
            .await
            .map(|_| ())
            .map_err(CoordError::from)
    }

    pub async fn get_node(&mut self, id: &str) -> Result<NodeInfo, CoordError> {
        let resp = self
            .inner
            .get_node(proto::GetNodeRequest { id: id.to_string() })
            .await
            .map_err(CoordError::from)?;
        resp.into_inner()
            .node
            .map(NodeInfo::from)
            .ok_or(CoordError::NotFound)
    }

    pub async fn get_cluster(&mut self) -> Result<Vec<NodeInfo>, CoordError> {
        let resp = self
            .inner
            .get_cluster(proto::GetClusterRequest {})
            .await
            .map_err(CoordError::from)?;
        Ok(resp
            .into_inner()
            .nodes
            .into_iter()
            .map(NodeInfo::from)
            .collect())
    }

    pub async fn set(&mut self, path: &str, value: &Value, merge: bool) -> Result<(), CoordError> {
        self.inner
            .set(proto::KeyValue {
                path: path.to_string(),
                value: encode_value(value)?,
                encoding: ENCODING_JSON.to_string(),
                merge,
            })
            .await
            .map(|_| ())
            .map_err(CoordError::from)
    }

    pub async fn get(&mut self, path: &str) -> Result<Value, CoordError> {
        let resp = self
            .inner
            .get(proto::GetRequest {
                path: path.to_string(),
            })
            .await
            .map_err(CoordError::from)?;
        let inner = resp.into_inner();
        decode_value(&inner.value, &inner.encoding)
    }

    pub async fn delete(&mut self, path: &str) -> Result<(), CoordError> {
        self.inner
            .delete(proto::DeleteRequest {
                path: path.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(CoordError::from)
    }

    pub async fn watch(&mut self) -> Result<tonic::Streaming<proto::Event>, CoordError> {
        let resp = self
            .inner
            .watch(proto::WatchRequest {})
            .await
            .map_err(CoordError::from)?;
        Ok(resp.into_inner())
    }

    pub async fn snapshot(&mut self) -> Result<(), CoordError> {
        self.inner
            .snapshot(proto::SnapshotRequest {})
            .await
            .map(|_| ())
            .map_err(CoordError::from)
    }
}

/// A leader-only operation retried through `NotLeader` redirects.
enum LeaderOp<'a> {
    Join(&'a NodeInfo),
    Leave(&'a str),
}

/// Issues `Join` against `peer_addr`, following `NotLeader` redirects and
/// retrying while the cluster has no leader yet.
pub async fn join_cluster(peer_addr: &str, node: &NodeInfo) -> Result<(), CoordError> {
    follow_leader(peer_addr, LeaderOp::Join(node)).await
}

/// Issues `Leave` for `id` against `peer_addr`, following redirects.
pub async fn leave_cluster(peer_addr: &str, id: &str) -> Result<(), CoordError> {
    follow_leader(peer_addr, LeaderOp::Leave(id)).await
}

async fn follow_leader(peer_addr: &str, op: LeaderOp<'_>) -> Result<(), CoordError> {
    let mut addr = peer_addr.to_string();
    let mut last_err = CoordError::unavailable("no attempts made");

    for attempt in 1..=REDIRECT_ATTEMPTS {
        match CoordinatorClient::connect(&addr).await {
            Ok(mut client) => {
                let result = match &op {
                    LeaderOp::Join(node) => client.join(node).await,
                    LeaderOp::Leave(id) => client.leave(id).await,
                };
                match result {
                    Ok(()) => return Ok(()),
                    Err(CoordError::NotLeader {
                        leader_addr: Some(leader),
                    }) => {
                        info!(attempt, %leader, "redirected to leader");
                        addr = leader;
                        continue;
                    }
                    Err(
                        e @ (CoordError::NotLeader { leader_addr: None }
                        | CoordError::Unavailable(_)),
                    ) => {
                        warn!(attempt, %addr, error = %e, "cluster not ready, retrying");
                        last_err = e;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => {
                warn!(attempt, %addr, error = %e, "connect failed, retrying");
                last_err = e;
            }
        }
        tokio::time::sleep(RETRY_BACKOFF).await;
    }

    Err(last_err)
}

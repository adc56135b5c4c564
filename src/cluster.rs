//! Cluster node identity, configuration, and the HTTP health endpoint.
//!
//! Every member of the cluster is described by a [`NodeInfo`] record stored
//! in the replicated tree under `/cluster/nodes/<id>`. The `leader` bit in
//! its metadata is advisory: it trails the real Raft leader by design and
//! must never be used to route writes.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};

use crate::errors::CoordError;
use crate::fsm::StateMachine;
use crate::value::Value;
use crate::watch::WatchHub;

// ── Node records ──────────────────────────────────────────────────────────────

/// Network endpoints and the advisory leader flag of a cluster member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub bind_addr: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub leader: bool,
}

/// A cluster member record as stored under `/cluster/nodes/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub metadata: NodeMeta,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, bind: &str, grpc: &str, http: &str) -> NodeInfo {
        NodeInfo {
            id: id.into(),
            metadata: NodeMeta {
                bind_addr: bind.to_string(),
                grpc_addr: grpc.to_string(),
                http_addr: http.to_string(),
                leader: false,
            },
        }
    }

    /// The record as a tree value.
    pub fn to_value(&self) -> Value {
        let json = serde_json::to_value(self).expect("node record serializes");
        Value::from_json(json)
    }

    /// Rebuilds a record from a tree value.
    pub fn from_value(value: &Value) -> Result<NodeInfo, CoordError> {
        serde_json::from_value(value.to_json()).map_err(CoordError::bad_encoding)
    }
}

// ── Node configuration ────────────────────────────────────────────────────────

/// Per-node configuration collected from the `start` subcommand flags.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable node identity, unique within the cluster.
    pub node_id: String,
    /// Raft peer transport address.
    pub bind_addr: String,
    /// Coordinator RPC service address.
    pub grpc_addr: String,
    /// HTTP health endpoint address.
    pub http_addr: String,
    /// Raft log and snapshot directory.
    pub data_dir: PathBuf,
    /// Existing cluster member to join, if any.
    pub peer_addr: Option<String>,
    /// JSON index mapping loaded at bootstrap into `/config/index_mapping`.
    pub index_mapping_file: Option<PathBuf>,
    /// Stored under `/config/index_type`.
    pub index_type: String,
    /// Stored under `/config/index_storage_type`.
    pub index_storage_type: String,
}

impl NodeConfig {
    pub fn self_node(&self) -> NodeInfo {
        NodeInfo::new(
            &self.node_id,
            &self.bind_addr,
            &self.grpc_addr,
            &self.http_addr,
        )
    }

    #[cfg(test)]
    pub fn for_testing(data_dir: PathBuf) -> NodeConfig {
        NodeConfig {
            node_id: "test-node".to_string(),
            bind_addr: "127.0.0.1:16060".to_string(),
            grpc_addr: "127.0.0.1:17070".to_string(),
            http_addr: "127.0.0.1:18080".to_string(),
            data_dir,
            peer_addr: None,
            index_mapping_file: None,
            index_type: "upside_down".to_string(),
            index_storage_type: "boltdb".to_string(),
        }
    }
}

// ── Node state ────────────────────────────────────────────────────────────────

/// Raft-derived lifecycle state of this node.
///
/// ```text
/// Forming  → Follower      (joined an existing cluster)
/// Forming  → Leader        (bootstrapped or won election)
/// Leader   ⇄ Follower      (elections)
/// any      → ShuttingDown  (signal received)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Starting up; Raft has not reached a leader yet.
    Forming,
    Follower,
    Leader,
    ShuttingDown,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Forming => "forming",
            NodeState::Follower => "follower",
            NodeState::Leader => "leader",
            NodeState::ShuttingDown => "shutting_down",
        }
    }

    /// True once the node serves reads and accepts (or forwards) writes.
    pub fn is_ready(&self) -> bool {
        matches!(self, NodeState::Follower | NodeState::Leader)
    }
}

// ── Cluster handle ────────────────────────────────────────────────────────────

/// Shared node state handle, cheap to clone across tasks.
///
/// The Raft metrics watcher writes it; the health endpoint and the RPC
/// service read it.
#[derive(Clone)]
pub struct ClusterHandle {
    state: Arc<Mutex<NodeState>>,
    config: Arc<NodeConfig>,
}

impl ClusterHandle {
    pub fn new(config: NodeConfig) -> ClusterHandle {
        ClusterHandle {
            state: Arc::new(Mutex::new(NodeState::Forming)),
            config: Arc::new(config),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().unwrap().clone()
    }

    pub fn set_state(&self, new_state: NodeState) {
        let old = {
            let mut guard = self.state.lock().unwrap();
            std::mem::replace(&mut *guard, new_state.clone())
        };
        if old != new_state {
            info!(
                node_id = %self.config.node_id,
                old_state = old.as_str(),
                new_state = new_state.as_str(),
                "node state changed"
            );
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

// ── HTTP access log ───────────────────────────────────────────────────────────

/// Line-per-request access log for the HTTP endpoint. Disabled when no file
/// is configured.
pub struct AccessLog {
    file: Option<Mutex<std::fs::File>>,
}

impl AccessLog {
    pub fn open(path: Option<&PathBuf>) -> std::io::Result<AccessLog> {
        let file = match path {
            Some(p) => Some(Mutex::new(
                std::fs::OpenOptions::new().create(true).append(true).open(p)?,
            )),
            None => None,
        };
        Ok(AccessLog { file })
    }

    pub fn disabled() -> AccessLog {
        AccessLog { file: None }
    }

    pub fn record(&self, remote: &str, method: &str, path: &str, status: u16, bytes: usize) {
        if let Some(file) = &self.file {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let mut guard = file.lock().unwrap();
            let _ = writeln!(guard, "{} [{}] \"{} {}\" {} {}", remote, ts, method, path, status, bytes);
        }
    }
}

// ── Health server ─────────────────────────────────────────────────────────────

/// JSON body returned by `GET /health/cluster`.
#[derive(Debug, Serialize)]
struct HealthBody {
    node_id: String,
    state: String,
    ready: bool,
    peers: usize,
    watch_subscribers: usize,
    watch_max_queue_depth: usize,
}

async fn health_handler(
    req: Request<Body>,
    handle: ClusterHandle,
    fsm: Arc<StateMachine>,
    hub: Arc<WatchHub>,
    access_log: Arc<AccessLog>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let (status, body) = if path == "/health/cluster" {
        let state = handle.state();
        let body = HealthBody {
            node_id: handle.config().node_id.clone(),
            state: state.as_str().to_string(),
            ready: state.is_ready(),
            peers: fsm.nodes().len(),
            watch_subscribers: hub.subscriber_count(),
            watch_max_queue_depth: hub.max_queue_depth(),
        };
        (200, serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string()))
    } else {
        (404, "not found".to_string())
    };

    access_log.record("-", &method, &path, status, body.len());

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// Serves `GET /health/cluster` until the shutdown signal fires.
pub async fn start_health_server(
    handle: ClusterHandle,
    fsm: Arc<StateMachine>,
    hub: Arc<WatchHub>,
    access_log: Arc<AccessLog>,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr: SocketAddr = match handle.config().http_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %handle.config().http_addr, error = %e, "invalid http address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let handle = handle.clone();
        let fsm = fsm.clone();
        let hub = hub.clone();
        let access_log = access_log.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                health_handler(
                    req,
                    handle.clone(),
                    fsm.clone(),
                    hub.clone(),
                    access_log.clone(),
                )
            }))
        }
    });

    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });

    info!(addr = %addr, "health endpoint started");

    if let Err(e) = server.await {
        error!(error = %e, "health server error");
    }
}

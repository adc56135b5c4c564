//! Consensus node: wraps `openraft` for leader election, log replication,
//! and voter membership changes.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and carried in the `payload` bytes of the `RaftTransport`
//! gRPC service, which every node serves on its bind address.
//!
//! ## Implementation note on async traits
//!
//! openraft 0.9 traits use RPITIT; implementations must be plain `async fn`,
//! not `#[async_trait]`.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    ClientWriteError, InitializeError, InstallSnapshotError, RPCError, RaftError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::Adaptor;
use openraft::{AnyError, BasicNode, ChangeMembers, Entry, ServerState, TokioRuntime};
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::cluster::{ClusterHandle, NodeInfo, NodeState};
use crate::command::{Command, CommandResponse};
use crate::errors::CoordError;
use crate::fsm::StateMachine;
use crate::server::proto::raft_transport_client::RaftTransportClient;
use crate::server::proto::RaftMessage;
use crate::store::RaftStore;

// ── Type configuration ────────────────────────────────────────────────────────

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Command,
        R            = CommandResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derives the stable u64 Raft id from a node's string identifier.
pub fn raft_node_id(s: &str) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── gRPC network transport ────────────────────────────────────────────────────

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer channel implementing openraft's `RaftNetwork` over the
/// `RaftTransport` service.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<RaftTransportClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut RaftTransportClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() dials on the first RPC and reconnects on
            // failure. The per-call timeout keeps heartbeats failing fast
            // instead of hanging into a follower's election window.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(RaftTransportClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .append_entries(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .vote(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .install_snapshot(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates a `GrpcNetwork` per target peer.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.addr.clone(),
            client: None,
        }
    }
}

// ── Consensus node ────────────────────────────────────────────────────────────

/// A running Raft node plus the coordinator-level membership operations
/// layered on it.
pub struct ConsensusNode {
    pub raft: RaftInstance,
    pub node_id: NodeId,
    handle: ClusterHandle,
    sm: Arc<StateMachine>,
}

/// Creates the Raft instance over a store rooted at the configured data
/// directory. Returns the node and whether the store already held state
/// (an initialized node neither bootstraps nor joins again).
pub async fn start(
    handle: ClusterHandle,
    sm: Arc<StateMachine>,
) -> Result<(Arc<ConsensusNode>, bool), CoordError> {
    let config = handle.config().clone();
    let node_id = raft_node_id(&config.node_id);

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "clustermeta".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .map_err(CoordError::internal)?,
    );

    let store = RaftStore::open(&config.data_dir, sm.clone()).map_err(CoordError::internal)?;
    let initialized = store.is_initialized();
    let (log_store, state_machine) = Adaptor::new(store);

    let raft = openraft::Raft::new(
        node_id,
        raft_config,
        GrpcNetworkFactory,
        log_store,
        state_machine,
    )
    .await
    .map_err(CoordError::internal)?;

    info!(
        node_id = %config.node_id,
        raft_id = node_id,
        initialized,
        "raft node started"
    );

    Ok((
        Arc::new(ConsensusNode {
            raft,
            node_id,
            handle,
            sm,
        }),
        initialized,
    ))
}

impl ConsensusNode {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The current leader's gRPC address, resolved through the roster.
    pub fn leader_grpc_addr(&self) -> Option<String> {
        let leader_id = self.raft.metrics().borrow().current_leader?;
        self.sm
            .nodes()
            .into_iter()
            .find(|n| raft_node_id(&n.id) == leader_id)
            .map(|n| n.metadata.grpc_addr)
    }

    /// The `NotLeader` error for this node, pointing at the current leader
    /// when one is known.
    pub fn not_leader(&self) -> CoordError {
        CoordError::NotLeader {
            leader_addr: self.leader_grpc_addr(),
        }
    }

    /// Proposes a command and waits for it to commit and apply locally.
    pub async fn propose(&self, command: Command) -> Result<CommandResponse, CoordError> {
        match self.raft.client_write(command).await {
            Ok(resp) => Ok(resp.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => {
                if fwd.leader_id.is_none() && fwd.leader_node.is_none() {
                    // No leader at all yet, distinct from "ask that node".
                    return Err(CoordError::unavailable("no leader elected"));
                }
                let leader_addr = fwd
                    .leader_id
                    .and_then(|id| {
                        self.sm
                            .nodes()
                            .into_iter()
                            .find(|n| raft_node_id(&n.id) == id)
                            .map(|n| n.metadata.grpc_addr)
                    })
                    .or(fwd.leader_node.map(|n| n.addr));
                Err(CoordError::NotLeader { leader_addr })
            }
            Err(RaftError::APIError(e)) => Err(CoordError::unavailable(e)),
            Err(RaftError::Fatal(e)) => Err(CoordError::internal(e)),
        }
    }

    /// Bootstraps a single-node cluster with self as sole voter, then
    /// registers the local node record with `leader = true`.
    pub async fn bootstrap(&self) -> Result<(), CoordError> {
        let config = self.handle.config();
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: config.bind_addr.clone(),
            },
        );

        match self.raft.initialize(members).await {
            Ok(()) => {}
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!("raft already initialized, skipping bootstrap");
                return Ok(());
            }
            Err(e) => return Err(CoordError::unavailable(e)),
        }

        self.wait_for_leader(Duration::from_secs(10)).await?;

        let mut node = config.self_node();
        node.metadata.leader = true;
        self.propose(Command::SetNode { node }).await?;
        Ok(())
    }

    /// Waits until this node observes itself as leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(), CoordError> {
        let mut rx = self.raft.metrics();
        let wait = async {
            loop {
                if rx.borrow().current_leader == Some(self.node_id) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CoordError::unavailable("no leader elected"))?;
        if self.is_leader() {
            Ok(())
        } else {
            Err(CoordError::unavailable("raft shut down during election"))
        }
    }

    /// Seeds `/config/*` with the index bootstrap values, merged without
    /// override so an established cluster's config wins over a joiner's.
    pub async fn seed_index_config(
        &self,
        index_mapping: Option<crate::value::Value>,
    ) -> Result<(), CoordError> {
        let config = self.handle.config();

        if let Some(mapping) = index_mapping {
            self.propose(Command::SetKv {
                path: "/config/index_mapping".to_string(),
                value: mapping,
                merge: true,
            })
            .await?;
        }
        self.propose(Command::SetKv {
            path: "/config/index_type".to_string(),
            value: crate::value::Value::Str(config.index_type.clone()),
            merge: true,
        })
        .await?;
        self.propose(Command::SetKv {
            path: "/config/index_storage_type".to_string(),
            value: crate::value::Value::Str(config.index_storage_type.clone()),
            merge: true,
        })
        .await?;
        Ok(())
    }

    /// Leader-side join: adds the node as learner, promotes it to voter,
    /// then registers its record in the roster.
    pub async fn handle_join(&self, node: NodeInfo) -> Result<(), CoordError> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }

        let raft_id = raft_node_id(&node.id);
        self.raft
            .add_learner(
                raft_id,
                BasicNode {
                    addr: node.metadata.bind_addr.clone(),
                },
                true,
            )
            .await
            .map_err(|e| CoordError::unavailable(e))?;

        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([raft_id])), false)
            .await
            .map_err(|e| CoordError::unavailable(e))?;

        self.propose(Command::SetNode { node: node.clone() }).await?;
        info!(node_id = %node.id, "node joined cluster");
        Ok(())
    }

    /// Leader-side leave: removes the voter, then drops its roster record.
    pub async fn handle_leave(&self, id: &str) -> Result<(), CoordError> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }

        let raft_id = raft_node_id(id);
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([raft_id])), false)
            .await
            .map_err(|e| CoordError::unavailable(e))?;

        self.propose(Command::DeleteNode { id: id.to_string() })
            .await?;
        info!(node_id = %id, "node left cluster");
        Ok(())
    }

    /// Forces a Raft snapshot (leader-only at the RPC layer).
    pub async fn trigger_snapshot(&self) -> Result<(), CoordError> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(CoordError::internal)
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = ?e, "raft shutdown error");
        }
    }

    /// Rewrites the advisory leader flags after winning an election: self
    /// becomes `leader = true`, every other roster entry is cleared.
    /// Best-effort; the flags trail the real leader by design.
    async fn rewrite_leader_flags(&self) {
        let mut node = self.handle.config().self_node();
        node.metadata.leader = true;
        if let Err(e) = self.propose(Command::SetNode { node }).await {
            warn!(error = %e, "failed to set own leader flag");
            return;
        }

        let self_id = &self.handle.config().node_id;
        for mut other in self.sm.nodes() {
            if &other.id != self_id && other.metadata.leader {
                other.metadata.leader = false;
                if let Err(e) = self.propose(Command::SetNode { node: other }).await {
                    warn!(error = %e, "failed to clear peer leader flag");
                }
            }
        }
    }

    /// Best-effort clear of this node's own flag after losing leadership.
    /// The proposal usually bounces with `NotLeader`; the new leader's
    /// rewrite covers that case.
    async fn clear_own_leader_flag(&self) {
        let had_flag = self
            .sm
            .get_node(&self.handle.config().node_id)
            .map(|n| n.metadata.leader)
            .unwrap_or(false);
        if !had_flag {
            return;
        }
        let node = self.handle.config().self_node();
        if let Err(e) = self.propose(Command::SetNode { node }).await {
            info!(error = %e, "deferred own leader-flag clear to new leader");
        }
    }
}

/// Watches Raft metrics, mirrors the server state into the cluster handle,
/// and maintains the advisory leader flags on every transition.
pub fn spawn_state_watcher(consensus: Arc<ConsensusNode>) -> JoinHandle<()> {
    let mut rx = consensus.raft.metrics();
    let handle = consensus.handle.clone();
    tokio::spawn(async move {
        let mut was_leader = false;
        loop {
            let metrics = rx.borrow().clone();

            let state = match metrics.state {
                ServerState::Leader => NodeState::Leader,
                ServerState::Follower | ServerState::Candidate => NodeState::Follower,
                _ => NodeState::Forming,
            };
            if handle.state() != NodeState::ShuttingDown {
                handle.set_state(state);
            }

            let is_leader = metrics.state == ServerState::Leader;
            if is_leader && !was_leader {
                info!(term = metrics.current_term, "became leader");
                consensus.rewrite_leader_flags().await;
            }
            if !is_leader && was_leader {
                info!(term = metrics.current_term, "lost leadership");
                consensus.clear_own_leader_flag().await;
            }
            was_leader = is_leader;

            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

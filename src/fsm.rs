//! The replicated state machine: a deterministic reducer over the committed
//! command log.
//!
//! A single writer (the Raft apply path) mutates the tree; RPC handlers read
//! through the same lock. Apply errors are recorded in the response and do
//! not abort the replica: every peer hits the same error on the same command
//! and stays consistent.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::NodeInfo;
use crate::command::{Command, CommandResponse};
use crate::errors::CoordError;
use crate::pathutil;
use crate::tree::Tree;
use crate::value::Value;
use crate::watch::{WatchEvent, WatchHub};

struct SmInner {
    tree: Tree,
    revision: u64,
}

/// In-memory FSM state plus the hub that mutation events fan out through.
pub struct StateMachine {
    inner: RwLock<SmInner>,
    hub: Arc<WatchHub>,
}

/// Serialized FSM state; the snapshot body is this, length-framed.
#[derive(Serialize, Deserialize)]
struct SnapshotData {
    tree: Tree,
    revision: u64,
}

impl StateMachine {
    pub fn new(hub: Arc<WatchHub>) -> StateMachine {
        StateMachine {
            inner: RwLock::new(SmInner {
                tree: Tree::new(),
                revision: 0,
            }),
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    /// Applies one committed command. The write lock is held only for the
    /// tree mutation and event enqueue; enqueueing never blocks.
    pub fn apply(&self, command: &Command) -> CommandResponse {
        let mut inner = self.inner.write().unwrap();

        let result = match command {
            Command::SetKv { path, value, merge } => {
                let result = if *merge {
                    inner.tree.merge(path, value.clone())
                } else {
                    inner.tree.set(path, value.clone())
                };
                result.map(|()| {
                    // Publish what the tree now holds at the path, not the
                    // proposed value: under merge the existing leaves win.
                    let stored = inner.tree.get(path).unwrap_or_else(|_| value.clone());
                    (path.clone(), Some(stored))
                })
            }
            Command::DeleteKv { path } => {
                inner.tree.delete(path).map(|()| (path.clone(), None))
            }
            Command::SetNode { node } => {
                let path = pathutil::node_path(&node.id);
                inner
                    .tree
                    .set(&path, node.to_value())
                    .map(|()| (path, Some(node.to_value())))
            }
            Command::DeleteNode { id } => {
                let path = pathutil::node_path(id);
                inner.tree.delete(&path).map(|()| (path, None))
            }
        };

        match result {
            Ok((path, stored)) => {
                inner.revision += 1;
                let revision = inner.revision;
                let event = match stored {
                    Some(value) => WatchEvent::Set {
                        path,
                        value,
                        revision,
                    },
                    None => WatchEvent::Delete { path, revision },
                };
                self.hub.publish(event);
                CommandResponse::ok(revision)
            }
            Err(e) => {
                let revision = inner.revision;
                warn!(error = %e, ?command, "command did not apply");
                CommandResponse::failed(revision, e.into())
            }
        }
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn get(&self, path: &str) -> Result<Value, CoordError> {
        self.inner.read().unwrap().tree.get(path)
    }

    pub fn has(&self, path: &str) -> Result<bool, CoordError> {
        self.inner.read().unwrap().tree.has(path)
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().unwrap().revision
    }

    /// The member record for `id`, if present in the roster.
    pub fn get_node(&self, id: &str) -> Result<NodeInfo, CoordError> {
        let value = self.get(&pathutil::node_path(id))?;
        NodeInfo::from_value(&value)
    }

    /// Every member currently in the roster, sorted by id. Records that do
    /// not parse as nodes are skipped with a warning.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let roster = match self.get(pathutil::NODES_PREFIX) {
            Ok(Value::Map(fields)) => fields,
            _ => return Vec::new(),
        };
        roster
            .iter()
            .filter_map(|(id, value)| match NodeInfo::from_value(value) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(node_id = %id, error = %e, "skipping malformed roster entry");
                    None
                }
            })
            .collect()
    }

    // ── Snapshot / restore ────────────────────────────────────────────────

    /// The complete serialized tree plus revision at this point in the log.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, CoordError> {
        let inner = self.inner.read().unwrap();
        serde_json::to_vec(&SnapshotData {
            tree: inner.tree.clone(),
            revision: inner.revision,
        })
        .map_err(CoordError::internal)
    }

    /// Replaces the tree atomically: concurrent readers see either the old
    /// or the new tree, never a mix.
    pub fn restore_bytes(&self, src: &[u8]) -> Result<(), CoordError> {
        let data: SnapshotData = serde_json::from_slice(src).map_err(CoordError::bad_encoding)?;
        let mut inner = self.inner.write().unwrap();
        inner.tree = data.tree;
        inner.revision = data.revision;
        Ok(())
    }

    /// Resets to the empty tree (used when installing an empty snapshot).
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.tree = Tree::new();
        inner.revision = 0;
    }
}

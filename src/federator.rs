//! Federation read side: a live mirror of the coordinator's membership
//! roster, maintained over the watch stream.
//!
//! The mirror connects, takes a full `GetCluster` snapshot, then applies
//! watch deltas. A `Lagging` marker or any malformed delta restarts the
//! snapshot-then-stream cycle; connection loss backs off exponentially
//! (500 ms base, 30 s cap, ±20 % jitter). Transport errors never reach the
//! mirror's readers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::NodeInfo;
use crate::client::CoordinatorClient;
use crate::errors::CoordError;
use crate::pathutil;
use crate::server::proto;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

type View = Arc<HashMap<String, NodeInfo>>;

/// What an applied event asks of the session loop.
#[derive(Debug, PartialEq)]
enum Outcome {
    Applied,
    /// State can no longer be patched incrementally; take a new snapshot.
    Resync,
    Ignored,
}

/// Applies one watch event to a roster map. Only `/cluster/nodes/*` events
/// matter to the mirror; deltas below a single node record (for example a
/// bare leader-flag write) force a resync instead of a partial patch.
fn apply_event(map: &mut HashMap<String, NodeInfo>, event: &proto::Event) -> Outcome {
    let kind = proto::EventKind::try_from(event.kind).unwrap_or(proto::EventKind::Unspecified);

    if kind == proto::EventKind::Lagging {
        return Outcome::Resync;
    }

    let segments = pathutil::split(&event.path);
    if segments.len() < 2 || segments[0] != "cluster" || segments[1] != "nodes" {
        return Outcome::Ignored;
    }

    match (kind, segments.len()) {
        (proto::EventKind::Set, 3) => match crate::server::decode_value(&event.value, &event.encoding)
            .and_then(|v| NodeInfo::from_value(&v))
        {
            Ok(node) => {
                map.insert(node.id.clone(), node);
                Outcome::Applied
            }
            Err(e) => {
                warn!(path = %event.path, error = %e, "unparseable roster delta");
                Outcome::Resync
            }
        },
        (proto::EventKind::Delete, 3) => {
            map.remove(&segments[2]);
            Outcome::Applied
        }
        (proto::EventKind::Delete, 2) => {
            map.clear();
            Outcome::Applied
        }
        // A write below one node record; rebuild from a snapshot.
        _ => Outcome::Resync,
    }
}

enum SessionEnd {
    Shutdown,
    Resync,
    Disconnected(CoordError),
}

/// Read-only mirror of the cluster roster.
pub struct Mirror {
    coordinator_addr: String,
    view: Arc<RwLock<View>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Mirror {
    pub fn new(coordinator_addr: impl Into<String>) -> Mirror {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Mirror {
            coordinator_addr: coordinator_addr.into(),
            view: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
            shutdown_tx,
            shutdown_rx,
            task: Mutex::new(None),
        }
    }

    /// Spawns the reconciliation task. Idempotent: a second call while
    /// running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let addr = self.coordinator_addr.clone();
        let view = self.view.clone();
        let shutdown = self.shutdown_rx.clone();
        *task = Some(tokio::spawn(reconcile(addr, view, shutdown)));
    }

    /// Signals cancellation and waits for the reconciliation task to
    /// terminate before returning.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// A point-in-time consistent snapshot of the roster. The map behind
    /// the returned handle never mutates; the mirror swaps in a fresh one
    /// per applied event.
    pub fn nodes(&self) -> View {
        self.view.read().unwrap().clone()
    }

    pub fn node(&self, id: &str) -> Option<NodeInfo> {
        self.nodes().get(id).cloned()
    }
}

async fn reconcile(addr: String, view: Arc<RwLock<View>>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = BACKOFF_BASE;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match session(&addr, &view, &mut shutdown, &mut backoff).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Resync => {
                debug!("resyncing roster from snapshot");
                continue;
            }
            SessionEnd::Disconnected(e) => {
                let jitter = rand::thread_rng().gen_range(0.8..=1.2);
                let delay = backoff.mul_f64(jitter);
                warn!(%addr, error = %e, delay_ms = delay.as_millis() as u64, "mirror disconnected, backing off");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
    info!("mirror stopped");
}

/// One snapshot-then-stream cycle. Resets the backoff once the snapshot
/// lands, so a healthy reconnect starts fresh.
async fn session(
    addr: &str,
    view: &Arc<RwLock<View>>,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Duration,
) -> SessionEnd {
    let mut client = match CoordinatorClient::connect(addr).await {
        Ok(c) => c,
        Err(e) => return SessionEnd::Disconnected(e),
    };

    let nodes = match client.get_cluster().await {
        Ok(nodes) => nodes,
        Err(e) => return SessionEnd::Disconnected(e),
    };
    let mut roster: HashMap<String, NodeInfo> =
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    *view.write().unwrap() = Arc::new(roster.clone());
    *backoff = BACKOFF_BASE;
    info!(%addr, nodes = roster.len(), "mirror synced");

    let mut stream = match client.watch().await {
        Ok(s) => s,
        Err(e) => return SessionEnd::Disconnected(e),
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => return SessionEnd::Shutdown,
            message = stream.message() => match message {
                Ok(Some(event)) => match apply_event(&mut roster, &event) {
                    Outcome::Applied => {
                        *view.write().unwrap() = Arc::new(roster.clone());
                    }
                    Outcome::Resync => return SessionEnd::Resync,
                    Outcome::Ignored => {}
                },
                Ok(None) => {
                    return SessionEnd::Disconnected(CoordError::unavailable("watch stream closed"))
                }
                Err(status) => return SessionEnd::Disconnected(status.into()),
            },
        }
    }
}

//! Raft log, vote, and snapshot persistence rooted at the node's data
//! directory.
//!
//! Implements the combined v1 `RaftStorage` trait; `openraft::storage::
//! Adaptor` splits it into the log-store and state-machine halves that
//! `Raft::new` expects. Layout inside `data-dir`:
//!
//! | File             | Contents                                        |
//! |------------------|-------------------------------------------------|
//! | `vote.json`      | Last saved vote                                 |
//! | `committed.json` | Last committed log id                           |
//! | `logmeta.json`   | Last purged log id                              |
//! | `log.dat`        | Length-framed JSON log entries, append-only     |
//! | `snapshot.dat`   | Two frames: snapshot meta, serialized tree      |
//!
//! The log file is append-only on the hot path; truncation and purge
//! rewrite it. A torn final frame after a crash is discarded on open.

use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, ErrorSubject, ErrorVerb, LogId, LogState, RaftLogId, Snapshot,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::{read_frame, write_frame, CommandResponse};
use crate::fsm::StateMachine;
use crate::raft::{NodeId, TypeConfig};

const VOTE_FILE: &str = "vote.json";
const COMMITTED_FILE: &str = "committed.json";
const LOG_META_FILE: &str = "logmeta.json";
const LOG_FILE: &str = "log.dat";
const SNAPSHOT_FILE: &str = "snapshot.dat";

#[derive(Serialize, Deserialize)]
struct LogMeta {
    last_purged: Option<LogId<NodeId>>,
}

fn read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::<NodeId>::new(ErrorSubject::Store, ErrorVerb::Read, AnyError::new(&e)).into()
}

fn write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::<NodeId>::new(ErrorSubject::Store, ErrorVerb::Write, AnyError::new(&e)).into()
}

/// Combined log store and state machine, persisted under one directory.
pub struct RaftStore {
    data_dir: PathBuf,
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_seq: u64,
    sm: Arc<StateMachine>,
}

impl RaftStore {
    /// Loads persisted state from `data_dir`, creating it when absent. The
    /// state machine is restored from the snapshot; openraft replays log
    /// entries between the snapshot and the committed index on startup.
    pub fn open(data_dir: &Path, sm: Arc<StateMachine>) -> std::io::Result<RaftStore> {
        fs::create_dir_all(data_dir)?;

        let mut store = RaftStore {
            data_dir: data_dir.to_path_buf(),
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot_seq: 0,
            sm,
        };

        if let Some(bytes) = store.read_file(VOTE_FILE)? {
            store.vote = serde_json::from_slice(&bytes).ok();
        }
        if let Some(bytes) = store.read_file(COMMITTED_FILE)? {
            store.committed = serde_json::from_slice(&bytes).ok();
        }
        if let Some(bytes) = store.read_file(LOG_META_FILE)? {
            if let Ok(meta) = serde_json::from_slice::<LogMeta>(&bytes) {
                store.last_purged = meta.last_purged;
            }
        }

        if let Some((meta, data)) = store.read_snapshot_file()? {
            if data.is_empty() {
                store.sm.reset();
            } else if let Err(e) = store.sm.restore_bytes(&data) {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
            store.last_applied = meta.last_log_id;
            store.last_membership = meta.last_membership.clone();
        }

        let log_path = store.data_dir.join(LOG_FILE);
        if log_path.exists() {
            let mut reader = std::io::BufReader::new(fs::File::open(&log_path)?);
            while let Some(frame) = read_frame(&mut reader)? {
                if let Ok(entry) = serde_json::from_slice::<Entry<TypeConfig>>(&frame) {
                    store.log.insert(entry.get_log_id().index, entry);
                }
            }
        }

        info!(
            data_dir = %data_dir.display(),
            log_entries = store.log.len(),
            has_snapshot = store.last_applied.is_some(),
            "raft store opened"
        );

        Ok(store)
    }

    /// True when this directory already holds Raft state; a node with an
    /// initialized store must not bootstrap a fresh cluster.
    pub fn is_initialized(&self) -> bool {
        self.vote.is_some() || !self.log.is_empty() || self.last_applied.is_some()
    }

    fn read_file(&self, name: &str) -> std::io::Result<Option<Vec<u8>>> {
        match fs::read(self.data_dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        // Write-then-rename keeps the previous version intact on a crash.
        let tmp = self.data_dir.join(format!("{}.tmp", name));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.data_dir.join(name))
    }

    fn read_snapshot_file(
        &self,
    ) -> std::io::Result<Option<(SnapshotMeta<NodeId, BasicNode>, Vec<u8>)>> {
        let path = self.data_dir.join(SNAPSHOT_FILE);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut reader = std::io::BufReader::new(file);
        let meta_frame = match read_frame(&mut reader)? {
            Some(f) => f,
            None => return Ok(None),
        };
        let data = match read_frame(&mut reader)? {
            Some(f) => f,
            None => return Ok(None),
        };
        let meta = serde_json::from_slice(&meta_frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some((meta, data)))
    }

    fn write_snapshot_file(
        data_dir: &Path,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        data: &[u8],
    ) -> std::io::Result<()> {
        let tmp = data_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut file = fs::File::create(&tmp)?;
            let meta_bytes = serde_json::to_vec(meta)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            write_frame(&mut file, &meta_bytes)?;
            write_frame(&mut file, data)?;
        }
        fs::rename(&tmp, data_dir.join(SNAPSHOT_FILE))
    }

    fn append_log_file(&self, entries: &[Entry<TypeConfig>]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(LOG_FILE))?;
        for entry in entries {
            let bytes = serde_json::to_vec(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            write_frame(&mut file, &bytes)?;
        }
        Ok(())
    }

    fn rewrite_log_file(&self) -> std::io::Result<()> {
        let tmp = self.data_dir.join(format!("{}.tmp", LOG_FILE));
        {
            let mut file = fs::File::create(&tmp)?;
            for entry in self.log.values() {
                let bytes = serde_json::to_vec(entry)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                write_frame(&mut file, &bytes)?;
            }
        }
        fs::rename(&tmp, self.data_dir.join(LOG_FILE))
    }
}

impl RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Point-in-time log reader handed to replication tasks.
pub struct StoreLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for StoreLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Serializes the tree and persists it as the current snapshot.
pub struct StoreSnapshotBuilder {
    data_dir: PathBuf,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_id: String,
    sm: Arc<StateMachine>,
}

impl RaftSnapshotBuilder<TypeConfig> for StoreSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self.sm.snapshot_bytes().map_err(read_err)?;

        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id: self.snapshot_id.clone(),
        };

        RaftStore::write_snapshot_file(&self.data_dir, &meta, &data).map_err(write_err)?;

        info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "snapshot written"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = StoreLogReader;
    type SnapshotBuilder = StoreSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(write_err)?;
        self.write_file(VOTE_FILE, &bytes).map_err(write_err)?;
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self
            .log
            .values()
            .next_back()
            .map(|e| *e.get_log_id())
            .or(self.last_purged);
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(&committed).map_err(write_err)?;
        self.write_file(COMMITTED_FILE, &bytes).map_err(write_err)?;
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        StoreLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        self.append_log_file(&entries).map_err(write_err)?;
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        self.rewrite_log_file().map_err(write_err)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        self.rewrite_log_file().map_err(write_err)?;
        let meta = serde_json::to_vec(&LogMeta {
            last_purged: self.last_purged,
        })
        .map_err(write_err)?;
        self.write_file(LOG_META_FILE, &meta).map_err(write_err)
    }

    // ── State machine ─────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(CommandResponse::ok(self.sm.revision()));
                }
                openraft::EntryPayload::Normal(command) => {
                    responses.push(self.sm.apply(command));
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(CommandResponse::ok(self.sm.revision()));
                }
            }
        }

        Ok(responses)
    }

    // ── Snapshot ──────────────────────────────────────────────────────────

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.snapshot_seq += 1;
        let snapshot_id = format!(
            "{}-{}",
            self.last_applied.map(|l| l.index).unwrap_or(0),
            self.snapshot_seq
        );
        StoreSnapshotBuilder {
            data_dir: self.data_dir.clone(),
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id,
            sm: self.sm.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        if data.is_empty() {
            self.sm.reset();
        } else {
            self.sm.restore_bytes(&data).map_err(write_err)?;
        }

        RaftStore::write_snapshot_file(&self.data_dir, meta, &data).map_err(write_err)?;
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();

        info!(snapshot_id = %meta.snapshot_id, "snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match self.read_snapshot_file().map_err(read_err)? {
            Some((meta, data)) => Ok(Some(Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(data)),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::value::Value;
    use crate::watch::WatchHub;
    use openraft::{CommittedLeaderId, EntryPayload};

    fn new_store(dir: &Path) -> RaftStore {
        let sm = Arc::new(StateMachine::new(WatchHub::new()));
        RaftStore::open(dir, sm).unwrap()
    }

    fn entry(index: u64, command: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(command),
        }
    }

    fn set_cmd(path: &str, v: i64) -> Command {
        Command::SetKv {
            path: path.to_string(),
            value: Value::Int(v),
            merge: false,
        }
    }

    #[tokio::test]
    async fn fresh_store_is_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        assert!(!store.is_initialized());

        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn vote_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vote = Vote::new(3, 42);
        {
            let mut store = new_store(dir.path());
            store.save_vote(&vote).await.unwrap();
        }
        let mut store = new_store(dir.path());
        assert!(store.is_initialized());
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn log_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = new_store(dir.path());
            store
                .append_to_log(vec![entry(1, set_cmd("/a", 1)), entry(2, set_cmd("/b", 2))])
                .await
                .unwrap();
        }
        let mut store = new_store(dir.path());
        let entries = store.try_get_log_entries(1..=2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].get_log_id().index, 2);
    }

    #[tokio::test]
    async fn conflict_truncation_rewrites_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = new_store(dir.path());
            store
                .append_to_log(vec![
                    entry(1, set_cmd("/a", 1)),
                    entry(2, set_cmd("/b", 2)),
                    entry(3, set_cmd("/c", 3)),
                ])
                .await
                .unwrap();
            store
                .delete_conflict_logs_since(LogId::new(CommittedLeaderId::new(1, 1), 2))
                .await
                .unwrap();
        }
        let mut store = new_store(dir.path());
        let entries = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get_log_id().index, 1);
    }

    #[tokio::test]
    async fn purge_records_last_purged() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = new_store(dir.path());
            store
                .append_to_log(vec![entry(1, set_cmd("/a", 1)), entry(2, set_cmd("/b", 2))])
                .await
                .unwrap();
            store
                .purge_logs_upto(LogId::new(CommittedLeaderId::new(1, 1), 1))
                .await
                .unwrap();
        }
        let mut store = new_store(dir.path());
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 1);
        assert_eq!(state.last_log_id.unwrap().index, 2);
    }

    #[tokio::test]
    async fn apply_updates_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let sm = Arc::new(StateMachine::new(WatchHub::new()));
        let mut store = RaftStore::open(dir.path(), sm.clone()).unwrap();

        let responses = store
            .apply_to_state_machine(&[entry(1, set_cmd("/a", 7))])
            .await
            .unwrap();
        assert!(responses[0].applied);
        assert_eq!(sm.get("/a").unwrap(), Value::Int(7));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_restores_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sm = Arc::new(StateMachine::new(WatchHub::new()));
        let mut store = RaftStore::open(dir.path(), sm.clone()).unwrap();

        store
            .apply_to_state_machine(&[entry(1, set_cmd("/a", 1)), entry(2, set_cmd("/b", 2))])
            .await
            .unwrap();

        let mut builder = store.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let sm2 = Arc::new(StateMachine::new(WatchHub::new()));
        let mut store2 = RaftStore::open(dir2.path(), sm2.clone()).unwrap();
        store2
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(sm2.get("/").unwrap(), sm.get("/").unwrap());
        assert_eq!(sm2.revision(), sm.revision());
    }

    #[tokio::test]
    async fn snapshot_restores_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sm = Arc::new(StateMachine::new(WatchHub::new()));
            let mut store = RaftStore::open(dir.path(), sm).unwrap();
            store
                .apply_to_state_machine(&[entry(1, set_cmd("/a", 1))])
                .await
                .unwrap();
            let mut builder = store.get_snapshot_builder().await;
            builder.build_snapshot().await.unwrap();
        }

        let sm = Arc::new(StateMachine::new(WatchHub::new()));
        let mut store = RaftStore::open(dir.path(), sm.clone()).unwrap();
        assert_eq!(sm.get("/a").unwrap(), Value::Int(1));
        let (last_applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }
}

//! Raft log storage backed by segmented NDJSON files.
//!
//! ```text
//! <data_dir>/raft/
//! ├── vote.json
//! ├── meta.json          # last purged + committed log ids
//! └── segments/
//!     ├── 00000000000000000000.ndjson
//!     └── 00000000000000001024.ndjson
//! ```
//!
//! Entries are mirrored in memory for reads; files are the source of truth
//! on restart.

mod meta;
mod segments;

use crate::types::{
    ClusterEntry, ClusterLogId, ClusterLogState, ClusterStorageError, ClusterVote, TypeConfig,
};
use meta::LogMeta;
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, RaftLogReader, StorageIOError};
use segments::SegmentSet;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

struct LogStoreInner {
    dir: PathBuf,
    entries: BTreeMap<u64, ClusterEntry>,
    segments: SegmentSet,
    meta: LogMeta,
    vote: Option<ClusterVote>,
}

impl LogStoreInner {
    fn open(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let segments = SegmentSet::new(dir.join("segments"))?;
        let mut entries = segments.load()?;
        let log_meta = meta::load_meta(&dir)?;
        let vote = meta::load_vote(&dir)?;

        // A crash between purge bookkeeping and file deletion can leave
        // purged entries on disk.
        if let Some(purged) = log_meta.last_purged {
            entries = entries.split_off(&(purged.index + 1));
        }

        Ok(Self {
            dir,
            entries,
            segments,
            meta: log_meta,
            vote,
        })
    }

    fn append(&mut self, batch: Vec<ClusterEntry>) -> io::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.segments.append(batch.iter())?;
        for entry in batch {
            self.entries.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    fn truncate(&mut self, from: u64) -> io::Result<()> {
        let _dropped = self.entries.split_off(&from);
        let boundary = SegmentSet::start_of(from);
        let kept: Vec<ClusterEntry> = self
            .entries
            .range(boundary..from)
            .map(|(_, e)| e.clone())
            .collect();
        self.segments.cut_at(from, &kept)
    }

    fn purge(&mut self, upto: ClusterLogId) -> io::Result<()> {
        self.meta.last_purged = Some(upto);
        meta::save_meta(&self.dir, &self.meta)?;
        self.entries = self.entries.split_off(&(upto.index + 1));
        self.segments.drop_through(upto.index)
    }
}

/// Persistent storage for Raft logs and vote state.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<RwLock<LogStoreInner>>,
}

impl LogStore {
    /// Create or open log storage in the given directory.
    pub fn open(dir: PathBuf) -> Result<Self, io::Error> {
        let inner = LogStoreInner::open(dir)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<ClusterEntry>, ClusterStorageError> {
        let inner = self.inner.read().await;
        Ok(inner.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<ClusterLogState, ClusterStorageError> {
        let inner = self.inner.read().await;
        let last_purged_log_id = inner.meta.last_purged;
        let last_log_id = inner
            .entries
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(last_purged_log_id);

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<ClusterLogId>,
    ) -> Result<(), ClusterStorageError> {
        let mut inner = self.inner.write().await;
        inner.meta.committed = committed;
        meta::save_meta(&inner.dir, &inner.meta).map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<ClusterLogId>, ClusterStorageError> {
        Ok(self.inner.read().await.meta.committed)
    }

    async fn save_vote(&mut self, vote: &ClusterVote) -> Result<(), ClusterStorageError> {
        let mut inner = self.inner.write().await;
        meta::save_vote(&inner.dir, vote).map_err(|e| StorageIOError::write_vote(&e))?;
        inner.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<ClusterVote>, ClusterStorageError> {
        Ok(self.inner.read().await.vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), ClusterStorageError>
    where
        I: IntoIterator<Item = ClusterEntry>,
    {
        let mut inner = self.inner.write().await;
        let result = inner.append(entries.into_iter().collect());
        match result {
            Ok(()) => {
                callback.log_io_completed(Ok(()));
                Ok(())
            }
            Err(e) => {
                let err = StorageIOError::write_logs(&e);
                callback.log_io_completed(Err(e));
                Err(err.into())
            }
        }
    }

    async fn truncate(&mut self, log_id: ClusterLogId) -> Result<(), ClusterStorageError> {
        tracing::debug!(%log_id, "truncating log");
        let mut inner = self.inner.write().await;
        inner
            .truncate(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: ClusterLogId) -> Result<(), ClusterStorageError> {
        tracing::debug!(%log_id, "purging log");
        let mut inner = self.inner.write().await;
        inner
            .purge(log_id)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::segments::SEGMENT_SPAN;
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload, Vote};
    use tempfile::TempDir;

    fn log_id(term: u64, index: u64) -> ClusterLogId {
        ClusterLogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn blanks(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<ClusterEntry> {
        range
            .map(|i| ClusterEntry {
                log_id: log_id(term, i),
                payload: EntryPayload::Blank,
            })
            .collect()
    }

    async fn append(store: &LogStore, entries: Vec<ClusterEntry>) {
        store
            .inner
            .write()
            .await
            .append(entries)
            .expect("append should succeed");
    }

    fn segment_count(dir: &TempDir) -> usize {
        fs::read_dir(dir.path().join("segments"))
            .expect("read segments dir")
            .count()
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("open store");

        append(&store, blanks(1, 1..=10)).await;

        let read = store.try_get_log_entries(3..=7).await.expect("read");
        assert_eq!(read.len(), 5);
        assert_eq!(read[0].log_id.index, 3);

        let state = store.get_log_state().await.expect("log state");
        assert_eq!(state.last_log_id, Some(log_id(1, 10)));
        assert_eq!(state.last_purged_log_id, None);
    }

    #[tokio::test]
    async fn rolls_segments_at_span_boundary() {
        let dir = TempDir::new().expect("create temp dir");
        let store = LogStore::open(dir.path().to_path_buf()).expect("open store");

        append(&store, blanks(1, 1..=SEGMENT_SPAN * 2 + 5)).await;
        assert_eq!(segment_count(&dir), 3);
    }

    #[tokio::test]
    async fn purge_drops_whole_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("open store");
        append(&store, blanks(1, 1..=SEGMENT_SPAN * 2 + 5)).await;

        store
            .purge(log_id(1, SEGMENT_SPAN + 10))
            .await
            .expect("purge");

        assert!(store
            .try_get_log_entries(..=SEGMENT_SPAN + 10)
            .await
            .expect("read")
            .is_empty());
        // The first segment is fully purged; the second still holds live entries.
        assert_eq!(segment_count(&dir), 2);

        let state = store.get_log_state().await.expect("log state");
        assert_eq!(state.last_purged_log_id, Some(log_id(1, SEGMENT_SPAN + 10)));
    }

    #[tokio::test]
    async fn truncate_then_append_survives_restart() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let mut store = LogStore::open(dir.path().to_path_buf()).expect("open store");
            append(&store, blanks(1, 1..=100)).await;
            store.truncate(log_id(1, 50)).await.expect("truncate");
            append(&store, blanks(2, 50..=60)).await;
        }

        let mut store = LogStore::open(dir.path().to_path_buf()).expect("reopen store");
        let read = store.try_get_log_entries(..).await.expect("read");
        assert_eq!(read.len(), 60);
        assert_eq!(read[48].log_id, log_id(1, 49));
        assert_eq!(read[49].log_id, log_id(2, 50));
        assert_eq!(read.last().map(|e| e.log_id), Some(log_id(2, 60)));
    }

    #[tokio::test]
    async fn vote_and_committed_persist() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let mut store = LogStore::open(dir.path().to_path_buf()).expect("open store");
            store.save_vote(&Vote::new(5, 3)).await.expect("save vote");
            store
                .save_committed(Some(log_id(5, 12)))
                .await
                .expect("save committed");
        }

        let mut store = LogStore::open(dir.path().to_path_buf()).expect("reopen store");
        let vote = store.read_vote().await.expect("read vote").expect("vote exists");
        assert_eq!(vote.leader_id().term, 5);
        assert_eq!(vote.leader_id().node_id, 3);
        assert_eq!(
            store.read_committed().await.expect("read committed"),
            Some(log_id(5, 12))
        );
    }
}

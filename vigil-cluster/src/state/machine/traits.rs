//! Trait implementations for OpenRaft integration.

use crate::command::ClusterRequest;
use crate::events::ClusterEvent;
use crate::state::snapshot::{self, SnapshotBundle};
use crate::types::{
    ClusterLogId, ClusterSnapshot, ClusterSnapshotMeta, ClusterStorageError,
    ClusterStoredMembership, TypeConfig,
};
use openraft::storage::RaftStateMachine;
use openraft::{
    EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership,
};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use super::apply::apply_command;
use super::types::{ClusterResponse, RequestCache, StoredSnapshot};
use super::ClusterStateMachine;

/// Serialized form of a snapshot.
///
/// The bundle carries the entities; the request cache travels alongside so
/// a retried proposal is still recognised after a follower installs the
/// snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    bundle: SnapshotBundle,
    #[serde(default)]
    requests: Vec<(Uuid, ClusterResponse)>,
}

/// Implementation of OpenRaft's snapshot builder interface.
///
/// Builds a consistent snapshot of the current cluster state for
/// log compaction and state transfer to new nodes.
impl RaftSnapshotBuilder<TypeConfig> for Arc<ClusterStateMachine> {
    async fn build_snapshot(&mut self) -> Result<ClusterSnapshot, ClusterStorageError> {
        let (image, last_applied_log, last_membership) = {
            let state = self.state.read();
            let image = SnapshotImage {
                bundle: snapshot::build(&state),
                requests: state.requests.entries(),
            };
            (image, state.last_applied_log, state.last_membership.clone())
        };

        let data =
            serde_json::to_vec(&image).map_err(|e| StorageIOError::read_state_machine(&e))?;

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = ClusterSnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            commands = image.bundle.command_count(),
            bytes = data.len(),
            "built snapshot"
        );

        *self.current_snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(ClusterSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// Implementation of OpenRaft's state machine interface.
///
/// Applies committed log entries to the cluster state deterministically.
/// Committed commands are announced on the event bus after the state lock
/// is released.
impl RaftStateMachine<TypeConfig> for Arc<ClusterStateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<ClusterLogId>, ClusterStoredMembership), ClusterStorageError> {
        let state = self.state.read();
        Ok((state.last_applied_log, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ClusterResponse>, ClusterStorageError>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + Send,
    {
        let mut responses = Vec::new();
        let mut committed = Vec::new();

        {
            let mut state = self.state.write();
            for entry in entries {
                tracing::debug!(%entry.log_id, "applying to state machine");

                state.last_applied_log = Some(entry.log_id);

                match entry.payload {
                    EntryPayload::Blank => {
                        responses.push(ClusterResponse::ok());
                    }
                    EntryPayload::Normal(ClusterRequest {
                        request_id,
                        command,
                    }) => {
                        if let Some(cached) = request_id.and_then(|id| state.requests.get(&id)) {
                            tracing::debug!(?request_id, "replayed request answered from cache");
                            responses.push(cached.clone());
                            continue;
                        }

                        let response = apply_command(&mut state, command.clone());
                        if let Some(id) = request_id {
                            state.requests.remember(id, response.clone());
                        }
                        if !response.success {
                            tracing::warn!(
                                command = command.name(),
                                error = response.error.as_deref().unwrap_or_default(),
                                "command rejected by state machine"
                            );
                        }

                        committed.push(ClusterEvent::CommandCommitted {
                            index: entry.log_id.index,
                            command: Arc::new(command),
                            changed: response.changed,
                        });
                        responses.push(response);
                    }
                    EntryPayload::Membership(membership) => {
                        state.last_membership =
                            StoredMembership::new(Some(entry.log_id), membership);
                        responses.push(ClusterResponse::ok());
                    }
                }
            }
        }

        for event in committed {
            self.events.publish(event);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, ClusterStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &ClusterSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), ClusterStorageError> {
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            snapshot_size = snapshot.get_ref().len(),
            "installing snapshot"
        );

        let new_snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        let image: SnapshotImage = serde_json::from_slice(&new_snapshot.data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        {
            let mut state = self.state.write();
            let mut next = snapshot::restore(&state, &image.bundle).map_err(|e| {
                StorageIOError::read_snapshot(
                    Some(meta.signature()),
                    &io::Error::new(io::ErrorKind::InvalidData, e),
                )
            })?;
            next.requests = RequestCache::from_entries(image.requests);
            next.last_applied_log = meta.last_log_id;
            next.last_membership = meta.last_membership.clone();
            *state = next;
        }

        *self.current_snapshot.write().await = Some(new_snapshot);

        self.events.publish(ClusterEvent::SnapshotInstalled {
            last_index: meta.last_log_id.map(|id| id.index),
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<ClusterSnapshot>, ClusterStorageError> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(ClusterSnapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::events::EventBus;
    use openraft::{CommittedLeaderId, Entry, LogId};
    use vigil_core::{Monitor, MonitorKind};

    fn log_id(index: u64) -> ClusterLogId {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn entry(index: u64, request: ClusterRequest) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(request),
        }
    }

    fn create(name: &str) -> Command {
        Command::CreateMonitor {
            monitor: Monitor::new(
                name,
                MonitorKind::Tcp {
                    host: "localhost".to_string(),
                    port: 5432,
                    degraded_after_ms: None,
                },
            ),
        }
    }

    #[tokio::test]
    async fn apply_publishes_committed_commands() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut sm = Arc::new(ClusterStateMachine::new(events));

        let responses = sm
            .apply(vec![entry(1, ClusterRequest::new(create("pg")))])
            .await
            .unwrap();
        assert!(responses[0].success);

        match rx.recv().await.unwrap() {
            ClusterEvent::CommandCommitted { index, changed, .. } => {
                assert_eq!(index, 1);
                assert!(changed);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sm.read(|s| s.monitors().len()), 1);
    }

    #[tokio::test]
    async fn replayed_request_id_is_applied_once() {
        let mut sm = Arc::new(ClusterStateMachine::new(EventBus::default()));
        let id = Uuid::new_v4();

        sm.apply(vec![entry(1, ClusterRequest::idempotent(id, create("pg")))])
            .await
            .unwrap();
        // Same key with a different payload still returns the first answer.
        let replay = sm
            .apply(vec![entry(2, ClusterRequest::idempotent(id, create("redis")))])
            .await
            .unwrap();

        assert!(replay[0].success);
        assert_eq!(sm.read(|s| s.monitors().len()), 1);
        assert_eq!(sm.read(|s| s.last_applied_log()), Some(log_id(2)));
    }

    #[tokio::test]
    async fn snapshot_installs_on_fresh_machine() {
        let mut source = Arc::new(ClusterStateMachine::new(EventBus::default()));
        source
            .apply(vec![entry(1, ClusterRequest::idempotent(Uuid::new_v4(), create("pg")))])
            .await
            .unwrap();

        let mut builder = source.get_snapshot_builder().await;
        let snap = builder.build_snapshot().await.unwrap();

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut target = Arc::new(ClusterStateMachine::new(events));
        target.install_snapshot(&snap.meta, snap.snapshot).await.unwrap();

        assert_eq!(
            target.read(|s| s.monitors().clone()),
            source.read(|s| s.monitors().clone())
        );
        assert_eq!(target.read(|s| s.requests.len()), 1);
        assert_eq!(target.read(|s| s.last_applied_log()), Some(log_id(1)));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClusterEvent::SnapshotInstalled { last_index: Some(1) }
        ));
        assert!(target.get_current_snapshot().await.unwrap().is_some());
    }
}

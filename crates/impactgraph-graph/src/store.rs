//! Versioned graph store.
//!
//! Readers load the current snapshot through an `ArcSwap` and never block;
//! writers prepare a write set off-lock and take the commit lock only to
//! check for conflicts, stamp the next version, log and publish.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use impactgraph_core::{
    GraphSettings, GraphVersion, ImpactGraphError, Result, StorageSettings,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::changelog::{ChangeLog, ChangeRecord, VersionDiff};
use crate::integrity::{self, IntegrityReport};
use crate::persistence::SnapshotStorage;
use crate::snapshot::{GraphHandle, GraphSnapshot};
use crate::write_set::{EntityChange, GraphDelta, PreparedTransaction, WriteSet};

/// Result of one optimistic commit attempt.
#[derive(Debug, Clone)]
pub enum CommitAttempt {
    Committed(Arc<ChangeRecord>),
    /// A later commit overlapped what the transaction read; retry on a fresh
    /// snapshot.
    Conflict {
        base: GraphVersion,
        head: GraphVersion,
    },
}

/// Hook run under the commit lock, after a commit is logged and before its
/// snapshot becomes visible to readers.
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, delta: &GraphDelta);

    /// The current snapshot is about to be replaced by a repair.
    fn on_reset(&self) {}
}

pub struct GraphStore {
    current: ArcSwap<GraphSnapshot>,
    observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
    history: RwLock<VecDeque<Arc<GraphSnapshot>>>,
    log: ChangeLog,
    commit_lock: Mutex<()>,
    halted: RwLock<Option<String>>,
    settings: GraphSettings,
    storage: Option<SnapshotStorage>,
    checkpoint_every: u64,
}

impl GraphStore {
    pub fn in_memory(settings: GraphSettings) -> Self {
        let log = ChangeLog::in_memory(settings.retained_versions);
        Self::assemble(GraphSnapshot::empty(), log, settings, None, 0, None)
    }

    /// Opens the store described by `storage`: in memory when no data
    /// directory is set, otherwise checkpoint plus log replay.
    pub fn open(settings: GraphSettings, storage: &StorageSettings) -> Result<Self> {
        let Some(dir) = &storage.data_dir else {
            return Ok(Self::in_memory(settings));
        };
        let files = SnapshotStorage::new(dir)?;
        let checkpoint = files.read_checkpoint()?.unwrap_or_default();
        let records = ChangeLog::recover_file(&files.changelog_path())?;
        let log = ChangeLog::open(files.changelog_path(), settings.retained_versions)?;

        let checkpoint_version = checkpoint.version();
        let (snapshot, mut halted) = match replay(checkpoint.clone(), &records) {
            Ok(snapshot) => (snapshot, None),
            Err(e) => {
                error!("Change log replay failed: {}", e);
                (checkpoint, Some(e.to_string()))
            }
        };
        if halted.is_none() {
            let report = integrity::verify(&snapshot);
            if !report.is_clean() {
                error!("Integrity check after open failed: {}", report.summary());
                halted = Some(report.summary());
            }
        }

        let skip = records.len().saturating_sub(settings.retained_versions);
        log.seed(records.into_iter().skip(skip));
        info!(
            dir = %files.dir().display(),
            checkpoint = %checkpoint_version,
            version = %snapshot.version(),
            halted = halted.is_some(),
            "Graph store opened"
        );
        Ok(Self::assemble(
            snapshot,
            log,
            settings,
            Some(files),
            storage.checkpoint_every,
            halted,
        ))
    }

    fn assemble(
        snapshot: GraphSnapshot,
        log: ChangeLog,
        settings: GraphSettings,
        storage: Option<SnapshotStorage>,
        checkpoint_every: u64,
        halted: Option<String>,
    ) -> Self {
        let snapshot = Arc::new(snapshot);
        let mut history = VecDeque::with_capacity(settings.retained_versions);
        history.push_back(snapshot.clone());
        Self {
            current: ArcSwap::new(snapshot),
            observers: RwLock::new(Vec::new()),
            history: RwLock::new(history),
            log,
            commit_lock: Mutex::new(()),
            halted: RwLock::new(halted),
            settings,
            storage,
            checkpoint_every,
        }
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    pub fn current(&self) -> GraphHandle {
        GraphHandle::new(self.current.load_full())
    }

    pub fn version(&self) -> GraphVersion {
        self.current.load().version()
    }

    /// Handle for a retained past version.
    pub fn pin(&self, version: GraphVersion) -> Result<GraphHandle> {
        let current = self.current.load_full();
        if current.version() == version {
            return Ok(GraphHandle::new(current));
        }
        self.history
            .read()
            .iter()
            .find(|s| s.version() == version)
            .cloned()
            .map(GraphHandle::new)
            .ok_or_else(|| {
                ImpactGraphError::not_found(format!("graph version {} (not retained)", version))
            })
    }

    /// Registers `observer` for every later commit and repair.
    pub fn subscribe(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.write().push(observer);
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    pub fn ensure_writable(&self) -> Result<()> {
        match self.halted.read().as_ref() {
            Some(reason) => Err(ImpactGraphError::WritesHalted(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&self, reason: String) {
        error!("Halting writes: {}", reason);
        *self.halted.write() = Some(reason);
    }

    /// Checks `txn` against everything committed since its base, then stamps,
    /// logs and publishes it as the next version.
    pub fn commit(&self, txn: PreparedTransaction) -> Result<CommitAttempt> {
        let _guard = self.commit_lock.lock();
        self.ensure_writable()?;

        let current = self.current.load_full();
        let head = current.version();
        if head != txn.base_version {
            let overlapping = match self.log.since(txn.base_version) {
                Some(later) => later
                    .iter()
                    .any(|r| txn.reads.overlaps(&r.write_set, &r.delta)),
                None => true,
            };
            if overlapping {
                debug!(
                    artifact = %txn.artifact,
                    base = %txn.base_version,
                    head = %head,
                    "Commit conflict"
                );
                return Ok(CommitAttempt::Conflict {
                    base: txn.base_version,
                    head,
                });
            }
        }

        let version = head.next();
        let PreparedTransaction {
            base_version,
            artifact,
            revision,
            removed_facts,
            added_facts,
            mut write_set,
            mut delta,
            ..
        } = txn;
        write_set.stamp(version);
        self.collect_reclaims(&current, &mut write_set, &mut delta, version);
        delta.version = version;

        let mut next = (*current).clone();
        next.apply(version, &write_set)?;
        let report = integrity::verify_write_set(&next, &write_set);
        if !report.is_clean() {
            let reason = report.summary();
            self.halt(reason.clone());
            return Err(ImpactGraphError::WritesHalted(reason));
        }

        let record = self.log.append(ChangeRecord {
            version,
            base_version,
            artifact,
            revision,
            removed_facts,
            added_facts,
            write_set,
            delta,
            committed_at: Utc::now(),
        })?;

        for observer in self.observers.read().iter() {
            observer.on_commit(&record.delta);
        }
        let next = Arc::new(next);
        self.current.store(next.clone());
        self.remember(next.clone());
        self.checkpoint_if_due(&next);
        Ok(CommitAttempt::Committed(record))
    }

    /// Tombstones older than the grace window with no edges left are dropped.
    fn collect_reclaims(
        &self,
        current: &GraphSnapshot,
        write_set: &mut WriteSet,
        delta: &mut GraphDelta,
        version: GraphVersion,
    ) {
        let grace = self.settings.tombstone_grace_versions;
        if version.get() <= grace {
            return;
        }
        let cutoff = GraphVersion(version.get() - grace);
        let footprint = write_set.footprint();
        for id in current.tombstoned_before(cutoff) {
            if footprint.contains(&id) || current.degree(&id) > 0 {
                continue;
            }
            if let Some(entity) = current.entity(&id) {
                debug!(entity = %entity, "Reclaiming tombstone");
                delta.reclaimed.insert(id);
                delta.touched_entities.insert(id);
                delta.touched_keys.extend(entity.alias_keys.iter().cloned());
                write_set
                    .entities
                    .push(EntityChange::Reclaim(entity.clone()));
            }
        }
    }

    fn remember(&self, snapshot: Arc<GraphSnapshot>) {
        let mut history = self.history.write();
        history.retain(|s| s.version() < snapshot.version());
        history.push_back(snapshot);
        while history.len() > self.settings.retained_versions {
            history.pop_front();
        }
    }

    fn checkpoint_if_due(&self, snapshot: &GraphSnapshot) {
        let Some(storage) = &self.storage else {
            return;
        };
        if self.checkpoint_every == 0 || snapshot.version().get() % self.checkpoint_every != 0 {
            return;
        }
        if let Err(e) = storage.write_checkpoint(snapshot) {
            warn!("Checkpoint at {} failed: {}", snapshot.version(), e);
        }
    }

    /// Writes a checkpoint of the current version. Returns false for
    /// in-memory stores.
    pub fn checkpoint(&self) -> Result<bool> {
        let Some(storage) = &self.storage else {
            debug!("Checkpoint requested on an in-memory store");
            return Ok(false);
        };
        let snapshot = self.current.load_full();
        storage.write_checkpoint(&snapshot)?;
        Ok(true)
    }

    pub fn verify(&self) -> IntegrityReport {
        let report = integrity::verify(&self.current.load());
        if !report.is_clean() {
            warn!("Integrity check failed: {}", report.summary());
        }
        report
    }

    /// Rebuilds the current snapshot from the last checkpoint (or the oldest
    /// retained snapshot) plus the change log and lifts a write halt.
    pub fn repair(&self) -> Result<GraphVersion> {
        let _guard = self.commit_lock.lock();
        let (base, records) = match &self.storage {
            Some(storage) => (
                storage.read_checkpoint()?.unwrap_or_default(),
                self.log.recover()?,
            ),
            None => {
                let base = self
                    .history
                    .read()
                    .front()
                    .map(|s| s.as_ref().clone())
                    .unwrap_or_default();
                let records = self
                    .log
                    .since(base.version())
                    .ok_or_else(|| {
                        ImpactGraphError::not_found(format!(
                            "change log after {}",
                            base.version()
                        ))
                    })?
                    .iter()
                    .map(|r| r.as_ref().clone())
                    .collect::<Vec<_>>();
                (base, records)
            }
        };

        let rebuilt = replay(base, &records)?;
        let report = integrity::verify(&rebuilt);
        if !report.is_clean() {
            return Err(ImpactGraphError::Integrity(report.summary()));
        }

        let version = rebuilt.version();
        for observer in self.observers.read().iter() {
            observer.on_reset();
        }
        let rebuilt = Arc::new(rebuilt);
        self.current.store(rebuilt.clone());
        self.remember(rebuilt);
        *self.halted.write() = None;
        info!(version = %version, replayed = records.len(), "Graph store repaired");
        Ok(version)
    }

    pub fn audit_between(
        &self,
        from: GraphVersion,
        to: GraphVersion,
    ) -> Result<(Vec<ChangeRecord>, VersionDiff)> {
        let records = self.log.between(from, to)?;
        let diff = VersionDiff::from_records(from, to, &records);
        Ok((records, diff))
    }

    #[cfg(test)]
    pub(crate) fn replace_current_for_test(&self, snapshot: GraphSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

/// Re-applies logged write sets on top of `snapshot`.
fn replay(mut snapshot: GraphSnapshot, records: &[ChangeRecord]) -> Result<GraphSnapshot> {
    let start = snapshot.version();
    for record in records.iter().filter(|r| r.version > start) {
        let expected = snapshot.version().next();
        if record.version != expected {
            return Err(ImpactGraphError::Integrity(format!(
                "change log gap: expected {}, found {}",
                expected, record.version
            )));
        }
        snapshot.apply(record.version, &record.write_set)?;
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write_set::ReadSet;

    fn empty_txn(base: GraphVersion, artifact: &str) -> PreparedTransaction {
        PreparedTransaction {
            base_version: base,
            artifact: artifact.into(),
            revision: "r".into(),
            removed_facts: vec![],
            added_facts: vec![],
            write_set: WriteSet::default(),
            reads: ReadSet::new(artifact),
            delta: GraphDelta::new(artifact),
        }
    }

    #[test]
    fn commits_bump_version_and_retain_history() {
        let store = GraphStore::in_memory(GraphSettings {
            retained_versions: 2,
            ..Default::default()
        });
        for _ in 0..3 {
            let base = store.version();
            assert!(matches!(
                store.commit(empty_txn(base, "a.md")).unwrap(),
                CommitAttempt::Committed(_)
            ));
        }
        assert_eq!(store.version(), GraphVersion(3));
        assert!(store.pin(GraphVersion(2)).is_ok());
        assert!(matches!(
            store.pin(GraphVersion(1)),
            Err(ImpactGraphError::NotFound(_))
        ));
    }

    #[test]
    fn stale_base_conflicts_only_on_overlap() {
        use crate::model::ArtifactRecord;
        use crate::write_set::ArtifactChange;

        let store = GraphStore::in_memory(GraphSettings::default());
        let mut first = empty_txn(GraphVersion::ZERO, "a.md");
        first.write_set.artifact = Some(ArtifactChange::Upsert(ArtifactRecord {
            path: "a.md".into(),
            revision: "r".into(),
            facts: Default::default(),
            bindings: Default::default(),
            last_version: GraphVersion::ZERO,
        }));
        store.commit(first).unwrap();

        assert!(matches!(
            store.commit(empty_txn(GraphVersion::ZERO, "a.md")).unwrap(),
            CommitAttempt::Conflict { head, .. } if head == GraphVersion(1)
        ));
        assert!(matches!(
            store.commit(empty_txn(GraphVersion::ZERO, "b.md")).unwrap(),
            CommitAttempt::Committed(_)
        ));
        assert_eq!(store.version(), GraphVersion(2));
    }

    #[derive(Default)]
    struct PublishWatcher {
        store: Mutex<std::sync::Weak<GraphStore>>,
        // (committed version, version readers could see at that moment)
        seen: Mutex<Vec<(GraphVersion, GraphVersion)>>,
        resets: Mutex<usize>,
    }

    impl CommitObserver for PublishWatcher {
        fn on_commit(&self, delta: &GraphDelta) {
            let visible = self
                .store
                .lock()
                .upgrade()
                .map(|s| s.version())
                .unwrap_or_default();
            self.seen.lock().push((delta.version, visible));
        }

        fn on_reset(&self) {
            *self.resets.lock() += 1;
        }
    }

    #[test]
    fn observers_run_before_the_new_version_is_visible() {
        let store = Arc::new(GraphStore::in_memory(GraphSettings::default()));
        let watcher = Arc::new(PublishWatcher::default());
        *watcher.store.lock() = Arc::downgrade(&store);
        store.subscribe(watcher.clone());

        store.commit(empty_txn(GraphVersion::ZERO, "a.md")).unwrap();
        store.commit(empty_txn(GraphVersion(1), "b.md")).unwrap();
        assert_eq!(
            *watcher.seen.lock(),
            vec![
                (GraphVersion(1), GraphVersion(0)),
                (GraphVersion(2), GraphVersion(1)),
            ]
        );

        store.repair().unwrap();
        assert_eq!(*watcher.resets.lock(), 1);
    }

    #[test]
    fn halted_store_refuses_writes_until_repaired() {
        let store = GraphStore::in_memory(GraphSettings::default());
        store.commit(empty_txn(GraphVersion::ZERO, "a.md")).unwrap();
        store.halt("test halt".into());

        assert!(matches!(
            store.commit(empty_txn(store.version(), "a.md")),
            Err(ImpactGraphError::WritesHalted(_))
        ));
        assert_eq!(store.repair().unwrap(), GraphVersion(1));
        assert!(store.commit(empty_txn(store.version(), "a.md")).is_ok());
    }

    #[test]
    fn repair_rebuilds_a_corrupted_snapshot_from_the_log() {
        use crate::model::{Edge, EdgeKey};
        use impactgraph_core::{EdgeKind, EntityId};

        let store = GraphStore::in_memory(GraphSettings::default());
        store.commit(empty_txn(GraphVersion::ZERO, "a.md")).unwrap();

        let mut corrupted = store.current().snapshot().as_ref().clone();
        corrupted.insert_raw_edge(Edge::new(EdgeKey::new(
            EntityId::new(),
            EdgeKind::References,
            EntityId::new(),
        )));
        store.replace_current_for_test(corrupted);
        assert!(!store.verify().is_clean());

        assert_eq!(store.repair().unwrap(), GraphVersion(1));
        assert!(store.verify().is_clean());
        assert!(!store.is_halted());
    }
}

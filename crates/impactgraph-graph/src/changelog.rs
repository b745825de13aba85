use std::collections::{BTreeSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use impactgraph_core::{EntityId, Fact, GraphVersion, ImpactGraphError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::EdgeKey;
use crate::write_set::{GraphDelta, WriteSet};

/// One committed transaction, keyed by the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub version: GraphVersion,
    pub base_version: GraphVersion,
    pub artifact: String,
    pub revision: String,
    pub removed_facts: Vec<Fact>,
    pub added_facts: Vec<Fact>,
    pub write_set: WriteSet,
    pub delta: GraphDelta,
    pub committed_at: DateTime<Utc>,
}

/// Append-only log of committed transactions.
///
/// The in-memory tail is bounded; when a file is attached every record is
/// written and synced there before the caller publishes the new snapshot.
pub struct ChangeLog {
    records: RwLock<VecDeque<Arc<ChangeRecord>>>,
    retained: usize,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl ChangeLog {
    pub fn in_memory(retained: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            retained: retained.max(1),
            file: None,
            path: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>, retained: usize) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened change log at {}", path.display());
        Ok(Self {
            records: RwLock::new(VecDeque::new()),
            retained: retained.max(1),
            file: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, record: ChangeRecord) -> Result<Arc<ChangeRecord>> {
        if let Some(file) = &self.file {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            let mut file = file.lock();
            file.write_all(line.as_bytes())?;
            file.flush()?;
            file.sync_data()?;
        }
        let record = Arc::new(record);
        self.remember(record.clone());
        Ok(record)
    }

    /// Loads already-persisted records into the in-memory tail.
    pub(crate) fn seed(&self, records: impl IntoIterator<Item = ChangeRecord>) {
        for record in records {
            self.remember(Arc::new(record));
        }
    }

    fn remember(&self, record: Arc<ChangeRecord>) {
        let mut records = self.records.write();
        records.push_back(record);
        while records.len() > self.retained {
            records.pop_front();
        }
    }

    pub fn latest_version(&self) -> Option<GraphVersion> {
        self.records.read().back().map(|r| r.version)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Records committed after `version`, or `None` when the retained tail no
    /// longer reaches back that far.
    pub fn since(&self, version: GraphVersion) -> Option<Vec<Arc<ChangeRecord>>> {
        let records = self.records.read();
        match records.front() {
            None => Some(Vec::new()),
            Some(oldest) if oldest.version.get() > version.get() + 1 => None,
            Some(_) => Some(
                records
                    .iter()
                    .filter(|r| r.version > version)
                    .cloned()
                    .collect(),
            ),
        }
    }

    /// Records with `from < version <= to`, for replay and audit.
    pub fn between(&self, from: GraphVersion, to: GraphVersion) -> Result<Vec<ChangeRecord>> {
        if from > to {
            return Err(ImpactGraphError::validation(format!(
                "audit range {}..{} is reversed",
                from, to
            )));
        }
        let records: Vec<ChangeRecord> = match &self.path {
            Some(path) => Self::read_file(path)?
                .into_iter()
                .filter(|r| r.version > from && r.version <= to)
                .collect(),
            None => self
                .records
                .read()
                .iter()
                .filter(|r| r.version > from && r.version <= to)
                .map(|r| r.as_ref().clone())
                .collect(),
        };

        let expected = (to.get() - from.get()) as usize;
        let contiguous = records
            .iter()
            .enumerate()
            .all(|(i, r)| r.version.get() == from.get() + 1 + i as u64);
        if records.len() != expected || !contiguous {
            return Err(ImpactGraphError::not_found(format!(
                "change log for {}..{}",
                from, to
            )));
        }
        Ok(records)
    }

    /// Reads a JSON-lines log. A torn final line (crash mid-append) is
    /// dropped; corruption anywhere else is an integrity error.
    pub fn read_file(path: &Path) -> Result<Vec<ChangeRecord>> {
        Self::read_lines(path).map(|(records, _)| records)
    }

    /// Re-reads the attached file the way [`ChangeLog::recover_file`] does,
    /// then reopens the append handle on the rewritten file. In-memory logs
    /// return their retained tail.
    pub fn recover(&self) -> Result<Vec<ChangeRecord>> {
        let (Some(path), Some(file)) = (&self.path, &self.file) else {
            return Ok(self.records.read().iter().map(|r| r.as_ref().clone()).collect());
        };
        let mut file = file.lock();
        let records = Self::recover_file(path)?;
        *file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(records)
    }

    /// Like [`ChangeLog::read_file`], but also rewrites the file without a
    /// torn tail so later appends start on a clean line.
    pub fn recover_file(path: &Path) -> Result<Vec<ChangeRecord>> {
        let (records, torn) = Self::read_lines(path)?;
        if torn {
            let tmp = path.with_extension("jsonl.tmp");
            let mut out = String::new();
            for record in &records {
                out.push_str(&serde_json::to_string(record)?);
                out.push('\n');
            }
            std::fs::write(&tmp, out)?;
            std::fs::rename(&tmp, path)?;
            warn!("Rewrote change log {} without its torn tail", path.display());
        }
        Ok(records)
    }

    fn read_lines(path: &Path) -> Result<(Vec<ChangeRecord>, bool)> {
        if !path.exists() {
            return Ok((Vec::new(), false));
        }
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut records = Vec::with_capacity(lines.len());
        let mut torn = false;
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if Some(index) == last => {
                    warn!(
                        "Dropping torn change log tail in {}: {}",
                        path.display(),
                        e
                    );
                    torn = true;
                }
                Err(e) => {
                    return Err(ImpactGraphError::Integrity(format!(
                        "change log {} line {}: {}",
                        path.display(),
                        index + 1,
                        e
                    )))
                }
            }
        }
        Ok((records, torn))
    }
}

/// Net entity/edge changes between two versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from: GraphVersion,
    pub to: GraphVersion,
    pub artifacts: BTreeSet<String>,
    pub added_entities: BTreeSet<EntityId>,
    pub removed_entities: BTreeSet<EntityId>,
    pub added_edges: BTreeSet<EdgeKey>,
    pub removed_edges: BTreeSet<EdgeKey>,
}

impl VersionDiff {
    pub fn from_records(from: GraphVersion, to: GraphVersion, records: &[ChangeRecord]) -> Self {
        let mut diff = VersionDiff {
            from,
            to,
            ..Default::default()
        };
        for record in records {
            let delta = &record.delta;
            diff.artifacts.insert(record.artifact.clone());
            for id in delta.created.iter().chain(delta.revived.iter()) {
                if !diff.removed_entities.remove(id) {
                    diff.added_entities.insert(*id);
                }
            }
            for id in delta.tombstoned.iter().chain(delta.reclaimed.iter()) {
                if !diff.added_entities.remove(id) {
                    diff.removed_entities.insert(*id);
                }
            }
            for key in &delta.added_edges {
                if !diff.removed_edges.remove(key) {
                    diff.added_edges.insert(*key);
                }
            }
            for key in &delta.removed_edges {
                if !diff.added_edges.remove(key) {
                    diff.removed_edges.insert(*key);
                }
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added_entities.is_empty()
            && self.removed_entities.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use impactgraph_core::{ImpactGraphError, Result};
use tracing::{debug, info};

use crate::snapshot::{GraphSnapshot, SnapshotImage};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const CHANGELOG_FILE: &str = "changelog.jsonl";

/// On-disk layout of a persistent store: one bincode checkpoint plus the
/// JSON-lines change log next to it.
#[derive(Debug, Clone)]
pub struct SnapshotStorage {
    dir: PathBuf,
}

impl SnapshotStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.dir.join(CHANGELOG_FILE)
    }

    /// Writes the checkpoint to a temporary file and renames it into place,
    /// so a crash never leaves a half-written checkpoint behind.
    pub fn write_checkpoint(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let image = snapshot.to_image();
        let bytes = bincode::serde::encode_to_vec(&image, bincode::config::standard())
            .map_err(|e| ImpactGraphError::Encoding(e.to_string()))?;

        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.snapshot_path())?;
        info!(
            version = %image.version,
            entities = image.entities.len(),
            edges = image.edges.len(),
            bytes = bytes.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    pub fn read_checkpoint(&self) -> Result<Option<GraphSnapshot>> {
        let path = self.snapshot_path();
        if !path.exists() {
            debug!("No checkpoint at {}", path.display());
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let (image, _): (SnapshotImage, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| ImpactGraphError::Encoding(e.to_string()))?;
        debug!(version = %image.version, "Checkpoint loaded");
        Ok(Some(GraphSnapshot::from_image(image)))
    }
}

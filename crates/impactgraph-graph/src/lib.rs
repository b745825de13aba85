//! Versioned dependency graph for ImpactGraph.
//!
//! Entities live in an arena keyed by opaque ids; edges are keyed by
//! `(source, kind, target)` and carry per-artifact provenance. Every commit
//! produces a new immutable [`GraphSnapshot`] published through
//! [`GraphStore`]; readers hold a [`GraphHandle`] pinned to one version and
//! never block writers.

pub mod changelog;
pub mod integrity;
pub mod model;
pub mod persistence;
pub mod rename;
pub mod resolve;
pub mod snapshot;
pub mod store;
pub mod traversal;
pub mod updater;
pub mod write_set;

pub use changelog::{ChangeLog, ChangeRecord, VersionDiff};
pub use integrity::{verify, IntegrityReport, IntegrityViolation};
pub use model::{ArtifactRecord, Edge, EdgeKey, EdgeProvenance, Entity, Occurrence};
pub use persistence::SnapshotStorage;
pub use rename::{detect_renames, name_similarity, RenameCandidate};
pub use resolve::{resolve_identity, IdentityIndex, Resolution};
pub use snapshot::{GraphHandle, GraphSnapshot, SnapshotImage};
pub use store::{CommitAttempt, CommitObserver, GraphStore};
pub use traversal::{walk, Direction, Reached, TraversalConfig, TraversalPolicy, TraversalResult};
pub use updater::{changeset_for_event, IncrementalUpdater, UpdateOutcome};
pub use write_set::{
    ArtifactChange, EdgeChange, EntityChange, GraphDelta, PreparedTransaction, ReadSet, WriteSet,
};

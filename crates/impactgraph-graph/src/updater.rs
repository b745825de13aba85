//! Incremental graph updater.
//!
//! Each artifact changeset becomes one optimistic transaction: the write set
//! is computed from a pinned snapshot without holding any store lock, then
//! committed if nothing it read changed in the meantime. At most one
//! changeset per artifact path is in flight; disjoint artifacts proceed in
//! parallel and only overlapping ones retry.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use impactgraph_core::{
    fact_digest, AliasKey, ArtifactChangeEvent, ArtifactChangeset, CanonicalKey, Confidence,
    EdgeKind, EntityId, EntityKind, EntityRef, Fact, GraphVersion, ImpactGraphError, Location,
    Provenance, Result, TransformRegistry, UpdateOptions,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::model::{ArtifactRecord, Edge, EdgeKey, EdgeProvenance, Entity, Occurrence};
use crate::rename::detect_renames;
use crate::resolve::{resolve_identity, IdentityIndex, Resolution};
use crate::snapshot::{GraphHandle, GraphSnapshot};
use crate::store::{CommitAttempt, GraphStore};
use crate::write_set::{
    ArtifactChange, EdgeChange, EntityChange, GraphDelta, PreparedTransaction, ReadSet, WriteSet,
};

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub version: GraphVersion,
    pub delta: GraphDelta,
    pub attempts: u32,
    /// False when the changeset was a no-op and no version was produced.
    pub committed: bool,
}

impl UpdateOutcome {
    fn unchanged(version: GraphVersion, artifact: &str, attempts: u32) -> Self {
        let mut delta = GraphDelta::new(artifact);
        delta.version = version;
        Self {
            version,
            delta,
            attempts,
            committed: false,
        }
    }
}

pub struct IncrementalUpdater {
    store: Arc<GraphStore>,
    registry: Arc<TransformRegistry>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IncrementalUpdater {
    pub fn new(store: Arc<GraphStore>, registry: Arc<TransformRegistry>) -> Self {
        Self {
            store,
            registry,
            path_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock of `path` unless another call still holds or waits on it.
    fn release_path_lock(&self, path: &str) {
        self.path_locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Paths with a lock currently allocated.
    pub fn locked_paths(&self) -> usize {
        self.path_locks.len()
    }

    /// Applies one artifact's changeset as a single atomic transaction,
    /// reading from `base` first and from fresh snapshots on retry.
    #[instrument(skip_all, fields(artifact = %changeset.path))]
    pub async fn apply(
        &self,
        base: &GraphHandle,
        changeset: ArtifactChangeset,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        changeset.validate()?;
        let path = changeset.path.clone();
        let lock = self.path_lock(&path);
        let base = base.clone();
        let result = with_timeout(options.timeout, async move {
            let _guard = lock.lock().await;
            self.apply_locked(base, changeset).await
        })
        .await;
        self.release_path_lock(&path);
        result
    }

    /// Diffs a full extraction against the recorded facts of the artifact
    /// and applies the difference. An event without facts retracts the
    /// artifact.
    #[instrument(skip_all, fields(artifact = %event.path))]
    pub async fn apply_event(
        &self,
        event: ArtifactChangeEvent,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        event.validate()?;
        let path = event.path.clone();
        let lock = self.path_lock(&path);
        let result = with_timeout(options.timeout, async move {
            let _guard = lock.lock().await;
            let base = self.store.current();
            let changeset = changeset_for_event(&base, &event);
            debug!(
                removed = changeset.removed.len(),
                added = changeset.added.len(),
                "Diffed change event"
            );
            self.apply_locked(base, changeset).await
        })
        .await;
        self.release_path_lock(&path);
        result
    }

    async fn apply_locked(
        &self,
        mut base: GraphHandle,
        changeset: ArtifactChangeset,
    ) -> Result<UpdateOutcome> {
        let settings = self.store.settings().clone();
        let max_attempts = settings.max_update_retries;

        // The per-path lock makes the current record authoritative.
        let current = self.store.current();
        if base.artifact(&changeset.path) != current.artifact(&changeset.path) {
            base = current;
        }

        for attempt in 1..=max_attempts {
            self.store.ensure_writable()?;
            let Some(txn) = prepare(&base, &self.registry, &changeset, settings.rename_similarity_threshold)?
            else {
                debug!("Changeset is a no-op");
                return Ok(UpdateOutcome::unchanged(
                    base.version(),
                    &changeset.path,
                    attempt,
                ));
            };

            match self.store.commit(txn)? {
                CommitAttempt::Committed(record) => {
                    info!(
                        version = %record.version,
                        attempt,
                        touched = record.delta.touched_entities.len(),
                        renames = record.delta.renames.len(),
                        "Changeset committed"
                    );
                    return Ok(UpdateOutcome {
                        version: record.version,
                        delta: record.delta.clone(),
                        attempts: attempt,
                        committed: true,
                    });
                }
                CommitAttempt::Conflict { base: stale, head } => {
                    warn!(attempt, base = %stale, head = %head, "Update conflict, retrying");
                    if attempt < max_attempts {
                        let backoff = settings.retry_backoff_ms.saturating_mul(attempt as u64);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    base = self.store.current();
                }
            }
        }

        Err(ImpactGraphError::Conflict {
            path: changeset.path.clone(),
            attempts: max_attempts,
        })
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| ImpactGraphError::Timeout(limit))?,
        None => work.await,
    }
}

/// Changeset that turns the recorded facts of `event.path` into the event's.
pub fn changeset_for_event(base: &GraphSnapshot, event: &ArtifactChangeEvent) -> ArtifactChangeset {
    let recorded: BTreeSet<&Fact> = base
        .artifact(&event.path)
        .map(|r| r.facts.iter().collect())
        .unwrap_or_default();
    let incoming: BTreeSet<&Fact> = event.extracted_facts.iter().collect();

    ArtifactChangeset {
        path: event.path.clone(),
        content_hash: Some(event.content_hash.clone()),
        removed: recorded.difference(&incoming).map(|f| (*f).clone()).collect(),
        added: incoming.difference(&recorded).map(|f| (*f).clone()).collect(),
    }
}

/// Entities created inside the transaction, visible to later resolutions.
#[derive(Default)]
struct Pending {
    keys: BTreeMap<CanonicalKey, EntityId>,
    aliases: BTreeMap<AliasKey, BTreeSet<EntityId>>,
    entities: BTreeMap<EntityId, Entity>,
}

struct Overlay<'a> {
    base: &'a GraphSnapshot,
    pending: &'a Pending,
}

impl IdentityIndex for Overlay<'_> {
    fn by_key(&self, key: &CanonicalKey) -> Option<EntityId> {
        self.pending
            .keys
            .get(key)
            .copied()
            .or_else(|| self.base.by_key(key))
    }

    fn by_alias(&self, alias: &AliasKey, kind: EntityKind) -> BTreeSet<EntityId> {
        let mut ids = self.base.by_alias(alias, kind);
        if let Some(pending) = self.pending.aliases.get(alias) {
            ids.extend(pending.iter().filter(|id| {
                self.pending
                    .entities
                    .get(id)
                    .map(|e| e.kind == kind)
                    .unwrap_or(false)
            }));
        }
        ids
    }

    fn alias_keys_of(&self, id: EntityId) -> BTreeSet<AliasKey> {
        match self.pending.entities.get(&id) {
            Some(entity) => entity.alias_keys.clone(),
            None => self.base.alias_keys_of(id),
        }
    }
}

struct TransactionBuilder<'a> {
    base: &'a GraphSnapshot,
    registry: &'a TransformRegistry,
    path: &'a str,
    revision: String,
    reads: ReadSet,
    pending: Pending,
}

impl<'a> TransactionBuilder<'a> {
    fn resolve_or_create(&mut self, mention: &EntityRef) -> EntityId {
        let aliases = self.registry.alias_keys(mention);
        self.reads.keys.extend(aliases.iter().cloned());

        let resolution = resolve_identity(
            &Overlay {
                base: self.base,
                pending: &self.pending,
            },
            self.registry,
            mention,
        );
        if let Some(id) = resolution.id() {
            if matches!(resolution, Resolution::Alias(_)) {
                debug!(mention = %mention, entity = %id, "Merged by alias");
            }
            self.reads.entities.insert(id);
            return id;
        }

        let key = self.registry.canonical_key(mention);
        let mut entity = Entity::new(mention.kind, mention.name.clone(), key.clone());
        entity.alias_keys = aliases.into_iter().collect();
        let id = entity.id;
        for alias in &entity.alias_keys {
            self.pending.aliases.entry(alias.clone()).or_default().insert(id);
        }
        self.pending.keys.insert(key, id);
        self.pending.entities.insert(id, entity);
        id
    }

    fn entity_image(&self, id: EntityId) -> Result<Entity> {
        self.pending
            .entities
            .get(&id)
            .cloned()
            .or_else(|| self.base.entity(&id).cloned())
            .ok_or_else(|| {
                ImpactGraphError::Integrity(format!(
                    "'{}' is bound to unknown entity {}",
                    self.path, id
                ))
            })
    }

    fn alias_keys_for(&self, entity: &Entity) -> BTreeSet<AliasKey> {
        let mut keys: BTreeSet<AliasKey> = entity
            .occurrences
            .iter()
            .flat_map(|o| {
                self.registry
                    .alias_keys(&EntityRef::new(entity.kind, o.raw_name.clone()))
            })
            .collect();
        keys.insert(AliasKey::new(
            entity.kind.scope(),
            entity.canonical_key.key.clone(),
        ));
        keys
    }

    fn provenance_is_live(&self, prov: &EdgeProvenance) -> bool {
        self.base
            .artifact(prov.artifact())
            .map(|a| a.revision == prov.revision())
            .unwrap_or(false)
    }

    fn edge_provenance(&self, location: Location, confidence: Confidence) -> EdgeProvenance {
        EdgeProvenance {
            provenance: Provenance {
                artifact: self.path.to_string(),
                revision: self.revision.clone(),
                location,
            },
            confidence,
        }
    }
}

fn declared_refs(facts: &BTreeSet<Fact>) -> BTreeSet<EntityRef> {
    facts
        .iter()
        .filter_map(|f| match f {
            Fact::Declares { entity, .. } => Some(entity.clone()),
            Fact::Relates { .. } => None,
        })
        .collect()
}

/// Builds the write set for `changeset` against `base`. `None` means the
/// changeset changes nothing.
pub(crate) fn prepare(
    base: &GraphSnapshot,
    registry: &TransformRegistry,
    changeset: &ArtifactChangeset,
    rename_threshold: f64,
) -> Result<Option<PreparedTransaction>> {
    let path = changeset.path.as_str();
    let previous = base.artifact(path);
    let old_facts: BTreeSet<Fact> = previous.map(|r| r.facts.clone()).unwrap_or_default();

    for fact in &changeset.removed {
        if !old_facts.contains(fact) {
            return Err(ImpactGraphError::validation(format!(
                "'{}' does not assert {:?}",
                path, fact
            )));
        }
    }
    for fact in &changeset.added {
        if old_facts.contains(fact) {
            return Err(ImpactGraphError::validation(format!(
                "'{}' already asserts {:?}",
                path, fact
            )));
        }
    }

    let mut facts = old_facts.clone();
    for fact in &changeset.removed {
        facts.remove(fact);
    }
    facts.extend(changeset.added.iter().cloned());

    let revision = changeset
        .content_hash
        .clone()
        .unwrap_or_else(|| fact_digest(&facts));
    if changeset.is_empty() && previous.map_or(true, |r| r.revision == revision) {
        return Ok(None);
    }

    let mut tx = TransactionBuilder {
        base,
        registry,
        path,
        revision: revision.clone(),
        reads: ReadSet::new(path),
        pending: Pending::default(),
    };
    let mut delta = GraphDelta::new(path);

    // Identity: keep bindings of mentions that survive, resolve the rest.
    let old_bindings: BTreeMap<EntityRef, EntityId> =
        previous.map(|r| r.bindings.clone()).unwrap_or_default();
    let mentions: BTreeSet<EntityRef> = facts
        .iter()
        .flat_map(|f| f.entities())
        .cloned()
        .collect();
    let mut bindings: BTreeMap<EntityRef, EntityId> = old_bindings
        .iter()
        .filter(|(mention, _)| mentions.contains(*mention))
        .map(|(mention, id)| (mention.clone(), *id))
        .collect();
    tx.reads.entities.extend(old_bindings.values().copied());

    let renames = detect_renames(
        &changeset.removed,
        &changeset.added,
        &declared_refs(&old_facts),
        &declared_refs(&facts),
        rename_threshold,
    );
    let mut renamed: Vec<(EntityId, EntityId, Location)> = Vec::new();
    for candidate in renames {
        let Some(&old_id) = old_bindings.get(&candidate.from) else {
            continue;
        };
        let new_id = tx.resolve_or_create(&candidate.to);
        if new_id == old_id {
            continue;
        }
        debug!(
            from = %candidate.from,
            to = %candidate.to,
            similarity = candidate.similarity,
            "Rename detected"
        );
        bindings.insert(candidate.to.clone(), new_id);
        for bound in bindings.values_mut() {
            if *bound == old_id {
                *bound = new_id;
            }
        }
        renamed.push((old_id, new_id, candidate.location));
    }

    for mention in &mentions {
        if !bindings.contains_key(mention) {
            let id = tx.resolve_or_create(mention);
            bindings.insert(mention.clone(), id);
        }
    }

    // Occurrences of this artifact, per entity.
    let mut observed: BTreeMap<EntityId, BTreeSet<Occurrence>> = BTreeMap::new();
    for fact in &facts {
        for mention in fact.entities() {
            if let Some(id) = bindings.get(mention) {
                observed.entry(*id).or_default().insert(Occurrence {
                    artifact: path.to_string(),
                    location: fact.location(),
                    raw_name: mention.name.clone(),
                });
            }
        }
    }

    let mut affected: BTreeSet<EntityId> = old_bindings.values().copied().collect();
    affected.extend(bindings.values().copied());
    for (from, to, _) in &renamed {
        affected.insert(*from);
        affected.insert(*to);
    }

    let mut write_set = WriteSet::default();
    let mut images: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for id in &affected {
        let mut entity = tx.entity_image(*id)?;
        entity
            .occurrences
            .retain(|o| o.artifact != path && base.artifact(&o.artifact).is_some());
        entity
            .occurrences
            .extend(observed.remove(id).unwrap_or_default());
        if !entity.occurrences.is_empty() {
            entity.alias_keys = tx.alias_keys_for(&entity);
        }

        let before = base.entity(id);
        let created = before.is_none();
        let changed = before.map_or(true, |b| !b.same_content(&entity));
        if changed {
            delta.touched_entities.insert(*id);
            delta.touched_keys.extend(entity.alias_keys.iter().cloned());
            if let Some(b) = before {
                delta.touched_keys.extend(b.alias_keys.iter().cloned());
                match (b.is_live(), entity.occurrences.is_empty()) {
                    (true, true) => {
                        delta.tombstoned.insert(*id);
                    }
                    (false, false) => {
                        delta.revived.insert(*id);
                    }
                    _ => {}
                }
            } else {
                delta.created.insert(*id);
            }
            write_set.entities.push(EntityChange::Upsert {
                entity: entity.clone(),
                created,
            });
        }
        images.insert(*id, entity);
    }

    // Edges asserted by this artifact after the change.
    let mut asserted: BTreeMap<EdgeKey, BTreeSet<EdgeProvenance>> = BTreeMap::new();
    for fact in &facts {
        if let Fact::Relates {
            kind,
            source,
            target,
            location,
            confidence,
        } = fact
        {
            let (Some(&s), Some(&t)) = (bindings.get(source), bindings.get(target)) else {
                continue;
            };
            if s == t {
                debug!(source = %source, target = %target, "Relation collapsed onto one entity");
                continue;
            }
            asserted
                .entry(EdgeKey::new(s, *kind, t))
                .or_default()
                .insert(tx.edge_provenance(*location, *confidence));
        }
    }

    let mut existing: BTreeSet<EdgeKey> = BTreeSet::new();
    for id in &affected {
        for edge in base.outgoing(id).chain(base.incoming(id)) {
            if edge.asserted_by(path) {
                existing.insert(edge.key);
            }
        }
    }

    // Rename edges of this artifact survive while it has facts.
    if !facts.is_empty() {
        for key in existing.iter().filter(|k| k.kind == EdgeKind::RenamedTo) {
            if let Some(edge) = base.edge(key) {
                let carried: Vec<EdgeProvenance> = edge
                    .provenance
                    .iter()
                    .filter(|p| p.artifact() == path)
                    .map(|p| tx.edge_provenance(p.provenance.location, p.confidence))
                    .collect();
                asserted.entry(*key).or_default().extend(carried);
            }
        }
    }
    for (from, to, location) in &renamed {
        let reverse = EdgeKey::new(*to, EdgeKind::RenamedTo, *from);
        if asserted.remove(&reverse).is_some() {
            debug!(from = %from, to = %to, "Rename reverted");
        } else {
            asserted
                .entry(EdgeKey::new(*from, EdgeKind::RenamedTo, *to))
                .or_default()
                .insert(tx.edge_provenance(*location, Confidence::CERTAIN));
            delta.renames.push((*from, *to));
        }
    }

    let keys: BTreeSet<EdgeKey> = existing.iter().chain(asserted.keys()).copied().collect();
    for key in keys {
        tx.reads.entities.insert(key.source);
        tx.reads.entities.insert(key.target);

        let before = base.edge(&key);
        let mut provenance: BTreeSet<EdgeProvenance> = before
            .map(|e| {
                e.provenance
                    .iter()
                    .filter(|p| p.artifact() != path && tx.provenance_is_live(p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        provenance.extend(asserted.remove(&key).unwrap_or_default());

        match before {
            None if provenance.is_empty() => {}
            Some(old) if provenance.is_empty() => {
                delta.removed_edges.insert(key);
                delta.touched_entities.insert(key.source);
                delta.touched_entities.insert(key.target);
                write_set.edges.push(EdgeChange::Remove(old.clone()));
            }
            _ => {
                let mut edge = before.cloned().unwrap_or_else(|| Edge::new(key));
                edge.provenance = provenance;
                let created = before.is_none();
                if before.map_or(true, |b| !b.same_assertions(&edge)) {
                    delta.touched_entities.insert(key.source);
                    delta.touched_entities.insert(key.target);
                    if created {
                        delta.added_edges.insert(key);
                    }
                }
                if before.map_or(true, |b| b.provenance != edge.provenance) {
                    write_set.edges.push(EdgeChange::Upsert { edge, created });
                }
            }
        }
    }

    check_write_set(base, &images, &write_set, path, &revision)?;

    write_set.artifact = if facts.is_empty() {
        previous.map(|r| ArtifactChange::Remove(r.clone()))
    } else {
        Some(ArtifactChange::Upsert(ArtifactRecord {
            path: path.to_string(),
            revision: revision.clone(),
            facts,
            bindings,
            last_version: base.version(),
        }))
    };

    let TransactionBuilder { reads, .. } = tx;
    Ok(Some(PreparedTransaction {
        base_version: base.version(),
        artifact: path.to_string(),
        revision,
        removed_facts: changeset.removed.clone(),
        added_facts: changeset.added.clone(),
        write_set,
        reads,
        delta,
    }))
}

/// Transaction-level invariants; a violation aborts the transaction.
fn check_write_set(
    base: &GraphSnapshot,
    images: &BTreeMap<EntityId, Entity>,
    write_set: &WriteSet,
    path: &str,
    revision: &str,
) -> Result<()> {
    let live = |id: &EntityId| -> Option<bool> {
        match images.get(id) {
            Some(entity) => Some(!entity.occurrences.is_empty()),
            None => base.entity(id).map(Entity::is_live),
        }
    };

    for change in &write_set.edges {
        let EdgeChange::Upsert { edge, .. } = change else {
            continue;
        };
        for endpoint in [edge.source(), edge.target()] {
            match live(&endpoint) {
                None => {
                    return Err(ImpactGraphError::Integrity(format!(
                        "edge {} has no entity {}",
                        edge.key, endpoint
                    )))
                }
                Some(false) if edge.kind() != EdgeKind::RenamedTo => {
                    return Err(ImpactGraphError::Integrity(format!(
                        "edge {} would point at tombstoned {}",
                        edge.key, endpoint
                    )))
                }
                _ => {}
            }
        }
        if let Some(stale) = edge
            .provenance
            .iter()
            .find(|p| p.artifact() == path && p.revision() != revision)
        {
            return Err(ImpactGraphError::Integrity(format!(
                "edge {} cites stale revision {} of '{}'",
                edge.key,
                stale.revision(),
                path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactgraph_core::GraphSettings;

    fn updater(settings: GraphSettings) -> IncrementalUpdater {
        IncrementalUpdater::new(
            Arc::new(GraphStore::in_memory(settings)),
            Arc::new(TransformRegistry::default()),
        )
    }

    fn config_key(name: &str, line: u32) -> Fact {
        Fact::declares(EntityKind::ConfigKey, name, line)
    }

    #[tokio::test]
    async fn naming_variants_merge_into_one_entity() {
        let updater = updater(GraphSettings::default());
        let opts = UpdateOptions::default();
        for (path, name) in [
            ("application.yml", "database.url"),
            ("src/Db.java", "DATABASE_URL"),
            ("docs/setup.md", "${database-url}"),
        ] {
            let base = updater.store().current();
            updater
                .apply(
                    &base,
                    ArtifactChangeset::new(path, vec![], vec![config_key(name, 1)]),
                    &opts,
                )
                .await
                .unwrap();
        }

        let snapshot = updater.store().current();
        assert_eq!(snapshot.live_entity_count(), 1);
        let entity = snapshot.live_entities().next().unwrap();
        assert_eq!(entity.canonical_name, "database.url");
        assert_eq!(entity.artifacts().len(), 3);
        assert_eq!(entity.alias_set().len(), 3);
    }

    #[tokio::test]
    async fn different_kinds_never_merge() {
        let updater = updater(GraphSettings::default());
        let base = updater.store().current();
        updater
            .apply(
                &base,
                ArtifactChangeset::new(
                    "src/User.java",
                    vec![],
                    vec![
                        Fact::declares(EntityKind::Class, "User", 1),
                        Fact::declares(EntityKind::Field, "User", 2),
                    ],
                ),
                &UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(updater.store().current().live_entity_count(), 2);
    }

    #[tokio::test]
    async fn removing_unasserted_fact_is_a_validation_error() {
        let updater = updater(GraphSettings::default());
        let base = updater.store().current();
        let err = updater
            .apply(
                &base,
                ArtifactChangeset::new("app.yml", vec![config_key("db.url", 1)], vec![]),
                &UpdateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactGraphError::Validation(_)));
        assert_eq!(updater.store().version(), GraphVersion::ZERO);
    }

    #[tokio::test]
    async fn timeout_leaves_graph_unchanged() {
        let updater = updater(GraphSettings::default());
        let held = updater.path_lock("app.yml");
        let _guard = held.lock().await;

        let base = updater.store().current();
        let err = updater
            .apply(
                &base,
                ArtifactChangeset::new("app.yml", vec![], vec![config_key("db.url", 1)]),
                &UpdateOptions::with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactGraphError::Timeout(_)));
        assert_eq!(updater.store().version(), GraphVersion::ZERO);
        assert_eq!(updater.store().current().entity_count(), 0);
    }

    #[tokio::test]
    async fn overlapping_stale_transaction_exhausts_retries() {
        let updater = updater(GraphSettings {
            max_update_retries: 1,
            ..Default::default()
        });
        let stale = updater.store().current();
        let opts = UpdateOptions::default();

        updater
            .apply(
                &stale,
                ArtifactChangeset::new("app.yml", vec![], vec![config_key("db.url", 1)]),
                &opts,
            )
            .await
            .unwrap();

        let err = updater
            .apply(
                &stale,
                ArtifactChangeset::new("Db.java", vec![], vec![config_key("DB_URL", 9)]),
                &opts,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactGraphError::Conflict { attempts: 1, .. }));
        assert_eq!(updater.store().version(), GraphVersion(1));
    }

    #[tokio::test]
    async fn stale_transaction_on_disjoint_entities_commits() {
        let updater = updater(GraphSettings {
            max_update_retries: 1,
            ..Default::default()
        });
        let stale = updater.store().current();
        let opts = UpdateOptions::default();
        updater
            .apply(
                &stale,
                ArtifactChangeset::new("app.yml", vec![], vec![config_key("db.url", 1)]),
                &opts,
            )
            .await
            .unwrap();
        let outcome = updater
            .apply(
                &stale,
                ArtifactChangeset::new("cache.yml", vec![], vec![config_key("cache.ttl", 1)]),
                &opts,
            )
            .await
            .unwrap();
        assert_eq!(outcome.version, GraphVersion(2));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retraction_tombstones_and_redeclaration_revives() {
        let updater = updater(GraphSettings::default());
        let opts = UpdateOptions::default();
        let event = |facts| ArtifactChangeEvent::new("app.yml", "h", facts);

        updater
            .apply_event(event(vec![config_key("db.url", 1)]), &opts)
            .await
            .unwrap();
        let id = updater.store().current().live_entities().next().unwrap().id;

        let gone = updater.apply_event(event(vec![]), &opts).await.unwrap();
        assert!(gone.delta.tombstoned.contains(&id));
        let snapshot = updater.store().current();
        assert_eq!(snapshot.live_entity_count(), 0);
        assert!(snapshot.artifact("app.yml").is_none());

        let back = updater
            .apply_event(
                ArtifactChangeEvent::new("app.yml", "h2", vec![config_key("DB_URL", 3)]),
                &opts,
            )
            .await
            .unwrap();
        assert!(back.delta.revived.contains(&id));
        assert!(updater.store().current().live_entity(&id).is_some());
    }

    #[tokio::test]
    async fn identical_event_is_a_no_op() {
        let updater = updater(GraphSettings::default());
        let opts = UpdateOptions::default();
        let event = ArtifactChangeEvent::new("app.yml", "h", vec![config_key("db.url", 1)]);
        updater.apply_event(event.clone(), &opts).await.unwrap();
        let again = updater.apply_event(event, &opts).await.unwrap();
        assert!(!again.committed);
        assert_eq!(updater.store().version(), GraphVersion(1));
    }

    #[tokio::test]
    async fn path_locks_are_released_after_each_update() {
        let updater = updater(GraphSettings::default());
        let opts = UpdateOptions::default();
        for i in 0..50 {
            let path = format!("conf/{}.yml", i);
            updater
                .apply_event(
                    ArtifactChangeEvent::new(&path, "h", vec![config_key("db.url", 1)]),
                    &opts,
                )
                .await
                .unwrap();
            updater
                .apply_event(ArtifactChangeEvent::new(&path, "gone", vec![]), &opts)
                .await
                .unwrap();
        }
        assert_eq!(updater.locked_paths(), 0);

        let (first, second) = tokio::join!(
            updater.apply_event(
                ArtifactChangeEvent::new("app.yml", "a", vec![config_key("db.url", 1)]),
                &opts,
            ),
            updater.apply_event(
                ArtifactChangeEvent::new("app.yml", "b", vec![config_key("db.url", 2)]),
                &opts,
            ),
        );
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(updater.locked_paths(), 0);
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use impactgraph_cache::{CacheDependencies, CacheKey, CacheStats, QueryCache};
use impactgraph_core::{
    ArtifactChangeEvent, ArtifactChangeset, EntityId, EntityRef, GraphVersion, ImpactGraphError,
    MutationKind, QueryOptions, Result, Settings, TransformRegistry, UpdateOptions,
};
use impactgraph_graph::{
    ChangeRecord, GraphHandle, GraphStore, IncrementalUpdater, IntegrityReport, UpdateOutcome,
    VersionDiff,
};
use impactgraph_query::{
    ContextAssembler, ContextBundle, ContextRequest, ImpactAnalyzer, ImpactReport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::usage::{TracingUsageSink, UsageEvent, UsageSink};

/// Result of one event from [`ImpactGraph::ingest_stream`].
#[derive(Debug)]
pub struct IngestOutcome {
    pub path: String,
    pub result: Result<UpdateOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCacheStats {
    pub impact: CacheStats,
    pub bundles: CacheStats,
}

/// The dependency graph together with its query surface.
///
/// Both caches subscribe to the store, so a commit invalidates them before
/// its version becomes visible. A cached value is returned stamped with the
/// version of the reader that asked for it.
pub struct ImpactGraph {
    settings: Settings,
    updater: IncrementalUpdater,
    analyzer: ImpactAnalyzer,
    assembler: ContextAssembler,
    impact_cache: Arc<QueryCache<ImpactReport>>,
    bundle_cache: Arc<QueryCache<ContextBundle>>,
    usage: Arc<dyn UsageSink>,
}

impl ImpactGraph {
    /// Opens the graph in memory, or from `storage.data_dir` when set.
    pub fn open(settings: Settings) -> Result<Self> {
        Self::open_with_registry(settings, TransformRegistry::default())
    }

    pub fn open_with_registry(settings: Settings, registry: TransformRegistry) -> Result<Self> {
        settings.validate()?;
        let store = GraphStore::open(settings.graph.clone(), &settings.storage)?;
        let impact_cache = Arc::new(QueryCache::new(&settings.cache));
        let bundle_cache = Arc::new(QueryCache::new(&settings.cache));
        store.subscribe(impact_cache.clone());
        store.subscribe(bundle_cache.clone());
        info!(
            version = %store.version(),
            persistent = settings.storage.data_dir.is_some(),
            "ImpactGraph opened"
        );
        Ok(Self {
            updater: IncrementalUpdater::new(Arc::new(store), Arc::new(registry)),
            analyzer: ImpactAnalyzer::new(settings.impact.clone()),
            assembler: ContextAssembler::new(settings.context.clone()),
            impact_cache,
            bundle_cache,
            usage: Arc::new(TracingUsageSink),
            settings,
        })
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = sink;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        self.updater.store()
    }

    pub fn registry(&self) -> &TransformRegistry {
        self.updater.registry()
    }

    pub fn current(&self) -> GraphHandle {
        self.store().current()
    }

    pub fn pin(&self, version: GraphVersion) -> Result<GraphHandle> {
        self.store().pin(version)
    }

    /// Applies a changeset read against `base`.
    pub async fn apply_at(
        &self,
        base: &GraphHandle,
        changeset: ArtifactChangeset,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        self.updater.apply(base, changeset, options).await
    }

    pub async fn apply(
        &self,
        changeset: ArtifactChangeset,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let base = self.current();
        self.apply_at(&base, changeset, options).await
    }

    /// Applies a full extraction of one artifact.
    pub async fn ingest(
        &self,
        event: ArtifactChangeEvent,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        self.updater.apply_event(event, options).await
    }

    /// Applies a stream of change events. Events of one path are applied in
    /// stream order; up to `concurrency` paths progress at once. Outcomes are
    /// returned in stream order and one failed event does not stop the rest.
    pub async fn ingest_stream<S>(
        &self,
        events: S,
        concurrency: usize,
        options: &UpdateOptions,
    ) -> Vec<IngestOutcome>
    where
        S: Stream<Item = ArtifactChangeEvent>,
    {
        let mut chunks = pin!(events.chunks(concurrency.max(1)));
        let mut outcomes = Vec::new();
        while let Some(chunk) = chunks.next().await {
            let base = outcomes.len();
            let mut by_path: BTreeMap<String, Vec<(usize, ArtifactChangeEvent)>> = BTreeMap::new();
            for (offset, event) in chunk.into_iter().enumerate() {
                by_path
                    .entry(event.path.clone())
                    .or_default()
                    .push((base + offset, event));
            }

            let groups = by_path.into_values().map(|group| async move {
                let mut results = Vec::with_capacity(group.len());
                for (index, event) in group {
                    let path = event.path.clone();
                    let result = self.ingest(event, options).await;
                    if let Err(e) = &result {
                        warn!(path = %path, "Change event failed: {}", e);
                    }
                    results.push((index, IngestOutcome { path, result }));
                }
                results
            });
            let mut finished: Vec<(usize, IngestOutcome)> =
                join_all(groups).await.into_iter().flatten().collect();
            finished.sort_by_key(|(index, _)| *index);
            outcomes.extend(finished.into_iter().map(|(_, outcome)| outcome));
        }
        debug!(events = outcomes.len(), "Change stream drained");
        outcomes
    }

    /// Impact of mutating the entity `entity` names, at the current version.
    pub fn analyze_impact(
        &self,
        entity: &EntityRef,
        mutation: MutationKind,
        options: &QueryOptions,
    ) -> Result<ImpactReport> {
        let handle = self.current();
        self.analyze_impact_at(&handle, entity, mutation, options)
    }

    pub fn analyze_impact_at(
        &self,
        handle: &GraphHandle,
        entity: &EntityRef,
        mutation: MutationKind,
        options: &QueryOptions,
    ) -> Result<ImpactReport> {
        let id = handle
            .resolve(self.registry(), entity)
            .ok_or_else(|| ImpactGraphError::not_found(format!("entity {}", entity)))?;
        self.analyze_entity_at(handle, id, mutation, options)
    }

    #[instrument(skip(self, handle, options), fields(version = %handle.version()))]
    pub fn analyze_entity_at(
        &self,
        handle: &GraphHandle,
        id: EntityId,
        mutation: MutationKind,
        options: &QueryOptions,
    ) -> Result<ImpactReport> {
        let key = CacheKey::Impact {
            entity: id,
            mutation,
        };
        if let Some(mut report) = self.impact_cache.get(&key, handle.version()) {
            report.version = handle.version();
            return Ok(report);
        }
        let report = self.analyzer.analyze(handle, id, mutation, options)?;
        let mut entities = report.visited.clone();
        entities.insert(id);
        self.impact_cache.put(
            key,
            handle.version(),
            report.clone(),
            CacheDependencies::new(entities, BTreeSet::new()),
        );
        Ok(report)
    }

    pub async fn assemble_context(
        &self,
        request: &ContextRequest,
        options: &QueryOptions,
    ) -> Result<ContextBundle> {
        let handle = self.current();
        self.assemble_context_at(&handle, request, options).await
    }

    #[instrument(skip(self, handle, request, options), fields(version = %handle.version()))]
    pub async fn assemble_context_at(
        &self,
        handle: &GraphHandle,
        request: &ContextRequest,
        options: &QueryOptions,
    ) -> Result<ContextBundle> {
        let started = Instant::now();
        let key = CacheKey::Bundle(request.signature().to_string());

        let (bundle, cache_hit) = match self.bundle_cache.get(&key, handle.version()) {
            Some(mut bundle) => {
                bundle.version = handle.version();
                (bundle, true)
            }
            None => {
                let assembly = self
                    .assembler
                    .assemble(handle, self.registry(), request, options)?;
                self.bundle_cache.put(
                    key,
                    handle.version(),
                    assembly.bundle.clone(),
                    CacheDependencies::new(assembly.visited, assembly.probed_keys),
                );
                (assembly.bundle, false)
            }
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let event = UsageEvent::from_bundle(&bundle, cache_hit, elapsed_ms);
        if let Err(e) = self.usage.record(event).await {
            warn!("Usage sink rejected event: {}", e);
        }
        Ok(bundle)
    }

    /// Writes a checkpoint. Returns false for in-memory graphs.
    pub fn checkpoint(&self) -> Result<bool> {
        self.store().checkpoint()
    }

    pub fn verify(&self) -> IntegrityReport {
        self.store().verify()
    }

    /// Rebuilds the graph from the change log and lifts a write halt. The
    /// caches are emptied before the rebuilt snapshot is published.
    pub fn repair(&self) -> Result<GraphVersion> {
        self.store().repair()
    }

    pub fn audit_between(
        &self,
        from: GraphVersion,
        to: GraphVersion,
    ) -> Result<(Vec<ChangeRecord>, VersionDiff)> {
        self.store().audit_between(from, to)
    }

    pub fn cache_stats(&self) -> EngineCacheStats {
        EngineCacheStats {
            impact: self.impact_cache.stats(),
            bundles: self.bundle_cache.stats(),
        }
    }
}

use std::sync::Arc;

use impactgraph_core::{
    ArtifactChangeEvent, CancellationToken, ContextSettings, EdgeKind, EntityId, EntityKind,
    EntityRef, Fact, GraphSettings, ImpactGraphError, QueryOptions, TransformRegistry,
    UpdateOptions,
};
use impactgraph_graph::{GraphStore, IncrementalUpdater};
use impactgraph_query::{ContextAssembler, ContextRequest, Domain, QueryIntent};
use tokio_test::block_on;

fn ingest(updater: &IncrementalUpdater, path: &str, facts: Vec<Fact>) {
    block_on(updater.apply_event(
        ArtifactChangeEvent::new(path, "rev-1", facts),
        &UpdateOptions::default(),
    ))
    .unwrap();
}

fn scenario() -> IncrementalUpdater {
    let updater = IncrementalUpdater::new(
        Arc::new(GraphStore::in_memory(GraphSettings::default())),
        Arc::new(TransformRegistry::default()),
    );
    ingest(
        &updater,
        "config/application.yml",
        vec![Fact::declares(EntityKind::ConfigKey, "database.url", 3)],
    );
    ingest(
        &updater,
        "src/Db.java",
        vec![
            Fact::declares(EntityKind::Method, "Db.connect", 10),
            Fact::relates(
                EdgeKind::References,
                EntityRef::new(EntityKind::Method, "Db.connect"),
                EntityRef::new(EntityKind::ConfigKey, "DATABASE_URL"),
                11,
            ),
        ],
    );
    ingest(
        &updater,
        "docs/setup.md",
        vec![
            Fact::declares(EntityKind::Document, "docs/setup.md", 1),
            Fact::relates(
                EdgeKind::Documents,
                EntityRef::new(EntityKind::Document, "docs/setup.md"),
                EntityRef::new(EntityKind::ConfigKey, "database.url"),
                7,
            ),
        ],
    );
    ingest(
        &updater,
        "test/DbTest.java",
        vec![
            Fact::declares(EntityKind::TestCase, "DbTest.connects", 4),
            Fact::relates(
                EdgeKind::Tests,
                EntityRef::new(EntityKind::TestCase, "DbTest.connects"),
                EntityRef::new(EntityKind::Method, "Db.connect"),
                5,
            ),
        ],
    );
    updater
}

fn assembler() -> ContextAssembler {
    ContextAssembler::new(ContextSettings::default())
}

#[test]
fn seeds_are_inferred_from_query_terms() {
    let updater = scenario();
    let snapshot = updater.store().current();

    let assembly = assembler()
        .assemble(
            &snapshot,
            updater.registry(),
            &ContextRequest::new("how is database.url used", 4096),
            &QueryOptions::default(),
        )
        .unwrap();
    let bundle = &assembly.bundle;

    assert_eq!(bundle.intent, QueryIntent::Question);
    assert_eq!(bundle.version, snapshot.version());
    assert_eq!(assembly.seeds.len(), 1);
    assert!(bundle
        .core_layer
        .lines
        .iter()
        .any(|l| l.starts_with("Seed") && l.contains("database.url")));

    let code = bundle.layer(Domain::Code).unwrap();
    assert_eq!(code.items[0].canonical_name, "Db.connect");
    let docs = bundle.layer(Domain::Documentation).unwrap();
    assert_eq!(docs.items[0].canonical_name, "docs/setup.md");
    // Testing is not a question domain, so the test case stays out.
    assert!(bundle.layer(Domain::Testing).is_none());
    assert!(bundle
        .tool_descriptors
        .iter()
        .all(|t| bundle.domains.contains(&t.domain)));
    assert!(!bundle.truncated);
    assert!(bundle.total_size <= bundle.budget);
    assert!(!assembly.probed_keys.is_empty());
}

#[test]
fn same_version_gives_byte_identical_bundles() {
    let updater = scenario();
    let snapshot = updater.store().current();
    let request = ContextRequest::new("what breaks if database.url changes", 4096);

    let first = assembler()
        .assemble(&snapshot, updater.registry(), &request, &QueryOptions::default())
        .unwrap();
    let second = assembler()
        .assemble(&snapshot, updater.registry(), &request, &QueryOptions::default())
        .unwrap();
    assert_eq!(
        first.bundle.to_json_bytes().unwrap(),
        second.bundle.to_json_bytes().unwrap()
    );
    assert_eq!(first.bundle.intent, QueryIntent::ImpactAnalysis);
    assert!(first.bundle.layer(Domain::Testing).is_some());
}

#[test]
fn budget_smaller_than_core_layer_fails() {
    let updater = scenario();
    let result = assembler().assemble(
        &updater.store().current(),
        updater.registry(),
        &ContextRequest::new("how is database.url used", 5),
        &QueryOptions::default(),
    );
    match result {
        Err(ImpactGraphError::BudgetExceeded { core_size, budget }) => {
            assert_eq!(budget, 5);
            assert!(core_size > 5);
        }
        other => panic!("expected BudgetExceeded, got {:?}", other.map(|a| a.bundle)),
    }
}

#[test]
fn tight_budget_trims_but_keeps_the_core_layer() {
    let updater = scenario();
    let snapshot = updater.store().current();
    let query = "what breaks if database.url changes";

    let full = assembler()
        .assemble(
            &snapshot,
            updater.registry(),
            &ContextRequest::new(query, 4096),
            &QueryOptions::default(),
        )
        .unwrap()
        .bundle;
    let budget = full.core_layer.size + 20;
    assert!(full.total_size > budget);

    let tight = assembler()
        .assemble(
            &snapshot,
            updater.registry(),
            &ContextRequest::new(query, budget),
            &QueryOptions::default(),
        )
        .unwrap()
        .bundle;
    assert!(tight.truncated);
    assert!(tight.total_size <= budget);
    assert_eq!(tight.core_layer, full.core_layer);
    assert!(tight.item_count() + tight.tool_descriptors.len()
        < full.item_count() + full.tool_descriptors.len());
}

#[test]
fn focal_entities_must_be_live() {
    let updater = scenario();
    let result = assembler().assemble(
        &updater.store().current(),
        updater.registry(),
        &ContextRequest::new("explain this", 4096).with_focal([EntityId::new()]),
        &QueryOptions::default(),
    );
    assert!(matches!(result, Err(ImpactGraphError::NotFound(_))));
}

#[test]
fn focal_entity_kinds_add_their_domain() {
    let updater = scenario();
    let snapshot = updater.store().current();
    let test_case = snapshot
        .resolve(
            updater.registry(),
            &EntityRef::new(EntityKind::TestCase, "DbTest.connects"),
        )
        .unwrap();

    let bundle = assembler()
        .assemble(
            &snapshot,
            updater.registry(),
            &ContextRequest::new("explain this", 4096).with_focal([test_case]),
            &QueryOptions::default(),
        )
        .unwrap()
        .bundle;
    assert!(bundle.domains.contains(&Domain::Testing));
    assert_eq!(
        bundle.layer(Domain::Code).unwrap().items[0].canonical_name,
        "Db.connect"
    );
}

#[test]
fn cancellation_is_reported_and_nothing_is_returned() {
    let updater = scenario();
    let token = CancellationToken::new();
    token.cancel();
    let result = assembler().assemble(
        &updater.store().current(),
        updater.registry(),
        &ContextRequest::new("how is database.url used", 4096),
        &QueryOptions::default().with_cancel(token),
    );
    assert!(matches!(result, Err(ImpactGraphError::Cancelled)));
}

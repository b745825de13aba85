use std::collections::BTreeSet;
use std::sync::Arc;

use impactgraph_core::{
    ArtifactChangeEvent, EntityKind, Fact, GraphSettings, GraphVersion, StorageSettings,
    TransformRegistry, UpdateOptions,
};
use impactgraph_graph::{GraphStore, IncrementalUpdater};
use tempfile::tempdir;

fn storage(dir: &std::path::Path, checkpoint_every: u64) -> StorageSettings {
    StorageSettings {
        data_dir: Some(dir.to_path_buf()),
        checkpoint_every,
    }
}

async fn ingest(store: Arc<GraphStore>, events: Vec<ArtifactChangeEvent>) {
    let updater = IncrementalUpdater::new(store, Arc::new(TransformRegistry::default()));
    for event in events {
        updater
            .apply_event(event, &UpdateOptions::default())
            .await
            .unwrap();
    }
}

fn events() -> Vec<ArtifactChangeEvent> {
    vec![
        ArtifactChangeEvent::new(
            "application.yml",
            "a1",
            vec![Fact::declares(EntityKind::ConfigKey, "database.url", 3)],
        ),
        ArtifactChangeEvent::new(
            "src/Db.java",
            "b1",
            vec![Fact::declares(EntityKind::ConfigKey, "DATABASE_URL", 8)],
        ),
        ArtifactChangeEvent::new(
            "docs/setup.md",
            "c1",
            vec![
                Fact::declares(EntityKind::Document, "docs/setup.md", 1),
                Fact::declares(EntityKind::ConfigKey, "${database.url}", 14),
            ],
        ),
    ]
}

#[tokio::test]
async fn reopen_replays_log_after_checkpoint() {
    let dir = tempdir().unwrap();
    let store = Arc::new(GraphStore::open(GraphSettings::default(), &storage(dir.path(), 2)).unwrap());
    ingest(store.clone(), events()).await;
    let ids: BTreeSet<_> = store.current().entities().map(|e| e.id).collect();
    assert_eq!(store.version(), GraphVersion(3));
    drop(store);

    assert!(dir.path().join("snapshot.bin").exists());
    let reopened = GraphStore::open(GraphSettings::default(), &storage(dir.path(), 2)).unwrap();
    assert_eq!(reopened.version(), GraphVersion(3));
    assert!(!reopened.is_halted());
    let reopened_ids: BTreeSet<_> = reopened.current().entities().map(|e| e.id).collect();
    assert_eq!(ids, reopened_ids);
    assert_eq!(reopened.current().live_entity_count(), 2);
}

#[tokio::test]
async fn reopen_without_checkpoint_replays_everything() {
    let dir = tempdir().unwrap();
    let store = Arc::new(GraphStore::open(GraphSettings::default(), &storage(dir.path(), 0)).unwrap());
    ingest(store.clone(), events()).await;
    drop(store);

    assert!(!dir.path().join("snapshot.bin").exists());
    let reopened = GraphStore::open(GraphSettings::default(), &storage(dir.path(), 0)).unwrap();
    assert_eq!(reopened.version(), GraphVersion(3));
    assert!(reopened.verify().is_clean());

    let (records, _) = reopened
        .audit_between(GraphVersion(1), GraphVersion(3))
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn writes_continue_after_reopen() {
    let dir = tempdir().unwrap();
    {
        let store =
            Arc::new(GraphStore::open(GraphSettings::default(), &storage(dir.path(), 2)).unwrap());
        ingest(store, events()).await;
    }
    let store = Arc::new(GraphStore::open(GraphSettings::default(), &storage(dir.path(), 2)).unwrap());
    ingest(
        store.clone(),
        vec![ArtifactChangeEvent::new("src/Db.java", "b2", vec![])],
    )
    .await;
    assert_eq!(store.version(), GraphVersion(4));
    assert!(store.checkpoint().unwrap());

    let reopened = GraphStore::open(GraphSettings::default(), &storage(dir.path(), 2)).unwrap();
    assert_eq!(reopened.version(), GraphVersion(4));
    assert!(reopened.current().artifact("src/Db.java").is_none());
}

#[tokio::test]
async fn repair_drops_a_torn_log_tail_and_keeps_appending() {
    use std::io::Write;

    let dir = tempdir().unwrap();
    let store = Arc::new(GraphStore::open(GraphSettings::default(), &storage(dir.path(), 0)).unwrap());
    ingest(store.clone(), events()).await;

    let log_path = dir.path().join("changelog.jsonl");
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .unwrap();
    log.write_all(br#"{"version":4,"base_ver"#).unwrap();
    drop(log);

    assert_eq!(store.repair().unwrap(), GraphVersion(3));
    ingest(
        store.clone(),
        vec![ArtifactChangeEvent::new("src/Db.java", "b2", vec![])],
    )
    .await;
    assert_eq!(store.version(), GraphVersion(4));
    drop(store);

    let reopened = GraphStore::open(GraphSettings::default(), &storage(dir.path(), 0)).unwrap();
    assert_eq!(reopened.version(), GraphVersion(4));
    assert!(!reopened.is_halted());
}

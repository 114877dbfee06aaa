use actor_index::{
    ActorKey, FileStateStore, HashIndex, IndexBucketRef, IndexError, IndexMetadata, IndexStatus,
    IndexValue, InMemoryStateStore, MemberUpdate, SiloId, StateStore, UpdateMode,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;

fn metadata(unique: bool, capacity: usize) -> IndexMetadata {
    IndexMetadata {
        index_name: "by_name".to_string(),
        interface_name: "IPlayer".to_string(),
        actor_type: "Player".to_string(),
        unique,
        bucket_capacity: capacity,
    }
}

fn keys(keys: &[&str]) -> BTreeSet<ActorKey> {
    keys.iter().map(|key| ActorKey::new(*key)).collect()
}

async fn insert(index: &HashIndex, actor: &str, key: &str) -> actor_index::Result<bool> {
    let metadata = index.metadata().clone();
    index
        .apply_index_update(
            &ActorKey::new(actor),
            MemberUpdate::insert(key, UpdateMode::NonTentative),
            metadata.unique,
            &metadata,
            &SiloId::new("s1"),
        )
        .await
}

async fn apply(index: &HashIndex, actor: &str, update: MemberUpdate) -> actor_index::Result<bool> {
    let metadata = index.metadata().clone();
    index
        .apply_index_update(
            &ActorKey::new(actor),
            update,
            metadata.unique,
            &metadata,
            &SiloId::new("s1"),
        )
        .await
}

async fn chained_index(unique: bool, capacity: usize) -> HashIndex {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(unique, capacity), store).await.unwrap();
    insert(&index, "a", "k1").await.unwrap();
    insert(&index, "b", "k2").await.unwrap();
    insert(&index, "c", "k3").await.unwrap();
    index
}

#[tokio::test]
async fn full_buckets_chain_and_lookups_follow_the_chain() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(false, 2), store).await.unwrap();

    insert(&index, "p1", "alice").await.unwrap();
    insert(&index, "p2", "bob").await.unwrap();
    insert(&index, "p3", "carol").await.unwrap();
    insert(&index, "p4", "alice").await.unwrap();

    assert_eq!(index.bucket_count().await.unwrap(), 2);
    assert_eq!(
        index.lookup(&IndexValue::from("alice")).await.unwrap(),
        keys(&["p1", "p4"])
    );
    assert_eq!(
        index.lookup(&IndexValue::from("carol")).await.unwrap(),
        keys(&["p3"])
    );

    let metadata = index.metadata().clone();
    index
        .apply_index_update(
            &ActorKey::new("p3"),
            MemberUpdate::delete("carol", UpdateMode::NonTentative),
            false,
            &metadata,
            &SiloId::new("s1"),
        )
        .await
        .unwrap();
    assert!(index.lookup(&IndexValue::from("carol")).await.unwrap().is_empty());
}

#[tokio::test]
async fn unique_chain_rejects_a_second_holder_in_a_later_bucket() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(true, 1), store).await.unwrap();

    insert(&index, "p1", "alice").await.unwrap();
    insert(&index, "p2", "bob").await.unwrap();
    let err = insert(&index, "p3", "bob").await.unwrap_err();

    assert!(matches!(err, IndexError::UniquenessConstraintViolated { .. }));
    assert_eq!(
        index.lookup(&IndexValue::from("bob")).await.unwrap(),
        keys(&["p2"])
    );
}

#[tokio::test]
async fn batch_reports_rejections_and_keeps_applying() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(true, 16), store).await.unwrap();
    insert(&index, "p1", "alice").await.unwrap();

    let mut updates = BTreeMap::new();
    updates.insert(
        ActorKey::new("p2"),
        vec![MemberUpdate::insert("alice", UpdateMode::NonTentative)],
    );
    updates.insert(
        ActorKey::new("p3"),
        vec![MemberUpdate::insert("carol", UpdateMode::NonTentative)],
    );
    let metadata = index.metadata().clone();
    let all_applied = index
        .apply_index_update_batch("by_name", updates, true, &metadata, &SiloId::new("s1"))
        .await
        .unwrap();

    assert!(!all_applied);
    assert_eq!(
        index.lookup(&IndexValue::from("alice")).await.unwrap(),
        keys(&["p1"])
    );
    assert_eq!(
        index.lookup(&IndexValue::from("carol")).await.unwrap(),
        keys(&["p3"])
    );

    let wrong_index = index
        .apply_index_update_batch(
            "by_level",
            BTreeMap::new(),
            false,
            &metadata,
            &SiloId::new("s1"),
        )
        .await;
    assert!(matches!(wrong_index, Err(IndexError::IndexNotFound(_))));
}

#[tokio::test]
async fn tentative_reservation_is_invisible_until_confirmed() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(true, 16), store).await.unwrap();
    let metadata = index.metadata().clone();
    let p1 = ActorKey::new("p1");
    let s1 = SiloId::new("s1");

    index
        .apply_index_update(
            &p1,
            MemberUpdate::insert("alice", UpdateMode::Tentative),
            true,
            &metadata,
            &s1,
        )
        .await
        .unwrap();
    assert!(index.lookup(&IndexValue::from("alice")).await.unwrap().is_empty());
    assert!(insert(&index, "p2", "alice").await.is_err());

    index
        .apply_index_update(
            &p1,
            MemberUpdate::insert("alice", UpdateMode::NonTentative),
            true,
            &metadata,
            &s1,
        )
        .await
        .unwrap();
    assert_eq!(
        index.lookup(&IndexValue::from("alice")).await.unwrap(),
        keys(&["p1"])
    );
}

#[tokio::test]
async fn file_backed_index_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
        let index = HashIndex::open(metadata(false, 1), store).await.unwrap();
        insert(&index, "p1", "alice").await.unwrap();
        insert(&index, "p2", "bob").await.unwrap();
    }

    let file_store = FileStateStore::new(dir.path());
    assert_eq!(file_store.root(), dir.path());
    let store: Arc<dyn StateStore> = Arc::new(file_store);
    let reopened = HashIndex::open(metadata(false, 1), store).await.unwrap();
    assert_eq!(reopened.bucket_count().await.unwrap(), 2);
    assert_eq!(
        reopened.lookup(&IndexValue::from("bob")).await.unwrap(),
        keys(&["p2"])
    );
    assert!(dir.path().join("index-bucket").join("by_name").join("1.json").exists());
}

#[tokio::test]
async fn builder_cannot_resurrect_values_deleted_during_construction() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(false, 16), store).await.unwrap();
    let metadata = index.metadata().clone();
    let p1 = ActorKey::new("p1");
    insert(&index, "p1", "alice").await.unwrap();

    index.begin_construction().await.unwrap();
    assert_eq!(index.status().await, IndexStatus::UnderConstruction);

    index
        .apply_index_update(
            &p1,
            MemberUpdate::delete("alice", UpdateMode::NonTentative),
            false,
            &metadata,
            &SiloId::new("s1"),
        )
        .await
        .unwrap();

    let resurrected = index
        .insert_during_construction(&p1, IndexValue::from("alice"))
        .await
        .unwrap();
    assert!(!resurrected);
    let built = index
        .insert_during_construction(&ActorKey::new("p2"), IndexValue::from("bob"))
        .await
        .unwrap();
    assert!(built);

    index.mark_available().await.unwrap();
    assert_eq!(index.status().await, IndexStatus::Available);
    assert!(index.lookup(&IndexValue::from("alice")).await.unwrap().is_empty());
    assert_eq!(
        index.lookup(&IndexValue::from("bob")).await.unwrap(),
        keys(&["p2"])
    );
}

#[tokio::test]
async fn unique_update_onto_a_key_in_a_later_bucket_is_rejected() {
    let index = chained_index(true, 2).await;
    assert_eq!(index.bucket_count().await.unwrap(), 2);

    let moved = MemberUpdate::update("k1", "k3", UpdateMode::NonTentative);
    let err = apply(&index, "a", moved).await.unwrap_err();

    assert!(matches!(err, IndexError::UniquenessConstraintViolated { .. }));
    assert_eq!(
        index.lookup(&IndexValue::from("k3")).await.unwrap(),
        keys(&["c"])
    );
    assert_eq!(
        index.lookup(&IndexValue::from("k1")).await.unwrap(),
        keys(&["a"])
    );
}

#[tokio::test]
async fn replayed_updates_across_buckets_are_idempotent() {
    let once = chained_index(false, 2).await;
    let twice = chained_index(false, 2).await;
    let moved = MemberUpdate::update("k1", "k4", UpdateMode::NonTentative);

    apply(&once, "a", moved.clone()).await.unwrap();
    apply(&twice, "a", moved.clone()).await.unwrap();
    apply(&twice, "a", moved).await.unwrap();

    assert_eq!(once.snapshot().await.unwrap(), twice.snapshot().await.unwrap());
    assert_eq!(
        twice.lookup(&IndexValue::from("k4")).await.unwrap(),
        keys(&["a"])
    );

    apply(&twice, "a", MemberUpdate::delete("k4", UpdateMode::NonTentative))
        .await
        .unwrap();
    let k4 = IndexValue::from("k4");
    assert!(twice.lookup(&k4).await.unwrap().is_empty());
    let buckets = twice.snapshot().await.unwrap();
    assert!(buckets.iter().all(|bucket| bucket.entry(&k4).is_none()));
}

#[tokio::test]
async fn tentative_update_across_buckets_can_be_reversed() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let index = HashIndex::open(metadata(true, 1), store).await.unwrap();
    insert(&index, "a", "k1").await.unwrap();
    insert(&index, "b", "k2").await.unwrap();

    let reserved = MemberUpdate::update("k1", "k3", UpdateMode::Tentative);
    apply(&index, "a", reserved.clone()).await.unwrap();
    assert_eq!(index.bucket_count().await.unwrap(), 3);
    assert_eq!(
        index.lookup(&IndexValue::from("k1")).await.unwrap(),
        keys(&["a"])
    );
    assert!(index.lookup(&IndexValue::from("k3")).await.unwrap().is_empty());
    assert!(insert(&index, "b", "k3").await.is_err());

    apply(&index, "a", reserved.reversed_tentative()).await.unwrap();
    let buckets = index.snapshot().await.unwrap();
    let k1 = buckets[0].entry(&IndexValue::from("k1")).unwrap();
    assert!(!k1.is_tentative());
    assert!(buckets[2].is_empty());

    insert(&index, "b", "k3").await.unwrap();
    assert_eq!(
        index.lookup(&IndexValue::from("k3")).await.unwrap(),
        keys(&["b"])
    );
}

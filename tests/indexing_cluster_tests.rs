use actor_index::{
    ActorKey, ActorTypeDefinition, ConsistencyScheme, IndexBucketRef, IndexDefinition, IndexError,
    IndexValue, IndexedActor, IndexedActorRef, IndexedActorState, IndexedInterfaceDefinition,
    IndexingCluster, IndexingConfig, InMemoryStateStore, MemberUpdate, PropertyChange, SiloId,
    StateStore, UpdateMode, WorkflowQueueEntry, WorkflowRecord, WorkflowRetryPolicy,
};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn player(scheme: ConsistencyScheme, eager: bool) -> ActorTypeDefinition {
    let mode = |idx: IndexDefinition| if eager { idx.eager() } else { idx };
    ActorTypeDefinition::new("Player", scheme).with_interface(
        IndexedInterfaceDefinition::new("IPlayer")
            .with_index(mode(IndexDefinition::new("by_name", "name").unique()))
            .with_index(mode(IndexDefinition::new("by_level", "level"))),
    )
}

fn config() -> IndexingConfig {
    IndexingConfig::default().with_retry(WorkflowRetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    })
}

async fn cluster_with(
    actor_type: ActorTypeDefinition,
    silos: &[&str],
    store: Arc<InMemoryStateStore>,
) -> IndexingCluster {
    let cluster = IndexingCluster::new(config(), store).unwrap();
    cluster.register_actor_type(actor_type).await.unwrap();
    for silo in silos {
        cluster.add_silo(*silo).await.unwrap();
    }
    cluster
}

async fn cluster(actor_type: ActorTypeDefinition, silos: &[&str]) -> IndexingCluster {
    cluster_with(actor_type, silos, Arc::new(InMemoryStateStore::new())).await
}

fn keys(keys: &[&str]) -> BTreeSet<ActorKey> {
    keys.iter().map(|key| ActorKey::new(*key)).collect()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn active_set_drains(actor: &IndexedActor) {
    for _ in 0..400 {
        if actor.get_active_workflow_ids().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("active workflows of {} never drained", actor.key());
}

async fn settle(cluster: &IndexingCluster) {
    tokio::time::timeout(Duration::from_secs(5), cluster.wait_for_quiescence())
        .await
        .expect("queues should drain");
}

#[tokio::test]
async fn lazy_insert_is_drained_and_active_set_pruned() {
    let cluster = cluster(player(ConsistencyScheme::FaultTolerantWorkflow, false), &["s1"]).await;
    let p1 = cluster.actor("Player", "p1").await.unwrap();

    p1.set_property("name", "alice").await.unwrap();
    settle(&cluster).await;

    assert_eq!(cluster.lookup("by_name", "alice").await.unwrap(), keys(&["p1"]));
    active_set_drains(&p1).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn lazy_updates_move_the_actor_between_keys() {
    let cluster = cluster(player(ConsistencyScheme::FaultTolerantWorkflow, false), &["s1"]).await;
    let p1 = cluster.actor("Player", "p1").await.unwrap();

    p1.set_property("name", "alice").await.unwrap();
    p1.set_property("name", "bob").await.unwrap();
    settle(&cluster).await;

    assert!(cluster.lookup("by_name", "alice").await.unwrap().is_empty());
    assert_eq!(cluster.lookup("by_name", "bob").await.unwrap(), keys(&["p1"]));
    assert_eq!(
        p1.property("name").await.unwrap(),
        Some(IndexValue::from("bob"))
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn property_change_batches_fold_into_one_update() {
    let cluster = cluster(player(ConsistencyScheme::NonFaultTolerantWorkflow, false), &["s1"]).await;
    let p1 = cluster.actor("Player", "p1").await.unwrap();

    p1.write_properties(vec![
        PropertyChange::set("name", "alice"),
        PropertyChange::clear("name"),
        PropertyChange::set("name", "carol"),
        PropertyChange::set("level", 4i64),
    ])
    .await
    .unwrap();
    settle(&cluster).await;

    assert!(cluster.lookup("by_name", "alice").await.unwrap().is_empty());
    assert_eq!(cluster.lookup("by_name", "carol").await.unwrap(), keys(&["p1"]));
    assert_eq!(cluster.lookup("by_level", 4i64).await.unwrap(), keys(&["p1"]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn lazy_unique_conflict_is_rejected_without_state_change() {
    let cluster = cluster(player(ConsistencyScheme::FaultTolerantWorkflow, false), &["s1"]).await;
    let p1 = cluster.actor("Player", "p1").await.unwrap();
    let p2 = cluster.actor("Player", "p2").await.unwrap();

    p1.set_property("name", "alice").await.unwrap();
    settle(&cluster).await;

    let err = p2
        .write_properties(vec![
            PropertyChange::set("level", 5i64),
            PropertyChange::set("name", "alice"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::UniquenessConstraintViolated { .. }));
    assert!(p2.properties().await.unwrap().is_empty());
    assert!(p2.get_active_workflow_ids().await.unwrap().is_empty());

    settle(&cluster).await;
    assert_eq!(cluster.lookup("by_name", "alice").await.unwrap(), keys(&["p1"]));
    assert!(cluster.lookup("by_level", 5i64).await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn eager_unique_violation_undoes_applied_updates() {
    let cluster = cluster(player(ConsistencyScheme::Workflow, true), &["s1"]).await;
    let p1 = cluster.actor("Player", "p1").await.unwrap();
    let p2 = cluster.actor("Player", "p2").await.unwrap();

    p1.set_property("name", "alice").await.unwrap();
    assert_eq!(cluster.lookup("by_name", "alice").await.unwrap(), keys(&["p1"]));

    let err = p2
        .write_properties(vec![
            PropertyChange::set("level", 3i64),
            PropertyChange::set("name", "alice"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::UniquenessConstraintViolated { .. }));
    assert!(cluster.lookup("by_level", 3i64).await.unwrap().is_empty());
    assert!(p2.properties().await.unwrap().is_empty());

    p2.set_property("name", "bob").await.unwrap();
    assert_eq!(cluster.lookup("by_name", "bob").await.unwrap(), keys(&["p2"]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn transactional_writes_are_visible_immediately() {
    let cluster = cluster(player(ConsistencyScheme::Transactional, true), &["s1"]).await;
    let p1 = cluster.actor("Player", "p1").await.unwrap();

    p1.set_property("level", 9i64).await.unwrap();
    assert_eq!(cluster.lookup("by_level", 9i64).await.unwrap(), keys(&["p1"]));
    assert!(cluster.live_queues().await.is_empty());

    p1.set_property("level", 10i64).await.unwrap();
    assert!(cluster.lookup("by_level", 9i64).await.unwrap().is_empty());
    assert_eq!(cluster.lookup("by_level", 10i64).await.unwrap(), keys(&["p1"]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn active_index_tracks_activation() {
    let beacon = ActorTypeDefinition::new("Beacon", ConsistencyScheme::Workflow).with_interface(
        IndexedInterfaceDefinition::new("IBeacon")
            .with_index(IndexDefinition::new("by_region", "region").active()),
    );
    let cluster = cluster(beacon, &["s1"]).await;
    let b1 = ActorKey::new("b1");

    let beacon = cluster.actor("Beacon", b1.clone()).await.unwrap();
    beacon.set_property("region", "west").await.unwrap();
    settle(&cluster).await;
    assert_eq!(cluster.lookup("by_region", "west").await.unwrap(), keys(&["b1"]));

    cluster.deactivate_actor(&b1).await.unwrap();
    settle(&cluster).await;
    assert!(cluster.lookup("by_region", "west").await.unwrap().is_empty());
    assert!(beacon.properties().await.is_err());

    cluster.actor("Beacon", b1.clone()).await.unwrap();
    settle(&cluster).await;
    assert_eq!(cluster.lookup("by_region", "west").await.unwrap(), keys(&["b1"]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn moved_actor_writes_through_its_new_silo() {
    let cluster = cluster(
        player(ConsistencyScheme::FaultTolerantWorkflow, false),
        &["s1", "s2"],
    )
    .await;
    let s2 = SiloId::new("s2");
    let p1 = cluster
        .actor_on("Player", "p1", &SiloId::new("s1"))
        .await
        .unwrap();

    p1.set_property("level", 1i64).await.unwrap();
    settle(&cluster).await;

    cluster.move_actor(&ActorKey::new("p1"), &s2).await.unwrap();
    let p1 = cluster.actor("Player", "p1").await.unwrap();
    assert_eq!(p1.silo(), &s2);

    p1.set_property("level", 2i64).await.unwrap();
    settle(&cluster).await;

    assert!(cluster.lookup("by_level", 1i64).await.unwrap().is_empty());
    assert_eq!(cluster.lookup("by_level", 2i64).await.unwrap(), keys(&["p1"]));
    active_set_drains(&p1).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn outstanding_work_of_a_dead_silo_is_reincarnated_and_handed_off() {
    let store = Arc::new(InMemoryStateStore::new());
    let cluster = cluster_with(
        player(ConsistencyScheme::FaultTolerantWorkflow, false),
        &["s2"],
        store.clone(),
    )
    .await;
    let p1 = ActorKey::new("p1");
    let dead = SiloId::new("s1");
    let old_queue = cluster.queue_address_for("IPlayer", &p1, &dead);

    // a write that reached the queue on s1 before the silo died
    let mut updates = BTreeMap::new();
    updates.insert(
        "by_level".to_string(),
        MemberUpdate::insert(7i64, UpdateMode::NonTentative),
    );
    let pending = WorkflowRecord::new(p1.clone(), "IPlayer", updates);
    let mut entry = WorkflowQueueEntry::new();
    entry.append(pending.clone());
    entry.append_punctuation("IPlayer").unwrap();
    store
        .upsert(&old_queue.storage_key(), serde_json::to_value(&entry).unwrap(), None)
        .await
        .unwrap();

    let mut state = IndexedActorState::default();
    state
        .properties
        .insert("level".to_string(), IndexValue::from(7i64));
    state.active_workflows.insert(pending.workflow_id());
    state
        .workflow_queues
        .entry("IPlayer".to_string())
        .or_default()
        .insert(old_queue.clone());
    store
        .upsert(
            &IndexedActorState::storage_key("Player", &p1),
            serde_json::to_value(&state).unwrap(),
            None,
        )
        .await
        .unwrap();

    let actor = cluster
        .actor_on("Player", p1.clone(), &SiloId::new("s2"))
        .await
        .unwrap();
    settle(&cluster).await;

    assert_eq!(cluster.lookup("by_level", 7i64).await.unwrap(), keys(&["p1"]));
    active_set_drains(&actor).await;
    let old_key = old_queue.storage_key();
    let (store, old_key) = (&store, &old_key);
    eventually("old queue to be emptied", || async move {
        let stored = store.read(old_key).await.unwrap().unwrap();
        let entry: WorkflowQueueEntry = serde_json::from_value(stored.value).unwrap();
        entry.record_count() == 0
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn orphaned_reservation_is_reversed_by_the_handler() {
    let cluster = cluster(player(ConsistencyScheme::FaultTolerantWorkflow, false), &["s1"]).await;
    let p1 = ActorKey::new("p1");
    let s1 = SiloId::new("s1");
    cluster.actor("Player", p1.clone()).await.unwrap();

    // a write that reserved "alice" and enqueued, then died before its state write
    let index = cluster.index("by_name").await.unwrap();
    let metadata = index.metadata().clone();
    let reservation = MemberUpdate::insert("alice", UpdateMode::Tentative);
    index
        .apply_index_update(&p1, reservation, true, &metadata, &s1)
        .await
        .unwrap();
    assert!(cluster.lookup("by_name", "alice").await.unwrap().is_empty());

    let mut updates = BTreeMap::new();
    updates.insert(
        "by_name".to_string(),
        MemberUpdate::insert("alice", UpdateMode::NonTentative),
    );
    let orphan = WorkflowRecord::new(p1.clone(), "IPlayer", updates);
    let queue = cluster
        .queue(&cluster.queue_address_for("IPlayer", &p1, &s1))
        .await
        .unwrap();
    queue.add_to_queue(orphan).await.unwrap();
    settle(&cluster).await;

    let alice = IndexValue::from("alice");
    let buckets = index.snapshot().await.unwrap();
    assert!(buckets.iter().all(|bucket| bucket.entry(&alice).is_none()));

    let p2 = cluster.actor("Player", "p2").await.unwrap();
    p2.set_property("name", "alice").await.unwrap();
    settle(&cluster).await;
    assert_eq!(cluster.lookup("by_name", "alice").await.unwrap(), keys(&["p2"]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn killed_silo_actors_reactivate_elsewhere_with_their_state() {
    let cluster = cluster(
        player(ConsistencyScheme::FaultTolerantWorkflow, false),
        &["s1", "s2"],
    )
    .await;
    let s1 = SiloId::new("s1");
    let p1 = cluster.actor_on("Player", "p1", &s1).await.unwrap();
    p1.set_property("name", "alice").await.unwrap();
    settle(&cluster).await;
    active_set_drains(&p1).await;

    cluster.kill_silo(&s1).await.unwrap();
    assert!(p1.properties().await.is_err());
    assert_eq!(cluster.live_silos().await, vec![SiloId::new("s2")]);

    let p1 = cluster.actor("Player", "p1").await.unwrap();
    assert_eq!(p1.silo(), &SiloId::new("s2"));
    assert_eq!(
        p1.property("name").await.unwrap(),
        Some(IndexValue::from("alice"))
    );
    assert_eq!(cluster.lookup("by_name", "alice").await.unwrap(), keys(&["p1"]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn misconfigured_types_and_silos_are_rejected() {
    let cluster = IndexingCluster::new(config(), Arc::new(InMemoryStateStore::new())).unwrap();

    let eager_fault_tolerant = player(ConsistencyScheme::FaultTolerantWorkflow, true);
    assert!(matches!(
        cluster.register_actor_type(eager_fault_tolerant).await,
        Err(IndexError::Configuration(_))
    ));

    let lazy_transactional = player(ConsistencyScheme::Transactional, false);
    assert!(matches!(
        cluster.register_actor_type(lazy_transactional).await,
        Err(IndexError::Configuration(_))
    ));

    assert!(cluster.add_silo("rack/1").await.is_err());
    assert!(cluster.actor("Player", "p1").await.is_err());

    let zero_partitions = IndexingConfig::default().with_queues_per_interface(0);
    assert!(IndexingCluster::new(zero_partitions, Arc::new(InMemoryStateStore::new())).is_err());
}

#[tokio::test]
async fn parked_queue_is_restarted_when_the_actor_returns_to_its_silo() {
    let store = Arc::new(InMemoryStateStore::new());
    let single_attempt = config().with_retry(WorkflowRetryPolicy {
        max_attempts: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
    });
    let cluster = IndexingCluster::new(single_attempt, store.clone()).unwrap();
    cluster
        .register_actor_type(player(ConsistencyScheme::FaultTolerantWorkflow, false))
        .await
        .unwrap();
    cluster.add_silo("s1").await.unwrap();
    let s1 = SiloId::new("s1");
    let key = ActorKey::new("p1");
    let p1 = cluster.actor_on("Player", key.clone(), &s1).await.unwrap();
    settle(&cluster).await;

    // the drain only runs once this task yields, so it sees the outage
    p1.set_property("level", 7i64).await.unwrap();
    store.set_offline(true);
    let queue = cluster
        .queue(&cluster.queue_address_for("IPlayer", &key, &s1))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), queue.wait_until_idle())
        .await
        .expect("queue should park");

    assert!(cluster.lookup("by_level", 7i64).await.unwrap().is_empty());
    assert_eq!(queue.snapshot().await.record_count(), 1);

    cluster.crash_actor(&key).await;
    store.set_offline(false);

    let p1 = cluster.actor_on("Player", key.clone(), &s1).await.unwrap();
    settle(&cluster).await;

    assert_eq!(cluster.lookup("by_level", 7i64).await.unwrap(), keys(&["p1"]));
    assert_eq!(queue.snapshot().await.record_count(), 0);
    active_set_drains(&p1).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn renames_across_a_bucket_chain_keep_names_unique() {
    let cluster = IndexingCluster::new(
        config().with_default_bucket_capacity(1),
        Arc::new(InMemoryStateStore::new()),
    )
    .unwrap();
    assert_eq!(cluster.config().default_bucket_capacity, 1);
    cluster
        .register_actor_type(player(ConsistencyScheme::FaultTolerantWorkflow, false))
        .await
        .unwrap();
    cluster.add_silo("s1").await.unwrap();
    let p1 = cluster.actor("Player", "p1").await.unwrap();
    let p2 = cluster.actor("Player", "p2").await.unwrap();

    p1.set_property("name", "alice").await.unwrap();
    p2.set_property("name", "bob").await.unwrap();
    settle(&cluster).await;
    assert_eq!(cluster.index("by_name").await.unwrap().bucket_count().await.unwrap(), 2);

    let err = p1.set_property("name", "bob").await.unwrap_err();
    assert!(matches!(err, IndexError::UniquenessConstraintViolated { .. }));
    assert_eq!(
        p1.property("name").await.unwrap(),
        Some(IndexValue::from("alice"))
    );

    p1.set_property("name", "carol").await.unwrap();
    settle(&cluster).await;

    assert!(cluster.lookup("by_name", "alice").await.unwrap().is_empty());
    assert_eq!(cluster.lookup("by_name", "bob").await.unwrap(), keys(&["p2"]));
    assert_eq!(cluster.lookup("by_name", "carol").await.unwrap(), keys(&["p1"]));
    active_set_drains(&p1).await;
    cluster.shutdown().await;
}

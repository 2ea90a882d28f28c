//! Whole-node scenarios.

use std::time::Duration;

use meridian::core::{
    ApplyStatus, Change, ChangeToApply, Component, ComponentKind, ConfigHandle, Entity,
    EntityFilter, EntityPatch, Position, TaskScope,
};
use meridian::shard::DiscoveryRegistry;
use meridian::sync::SubscribeRequest;
use meridian::world::{SubscriptionConfig, WorldStore};
use meridian::{Node, LIGHTING_DOMAIN};

#[tokio::test]
async fn test_guarded_update_and_filtered_subscriber() {
    let store = WorldStore::in_memory(ConfigHandle::default());
    let scope = TaskScope::new("e2e");

    // A exists with no components.
    let a = store.allocate_id();
    let created = store
        .apply(vec![ChangeToApply::new().create(Entity::new(a))])
        .await
        .unwrap();
    assert!(created.all_succeeded());
    assert_eq!(store.get_with_version(&[a]).await.unwrap()[0].0, 1);

    let has_health = EntityFilter::everything().with(ComponentKind::Health);
    let mut stream = store.subscribe(SubscriptionConfig::filtered(has_health), scope.token());
    let bootstrap = stream.recv().await.unwrap();
    assert!(bootstrap.bootstrapped);
    assert!(bootstrap.changes.is_empty());

    let wounded = || {
        ChangeToApply::new()
            .iff(a, 1)
            .update(EntityPatch::new(a).set(Component::Health { hp: 3, max: 10 }))
    };
    let first = store.apply(vec![wounded()]).await.unwrap();
    assert_eq!(first.outcomes, vec![ApplyStatus::Success]);
    let second = store.apply(vec![wounded()]).await.unwrap();
    assert_eq!(second.outcomes, vec![ApplyStatus::Aborted]);
    assert_eq!(store.get_with_version(&[a]).await.unwrap()[0].0, 2);

    let update = stream.recv().await.unwrap();
    assert!(!update.bootstrapped);
    assert!(matches!(
        update.changes.as_slice(),
        [Change::Create { tick: 2, entity }] if entity.id == a && entity.has(ComponentKind::Health)
    ));

    // Nothing for the aborted write.
    let quiet = tokio::time::timeout(Duration::from_millis(100), stream.recv()).await;
    assert!(quiet.is_err());

    scope.shutdown().await;
}

#[tokio::test]
async fn test_node_lights_up_a_client() {
    let registry = DiscoveryRegistry::new();
    let node = Node::start(ConfigHandle::default(), &registry).await.unwrap();

    let player = node.world().allocate_id();
    let lamp = node.world().allocate_id();
    node.world()
        .apply(vec![ChangeToApply::new()
            .create(
                Entity::new(player)
                    .with(Component::Position(Position::new(0.0, 0.0, 0.0)))
                    .with(Component::RemoteConnection),
            )
            .create(
                Entity::new(lamp)
                    .with(Component::Position(Position::new(10.0, 10.0, 10.0)))
                    .with(Component::LightSource { intensity: 15 }),
            )])
        .await
        .unwrap();

    let mut session = node.connect(SubscribeRequest::new(player)).unwrap();
    let lit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let delta = session.recv().await.unwrap();
            let found = delta.changes.iter().any(|change| match change {
                Change::Create { entity, .. } => entity.has(ComponentKind::Illumination),
                Change::Update { patch, .. } => patch.touches(ComponentKind::Illumination),
                Change::Delete { .. } => false,
            });
            if found {
                break;
            }
        }
    })
    .await;
    assert!(lit.is_ok(), "no illumination reached the client");

    session.close().await;
    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_nodes_split_and_hand_over_shards() {
    let config = ConfigHandle::default();
    let total = config.snapshot().shards.domain(LIGHTING_DOMAIN).shards;
    let registry = DiscoveryRegistry::new();

    let first = Node::start(config.clone(), &registry).await.unwrap();
    let second = Node::start(config.clone(), &registry).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let a = first.shards().held();
    let b = second.shards().held();
    assert!(a.is_disjoint(&b));
    assert_eq!(a.len() + b.len(), total as usize);
    assert!(!a.is_empty() && !b.is_empty());

    second.stop().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(first.shards().held().len(), total as usize);

    first.stop().await;
}

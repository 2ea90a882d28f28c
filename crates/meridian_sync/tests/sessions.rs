//! Sync sessions against an in-memory world.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use meridian_core::{
    Change, ChangeToApply, Component, ConfigHandle, Entity, EntityId, EntityPatch, Position,
    TaskScope,
};
use meridian_sync::{
    NoResidency, SubscribeRequest, SyncDelta, SyncError, SyncIndex, SyncSession, WorldResidency,
};
use meridian_world::WorldStore;

struct Fixture {
    store: WorldStore,
    index: SyncIndex,
    scope: TaskScope,
    me: EntityId,
    near: EntityId,
    far: EntityId,
}

fn at(id: EntityId, x: f64) -> Entity {
    Entity::new(id).with(Component::Position(Position::new(x, 0.0, 0.0)))
}

async fn fixture() -> Fixture {
    let store = WorldStore::in_memory(ConfigHandle::default());
    let (me, near, far) = (store.allocate_id(), store.allocate_id(), store.allocate_id());
    store
        .apply(vec![ChangeToApply::new()
            .create(at(me, 0.0))
            .create(at(near, 10.0))
            .create(at(far, 1_000.0))])
        .await
        .unwrap();

    let scope = TaskScope::new("sync-test");
    let index = SyncIndex::new();
    index.start(store.clone(), store.config().clone(), &scope.token());
    Fixture {
        store,
        index,
        scope,
        me,
        near,
        far,
    }
}

impl Fixture {
    fn open(&self, request: SubscribeRequest) -> SyncSession {
        SyncSession::open(
            self.index.clone(),
            Arc::new(NoResidency),
            self.store.config(),
            request,
            &self.scope.token(),
        )
        .unwrap()
    }

    async fn move_to(&self, id: EntityId, x: f64) {
        let patch = EntityPatch::new(id).set(Component::Position(Position::new(x, 0.0, 0.0)));
        self.store
            .apply(vec![ChangeToApply::new().update(patch)])
            .await
            .unwrap();
    }
}

/// Next delta that carries changes.
async fn next_changes(session: &mut SyncSession) -> SyncDelta {
    loop {
        let delta = session.recv().await.unwrap();
        if !delta.is_heartbeat() {
            return delta;
        }
    }
}

fn ids(delta: &SyncDelta) -> Vec<EntityId> {
    delta.changes.iter().map(Change::id).collect()
}

#[tokio::test]
async fn test_bootstrap_sends_entities_in_radius() {
    let f = fixture().await;
    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(50.0);
    let mut session = f.open(request);

    let bootstrap = session.recv().await.unwrap();
    assert!(bootstrap.bootstrap_complete);
    assert_eq!(ids(&bootstrap), vec![f.me, f.near]);
    assert!(bootstrap
        .changes
        .iter()
        .all(|change| matches!(change, Change::Create { .. })));

    session.close().await;
    f.scope.shutdown().await;
}

#[tokio::test]
async fn test_entities_moving_in_and_out() {
    let f = fixture().await;
    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(50.0);
    let mut session = f.open(request);
    session.recv().await.unwrap();

    f.move_to(f.far, 20.0).await;
    let delta = next_changes(&mut session).await;
    assert!(!delta.bootstrap_complete);
    assert!(matches!(
        delta.changes.as_slice(),
        [Change::Create { entity, .. }] if entity.id == f.far
    ));

    f.move_to(f.near, 900.0).await;
    let delta = next_changes(&mut session).await;
    assert!(matches!(
        delta.changes.as_slice(),
        [Change::Delete { id, .. }] if *id == f.near
    ));

    session.close().await;
    f.scope.shutdown().await;
}

#[tokio::test]
async fn test_known_versions_are_not_resent() {
    let f = fixture().await;
    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(50.0);
    request.known_versions = Some(HashMap::from([(f.me, 1), (f.near, 1), (f.far, 1)]));
    let mut session = f.open(request);

    let bootstrap = session.recv().await.unwrap();
    assert!(bootstrap.bootstrap_complete);
    assert!(matches!(
        bootstrap.changes.as_slice(),
        [Change::Delete { id, .. }] if *id == f.far
    ));

    session.close().await;
    f.scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_heartbeats() {
    let f = fixture().await;
    let mut session = f.open(SubscribeRequest::new(f.me));
    session.recv().await.unwrap();

    let beat = tokio::time::timeout(Duration::from_secs(5), session.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(beat.is_heartbeat());
    assert!(!beat.bootstrap_complete);

    session.close().await;
    f.scope.shutdown().await;
}

#[tokio::test]
async fn test_radius_change_brings_far_entities_in() {
    let f = fixture().await;
    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(50.0);
    let mut session = f.open(request);
    session.recv().await.unwrap();

    session.set_radius(2_000.0).unwrap();
    let delta = next_changes(&mut session).await;
    assert_eq!(ids(&delta), vec![f.far]);

    assert!(matches!(
        session.set_radius(f64::NAN),
        Err(SyncError::InvalidRadius(_))
    ));
    assert!(matches!(
        session.set_radius(1e12),
        Err(SyncError::InvalidRadius(_))
    ));

    session.close().await;
    f.scope.shutdown().await;
}

#[tokio::test]
async fn test_followed_entities_stay_resident() {
    let f = fixture().await;
    let following = EntityPatch::new(f.me).set(Component::Following(BTreeSet::from([f.far])));
    f.store
        .apply(vec![ChangeToApply::new().update(following)])
        .await
        .unwrap();

    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(50.0);
    let mut session = SyncSession::open(
        f.index.clone(),
        Arc::new(WorldResidency::new(f.store.clone())),
        f.store.config(),
        request,
        &f.scope.token(),
    )
    .unwrap();

    let bootstrap = session.recv().await.unwrap();
    let mut seen = ids(&bootstrap);
    seen.sort();
    assert_eq!(seen, vec![f.me, f.near, f.far]);

    session.close().await;
    f.scope.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let f = fixture().await;

    let mut request = SubscribeRequest::new(f.me);
    request.filter = Some("ghosts".into());
    let opened = SyncSession::open(
        f.index.clone(),
        Arc::new(NoResidency),
        f.store.config(),
        request,
        &f.scope.token(),
    );
    assert!(matches!(opened, Err(SyncError::UnknownFilter(_))));

    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(-1.0);
    let opened = SyncSession::open(
        f.index.clone(),
        Arc::new(NoResidency),
        f.store.config(),
        request,
        &f.scope.token(),
    );
    assert!(matches!(opened, Err(SyncError::InvalidRadius(_))));

    let mut request = SubscribeRequest::new(f.me);
    request.radius = Some(1e12);
    let opened = SyncSession::open(
        f.index.clone(),
        Arc::new(NoResidency),
        f.store.config(),
        request,
        &f.scope.token(),
    );
    assert!(matches!(opened, Err(SyncError::InvalidRadius(_))));

    f.scope.shutdown().await;
}

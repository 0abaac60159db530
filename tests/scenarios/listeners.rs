//! Test: Listeners - which result stores a pool watches, and when

use crate::helpers::*;
use consortium_pipeline::core::result::ComputationResult;
use consortium_pipeline::execution::PoolState;
use consortium_pipeline::{
    Consortium, FunctionRegistry, PoolError, PoolEvent, RemoteComputationResult, RemotePipelineRunnerPool,
};
use serde_json::{json, Value};

fn functions() -> FunctionRegistry {
    FunctionRegistry::new()
        .with("local", constant(json!(1)))
        .with("remote", constant(Value::Null))
}

async fn remote_pool(consortia: &[(&str, &[&str])]) -> RemotePipelineRunnerPool {
    let ctx = seeded_context(&definition_yaml("local", "remote"), functions(), consortia).await;
    RemotePipelineRunnerPool::remote(ctx)
}

/// Init attaches one listener per known consortium, then reports ready
#[tokio::test]
async fn test_init_listens_to_existing_consortia() {
    let pool = remote_pool(&[("c1", &["alice"]), ("c2", &["bob"])]).await;
    let mut events = pool.events().subscribe();

    pool.init().await.unwrap();
    assert_eq!(pool.state(), PoolState::Initialized);
    assert_eq!(
        pool.listener_names(),
        vec!["local-consortium-c1".to_string(), "local-consortium-c2".to_string()]
    );

    let (_, seen) = wait_for_event(&mut events, |e| *e == PoolEvent::Ready).await;
    assert_event_count(&seen, "listener:created", 2);
}

/// listenTo narrows the consortia a pool watches
#[tokio::test]
async fn test_listen_to_scopes_consortia() {
    let pool = remote_pool(&[("c1", &["alice"]), ("c2", &["bob"])])
        .await
        .with_listen_to(vec!["c2".to_string()]);

    pool.init().await.unwrap();
    assert_eq!(pool.listen_to(), Some(vec!["c2".to_string()]));
    assert_eq!(pool.listener_names(), vec!["local-consortium-c2".to_string()]);
}

/// Consortia created after init get a listener too
#[tokio::test]
async fn test_new_consortium_gets_listener() {
    let pool = remote_pool(&[("c1", &["alice"])]).await;
    pool.init().await.unwrap();
    let mut events = pool.events().subscribe();

    add_consortium(&pool.context().stores, "c3", &["carol"]).await;

    let (created, _) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::ListenerCreated(_))).await;
    assert_eq!(created, PoolEvent::ListenerCreated("local-consortium-c3".to_string()));
    assert!(pool.listener_names().contains(&"local-consortium-c3".to_string()));
}

/// A participant's write reaches the aggregator through its listener
#[tokio::test]
async fn test_result_change_triggers_remote_run() {
    let pool = remote_pool(&[("c1", &["alice", "bob"])]).await;
    pool.init().await.unwrap();
    let mut events = pool.events().subscribe();

    put_local_result(&pool.context().stores, "c1", "run1", "alice", json!({ "value": 2 })).await;

    let (start, _) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::RunStart(_))).await;
    let PoolEvent::RunStart(trigger) = start else { unreachable!() };
    assert_eq!(trigger.id(), "run1-alice");

    let (end, _) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::RunEnd(_))).await;
    let PoolEvent::RunEnd(doc) = end else { unreachable!() };
    assert_eq!(doc.id(), "run1");

    let store = pool
        .context()
        .stores
        .get(&Consortium::remote_store_name("c1"))
        .await
        .unwrap();
    let remote = RemoteComputationResult::from_value(store.get("run1").await.unwrap()).unwrap();
    assert_eq!(remote.usernames, vec!["alice".to_string(), "bob".to_string()]);
    assert!(!remote.complete);
}

/// After unlistening, recreating the store brings the listener back
#[tokio::test]
async fn test_recreated_store_is_upserted() {
    let pool = remote_pool(&[("c1", &["alice"])]).await;
    pool.init().await.unwrap();

    pool.unlisten_to_consortia(&["c1".to_string()]).await.unwrap();
    assert!(pool.listener_names().is_empty());

    let mut events = pool.events().subscribe();
    pool.context()
        .stores
        .get(&Consortium::local_store_name("c1"))
        .await
        .unwrap();

    let (created, _) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::ListenerCreated(_))).await;
    assert_eq!(created, PoolEvent::ListenerCreated("local-consortium-c1".to_string()));
    assert_eq!(pool.listener_names(), vec!["local-consortium-c1".to_string()]);
}

/// Only unwatched result stores of known consortia are upserted
#[tokio::test]
async fn test_upsert_ignores_foreign_stores() {
    let pool = remote_pool(&[("c1", &["alice"])]).await;
    pool.init().await.unwrap();

    assert!(!pool.upsert_listener("remote-consortium-c1").await.unwrap());
    assert!(!pool.upsert_listener("local-consortium-unknown").await.unwrap());
    assert!(!pool.upsert_listener("consortia").await.unwrap());
    assert!(!pool.upsert_listener("local-consortium-c1").await.unwrap());
    assert_eq!(pool.listener_names().len(), 1);
}

/// Init runs once; destroy tears down once
#[tokio::test]
async fn test_lifecycle_transitions() {
    let pool = remote_pool(&[("c1", &["alice"])]).await;
    assert_eq!(pool.state(), PoolState::Uninitialized);
    assert!(matches!(pool.destroy().await, Err(PoolError::NotInitialized)));

    pool.init().await.unwrap();
    assert!(matches!(pool.init().await, Err(PoolError::AlreadyInitialized)));

    pool.destroy().await.unwrap();
    assert_eq!(pool.state(), PoolState::Destroyed);
    assert!(!pool.is_active());
    assert!(pool.listener_names().is_empty());
    assert!(pool.context().stores.is_destroyed());

    assert!(matches!(pool.destroy().await, Err(PoolError::NotInitialized)));
}

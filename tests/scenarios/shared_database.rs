//! Test: Shared Database - a participant and the aggregator as separate nodes
//!
//! Each node opens its own store registry on one SQLite file, so every write
//! crosses over through the polled change feed.
#![cfg(feature = "sqlite")]

use crate::helpers::*;
use consortium_pipeline::core::config::StoreConfig;
use consortium_pipeline::execution::COMPUTATIONS_STORE;
use consortium_pipeline::{
    ComputationError, DecentralizedComputation, FunctionRegistry, LocalComputationRegistry,
    LocalPipelineRunnerPool, PoolContext, PoolEvent, RemoteComputationResult, RemotePipelineRunnerPool,
    StoreRegistry,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

async fn sum(input: Value) -> Result<Value, ComputationError> {
    let total: f64 = input["userResults"]
        .as_array()
        .map(|results| results.iter().filter_map(|r| r["data"]["value"].as_f64()).sum())
        .unwrap_or_default();
    Ok(json!({ "total": total, "complete": true }))
}

async fn node(path: &Path) -> PoolContext {
    let config = StoreConfig::Sqlite {
        path: Some(path.to_path_buf()),
    };
    let stores = StoreRegistry::from_config(&config, Duration::from_millis(20))
        .await
        .unwrap();
    let registry = LocalComputationRegistry::in_memory();
    registry
        .insert(DecentralizedComputation::from_yaml(&definition_yaml("contribute", "sum")).unwrap())
        .await;

    let functions = FunctionRegistry::new()
        .with("contribute", constant(json!({ "value": 4 })))
        .with("sum", sum);
    PoolContext::new(Arc::new(stores), Arc::new(registry)).with_functions(functions)
}

/// A participant's result written on one node completes the run on the other
#[tokio::test]
async fn test_run_completes_across_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("documents.db");

    let participant = node(&path).await;
    participant
        .stores
        .get(COMPUTATIONS_STORE)
        .await
        .unwrap()
        .save(json!({ "_id": COMPUTATION_ID, "name": "test-computation", "version": "1.0.0" }))
        .await
        .unwrap();
    add_consortium(&participant.stores, "c1", &["alice"]).await;
    let aggregator = node(&path).await;

    let remote = RemotePipelineRunnerPool::remote(aggregator);
    let mut remote_events = remote.events().subscribe();
    remote.init().await.unwrap();

    let local = LocalPipelineRunnerPool::local("alice", participant);
    let mut local_events = local.events().subscribe();
    local.init().await.unwrap();

    let kickoff = RemoteComputationResult::new("run1", COMPUTATION_ID, "c1", vec!["alice".to_string()]).unwrap();
    local.trigger_runner(kickoff, Some(json!({}))).await.unwrap();

    let (marked, _) = wait_for_event(&mut remote_events, |e| {
        matches!(e, PoolEvent::ComputationMarkedComplete { .. })
    })
    .await;
    assert_eq!(
        marked,
        PoolEvent::ComputationMarkedComplete {
            run_id: "run1".to_string(),
            consortium_id: "c1".to_string(),
        }
    );

    wait_for_event(&mut local_events, |e| matches!(e, PoolEvent::ComputationComplete { .. })).await;

    let store = local
        .context()
        .stores
        .get("remote-consortium-c1")
        .await
        .unwrap();
    let doc = store.get("run1").await.unwrap();
    assert_eq!(doc["data"]["total"], json!(4.0));

    local.destroy().await.unwrap();
    remote.destroy().await.unwrap();
}

//! Test: End to End - participants and aggregator converging on a result

use crate::helpers::*;
use consortium_pipeline::core::plugin::GROUP_STEP;
use consortium_pipeline::core::result::ComputationResult;
use consortium_pipeline::core::ErrorInfo;
use consortium_pipeline::simulation::{Simulation, CONSORTIUM_ID, RUN_ID};
use consortium_pipeline::{
    Consortium, FunctionRegistry, LocalComputationResult, PoolEvent, RemoteComputationResult,
    RemotePipelineRunnerPool,
};
use serde_json::{json, Value};

fn participants() -> Vec<(String, f64)> {
    vec![("alice".to_string(), 2.0), ("bob".to_string(), 3.0)]
}

/// Two participants contribute and the aggregate completes with their sum
#[tokio::test]
async fn test_two_participants_complete() {
    let simulation = Simulation::new(participants(), false).await.unwrap();
    let mut alice = simulation.locals()[0].events().subscribe();

    let result = simulation.run(WAIT).await.unwrap();
    assert_eq!(result.run_id(), RUN_ID);
    assert_eq!(result.consortium_id(), CONSORTIUM_ID);
    assert_eq!(result.data()["total"], json!(5.0));
    assert_eq!(result.data()["contributors"], json!(2));
    assert!(result.complete);
    assert!(result.end_date.is_some());
    assert!(result.user_errors.is_empty());

    let (complete, _) = wait_for_event(&mut alice, |e| matches!(e, PoolEvent::ComputationComplete { .. })).await;
    assert_eq!(
        complete,
        PoolEvent::ComputationComplete {
            run_id: RUN_ID.to_string(),
            consortium_id: CONSORTIUM_ID.to_string(),
        }
    );

    simulation.shutdown().await;
    assert!(simulation.stores().is_destroyed());
}

/// With group stepping the aggregate still completes, one step past kickoff
#[tokio::test]
async fn test_group_step_completes() {
    let simulation = Simulation::new(participants(), true).await.unwrap();

    let result = simulation.run(WAIT).await.unwrap();
    assert_eq!(result.data()["total"], json!(5.0));
    assert!(result.complete);
    assert_eq!(result.core().plugin_state[GROUP_STEP]["step"], json!(2));

    let store = simulation
        .stores()
        .get(&Consortium::local_store_name(CONSORTIUM_ID))
        .await
        .unwrap();
    for user in ["alice", "bob"] {
        let doc = store
            .get(&LocalComputationResult::document_id(RUN_ID, user))
            .await
            .unwrap();
        let local = LocalComputationResult::from_value(doc).unwrap();
        assert_eq!(local.core().plugin_state[GROUP_STEP]["step"], json!(1));
    }

    simulation.shutdown().await;
}

/// A participant's recorded error is collected on the aggregate
#[tokio::test]
async fn test_participant_error_reaches_aggregate() {
    let functions = FunctionRegistry::new()
        .with("local", constant(json!(1)))
        .with("remote", constant(Value::Null));
    let ctx = seeded_context(&definition_yaml("local", "remote"), functions, &[("c1", &["alice", "bob"])]).await;
    let pool = RemotePipelineRunnerPool::remote(ctx);
    pool.init().await.unwrap();
    let mut events = pool.events().subscribe();

    let stores = pool.context().stores.clone();
    let mut failed = LocalComputationResult::new(
        LocalComputationResult::document_id("run1", "alice"),
        COMPUTATION_ID,
        "c1",
        "alice",
    )
    .unwrap();
    failed.core_mut().error = Some(ErrorInfo::new("bad input"));
    stores
        .get(&Consortium::local_store_name("c1"))
        .await
        .unwrap()
        .save(failed.to_value().unwrap())
        .await
        .unwrap();

    let (end, seen) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::RunEnd(_))).await;
    let PoolEvent::RunEnd(doc) = end else { unreachable!() };
    assert_eq!(doc.id(), "run1");
    assert_event_count(&seen, "computation:complete", 0);

    let remote = RemoteComputationResult::from_value(
        stores
            .get(&Consortium::remote_store_name("c1"))
            .await
            .unwrap()
            .get("run1")
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(remote.user_errors.len(), 1);
    assert_eq!(remote.user_errors[0].message, "bad input");
    assert_eq!(remote.user_errors[0].username.as_deref(), Some("alice"));
    assert!(!remote.complete);

    pool.destroy().await.unwrap();
}

//! Test: Queue Ordering - one run at a time per runId

use crate::helpers::*;
use consortium_pipeline::core::result::ComputationResult;
use consortium_pipeline::{
    ComputationError, Consortium, FunctionRegistry, LocalComputationResult, LocalPipelineRunnerPool, PoolError,
    PoolEvent, RemoteComputationResult, RunnerError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn kickoff(run_id: &str) -> RemoteComputationResult {
    RemoteComputationResult::new(run_id, COMPUTATION_ID, "cons", vec!["alice".to_string()]).unwrap()
}

async fn local_doc(pool: &LocalPipelineRunnerPool, run_id: &str) -> LocalComputationResult {
    let store = pool
        .context()
        .stores
        .get(&Consortium::local_store_name("cons"))
        .await
        .unwrap();
    let doc = store
        .get(&LocalComputationResult::document_id(run_id, "alice"))
        .await
        .unwrap();
    LocalComputationResult::from_value(doc).unwrap()
}

/// Jobs for the same runId run strictly one after another, in order
#[tokio::test]
async fn test_runs_for_one_run_id_never_overlap() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let track = {
        let (running, peak, calls) = (running.clone(), peak.clone(), calls.clone());
        move |_input: Value| {
            let (running, peak, calls) = (running.clone(), peak.clone(), calls.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, ComputationError>(json!({ "call": call }))
            }
        }
    };
    let functions = FunctionRegistry::new()
        .with("track", track)
        .with("noop", constant(Value::Null));
    let ctx = seeded_context(&definition_yaml("track", "noop"), functions, &[("cons", &["alice"])]).await;
    let pool = LocalPipelineRunnerPool::local("alice", ctx);
    let mut events = pool.events().subscribe();

    let jobs: Vec<_> = (0..4)
        .map(|n| pool.trigger_runner(kickoff("run1"), Some(json!({ "n": n }))))
        .collect();
    for job in jobs {
        job.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let (_, seen) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::QueueEnd(_))).await;
    assert_event_count(&seen, "queue:start", 1);
    assert_event_count(&seen, "run:start", 4);
    assert_event_count(&seen, "run:end", 4);

    let result = local_doc(&pool, "run1").await;
    assert_eq!(result.user_data, Some(json!({ "n": 0 })));
    assert_eq!(result.data(), &json!({ "call": 4 }));
    assert_eq!(
        result.core().history,
        vec![json!({ "call": 1 }), json!({ "call": 2 }), json!({ "call": 3 })]
    );
    assert_eq!(pool.runner_count(), 1);
}

/// Different runIds are queued independently and may run side by side
#[tokio::test]
async fn test_distinct_run_ids_run_concurrently() {
    let barrier = Arc::new(Barrier::new(2));
    let meet = move |_input: Value| {
        let barrier = barrier.clone();
        async move {
            tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                .await
                .map_err(|_| ComputationError::failed("runs were serialized"))?;
            Ok::<_, ComputationError>(json!("met"))
        }
    };
    let functions = FunctionRegistry::new()
        .with("meet", meet)
        .with("noop", constant(Value::Null));
    let ctx = seeded_context(&definition_yaml("meet", "noop"), functions, &[("cons", &["alice"])]).await;
    let pool = LocalPipelineRunnerPool::local("alice", ctx);

    let first = pool.trigger_runner(kickoff("run1"), Some(json!({})));
    let second = pool.trigger_runner(kickoff("run2"), Some(json!({})));
    first.await.unwrap();
    second.await.unwrap();

    for run_id in ["run1", "run2"] {
        let result = local_doc(&pool, run_id).await;
        assert!(result.core().error.is_none(), "{} recorded an error", run_id);
        assert_eq!(result.data(), &json!("met"));
    }
    assert_eq!(pool.runner_count(), 2);
}

/// A single job announces its queue before the run and drains it after
#[tokio::test]
async fn test_single_job_event_order() {
    let functions = FunctionRegistry::new()
        .with("one", constant(json!(1)))
        .with("noop", constant(Value::Null));
    let ctx = seeded_context(&definition_yaml("one", "noop"), functions, &[("cons", &["alice"])]).await;
    let pool = LocalPipelineRunnerPool::local("alice", ctx);
    let mut events = pool.events().subscribe();

    let doc = pool
        .trigger_runner(kickoff("run1"), Some(json!({})))
        .await
        .unwrap();
    assert_eq!(doc.id(), "run1-alice");

    let (end, seen) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::QueueEnd(_))).await;
    assert_eq!(end, PoolEvent::QueueEnd("run1".to_string()));
    assert_eq!(names(&seen), vec!["queue:start", "run:start", "run:end"]);
}

/// Runs against a finished remote result fail and surface as pool errors
#[tokio::test]
async fn test_trigger_on_complete_run_fails() {
    let functions = FunctionRegistry::new()
        .with("one", constant(json!(1)))
        .with("noop", constant(Value::Null));
    let ctx = seeded_context(&definition_yaml("one", "noop"), functions, &[("cons", &["alice"])]).await;
    let pool = LocalPipelineRunnerPool::local("alice", ctx);
    let mut events = pool.events().subscribe();

    let mut done = kickoff("run1");
    done.complete = true;
    let err = pool.trigger_runner(done, Some(json!({}))).await.unwrap_err();
    assert!(matches!(err, PoolError::Runner(RunnerError::RunComplete(ref id)) if id == "run1"));

    let (_, seen) = wait_for_event(&mut events, |e| matches!(e, PoolEvent::QueueEnd(_))).await;
    assert_event_count(&seen, "error", 1);
    assert_event_count(&seen, "run:end", 0);
}

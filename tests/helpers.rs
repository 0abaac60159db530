//! Test utility functions for consortium-pipeline
#![allow(dead_code)]

use consortium_pipeline::computation::{ComputationError, FunctionRegistry, LocalComputationRegistry};
use consortium_pipeline::core::result::{ComputationResult, LocalComputationResult};
use consortium_pipeline::execution::{PoolContext, PoolEvent, COMPUTATIONS_STORE, CONSORTIA_STORE};
use consortium_pipeline::persistence::StoreRegistry;
use consortium_pipeline::{Consortium, DecentralizedComputation};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

pub const COMPUTATION_ID: &str = "comp";

/// Definition whose local and remote pipelines call the named functions
pub fn definition_yaml(local: &str, remote: &str) -> String {
    format!(
        r#"
name: test-computation
version: 1.0.0
local:
  type: function
  name: {}
remote:
  type: function
  name: {}
"#,
        local, remote
    )
}

/// In-memory stores seeded with the computation document and these consortia
pub async fn seeded_context(
    definition: &str,
    functions: FunctionRegistry,
    consortia: &[(&str, &[&str])],
) -> PoolContext {
    let stores = Arc::new(StoreRegistry::in_memory());
    let registry = LocalComputationRegistry::in_memory();
    let definition = DecentralizedComputation::from_yaml(definition).unwrap();

    stores
        .get(COMPUTATIONS_STORE)
        .await
        .unwrap()
        .save(json!({
            "_id": COMPUTATION_ID,
            "name": definition.name,
            "version": definition.version,
        }))
        .await
        .unwrap();
    registry.insert(definition).await;

    for (id, users) in consortia {
        add_consortium(&stores, id, users).await;
    }

    PoolContext::new(stores, Arc::new(registry)).with_functions(functions)
}

pub async fn add_consortium(stores: &StoreRegistry, id: &str, users: &[&str]) {
    let mut consortium = Consortium::new(id, users.iter().map(|u| u.to_string()).collect());
    consortium.active_computation_id = Some(COMPUTATION_ID.to_string());
    stores
        .get(CONSORTIA_STORE)
        .await
        .unwrap()
        .save(serde_json::to_value(consortium).unwrap())
        .await
        .unwrap();
}

/// Function returning `data` regardless of input
pub fn constant(data: Value) -> impl Fn(Value) -> std::future::Ready<Result<Value, ComputationError>> + Send + Sync {
    move |_| std::future::ready(Ok(data.clone()))
}

/// Write a participant result straight into `local-consortium-<consortium>`
pub async fn put_local_result(
    stores: &StoreRegistry,
    consortium: &str,
    run_id: &str,
    username: &str,
    data: Value,
) -> LocalComputationResult {
    let store = stores
        .get(&Consortium::local_store_name(consortium))
        .await
        .unwrap();
    let id = LocalComputationResult::document_id(run_id, username);
    let mut result = match store.get_opt(&id).await.unwrap() {
        Some(doc) => LocalComputationResult::from_value(doc).unwrap(),
        None => LocalComputationResult::new(id, COMPUTATION_ID, consortium, username).unwrap(),
    };
    result.core_mut().data = data;
    let saved = store.save(result.to_value().unwrap()).await.unwrap();
    result.core_mut().rev = Some(saved.rev);
    result
}

/// Receive events until one matches, returning it and everything seen before
pub async fn wait_for_event<F>(events: &mut UnboundedReceiver<PoolEvent>, mut matches: F) -> (PoolEvent, Vec<PoolEvent>)
where
    F: FnMut(&PoolEvent) -> bool,
{
    let mut seen = Vec::new();
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Some(event);
            }
            seen.push(event);
        }
        None
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for event; saw {:?}", names(&seen)));

    match found {
        Some(event) => (event, seen),
        None => panic!("event stream closed; saw {:?}", names(&seen)),
    }
}

/// Everything received so far, without waiting
pub fn drain(events: &mut UnboundedReceiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn names(events: &[PoolEvent]) -> Vec<&'static str> {
    events.iter().map(PoolEvent::name).collect()
}

/// Assert that `name` appears exactly `expected` times
pub fn assert_event_count(events: &[PoolEvent], name: &str, expected: usize) {
    let count = events.iter().filter(|e| e.name() == name).count();
    assert_eq!(
        count, expected,
        "expected {} `{}` events, got {} in {:?}",
        expected,
        name,
        count,
        names(events)
    );
}

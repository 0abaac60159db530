//! Participant-side runner

use crate::core::events::EventBus;
use crate::core::pipeline::Pipeline;
use crate::core::result::{ComputationResult, LocalComputationResult, RemoteComputationResult};
use crate::execution::runner::{PipelineRunner, Runner, RunnerError, RunnerEvent};
use crate::persistence::DocumentStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Runs a participant's local pipeline whenever the aggregate result changes
pub struct LocalPipelineRunner {
    runner: PipelineRunner<LocalComputationResult>,
}

impl LocalPipelineRunner {
    pub fn new(pipeline: Pipeline, result: LocalComputationResult, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            runner: PipelineRunner::new(pipeline, result, store),
        }
    }

    pub fn runner(&self) -> &PipelineRunner<LocalComputationResult> {
        &self.runner
    }

    /// Run the local pipeline against the latest remote result
    ///
    /// The first `user_data` provided sticks; later values are ignored. Until
    /// any is known the run is skipped with `NoopPendingKickoff`.
    pub async fn run(
        &mut self,
        remote_result: &RemoteComputationResult,
        user_data: Option<Value>,
    ) -> Result<LocalComputationResult, RunnerError> {
        if remote_result.complete {
            return Err(RunnerError::RunComplete(remote_result.run_id().to_string()));
        }
        self.runner.begin_attempt().await?;

        if let Some(user_data) = user_data {
            self.runner.update_result(|result| {
                if result.user_data.is_none() {
                    result.user_data = Some(user_data);
                }
            });
        }

        let result = self.runner.result();
        let Some(user_data) = result.user_data.clone() else {
            debug!("{}: waiting for kickoff data", result.id());
            self.runner.emit(RunnerEvent::NoopPendingKickoff(result.to_document()));
            return Ok(result);
        };

        let payload = json!({
            "computationId": result.computation_id(),
            "consortiumId": result.consortium_id(),
            "previousData": result.data(),
            "remoteResult": remote_result.to_value()?,
            "username": result.username(),
            "userData": user_data,
        });
        self.runner.run_pipeline(payload).await
    }
}

#[async_trait]
impl Runner for LocalPipelineRunner {
    type Trigger = RemoteComputationResult;
    type Output = LocalComputationResult;

    async fn run(
        &mut self,
        trigger: &RemoteComputationResult,
        user_data: Option<Value>,
    ) -> Result<LocalComputationResult, RunnerError> {
        LocalPipelineRunner::run(self, trigger, user_data).await
    }

    fn events(&self) -> &EventBus<RunnerEvent> {
        self.runner.events()
    }

    fn result(&self) -> LocalComputationResult {
        self.runner.result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::{Computation, ComputationError};
    use crate::persistence::InMemoryStore;
    use std::sync::Mutex;

    fn remote() -> RemoteComputationResult {
        RemoteComputationResult::new("run1", "comp", "cons", vec!["alice".to_string()]).unwrap()
    }

    fn echo_runner(store: Arc<InMemoryStore>) -> LocalPipelineRunner {
        let echo = Computation::function("echo", |input: Value| async move {
            Ok::<_, ComputationError>(json!({
                "userData": input["userData"].clone(),
                "username": input["username"].clone(),
                "remoteId": input["remoteResult"]["_id"].clone(),
            }))
        });
        let result = LocalComputationResult::new("run1-alice", "comp", "cons", "alice").unwrap();
        LocalPipelineRunner::new(Pipeline::new(vec![echo]).unwrap(), result, store)
    }

    #[tokio::test]
    async fn test_waits_for_kickoff() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let mut runner = echo_runner(store.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runner
            .runner()
            .events()
            .add_handler(move |e: &RunnerEvent| sink.lock().unwrap().push(e.name()));

        let result = runner.run(&remote(), None).await.unwrap();
        assert!(result.rev().is_none());
        assert_eq!(*seen.lock().unwrap(), vec!["noop:pendingKickoff"]);
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_and_first_user_data_wins() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let mut runner = echo_runner(store.clone());

        let first = runner.run(&remote(), Some(json!({ "n": 1 }))).await.unwrap();
        assert_eq!(
            first.data(),
            &json!({ "userData": { "n": 1 }, "username": "alice", "remoteId": "run1" })
        );

        let second = runner.run(&remote(), Some(json!({ "n": 2 }))).await.unwrap();
        assert_eq!(second.data()["userData"], json!({ "n": 1 }));
        assert_eq!(second.user_data, Some(json!({ "n": 1 })));

        let doc = store.get("run1-alice").await.unwrap();
        assert_eq!(doc["userData"], json!({ "n": 1 }));
        assert_eq!(doc["username"], "alice");
    }

    #[tokio::test]
    async fn test_complete_run_is_rejected() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let mut runner = echo_runner(store);
        let mut done = remote();
        done.complete = true;

        let err = runner.run(&done, Some(json!({}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::RunComplete(id) if id == "run1"));
    }
}

//! Aggregator-side runner

use crate::core::events::EventBus;
use crate::core::pipeline::Pipeline;
use crate::core::result::{ComputationResult, LocalComputationResult, RemoteComputationResult};
use crate::core::state::ErrorInfo;
use crate::execution::runner::{get_result_docs, PipelineRunner, Runner, RunnerError, RunnerEvent};
use crate::persistence::DocumentStore;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Sorted `(_id, _rev)` pairs of every participant document of a run
type Fingerprint = Vec<(String, Option<String>)>;

/// Runs the aggregate pipeline whenever participant results change
pub struct RemotePipelineRunner {
    runner: PipelineRunner<RemoteComputationResult>,
    local_store: Arc<dyn DocumentStore>,
    last_fingerprint: Option<Fingerprint>,
}

impl RemotePipelineRunner {
    /// `local_store` holds participant results; `remote_store` receives the aggregate
    pub fn new(
        pipeline: Pipeline,
        result: RemoteComputationResult,
        local_store: Arc<dyn DocumentStore>,
        remote_store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            runner: PipelineRunner::new(pipeline, result, remote_store),
            local_store,
            last_fingerprint: None,
        }
    }

    pub fn runner(&self) -> &PipelineRunner<RemoteComputationResult> {
        &self.runner
    }

    /// Re-run the aggregate for the run `local_result` belongs to
    ///
    /// Skipped with `NoopNoStateChange` when no participant document changed
    /// revision since the last successful call. When any participant reported
    /// an error the errors are saved and the pipeline does not run.
    pub async fn run(&mut self, local_result: &LocalComputationResult) -> Result<RemoteComputationResult, RunnerError> {
        let run_id = local_result.run_id();

        let user_results = get_result_docs(&*self.local_store, run_id)
            .await?
            .into_iter()
            .map(LocalComputationResult::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        let mut fingerprint: Fingerprint = user_results
            .iter()
            .map(|r| (r.id().to_string(), r.rev().map(str::to_string)))
            .collect();
        fingerprint.sort();

        if self.last_fingerprint.as_ref() == Some(&fingerprint) {
            let result = self.runner.result();
            debug!("{}: participant results unchanged", result.id());
            self.runner.emit(RunnerEvent::NoopNoStateChange(result.to_document()));
            return Ok(result);
        }
        self.runner.begin_attempt().await?;

        let (previous_data, plugin_state) = match self.runner.store().get_opt(run_id).await? {
            Some(doc) => (
                doc.get("data").cloned().unwrap_or(Value::Null),
                doc.get("pluginState").cloned().unwrap_or_else(|| json!({})),
            ),
            None => (Value::Null, Value::Object(Map::new())),
        };

        let user_errors: Vec<ErrorInfo> = user_results
            .iter()
            .filter_map(|r| {
                r.core().error.clone().map(|e| match r.username() {
                    Some(username) if e.username.is_none() => e.with_username(username),
                    _ => e,
                })
            })
            .collect();
        let has_errors = !user_errors.is_empty();
        self.runner.update_result(|result| result.user_errors = user_errors);

        if has_errors {
            info!("{}: participants reported errors; skipping aggregation", run_id);
            let saved = self.runner.save_result(None, None, true).await;
            let flushed = self.runner.flush().await;
            saved?;
            let result = flushed?;
            self.last_fingerprint = Some(fingerprint);
            return Ok(result);
        }

        let result = self.runner.result();
        let user_results = user_results
            .iter()
            .map(|r| r.to_value())
            .collect::<Result<Vec<_>, _>>()?;
        let payload = json!({
            "computationId": result.computation_id(),
            "consortiumId": result.consortium_id(),
            "pluginState": plugin_state,
            "previousData": previous_data,
            "usernames": result.usernames,
            "userResults": user_results,
        });
        let result = self.runner.run_pipeline(payload).await?;
        self.last_fingerprint = Some(fingerprint);
        Ok(result)
    }
}

#[async_trait]
impl Runner for RemotePipelineRunner {
    type Trigger = LocalComputationResult;
    type Output = RemoteComputationResult;

    async fn run(
        &mut self,
        trigger: &LocalComputationResult,
        _user_data: Option<Value>,
    ) -> Result<RemoteComputationResult, RunnerError> {
        RemotePipelineRunner::run(self, trigger).await
    }

    fn events(&self) -> &EventBus<RunnerEvent> {
        self.runner.events()
    }

    fn result(&self) -> RemoteComputationResult {
        self.runner.result()
    }
}

//! Pipeline runner core
//!
//! A runner owns one [`Pipeline`] and the result document it advances. Every
//! save request, whether raised by the pipeline or by the runner itself, is
//! applied by a single worker task in submission order, so each save sees the
//! state left behind by the previous one.

use crate::core::events::{EventBus, HandlerId};
use crate::core::pipeline::{Pipeline, PipelineError, PipelineEvent};
use crate::core::result::{ComputationResult, ResultDocument, ResultError};
use crate::core::state::{ErrorInfo, PipelineState};
use crate::persistence::{DocumentStore, StoreError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Error types for runner operations
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("run {0} is already complete")]
    RunComplete(String),

    #[error("no result document found for {0}, and one was already persisted")]
    NoResultDocument(String),

    #[error("result document {0} not found, yet result has a _rev")]
    MissingDocument(String),

    #[error("conflicting usernames exist on {id} ({ours} vs {theirs}); stores are not wired properly")]
    ConflictingUsernames {
        id: String,
        ours: String,
        theirs: String,
    },

    #[error("save aborted after an earlier failure: {0}")]
    SaveAborted(String),

    #[error("save queue closed")]
    SaveQueueClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Events emitted by a runner; each carries the result at that moment
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// A save was skipped because it carried nothing new
    NoopNoData(ResultDocument),
    /// A local run was skipped until the participant provides input
    NoopPendingKickoff(ResultDocument),
    /// A remote run was skipped because no participant document changed
    NoopNoStateChange(ResultDocument),
    /// All saves of the run settled
    Halt(ResultDocument),
    /// The pipeline advanced and runs another round
    InProgress(ResultDocument),
    /// A save failed to persist
    Error(String),
}

impl RunnerEvent {
    /// The result carried by halting events (`Halt` and every no-op)
    pub fn halted_with(&self) -> Option<&ResultDocument> {
        match self {
            RunnerEvent::NoopNoData(doc)
            | RunnerEvent::NoopPendingKickoff(doc)
            | RunnerEvent::NoopNoStateChange(doc)
            | RunnerEvent::Halt(doc) => Some(doc),
            RunnerEvent::InProgress(_) | RunnerEvent::Error(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunnerEvent::NoopNoData(_) => "noop:noData",
            RunnerEvent::NoopPendingKickoff(_) => "noop:pendingKickoff",
            RunnerEvent::NoopNoStateChange(_) => "noop:noStateChange",
            RunnerEvent::Halt(_) => "halt",
            RunnerEvent::InProgress(_) => "inProgress",
            RunnerEvent::Error(_) => "error",
        }
    }
}

/// Fields written to the result document by one save
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPatch {
    pub pipeline_state: PipelineState,
    pub plugin_state: Map<String, Value>,
    /// Written only when present
    pub data: Option<Value>,
    /// Written when present, cleared otherwise
    pub error: Option<ErrorInfo>,
    pub force: bool,
}

impl ResultPatch {
    fn is_empty(&self) -> bool {
        !self.force && self.error.is_none() && self.data.is_none()
    }

    fn apply_to(&self, doc: &mut Map<String, Value>, owned: Map<String, Value>) -> Result<(), ResultError> {
        doc.insert(
            "pipelineState".to_string(),
            serde_json::to_value(self.pipeline_state)?,
        );
        doc.insert(
            "pluginState".to_string(),
            Value::Object(self.plugin_state.clone()),
        );
        if let Some(data) = &self.data {
            doc.insert("data".to_string(), data.clone());
        }
        match &self.error {
            Some(error) => {
                doc.insert("error".to_string(), serde_json::to_value(error)?);
            }
            None => {
                doc.remove("error");
            }
        }
        doc.extend(owned);
        Ok(())
    }
}

/// Treat JSON `null` as "no data"
fn non_null(data: Value) -> Option<Value> {
    if data.is_null() {
        None
    } else {
        Some(data)
    }
}

enum SaveJob {
    Save {
        patch: ResultPatch,
        reply: Option<oneshot::Sender<Result<ResultDocument, RunnerError>>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), RunnerError>>,
    },
}

struct RunnerShared<R> {
    store: Arc<dyn DocumentStore>,
    result: Mutex<R>,
    has_persisted_result: AtomicBool,
    events: EventBus<RunnerEvent>,
}

impl<R: ComputationResult> RunnerShared<R> {
    fn result(&self) -> R {
        self.result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut result = self
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut result)
    }

    /// Apply one patch against the stored document
    async fn persist(&self, patch: &ResultPatch) -> Result<R, RunnerError> {
        let current = self.result();

        if current.rev().is_some() && patch.is_empty() {
            debug!("{}: nothing to save", current.id());
            self.events.emit(RunnerEvent::NoopNoData(current.to_document()));
            return Ok(current);
        }

        let stored = self.store.get_opt(current.id()).await?;
        let mut doc = match current.to_value()? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        match stored {
            Some(Value::Object(stored)) => {
                if let (Some(ours), Some(theirs)) = (
                    current.username(),
                    stored.get("username").and_then(Value::as_str),
                ) {
                    if ours != theirs {
                        return Err(RunnerError::ConflictingUsernames {
                            id: current.id().to_string(),
                            ours: ours.to_string(),
                            theirs: theirs.to_string(),
                        });
                    }
                }

                let mut history = stored
                    .get("history")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if let Some(previous) = stored.get("data").filter(|d| !d.is_null()) {
                    history.push(previous.clone());
                }

                doc.extend(stored);
                doc.insert("history".to_string(), Value::Array(history));
            }
            Some(_) => {
                return Err(StoreError::InvalidDocument {
                    store: self.store.name().to_string(),
                }
                .into())
            }
            None => {
                if current.rev().is_some() {
                    return Err(RunnerError::MissingDocument(current.id().to_string()));
                }
                if self.has_persisted_result.load(Ordering::SeqCst) {
                    return Err(RunnerError::NoResultDocument(current.id().to_string()));
                }
            }
        }

        patch.apply_to(&mut doc, current.owned_fields())?;

        let mut merged = R::from_value(Value::Object(doc))?;
        let saved = self.store.save(merged.to_value()?).await?;
        merged.core_mut().rev = Some(saved.rev);
        self.has_persisted_result.store(true, Ordering::SeqCst);

        debug!(
            "{}: saved at step {} ({} prior values)",
            merged.id(),
            merged.core().pipeline_state.step,
            merged.core().history.len()
        );
        self.update(|result| *result = merged.clone());
        Ok(merged)
    }
}

/// Drain save jobs in order; after a failure, reject saves until the next flush
async fn save_worker<R: ComputationResult>(shared: Arc<RunnerShared<R>>, mut jobs: mpsc::UnboundedReceiver<SaveJob>) {
    let mut failure: Option<String> = None;

    while let Some(job) = jobs.recv().await {
        match job {
            SaveJob::Save { patch, reply } => {
                let outcome = match &failure {
                    Some(message) => Err(RunnerError::SaveAborted(message.clone())),
                    None => match shared.persist(&patch).await {
                        Ok(result) => Ok(result.to_document()),
                        Err(e) => {
                            error!("Failed to save result: {}", e);
                            failure = Some(e.to_string());
                            shared.events.emit(RunnerEvent::Error(e.to_string()));
                            Err(e)
                        }
                    },
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            SaveJob::Flush { reply } => {
                let outcome = match failure.take() {
                    Some(message) => Err(RunnerError::SaveAborted(message)),
                    None => Ok(()),
                };
                let _ = reply.send(outcome);
            }
        }
    }
}

/// Owns a pipeline and the result document it advances
pub struct PipelineRunner<R: ComputationResult> {
    pipeline: Pipeline,
    shared: Arc<RunnerShared<R>>,
    saves: mpsc::UnboundedSender<SaveJob>,
    pipeline_handler: HandlerId,
}

impl<R: ComputationResult> PipelineRunner<R> {
    /// Create a runner persisting `result` into `store`
    ///
    /// Must be called within a tokio runtime; the save worker is spawned here.
    pub fn new(pipeline: Pipeline, result: R, store: Arc<dyn DocumentStore>) -> Self {
        let shared = Arc::new(RunnerShared {
            store,
            has_persisted_result: AtomicBool::new(result.rev().is_some()),
            result: Mutex::new(result),
            events: EventBus::new(),
        });

        let (saves, jobs) = mpsc::unbounded_channel();
        tokio::spawn(save_worker(shared.clone(), jobs));

        let handler_saves = saves.clone();
        let handler_shared = shared.clone();
        let pipeline_handler = pipeline.add_event_handler(move |event| match event {
            PipelineEvent::SaveRequest(request) => {
                let patch = ResultPatch {
                    pipeline_state: request.pipeline_state,
                    plugin_state: request.plugin_state.clone(),
                    data: non_null(request.data.clone()),
                    error: None,
                    force: request.force,
                };
                if handler_saves.send(SaveJob::Save { patch, reply: None }).is_err() {
                    warn!("Save queue closed; dropping save request");
                }
            }
            PipelineEvent::InProgress { .. } => {
                let doc = handler_shared.result().to_document();
                handler_shared.events.emit(RunnerEvent::InProgress(doc));
            }
            PipelineEvent::ComputationStart { .. } | PipelineEvent::ComputationEnd { .. } => {}
        });

        Self {
            pipeline,
            shared,
            saves,
            pipeline_handler,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.shared.store
    }

    pub fn events(&self) -> &EventBus<RunnerEvent> {
        &self.shared.events
    }

    /// Snapshot of the current result
    pub fn result(&self) -> R {
        self.shared.result()
    }

    pub fn has_persisted_result(&self) -> bool {
        self.shared.has_persisted_result.load(Ordering::SeqCst)
    }

    pub(crate) fn update_result<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        self.shared.update(f)
    }

    pub(crate) fn emit(&self, event: RunnerEvent) {
        self.shared.events.emit(event);
    }

    fn patch(&self, data: Option<Value>, error: Option<ErrorInfo>, force: bool, plugin_state: Map<String, Value>) -> ResultPatch {
        ResultPatch {
            pipeline_state: self.pipeline.serialize(),
            plugin_state,
            data: data.and_then(non_null),
            error,
            force,
        }
    }

    async fn enqueue(&self, patch: ResultPatch) -> Result<R, RunnerError> {
        let (reply, rx) = oneshot::channel();
        self.saves
            .send(SaveJob::Save {
                patch,
                reply: Some(reply),
            })
            .map_err(|_| RunnerError::SaveQueueClosed)?;
        rx.await.map_err(|_| RunnerError::SaveQueueClosed)??;
        Ok(self.result())
    }

    /// Queue a save of `data` and/or `error`, resolving once it was applied
    ///
    /// Skipped with [`RunnerEvent::NoopNoData`] when the result was persisted
    /// before and there is neither data, an error, nor `force`.
    pub async fn save_result(
        &self,
        data: Option<Value>,
        error: Option<ErrorInfo>,
        force: bool,
    ) -> Result<R, RunnerError> {
        let plugin_state = self.result().core().plugin_state.clone();
        self.enqueue(self.patch(data, error, force, plugin_state)).await
    }

    /// Wait for every queued save; reports and clears a pending failure
    async fn settle(&self) -> Result<(), RunnerError> {
        let (reply, rx) = oneshot::channel();
        self.saves
            .send(SaveJob::Flush { reply })
            .map_err(|_| RunnerError::SaveQueueClosed)?;
        rx.await.map_err(|_| RunnerError::SaveQueueClosed)?
    }

    /// Start a run attempt with a clean save queue
    ///
    /// A failure left over from an earlier attempt belongs to that attempt and
    /// is discarded here.
    pub async fn begin_attempt(&self) -> Result<(), RunnerError> {
        match self.settle().await {
            Err(RunnerError::SaveAborted(message)) => {
                warn!("{}: discarding failure of an earlier run: {}", self.result().id(), message);
                Ok(())
            }
            other => other,
        }
    }

    /// Wait for every queued save, then emit [`RunnerEvent::Halt`]
    pub async fn flush(&self) -> Result<R, RunnerError> {
        self.settle().await?;

        let result = self.result();
        self.emit(RunnerEvent::Halt(result.to_document()));
        Ok(result)
    }

    /// Run the pipeline on `payload`, recording a failure on the result
    ///
    /// A failing pipeline does not fail the call: its error is persisted with
    /// a forced save and the runner still halts. Only persistence failures are
    /// returned.
    pub async fn run_pipeline(&mut self, payload: Value) -> Result<R, RunnerError> {
        let mut working = self.result().core().clone();
        let step = self.pipeline.step();

        match self.pipeline.run(payload, &mut working).await {
            Ok(_) => {
                debug!("{}: pipeline settled at step {}", self.result().id(), self.pipeline.step());
            }
            Err(err) => {
                warn!("{}: pipeline failed from step {}: {}", self.result().id(), step, err);
                let patch = self.patch(None, Some(ErrorInfo::from_error(&err)), true, working.plugin_state.clone());
                if self.saves.send(SaveJob::Save { patch, reply: None }).is_err() {
                    return Err(RunnerError::SaveQueueClosed);
                }
            }
        }

        let result = self.flush().await?;
        let plugin_state = working.plugin_state;
        self.update_result(|r| r.core_mut().plugin_state = plugin_state);
        info!("{}: halted at step {}", result.id(), self.pipeline.step());
        Ok(self.result())
    }
}

impl<R: ComputationResult> Drop for PipelineRunner<R> {
    fn drop(&mut self) {
        self.pipeline.remove_event_handler(self.pipeline_handler);
    }
}

/// Documents of `run_id`: the remote `<runId>` and every local `<runId>-<user>`
pub async fn get_result_docs(store: &dyn DocumentStore, run_id: &str) -> Result<Vec<Value>, StoreError> {
    let prefix = format!("{}-", run_id);
    Ok(store
        .all()
        .await?
        .into_iter()
        .filter(|doc| {
            doc.get("_id")
                .and_then(Value::as_str)
                .is_some_and(|id| id == run_id || id.starts_with(&prefix))
        })
        .collect())
}

/// First document of `run_id`, if any
pub async fn find_result_by_run_id(store: &dyn DocumentStore, run_id: &str) -> Result<Option<Value>, StoreError> {
    Ok(get_result_docs(store, run_id).await?.into_iter().next())
}

/// `data` of the first document of `run_id`, or `null`
pub async fn get_previous_result_data(store: &dyn DocumentStore, run_id: &str) -> Result<Value, StoreError> {
    Ok(find_result_by_run_id(store, run_id)
        .await?
        .and_then(|doc| doc.get("data").cloned())
        .unwrap_or(Value::Null))
}

/// A runner the pool can drive with a change observed on the other side
#[async_trait]
pub trait Runner: Send + 'static {
    /// Document type whose changes trigger a run
    type Trigger: ComputationResult;
    /// Document type this runner writes
    type Output: ComputationResult;

    async fn run(
        &mut self,
        trigger: &Self::Trigger,
        user_data: Option<Value>,
    ) -> Result<Self::Output, RunnerError>;

    fn events(&self) -> &EventBus<RunnerEvent>;

    fn result(&self) -> Self::Output;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::{Computation, ComputationError};
    use crate::core::result::LocalComputationResult;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn local_result() -> LocalComputationResult {
        LocalComputationResult::new("run1-alice", "comp", "cons", "alice").unwrap()
    }

    fn constant(value: Value) -> Computation {
        Computation::function("constant", move |_: Value| {
            let value = value.clone();
            async move { Ok::<_, ComputationError>(value) }
        })
    }

    fn runner_with(store: Arc<InMemoryStore>, computation: Computation) -> PipelineRunner<LocalComputationResult> {
        PipelineRunner::new(Pipeline::new(vec![computation]).unwrap(), local_result(), store)
    }

    fn record(runner: &PipelineRunner<LocalComputationResult>) -> Arc<Mutex<Vec<&'static str>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runner.events().add_handler(move |e: &RunnerEvent| sink.lock().unwrap().push(e.name()));
        seen
    }

    #[tokio::test]
    async fn test_first_save_always_persists() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let runner = runner_with(store.clone(), constant(json!(1)));
        let seen = record(&runner);

        let first = runner.save_result(None, None, false).await.unwrap();
        assert!(first.rev().is_some());
        assert!(runner.has_persisted_result());

        let second = runner.save_result(None, None, false).await.unwrap();
        assert_eq!(second.rev(), first.rev());
        assert_eq!(*seen.lock().unwrap(), vec!["noop:noData"]);
        assert_eq!(store.get("run1-alice").await.unwrap()["_rev"], first.rev().unwrap());
    }

    #[tokio::test]
    async fn test_history_is_append_only() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let runner = runner_with(store.clone(), constant(json!(1)));

        for n in 1..=4 {
            runner.save_result(Some(json!(n)), None, false).await.unwrap();
        }

        let doc = store.get("run1-alice").await.unwrap();
        assert_eq!(doc["history"], json!([1, 2, 3]));
        assert_eq!(doc["data"], json!(4));
    }

    #[tokio::test]
    async fn test_forced_save_without_data_still_records_history() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let runner = runner_with(store.clone(), constant(json!(1)));

        runner.save_result(Some(json!(1)), None, false).await.unwrap();
        runner.save_result(None, None, true).await.unwrap();
        assert_eq!(store.get("run1-alice").await.unwrap()["history"], json!([1]));

        runner.save_result(Some(json!(2)), None, false).await.unwrap();
        let doc = store.get("run1-alice").await.unwrap();
        assert_eq!(doc["history"], json!([1, 1]));
        assert_eq!(doc["data"], json!(2));
    }

    #[tokio::test]
    async fn test_new_attempt_discards_earlier_failure() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let mut result = local_result();
        result.core_mut().rev = Some("1-abc".to_string());
        let runner = PipelineRunner::new(
            Pipeline::new(vec![constant(json!(1))]).unwrap(),
            result,
            store.clone(),
        );

        assert!(runner.save_result(Some(json!(1)), None, false).await.is_err());
        assert!(matches!(
            runner.save_result(Some(json!(1)), None, false).await,
            Err(RunnerError::SaveAborted(_))
        ));

        runner.begin_attempt().await.unwrap();
        runner.update_result(|r| r.core_mut().rev = None);
        runner.save_result(Some(json!(2)), None, false).await.unwrap();
        assert_eq!(store.get("run1-alice").await.unwrap()["data"], json!(2));
    }

    #[tokio::test]
    async fn test_concurrent_saves_apply_in_order() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let runner = runner_with(store.clone(), constant(json!(1)));

        let (a, b, c) = tokio::join!(
            runner.save_result(Some(json!("a")), None, false),
            runner.save_result(Some(json!("b")), None, false),
            runner.save_result(Some(json!("c")), None, false),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let doc = store.get("run1-alice").await.unwrap();
        assert_eq!(doc["history"], json!(["a", "b"]));
        assert_eq!(doc["data"], json!("c"));
    }

    #[tokio::test]
    async fn test_error_is_recorded_then_cleared() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let runner = runner_with(store.clone(), constant(json!(1)));

        runner
            .save_result(None, Some(ErrorInfo::new("boom")), true)
            .await
            .unwrap();
        assert_eq!(store.get("run1-alice").await.unwrap()["error"]["message"], "boom");

        runner.save_result(Some(json!(2)), None, false).await.unwrap();
        assert!(store.get("run1-alice").await.unwrap().get("error").is_none());
    }

    #[tokio::test]
    async fn test_missing_document_with_rev_fails() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let mut result = local_result();
        result.core_mut().rev = Some("1-abc".to_string());
        let runner = PipelineRunner::new(
            Pipeline::new(vec![constant(json!(1))]).unwrap(),
            result,
            store,
        );
        let seen = record(&runner);

        let err = runner.save_result(Some(json!(1)), None, false).await.unwrap_err();
        assert!(matches!(err, RunnerError::MissingDocument(_)));
        assert_eq!(*seen.lock().unwrap(), vec!["error"]);

        // the failure is reported once more by the next flush, then cleared
        assert!(runner.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_conflicting_usernames() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        store
            .save(json!({
                "_id": "run1-alice",
                "username": "mallory",
                "computationId": "comp",
                "consortiumId": "cons",
            }))
            .await
            .unwrap();
        let runner = runner_with(store, constant(json!(1)));

        let err = runner.save_result(Some(json!(1)), None, false).await.unwrap_err();
        assert!(matches!(err, RunnerError::ConflictingUsernames { .. }));
    }

    #[tokio::test]
    async fn test_run_pipeline_persists_output_and_halts() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let mut runner = runner_with(store.clone(), constant(json!({ "sum": 3 })));
        let seen = record(&runner);

        let result = runner.run_pipeline(json!({})).await.unwrap();
        assert_eq!(result.data(), &json!({ "sum": 3 }));
        assert_eq!(*seen.lock().unwrap(), vec!["halt"]);
        assert_eq!(store.get("run1-alice").await.unwrap()["data"], json!({ "sum": 3 }));
    }

    #[tokio::test]
    async fn test_run_pipeline_records_failure() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let failing = Computation::function("boom", |_: Value| async {
            Err::<Value, _>(ComputationError::failed("boom"))
        });
        let mut runner = runner_with(store.clone(), failing);

        let result = runner.run_pipeline(json!({})).await.unwrap();
        let error = result.core().error.clone().unwrap();
        assert!(error.message.contains("boom"));
        assert!(!runner.pipeline().in_progress());

        let doc = store.get("run1-alice").await.unwrap();
        assert!(doc["error"]["message"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_owned_fields_survive_merges() {
        let store = Arc::new(InMemoryStore::new("local-consortium-cons"));
        let runner = runner_with(store.clone(), constant(json!(1)));
        runner.update_result(|r| r.user_data = Some(json!({ "x": 1 })));

        runner.save_result(Some(json!(1)), None, false).await.unwrap();
        assert_eq!(store.get("run1-alice").await.unwrap()["userData"], json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_result_docs_match_run_exactly() {
        let store = InMemoryStore::new("local-consortium-cons");
        for id in ["run1-alice", "run1-bob", "run10-alice", "run2-alice"] {
            store.save(json!({ "_id": id, "data": id })).await.unwrap();
        }

        let docs = get_result_docs(&store, "run1").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(get_previous_result_data(&store, "run2").await.unwrap(), json!("run2-alice"));
        assert!(find_result_by_run_id(&store, "run3").await.unwrap().is_none());
    }
}

//! Runner pools
//!
//! A pool watches the result stores of every consortium in scope and drives
//! one runner per run id whenever a result document on the other side
//! changes. Triggers for the same run id are executed strictly one after the
//! other; different run ids proceed independently.

use crate::computation::{ComputationError, ComputationRegistry, FunctionRegistry, RegistryError};
use crate::core::consortium::Consortium;
use crate::core::decentralized::{DecentralizedComputation, Environment};
use crate::core::events::EventBus;
use crate::core::pipeline::{Pipeline, PipelineError};
use crate::core::plugin::{PipelinePlugins, PluginError, PluginRegistry};
use crate::core::result::{ComputationResult, ResultDocument, ResultError};
use crate::execution::listener::{ChangeListener, ListenerEvent};
use crate::execution::runner::{Runner, RunnerError, RunnerEvent};
use crate::persistence::{StoreError, StoreLifecycle, StoreRegistry};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static RESULT_STORE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(local|remote)-consortium-([^-]+)$").expect("Invalid result store pattern")
});

/// Name of the consortium membership store
pub const CONSORTIA_STORE: &str = "consortia";

/// Name of the store mapping computation ids to `{name, version}`
pub const COMPUTATIONS_STORE: &str = "computations";

/// Error types for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool must be initialized first")]
    NotInitialized,

    #[error("pool is already initialized")]
    AlreadyInitialized,

    #[error("run {0} exited, but pipeline has not halted")]
    NotHalted(String),

    #[error("run queue for {0} closed before the job finished")]
    QueueClosed(String),

    #[error("computation document {0} lacks name or version")]
    InvalidComputationDocument(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Computation(#[from] ComputationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error("invalid consortium document: {0}")]
    Consortium(#[from] serde_json::Error),
}

/// Events published by a pool
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Ready,
    RunStart(ResultDocument),
    RunEnd(ResultDocument),
    PipelineInProgress,
    QueueStart(String),
    QueueEnd(String),
    ListenerCreated(String),
    ComputationComplete { run_id: String, consortium_id: String },
    ComputationMarkedComplete { run_id: String, consortium_id: String },
    Error(String),
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::Ready => "ready",
            PoolEvent::RunStart(_) => "run:start",
            PoolEvent::RunEnd(_) => "run:end",
            PoolEvent::PipelineInProgress => "pipeline:inProgress",
            PoolEvent::QueueStart(_) => "queue:start",
            PoolEvent::QueueEnd(_) => "queue:end",
            PoolEvent::ListenerCreated(_) => "listener:created",
            PoolEvent::ComputationComplete { .. } => "computation:complete",
            PoolEvent::ComputationMarkedComplete { .. } => "computation:markedComplete",
            PoolEvent::Error(_) => "error",
        }
    }
}

/// Collaborators shared by every runner a pool creates
#[derive(Clone)]
pub struct PoolContext {
    pub stores: Arc<StoreRegistry>,
    pub computations: Arc<dyn ComputationRegistry>,
    pub plugins: PluginRegistry,
    pub functions: FunctionRegistry,
}

impl PoolContext {
    pub fn new(stores: Arc<StoreRegistry>, computations: Arc<dyn ComputationRegistry>) -> Self {
        Self {
            stores,
            computations,
            plugins: PluginRegistry::with_builtins(),
            functions: FunctionRegistry::new(),
        }
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Resolve a computation id through the computations store and registry
    pub async fn get_decentralized_computation(
        &self,
        computation_id: &str,
    ) -> Result<Arc<DecentralizedComputation>, PoolError> {
        let doc = self.stores.get(COMPUTATIONS_STORE).await?.get(computation_id).await?;
        let (Some(name), Some(version)) = (
            doc.get("name").and_then(Value::as_str),
            doc.get("version").and_then(Value::as_str),
        ) else {
            return Err(PoolError::InvalidComputationDocument(computation_id.to_string()));
        };
        Ok(self.computations.add(name, version).await?)
    }

    /// Hooks of the definition's plugins for one environment
    pub fn get_pipeline_plugins(
        &self,
        computation: &DecentralizedComputation,
        env: Environment,
    ) -> Result<PipelinePlugins, PoolError> {
        Ok(self.plugins.hooks(&computation.plugins, env)?)
    }

    /// Build the pipeline of `computation_id` for `env`, resuming at `step`
    pub async fn build_pipeline(
        &self,
        computation_id: &str,
        env: Environment,
        step: usize,
    ) -> Result<Pipeline, PoolError> {
        let computation = self.get_decentralized_computation(computation_id).await?;
        let computations = computation.computations(env, &self.functions)?;
        let plugins = self.get_pipeline_plugins(&computation, env)?;
        Ok(Pipeline::new(computations)?.with_plugins(plugins).with_step(step))
    }
}

impl std::fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolContext")
            .field("stores", &self.stores)
            .field("plugins", &self.plugins)
            .field("functions", &self.functions)
            .finish()
    }
}

/// Environment-specific behavior of a pool
#[async_trait]
pub trait PoolFlavor: Send + Sync + 'static {
    type Runner: Runner;

    /// Prefix of the result stores this pool listens to (`local` or `remote`)
    const LISTEN_PREFIX: &'static str;

    /// Environment of the pipelines this pool runs
    const ENV: Environment;

    /// Build the runner for the run `trigger` belongs to
    async fn create_runner(
        &self,
        ctx: &PoolContext,
        trigger: &<Self::Runner as Runner>::Trigger,
    ) -> Result<Self::Runner, PoolError>;

    /// React to a run reporting completion; returns whether it was marked
    async fn on_computation_complete(
        &self,
        _ctx: &PoolContext,
        _run_id: &str,
        _consortium_id: &str,
    ) -> Result<bool, PoolError> {
        Ok(false)
    }
}

type TriggerOf<F> = <<F as PoolFlavor>::Runner as Runner>::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Initializing,
    Initialized,
    Destroying,
    Destroyed,
}

/// Work executed in order on a run's queue
enum RunJob<T> {
    Run {
        trigger: T,
        user_data: Option<Value>,
        reply: oneshot::Sender<Result<ResultDocument, PoolError>>,
    },
    MarkComplete {
        consortium_id: String,
    },
}

struct RunQueue<T> {
    jobs: mpsc::UnboundedSender<RunJob<T>>,
    pending: usize,
}

enum ListenerSlot {
    Constructing,
    Active(ChangeListener),
}

struct PoolInner<F: PoolFlavor> {
    flavor: F,
    ctx: PoolContext,
    state: Mutex<PoolState>,
    settled: watch::Sender<bool>,
    events: EventBus<PoolEvent>,
    runners: Mutex<HashMap<String, Arc<tokio::sync::Mutex<F::Runner>>>>,
    queues: Mutex<HashMap<String, RunQueue<TriggerOf<F>>>>,
    listeners: Mutex<HashMap<String, ListenerSlot>>,
    consortia_listener: Mutex<Option<ChangeListener>>,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
    listen_to: Mutex<Option<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives runners in response to result changes
pub struct PipelineRunnerPool<F: PoolFlavor> {
    inner: Arc<PoolInner<F>>,
}

impl<F: PoolFlavor> Clone for PipelineRunnerPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: PoolFlavor> PipelineRunnerPool<F> {
    pub fn new(flavor: F, ctx: PoolContext) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                flavor,
                ctx,
                state: Mutex::new(PoolState::Uninitialized),
                settled,
                events: EventBus::new(),
                runners: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                consortia_listener: Mutex::new(None),
                lifecycle_task: Mutex::new(None),
                listen_to: Mutex::new(None),
            }),
        }
    }

    /// Restrict the pool to these consortium ids
    pub fn with_listen_to(self, ids: Vec<String>) -> Self {
        *lock(&self.inner.listen_to) = Some(ids);
        self
    }

    pub fn events(&self) -> &EventBus<PoolEvent> {
        &self.inner.events
    }

    pub fn context(&self) -> &PoolContext {
        &self.inner.ctx
    }

    pub fn flavor(&self) -> &F {
        &self.inner.flavor
    }

    pub fn state(&self) -> PoolState {
        *lock(&self.inner.state)
    }

    /// Initialized or initializing, and not being torn down
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn listen_to(&self) -> Option<Vec<String>> {
        lock(&self.inner.listen_to).clone()
    }

    /// Names of the result stores currently listened to
    pub fn listener_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.listeners).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn runner_count(&self) -> usize {
        lock(&self.inner.runners).len()
    }

    /// Start listening; resolves once every in-scope consortium is wired
    pub async fn init(&self) -> Result<(), PoolError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != PoolState::Uninitialized {
                return Err(PoolError::AlreadyInitialized);
            }
            *state = PoolState::Initializing;
        }
        info!("Initializing {} pool", F::ENV);

        let outcome = self.inner.clone().init().await;

        {
            let mut state = lock(&self.inner.state);
            if *state == PoolState::Initializing {
                *state = match outcome {
                    Ok(()) => PoolState::Initialized,
                    Err(_) => PoolState::Uninitialized,
                };
            }
        }
        self.inner.settled.send_replace(true);

        match outcome {
            Ok(()) => {
                info!("{} pool ready", F::ENV);
                self.inner.events.emit(PoolEvent::Ready);
                Ok(())
            }
            Err(e) => {
                error!("{} pool failed to initialize: {}", F::ENV, e);
                self.inner.events.emit(PoolEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Route a changed result document to its runner
    ///
    /// Results that already signal completion only emit
    /// `ComputationComplete`; nothing runs for them.
    pub fn handle_result_change(&self, result: TriggerOf<F>) {
        self.inner.handle_result_change(result);
    }

    /// Queue a run for `result`'s run id
    ///
    /// Enqueueing happens before this returns, so calls made in sequence run
    /// in the same order. The returned future resolves with that job's outcome
    /// and may be dropped without cancelling the job.
    pub fn trigger_runner(
        &self,
        result: TriggerOf<F>,
        user_data: Option<Value>,
    ) -> impl Future<Output = Result<ResultDocument, PoolError>> + Send + 'static {
        self.inner.trigger_runner(result, user_data)
    }

    /// Listen to the result stores of these consortia
    pub async fn listen_to_consortia(&self, consortia: Vec<Consortium>) -> Result<Vec<String>, PoolError> {
        self.inner.listen_to_consortia(consortia).await
    }

    /// Stop listening to these consortia and close their result stores
    pub async fn unlisten_to_consortia(&self, ids: &[String]) -> Result<(), PoolError> {
        self.inner.unlisten_to_consortia(ids).await
    }

    /// React to a newly created store; attaches a listener when it is an
    /// in-scope result store this pool does not watch yet
    pub async fn upsert_listener(&self, store_name: &str) -> Result<bool, PoolError> {
        self.inner.upsert_listener(store_name).await
    }

    /// Tear down listeners and the store registry
    ///
    /// Waits for a pending `init` to settle first.
    pub async fn destroy(&self) -> Result<(), PoolError> {
        let was_initializing = {
            let mut state = lock(&self.inner.state);
            match *state {
                PoolState::Initialized => {
                    *state = PoolState::Destroying;
                    false
                }
                PoolState::Initializing => {
                    *state = PoolState::Destroying;
                    true
                }
                _ => return Err(PoolError::NotInitialized),
            }
        };

        if was_initializing {
            debug!("Waiting for init before destroying pool");
            let mut settled = self.inner.settled.subscribe();
            let _ = settled.wait_for(|done| *done).await;
        }

        self.inner.events.clear();
        if let Some(task) = lock(&self.inner.lifecycle_task).take() {
            task.abort();
        }
        if let Some(mut listener) = lock(&self.inner.consortia_listener).take() {
            listener.destroy();
        }
        let listeners: Vec<ListenerSlot> = lock(&self.inner.listeners).drain().map(|(_, slot)| slot).collect();
        for slot in listeners {
            if let ListenerSlot::Active(mut listener) = slot {
                listener.destroy();
            }
        }

        let outcome = self.inner.ctx.stores.destroy(false).await;
        *lock(&self.inner.state) = PoolState::Destroyed;
        info!("{} pool destroyed", F::ENV);
        outcome.map_err(PoolError::from)
    }
}

impl<F: PoolFlavor> PoolInner<F> {
    fn is_active(&self) -> bool {
        matches!(
            *lock(&self.state),
            PoolState::Initializing | PoolState::Initialized
        )
    }

    fn store_name(id: &str) -> String {
        format!("{}-consortium-{}", F::LISTEN_PREFIX, id)
    }

    fn should_listen(&self, consortium_id: &str) -> bool {
        match &*lock(&self.listen_to) {
            Some(ids) => ids.iter().any(|id| id == consortium_id),
            None => true,
        }
    }

    async fn init(self: Arc<Self>) -> Result<(), PoolError> {
        let mut lifecycle = self.ctx.stores.subscribe();
        let weak = Arc::downgrade(&self);
        let task = tokio::spawn(async move {
            loop {
                let name = match lifecycle.recv().await {
                    Ok(StoreLifecycle::Created(name)) => name,
                    Ok(StoreLifecycle::Removed(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} store lifecycle events", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_active() {
                    continue;
                }
                if let Err(e) = inner.upsert_listener(&name).await {
                    inner.events.emit(PoolEvent::Error(e.to_string()));
                }
            }
        });
        *lock(&self.lifecycle_task) = Some(task);

        let consortia = self.ctx.stores.get(CONSORTIA_STORE).await?;
        consortia.wait_synced().await?;
        self.ctx.stores.get(COMPUTATIONS_STORE).await?.wait_synced().await?;

        let known: Vec<Consortium> = consortia
            .all()
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        let in_scope: Vec<Consortium> = known.into_iter().filter(|c| self.should_listen(&c.id)).collect();
        self.listen_to_consortia(in_scope).await?;

        let weak = Arc::downgrade(&self);
        let listener = ChangeListener::new(&*consortia, move |event| {
            let ListenerEvent::Change { doc, .. } = event else {
                return;
            };
            let Some(inner) = weak.upgrade() else { return };
            let consortium: Consortium = match serde_json::from_value(doc) {
                Ok(consortium) => consortium,
                Err(e) => {
                    inner.events.emit(PoolEvent::Error(format!("invalid consortium document: {}", e)));
                    return;
                }
            };
            if !inner.is_active() || !inner.should_listen(&consortium.id) {
                return;
            }
            tokio::spawn(async move {
                if let Err(e) = inner.listen_to_consortia(vec![consortium]).await {
                    inner.events.emit(PoolEvent::Error(e.to_string()));
                }
            });
        });
        *lock(&self.consortia_listener) = Some(listener);

        Ok(())
    }

    /// Claim the listener slot for `name`; false when one exists or is being built
    fn claim_listener(&self, name: &str) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.contains_key(name) {
            return false;
        }
        listeners.insert(name.to_string(), ListenerSlot::Constructing);
        true
    }

    async fn listen_to_consortia(self: &Arc<Self>, consortia: Vec<Consortium>) -> Result<Vec<String>, PoolError> {
        let mut created = Vec::new();
        for consortium in consortia {
            let name = Self::store_name(&consortium.id);
            if !self.claim_listener(&name) {
                continue;
            }
            self.attach_listener(&name, &consortium.id).await?;
            created.push(name);
        }
        Ok(created)
    }

    /// Build the listener for a claimed slot
    async fn attach_listener(self: &Arc<Self>, name: &str, consortium_id: &str) -> Result<(), PoolError> {
        let store = match self.ctx.stores.get(name).await {
            Ok(store) => store,
            Err(e) => {
                lock(&self.listeners).remove(name);
                return Err(e.into());
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let listener = ChangeListener::new(&*store, move |event| {
            let Some(inner) = weak.upgrade() else { return };
            match event {
                ListenerEvent::Change { doc, name } => match <TriggerOf<F> as ComputationResult>::from_value(doc) {
                    Ok(result) => inner.handle_result_change(result),
                    Err(e) => {
                        warn!("Ignoring malformed result in {}: {}", name, e);
                        inner.events.emit(PoolEvent::Error(e.to_string()));
                    }
                },
                ListenerEvent::Delete { .. } => {}
                ListenerEvent::Error { error, .. } => inner.events.emit(PoolEvent::Error(error)),
            }
        });

        lock(&self.listeners).insert(name.to_string(), ListenerSlot::Active(listener));
        if let Some(ids) = lock(&self.listen_to).as_mut() {
            if !ids.iter().any(|id| id == consortium_id) {
                ids.push(consortium_id.to_string());
            }
        }

        info!("Listening to {}", name);
        self.events.emit(PoolEvent::ListenerCreated(name.to_string()));
        Ok(())
    }

    async fn upsert_listener(self: &Arc<Self>, store_name: &str) -> Result<bool, PoolError> {
        let Some(id) = RESULT_STORE_PATTERN
            .captures(store_name)
            .filter(|caps| &caps[1] == F::LISTEN_PREFIX)
            .map(|caps| caps[2].to_string())
        else {
            return Ok(false);
        };
        if !self.is_active() {
            return Ok(false);
        }

        let consortia = self.ctx.stores.get(CONSORTIA_STORE).await?;
        if consortia.get_opt(&id).await?.is_none() || !self.is_active() {
            debug!("No consortium {} for new store {}", id, store_name);
            return Ok(false);
        }
        if !self.claim_listener(store_name) {
            return Ok(false);
        }
        self.attach_listener(store_name, &id).await?;
        Ok(true)
    }

    async fn unlisten_to_consortia(&self, ids: &[String]) -> Result<(), PoolError> {
        for id in ids {
            let name = Self::store_name(id);
            if let Some(list) = lock(&self.listen_to).as_mut() {
                list.retain(|existing| existing != id);
            }
            let slot = lock(&self.listeners).remove(&name);
            if let Some(ListenerSlot::Active(mut listener)) = slot {
                listener.destroy();
            }
            self.ctx.stores.clean_up(&name, false).await?;
            info!("Stopped listening to {}", name);
        }
        Ok(())
    }

    fn handle_result_change(self: &Arc<Self>, result: TriggerOf<F>) {
        if result.signals_completion() {
            self.notify_complete(result.run_id(), result.consortium_id());
            return;
        }
        // the outcome is reported through events
        drop(self.trigger_runner(result, None));
    }

    fn notify_complete(self: &Arc<Self>, run_id: &str, consortium_id: &str) {
        info!("Run {} of consortium {} is complete", run_id, consortium_id);
        self.events.emit(PoolEvent::ComputationComplete {
            run_id: run_id.to_string(),
            consortium_id: consortium_id.to_string(),
        });

        // ordered after every job already queued for this run
        self.enqueue(
            run_id.to_string(),
            RunJob::MarkComplete {
                consortium_id: consortium_id.to_string(),
            },
        );
    }

    async fn mark_complete(&self, run_id: &str, consortium_id: &str) {
        match self.flavor.on_computation_complete(&self.ctx, run_id, consortium_id).await {
            Ok(true) => self.events.emit(PoolEvent::ComputationMarkedComplete {
                run_id: run_id.to_string(),
                consortium_id: consortium_id.to_string(),
            }),
            Ok(false) => {}
            Err(e) => {
                error!("Failed to mark run {} complete: {}", run_id, e);
                self.events.emit(PoolEvent::Error(e.to_string()));
            }
        }
    }

    fn trigger_runner(
        self: &Arc<Self>,
        result: TriggerOf<F>,
        user_data: Option<Value>,
    ) -> impl Future<Output = Result<ResultDocument, PoolError>> + Send + 'static {
        let run_id = result.run_id().to_string();
        let (reply, outcome) = oneshot::channel();
        self.enqueue(
            run_id.clone(),
            RunJob::Run {
                trigger: result,
                user_data,
                reply,
            },
        );

        async move { outcome.await.map_err(|_| PoolError::QueueClosed(run_id))? }
    }

    /// Append `job` to the queue of `run_id`, starting its worker if idle
    fn enqueue(self: &Arc<Self>, run_id: String, job: RunJob<TriggerOf<F>>) {
        let worker = {
            let mut queues = lock(&self.queues);
            let mut worker = None;
            let queue = queues.entry(run_id.clone()).or_insert_with(|| {
                let (jobs, rx) = mpsc::unbounded_channel();
                worker = Some(rx);
                RunQueue { jobs, pending: 0 }
            });
            queue.pending += 1;
            // the worker only exits after removing the queue under this lock
            let _ = queue.jobs.send(job);
            worker
        };
        if let Some(rx) = worker {
            debug!("Started run queue for {}", run_id);
            self.events.emit(PoolEvent::QueueStart(run_id.clone()));
            tokio::spawn(self.clone().drain_queue(run_id, rx));
        }
    }

    async fn drain_queue(self: Arc<Self>, run_id: String, mut jobs: mpsc::UnboundedReceiver<RunJob<TriggerOf<F>>>) {
        while let Some(job) = jobs.recv().await {
            match job {
                RunJob::Run {
                    trigger,
                    user_data,
                    reply,
                } => {
                    let outcome = self.trigger_run(&trigger, user_data).await;
                    if let Err(e) = &outcome {
                        error!("Run {} failed: {}", run_id, e);
                        self.events.emit(PoolEvent::Error(e.to_string()));
                    }
                    let _ = reply.send(outcome);
                }
                RunJob::MarkComplete { consortium_id } => {
                    self.mark_complete(&run_id, &consortium_id).await;
                }
            }

            let drained = {
                let mut queues = lock(&self.queues);
                let drained = match queues.get_mut(&run_id) {
                    Some(queue) => {
                        queue.pending -= 1;
                        queue.pending == 0
                    }
                    None => true,
                };
                if drained {
                    queues.remove(&run_id);
                }
                drained
            };
            if drained {
                debug!("Run queue for {} drained", run_id);
                self.events.emit(PoolEvent::QueueEnd(run_id.clone()));
                break;
            }
        }
    }

    async fn prepare_runner(&self, trigger: &TriggerOf<F>) -> Result<Arc<tokio::sync::Mutex<F::Runner>>, PoolError> {
        let run_id = trigger.run_id();
        let existing = lock(&self.runners).get(run_id).cloned();
        if let Some(runner) = existing {
            return Ok(runner);
        }

        // only this run's queue worker creates its runner
        info!("Creating {} runner for run {}", F::ENV, run_id);
        let runner = Arc::new(tokio::sync::Mutex::new(
            self.flavor.create_runner(&self.ctx, trigger).await?,
        ));
        lock(&self.runners).insert(run_id.to_string(), runner.clone());
        Ok(runner)
    }

    async fn trigger_run(self: &Arc<Self>, trigger: &TriggerOf<F>, user_data: Option<Value>) -> Result<ResultDocument, PoolError> {
        let runner = self.prepare_runner(trigger).await?;
        let mut runner = runner.lock().await;
        self.run(&mut *runner, trigger, user_data).await
    }

    /// Run once, relaying this run's runner events onto the pool
    async fn run(
        self: &Arc<Self>,
        runner: &mut F::Runner,
        trigger: &TriggerOf<F>,
        user_data: Option<Value>,
    ) -> Result<ResultDocument, PoolError> {
        let halted: Arc<Mutex<Option<ResultDocument>>> = Arc::new(Mutex::new(None));

        let events = self.events.clone();
        let halt_slot = halted.clone();
        let handler = runner.events().add_handler(move |event: &RunnerEvent| {
            if matches!(event, RunnerEvent::InProgress(_)) {
                events.emit(PoolEvent::PipelineInProgress);
                return;
            }
            if let Some(doc) = event.halted_with() {
                let mut slot = lock(&halt_slot);
                if slot.is_none() {
                    *slot = Some(doc.clone());
                    drop(slot);
                    events.emit(PoolEvent::RunEnd(doc.clone()));
                }
            }
        });

        self.events.emit(PoolEvent::RunStart(trigger.to_document()));
        let outcome = runner.run(trigger, user_data).await;
        runner.events().remove_handler(handler);
        outcome?;

        let Some(doc) = lock(&halted).take() else {
            return Err(PoolError::NotHalted(trigger.run_id().to_string()));
        };
        if doc.signals_completion() {
            self.notify_complete(doc.run_id(), doc.consortium_id());
        }
        Ok(doc)
    }
}

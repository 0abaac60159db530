//! Pipeline state machine
//!
//! A pipeline is an ordered list of computations plus a `step` cursor. Each
//! call to [`Pipeline::run`] executes one round at the current step and keeps
//! running further rounds for as long as the step gate says to advance.
//! Every round ends with a [`PipelineEvent::SaveRequest`] so the owner can
//! persist the output.

use crate::computation::{Computation, ComputationError};
use crate::core::events::{EventBus, HandlerId};
use crate::core::plugin::{PipelinePlugins, PluginError, RunControl};
use crate::core::result::ResultCore;
use crate::core::state::{is_truthy, PipelineState};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

/// Error types for pipeline runs
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run input must be a JSON object")]
    MissingInput,

    #[error("pipelines do not permit concurrent running; create a new pipeline instance if concurrency is required")]
    ConcurrentRun,

    #[error("pipeline requires at least one computation")]
    NoComputations,

    #[error("computation at step {step} failed: {source}")]
    Computation {
        step: usize,
        #[source]
        source: ComputationError,
    },

    #[error("step gate at step {step} failed: {source}")]
    Gate {
        step: usize,
        #[source]
        source: ComputationError,
    },

    #[error("{phase} plugin failed at step {step}: {source}")]
    Plugin {
        step: usize,
        phase: &'static str,
        #[source]
        source: PluginError,
    },
}

impl PipelineError {
    /// Whether the error was raised while executing a round, as opposed to
    /// rejecting the call up front
    pub fn is_run_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Computation { .. } | PipelineError::Gate { .. } | PipelineError::Plugin { .. }
        )
    }
}

/// A request to persist the output of one round
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    /// Output of the round (`null` when cancelled or empty)
    pub data: Value,

    /// Persist even when `data` is empty
    pub force: bool,

    /// Pipeline state at the time of the request
    pub pipeline_state: PipelineState,

    /// Plugin state at the time of the request
    pub plugin_state: Map<String, Value>,
}

/// Events that occur while a pipeline runs
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ComputationStart { step: usize },
    ComputationEnd { step: usize },
    SaveRequest(SaveRequest),
    /// Another round is about to run
    InProgress { output: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatePhase {
    PreRun,
    PostRun,
}

/// Ordered computations with a step cursor
#[derive(Debug)]
pub struct Pipeline {
    computations: Vec<Computation>,
    step: usize,
    in_progress: bool,
    plugins: PipelinePlugins,
    events: EventBus<PipelineEvent>,
}

impl Pipeline {
    /// Create a pipeline at step 0
    pub fn new(computations: Vec<Computation>) -> Result<Self, PipelineError> {
        if computations.is_empty() {
            return Err(PipelineError::NoComputations);
        }
        Ok(Self {
            computations,
            step: 0,
            in_progress: false,
            plugins: PipelinePlugins::default(),
            events: EventBus::new(),
        })
    }

    pub fn with_plugins(mut self, plugins: PipelinePlugins) -> Self {
        self.plugins = plugins;
        self
    }

    /// Resume from a persisted step
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step.min(self.computations.len() - 1);
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.events.add_handler(handler)
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        self.events.remove_handler(id)
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn computations(&self) -> &[Computation] {
        &self.computations
    }

    pub fn computation(&self) -> &Computation {
        &self.computations[self.step]
    }

    /// Persistable state; computations are not part of it
    pub fn serialize(&self) -> PipelineState {
        PipelineState::new(self.step, self.in_progress)
    }

    /// Run rounds starting at the current step
    ///
    /// Resolves with the output of the last round. Rounds chain while the
    /// post-run gate advances the step; each chained round receives the
    /// previous input plus `previousData` set to the prior output.
    ///
    /// # Errors
    /// Rejects without touching state when `input` is not an object or a run
    /// is already in flight. Failures raised by computations, gates, or
    /// plugins reset `in_progress` and are returned as run errors.
    pub async fn run(&mut self, input: Value, result: &mut ResultCore) -> Result<Value, PipelineError> {
        if !input.is_object() {
            return Err(PipelineError::MissingInput);
        }
        if self.in_progress {
            return Err(PipelineError::ConcurrentRun);
        }

        let mut input = input;
        loop {
            self.in_progress = true;
            match self.run_round(&input, result).await {
                Ok((output, None)) => return Ok(output),
                Ok((_, Some(next_input))) => input = next_input,
                Err(err) => {
                    self.in_progress = false;
                    return Err(err);
                }
            }
        }
    }

    /// One round; returns the output and, when the step advanced, the next round's input
    async fn run_round(
        &mut self,
        input: &Value,
        result: &mut ResultCore,
    ) -> Result<(Value, Option<Value>), PipelineError> {
        let control = RunControl::new();

        self.try_next(input, GatePhase::PreRun).await?;
        let step = self.step;
        debug!("Pipeline round starting at step {}", step);
        self.events.emit(PipelineEvent::ComputationStart { step });

        for hook in &self.plugins.pre_run {
            if control.is_run_cancelled() {
                break;
            }
            hook.call(input, result, &control)
                .await
                .map_err(|source| PipelineError::Plugin {
                    step,
                    phase: "pre-run",
                    source,
                })?;
        }

        let output = if control.is_run_cancelled() {
            debug!("Round at step {} cancelled by plugin", step);
            Value::Null
        } else {
            let output = self.computations[step]
                .run(input)
                .await
                .map_err(|source| PipelineError::Computation { step, source })?;
            for hook in &self.plugins.post_run {
                hook.call(&output, result, &control)
                    .await
                    .map_err(|source| PipelineError::Plugin {
                        step,
                        phase: "post-run",
                        source,
                    })?;
            }
            output
        };

        self.events.emit(PipelineEvent::ComputationEnd { step });

        let next_input = with_previous_data(input, &output);
        let advanced = if control.is_run_cancelled() {
            false
        } else {
            self.try_next(&next_input, GatePhase::PostRun).await?
        };

        self.in_progress = advanced;
        self.events.emit(PipelineEvent::SaveRequest(SaveRequest {
            data: output.clone(),
            force: control.is_force_save(),
            pipeline_state: self.serialize(),
            plugin_state: result.plugin_state.clone(),
        }));
        self.in_progress = false;

        if advanced {
            info!("Pipeline advanced to step {}", self.step);
            self.events.emit(PipelineEvent::InProgress {
                output: output.clone(),
            });
            Ok((output, Some(next_input)))
        } else {
            Ok((output, None))
        }
    }

    /// Evaluate the step gate and advance by at most one step
    ///
    /// Without a `next` gate the pre-run phase never advances and the
    /// post-run phase always does. The cursor never moves past the last step.
    async fn try_next(&mut self, input: &Value, phase: GatePhase) -> Result<bool, PipelineError> {
        let step = self.step;
        let do_next = match self.computations[step].next() {
            Some(gate) => {
                let verdict = gate
                    .run(input)
                    .await
                    .map_err(|source| PipelineError::Gate { step, source })?;
                is_truthy(&verdict)
            }
            None => phase == GatePhase::PostRun,
        };

        if do_next && step + 1 < self.computations.len() {
            self.step = step + 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn with_previous_data(input: &Value, output: &Value) -> Value {
    let mut next = input.as_object().cloned().unwrap_or_default();
    next.insert("previousData".to_string(), output.clone());
    Value::Object(next)
}

//! Core domain models for consortium pipelines
//!
//! This module defines result documents, consortium membership, computation
//! definitions, and the pipeline state machine that drives one participant's
//! rounds.

pub mod config;
pub mod consortium;
pub mod decentralized;
pub mod events;
pub mod pipeline;
pub mod plugin;
pub mod result;
pub mod state;

pub use consortium::Consortium;
pub use decentralized::{DecentralizedComputation, Environment};
pub use events::{EventBus, HandlerId};
pub use pipeline::{Pipeline, PipelineError, PipelineEvent, SaveRequest};
pub use plugin::{PipelinePlugins, PluginHook, PluginRegistry, RunControl};
pub use result::{
    ComputationResult, LocalComputationResult, RemoteComputationResult, ResultCore,
    ResultDocument, ResultError,
};
pub use state::{ErrorInfo, PipelineState};

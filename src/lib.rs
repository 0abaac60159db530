//! consortium-pipeline - decentralized multi-party computation pipelines

pub mod cli;
pub mod computation;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod simulation;

// Re-export commonly used types
pub use computation::{Computation, ComputationError, ComputationRegistry, FunctionRegistry, LocalComputationRegistry};
pub use core::{
    ComputationResult, Consortium, DecentralizedComputation, Environment, LocalComputationResult, Pipeline,
    PipelineError, PipelineEvent, RemoteComputationResult, ResultDocument,
};
pub use execution::{
    ChangeListener, LocalPipelineRunner, LocalPipelineRunnerPool, PipelineRunner, PoolContext, PoolError, PoolEvent,
    RemotePipelineRunner, RemotePipelineRunnerPool, RunnerError, RunnerEvent,
};
pub use persistence::{DocumentStore, InMemoryStore, StoreError, StoreRegistry};

//! Run coordination: change listeners, runners and runner pools

pub mod listener;
pub mod local_pool;
pub mod local_runner;
pub mod pool;
pub mod remote_pool;
pub mod remote_runner;
pub mod runner;

pub use listener::{ChangeListener, ListenerEvent};
pub use local_pool::{LocalFlavor, LocalPipelineRunnerPool};
pub use local_runner::LocalPipelineRunner;
pub use pool::{
    PipelineRunnerPool, PoolContext, PoolError, PoolEvent, PoolFlavor, PoolState, COMPUTATIONS_STORE,
    CONSORTIA_STORE,
};
pub use remote_pool::{RemoteFlavor, RemotePipelineRunnerPool};
pub use remote_runner::RemotePipelineRunner;
pub use runner::{PipelineRunner, ResultPatch, Runner, RunnerError, RunnerEvent};

//! Participant-side pool: runs local pipelines as aggregate results change

use crate::core::consortium::Consortium;
use crate::core::decentralized::Environment;
use crate::core::result::{ComputationResult, LocalComputationResult, RemoteComputationResult};
use crate::execution::local_runner::LocalPipelineRunner;
use crate::execution::pool::{PipelineRunnerPool, PoolContext, PoolError, PoolFlavor};
use async_trait::async_trait;
use tracing::debug;

/// Pool listening to `remote-consortium-<id>` stores on behalf of one user
pub type LocalPipelineRunnerPool = PipelineRunnerPool<LocalFlavor>;

#[derive(Debug, Clone)]
pub struct LocalFlavor {
    username: String,
}

impl LocalFlavor {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

#[async_trait]
impl PoolFlavor for LocalFlavor {
    type Runner = LocalPipelineRunner;

    const LISTEN_PREFIX: &'static str = "remote";
    const ENV: Environment = Environment::Local;

    async fn create_runner(
        &self,
        ctx: &PoolContext,
        remote: &RemoteComputationResult,
    ) -> Result<LocalPipelineRunner, PoolError> {
        let store = ctx
            .stores
            .get(&Consortium::local_store_name(remote.consortium_id()))
            .await?;

        let id = LocalComputationResult::document_id(remote.run_id(), &self.username);
        let result = match store.get_opt(&id).await? {
            Some(doc) => {
                debug!("Resuming local result {}", id);
                LocalComputationResult::from_value(doc)?
            }
            None => LocalComputationResult::new(
                id,
                remote.computation_id(),
                remote.consortium_id(),
                self.username.as_str(),
            )?,
        };

        let pipeline = ctx
            .build_pipeline(
                remote.computation_id(),
                Environment::Local,
                result.core().pipeline_state.step,
            )
            .await?;
        Ok(LocalPipelineRunner::new(pipeline, result, store))
    }
}

impl LocalPipelineRunnerPool {
    /// Pool running `username`'s pipelines
    pub fn local(username: impl Into<String>, ctx: PoolContext) -> Self {
        PipelineRunnerPool::new(LocalFlavor::new(username), ctx)
    }
}

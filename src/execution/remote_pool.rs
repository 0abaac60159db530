//! Aggregator-side pool: runs the remote pipeline as participant results change

use crate::core::consortium::Consortium;
use crate::core::decentralized::Environment;
use crate::core::result::{ComputationResult, LocalComputationResult, RemoteComputationResult};
use crate::execution::pool::{PipelineRunnerPool, PoolContext, PoolError, PoolFlavor, CONSORTIA_STORE};
use crate::execution::remote_runner::RemotePipelineRunner;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

/// Pool listening to `local-consortium-<id>` stores
pub type RemotePipelineRunnerPool = PipelineRunnerPool<RemoteFlavor>;

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteFlavor;

impl RemoteFlavor {
    /// Fresh aggregate result locking in the consortium's current members and inputs
    async fn build_new_remote_result(
        ctx: &PoolContext,
        local: &LocalComputationResult,
    ) -> Result<RemoteComputationResult, PoolError> {
        let doc = ctx
            .stores
            .get(CONSORTIA_STORE)
            .await?
            .get(local.consortium_id())
            .await?;
        let consortium: Consortium = serde_json::from_value(doc)?;

        Ok(RemoteComputationResult::new(
            local.run_id(),
            local.computation_id(),
            local.consortium_id(),
            consortium.users,
        )?
        .with_computation_inputs(consortium.active_computation_inputs))
    }
}

#[async_trait]
impl PoolFlavor for RemoteFlavor {
    type Runner = RemotePipelineRunner;

    const LISTEN_PREFIX: &'static str = "local";
    const ENV: Environment = Environment::Remote;

    async fn create_runner(
        &self,
        ctx: &PoolContext,
        local: &LocalComputationResult,
    ) -> Result<RemotePipelineRunner, PoolError> {
        let consortium_id = local.consortium_id();
        let local_store = ctx.stores.get(&Consortium::local_store_name(consortium_id)).await?;
        let remote_store = ctx.stores.get(&Consortium::remote_store_name(consortium_id)).await?;

        let result = match remote_store.get_opt(local.run_id()).await? {
            Some(doc) => {
                debug!("Resuming remote result {}", local.run_id());
                RemoteComputationResult::from_value(doc)?
            }
            None => Self::build_new_remote_result(ctx, local).await?,
        };

        let pipeline = ctx
            .build_pipeline(
                local.computation_id(),
                Environment::Remote,
                result.core().pipeline_state.step,
            )
            .await?;
        Ok(RemotePipelineRunner::new(pipeline, result, local_store, remote_store))
    }

    async fn on_computation_complete(
        &self,
        ctx: &PoolContext,
        run_id: &str,
        consortium_id: &str,
    ) -> Result<bool, PoolError> {
        let store = ctx.stores.get(&Consortium::remote_store_name(consortium_id)).await?;
        let mut result = RemoteComputationResult::from_value(store.get(run_id).await?)?;
        if result.complete {
            debug!("Run {} already marked complete", run_id);
            return Ok(false);
        }

        result.complete = true;
        result.end_date = Some(Utc::now());
        store.save(result.to_value()?).await?;
        info!("Marked run {} of consortium {} complete", run_id, consortium_id);
        Ok(true)
    }
}

impl RemotePipelineRunnerPool {
    pub fn remote(ctx: PoolContext) -> Self {
        PipelineRunnerPool::new(RemoteFlavor, ctx)
    }
}

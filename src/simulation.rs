//! In-process simulation of a whole consortium
//!
//! One aggregator pool and one participant pool per user share a single
//! in-memory store registry, so every write is visible to the other side
//! immediately. Each participant contributes one number; the aggregate is
//! their sum.

use crate::computation::{
    ComputationError, ComputationSpec, FunctionRegistry, LocalComputationRegistry, PipelineSpec,
};
use crate::core::consortium::Consortium;
use crate::core::decentralized::DecentralizedComputation;
use crate::core::plugin::GROUP_STEP;
use crate::core::result::{ComputationResult, RemoteComputationResult, ResultError};
use crate::execution::{
    LocalPipelineRunnerPool, PoolContext, PoolError, PoolEvent, RemotePipelineRunnerPool,
    COMPUTATIONS_STORE, CONSORTIA_STORE,
};
use crate::persistence::{StoreError, StoreRegistry};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const CONSORTIUM_ID: &str = "simulation";
pub const COMPUTATION_ID: &str = "simulated-sum";
pub const RUN_ID: &str = "simrun";

const LOCAL_FUNCTION: &str = "contribute";
const REMOTE_FUNCTION: &str = "aggregate";

/// Error types for simulations
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("simulation needs at least one participant")]
    NoParticipants,

    #[error("invalid username '{0}'")]
    InvalidUsername(String),

    #[error("run did not complete within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("event stream closed before the run completed")]
    EventsClosed,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Participants' local step: contribute `userData.value` once
async fn contribute(input: Value) -> Result<Value, ComputationError> {
    if !input["previousData"].is_null() {
        return Ok(Value::Null);
    }
    let value = input["userData"]["value"]
        .as_f64()
        .ok_or_else(|| ComputationError::failed("userData.value must be a number"))?;
    Ok(json!({ "value": value }))
}

/// Aggregator step: sum once every participant contributed
async fn aggregate(input: Value) -> Result<Value, ComputationError> {
    let expected = input["usernames"].as_array().map(Vec::len).unwrap_or(0);
    let values: Vec<f64> = input["userResults"]
        .as_array()
        .map(|results| {
            results
                .iter()
                .filter_map(|r| r["data"]["value"].as_f64())
                .collect()
        })
        .unwrap_or_default();

    if values.len() < expected {
        return Ok(Value::Null);
    }
    Ok(json!({
        "total": values.iter().sum::<f64>(),
        "contributors": values.len(),
        "complete": true,
    }))
}

/// Definition run by the simulation
pub fn definition(group_step: bool) -> DecentralizedComputation {
    DecentralizedComputation {
        name: COMPUTATION_ID.to_string(),
        version: "1.0.0".to_string(),
        local: PipelineSpec::One(ComputationSpec::function(LOCAL_FUNCTION)),
        remote: PipelineSpec::One(ComputationSpec::function(REMOTE_FUNCTION)),
        plugins: if group_step {
            vec![GROUP_STEP.to_string()]
        } else {
            Vec::new()
        },
        setup: None,
        repository: None,
        cwd: PathBuf::from("."),
        meta: None,
    }
}

/// Functions backing [`definition`]
pub fn functions() -> FunctionRegistry {
    FunctionRegistry::new()
        .with(LOCAL_FUNCTION, contribute)
        .with(REMOTE_FUNCTION, aggregate)
}

pub struct Simulation {
    participants: Vec<(String, f64)>,
    stores: Arc<StoreRegistry>,
    remote: RemotePipelineRunnerPool,
    locals: Vec<LocalPipelineRunnerPool>,
}

impl Simulation {
    /// Seed the consortium and build one pool per participant plus the aggregator
    pub async fn new(participants: Vec<(String, f64)>, group_step: bool) -> Result<Self, SimulationError> {
        if participants.is_empty() {
            return Err(SimulationError::NoParticipants);
        }
        if let Some((bad, _)) = participants
            .iter()
            .find(|(name, _)| name.trim().is_empty())
        {
            return Err(SimulationError::InvalidUsername(bad.clone()));
        }

        let stores = Arc::new(StoreRegistry::in_memory());
        let definition = definition(group_step);

        stores
            .get(COMPUTATIONS_STORE)
            .await?
            .save(json!({
                "_id": COMPUTATION_ID,
                "name": definition.name,
                "version": definition.version,
            }))
            .await?;

        let users: Vec<String> = participants.iter().map(|(name, _)| name.clone()).collect();
        let mut consortium = Consortium::new(CONSORTIUM_ID, users.clone());
        consortium.owners = users.first().cloned().into_iter().collect();
        consortium.active_computation_id = Some(COMPUTATION_ID.to_string());
        consortium.active_run_id = Some(RUN_ID.to_string());
        stores
            .get(CONSORTIA_STORE)
            .await?
            .save(serde_json::to_value(&consortium)?)
            .await?;

        let registry = LocalComputationRegistry::in_memory();
        registry.insert(definition).await;
        let ctx = PoolContext::new(stores.clone(), Arc::new(registry)).with_functions(functions());

        let remote = RemotePipelineRunnerPool::remote(ctx.clone());
        let locals = users
            .iter()
            .map(|user| LocalPipelineRunnerPool::local(user.as_str(), ctx.clone()))
            .collect();

        Ok(Self {
            participants,
            stores,
            remote,
            locals,
        })
    }

    pub fn stores(&self) -> &Arc<StoreRegistry> {
        &self.stores
    }

    pub fn remote(&self) -> &RemotePipelineRunnerPool {
        &self.remote
    }

    pub fn locals(&self) -> &[LocalPipelineRunnerPool] {
        &self.locals
    }

    /// Initialize the aggregator, then every participant
    pub async fn start(&self) -> Result<(), SimulationError> {
        self.remote.init().await?;
        for local in &self.locals {
            local.init().await?;
        }
        Ok(())
    }

    /// Hand each participant its value; the participants' runs start from here
    pub fn kick_off(&self) -> Result<(), SimulationError> {
        let users: Vec<String> = self.participants.iter().map(|(name, _)| name.clone()).collect();
        for (local, (user, value)) in self.locals.iter().zip(&self.participants) {
            let remote = RemoteComputationResult::new(RUN_ID, COMPUTATION_ID, CONSORTIUM_ID, users.clone())?;
            info!("Kicking off {} with {}", user, value);
            // outcomes surface as pool events
            drop(local.trigger_runner(remote, Some(json!({ "value": value }))));
        }
        Ok(())
    }

    /// Start, kick off and wait until the aggregate is marked complete
    pub async fn run(&self, timeout: Duration) -> Result<RemoteComputationResult, SimulationError> {
        let mut events = self.remote.events().subscribe();
        self.start().await?;
        self.kick_off()?;

        let marked = tokio::time::timeout(timeout, async {
            while let Some(event) = events.recv().await {
                if let PoolEvent::ComputationMarkedComplete { run_id, .. } = event {
                    if run_id == RUN_ID {
                        return Ok(());
                    }
                }
            }
            Err(SimulationError::EventsClosed)
        })
        .await;

        match marked {
            Ok(outcome) => outcome?,
            Err(_) => return Err(SimulationError::TimedOut(timeout)),
        }
        self.result().await
    }

    /// Current aggregate document
    pub async fn result(&self) -> Result<RemoteComputationResult, SimulationError> {
        let store = self
            .stores
            .get(&Consortium::remote_store_name(CONSORTIUM_ID))
            .await?;
        Ok(RemoteComputationResult::from_value(store.get(RUN_ID).await?)?)
    }

    /// Destroy every pool
    pub async fn shutdown(&self) {
        for local in &self.locals {
            if let Err(e) = local.destroy().await {
                warn!("Failed to destroy participant pool: {}", e);
            }
        }
        if let Err(e) = self.remote.destroy().await {
            warn!("Failed to destroy aggregator pool: {}", e);
        }
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("participants", &self.participants)
            .field("stores", &self.stores)
            .finish()
    }
}

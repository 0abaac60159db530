//! Pipeline plugins
//!
//! Plugins hook into each pipeline round before the computation runs
//! (`pre_run`) and after it produced output (`post_run`). Hooks cannot abort
//! an in-flight computation; they steer the round through [`RunControl`].

use crate::core::decentralized::Environment;
use crate::core::result::ResultCore;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Name of the built-in lock-step plugin
pub const GROUP_STEP: &str = "group-step";

/// Error returned by a plugin hook
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// Run modifiers offered to plugin hooks for one round
#[derive(Debug, Default)]
pub struct RunControl {
    cancelled: AtomicBool,
    force_save: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the computation and remaining hooks of this round
    pub fn cancel_run(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_run_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Persist this round even when it produced no data
    pub fn force_save(&self) {
        self.force_save.store(true, Ordering::SeqCst);
    }

    pub fn is_force_save(&self) -> bool {
        self.force_save.load(Ordering::SeqCst)
    }
}

/// A single pre- or post-run hook
#[async_trait]
pub trait PluginHook: Send + Sync {
    /// `input` is the round input for pre-run hooks and the output for post-run hooks
    async fn call(
        &self,
        input: &Value,
        result: &mut ResultCore,
        control: &RunControl,
    ) -> Result<(), PluginError>;
}

/// A named plugin providing hooks per environment
pub trait Plugin: Send + Sync {
    fn pre_run(&self, env: Environment) -> Option<Arc<dyn PluginHook>>;

    fn post_run(&self, _env: Environment) -> Option<Arc<dyn PluginHook>> {
        None
    }
}

/// Hooks installed on one pipeline
#[derive(Clone, Default)]
pub struct PipelinePlugins {
    pub pre_run: Vec<Arc<dyn PluginHook>>,
    pub post_run: Vec<Arc<dyn PluginHook>>,
}

impl PipelinePlugins {
    pub fn is_empty(&self) -> bool {
        self.pre_run.is_empty() && self.post_run.is_empty()
    }
}

impl fmt::Debug for PipelinePlugins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinePlugins")
            .field("pre_run", &self.pre_run.len())
            .field("post_run", &self.post_run.len())
            .finish()
    }
}

/// Plugins available to definitions by name
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Registry without any plugins
    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry with the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(GROUP_STEP, GroupStep);
        registry
    }

    pub fn is_builtin(name: &str) -> bool {
        name == GROUP_STEP
    }

    pub fn register<P: Plugin + 'static>(&mut self, name: impl Into<String>, plugin: P) -> &mut Self {
        self.plugins.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Collect hooks of the named plugins for `env`, in declaration order
    pub fn hooks(&self, names: &[String], env: Environment) -> Result<PipelinePlugins, PluginError> {
        let mut hooks = PipelinePlugins::default();
        for name in names {
            let plugin = self
                .plugins
                .get(name)
                .ok_or_else(|| PluginError(format!("unknown plugin '{}'", name)))?;
            if let Some(hook) = plugin.pre_run(env) {
                hooks.pre_run.push(hook);
            }
            if let Some(hook) = plugin.post_run(env) {
                hooks.post_run.push(hook);
            }
        }
        Ok(hooks)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.plugins.keys().collect();
        names.sort();
        f.debug_struct("PluginRegistry").field("plugins", &names).finish()
    }
}

/// Keeps every participant on the same step.
///
/// Participants advance one step at a time and wait until the aggregator
/// reports that the whole group reached the same step.
#[derive(Debug, Clone, Copy)]
pub struct GroupStep;

impl Plugin for GroupStep {
    fn pre_run(&self, env: Environment) -> Option<Arc<dyn PluginHook>> {
        match env {
            Environment::Local => Some(Arc::new(GroupStepLocal)),
            Environment::Remote => Some(Arc::new(GroupStepRemote)),
        }
    }
}

fn group_step_of(plugin_state: Option<&Value>) -> Option<u64> {
    plugin_state?.get(GROUP_STEP)?.get("step")?.as_u64()
}

struct GroupStepLocal;

#[async_trait]
impl PluginHook for GroupStepLocal {
    async fn call(
        &self,
        input: &Value,
        result: &mut ResultCore,
        control: &RunControl,
    ) -> Result<(), PluginError> {
        let user_step = result
            .plugin_state
            .get(GROUP_STEP)
            .and_then(|s| s.get("step"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let group_step = group_step_of(input.get("remoteResult").and_then(|r| r.get("pluginState")))
            .filter(|step| *step != 0)
            .unwrap_or(1);

        if user_step == group_step {
            debug!("group-step: waiting for group at step {}", group_step);
            control.cancel_run();
        } else {
            control.force_save();
            result
                .plugin_state
                .insert(GROUP_STEP.to_string(), json!({ "step": user_step + 1 }));
        }
        Ok(())
    }
}

struct GroupStepRemote;

#[async_trait]
impl PluginHook for GroupStepRemote {
    async fn call(
        &self,
        input: &Value,
        result: &mut ResultCore,
        control: &RunControl,
    ) -> Result<(), PluginError> {
        let stored = result.plugin_state.get(GROUP_STEP);
        let mut step = stored
            .and_then(|s| s.get("step"))
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let mut user_step: Map<String, Value> = stored
            .and_then(|s| s.get("userStep"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let user_results = input
            .get("userResults")
            .and_then(Value::as_array)
            .ok_or_else(|| PluginError("group-step expects userResults".to_string()))?;
        for user_result in user_results {
            let Some(username) = user_result.get("username").and_then(Value::as_str) else {
                continue;
            };
            let reported = group_step_of(user_result.get("pluginState"))
                .map(Value::from)
                .unwrap_or(Value::Null);
            user_step.insert(username.to_string(), reported);
        }

        let expected_users = input
            .get("usernames")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let steps: Vec<&Value> = user_step.values().collect();
        let all_match = steps.iter().all(|s| Some(*s) == steps.first().copied());
        let all_latest = steps.iter().all(|s| s.as_u64() == Some(step));
        let all_present = steps.len() == expected_users;

        control.force_save();
        if all_match && all_latest && all_present {
            step += 1;
            debug!("group-step: all users at step {}, advancing group", step - 1);
        } else {
            control.cancel_run();
        }

        result.plugin_state.insert(
            GROUP_STEP.to_string(),
            json!({ "step": step, "userStep": user_step }),
        );
        Ok(())
    }
}

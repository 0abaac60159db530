//! In-process computations

use crate::computation::ComputationError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// An in-process computation body
#[async_trait]
pub trait ComputationFn: Send + Sync {
    async fn call(&self, input: &Value) -> Result<Value, ComputationError>;
}

#[async_trait]
impl<F, Fut> ComputationFn for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ComputationError>> + Send,
{
    async fn call(&self, input: &Value) -> Result<Value, ComputationError> {
        (self)(input.clone()).await
    }
}

/// Named in-process computations that `function` definitions resolve against
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn ComputationFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computation under `name`, replacing any previous entry
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: ComputationFn + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: ComputationFn + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ComputationFn>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_computation() {
        let double = |input: Value| async move {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok::<_, ComputationError>(json!(n * 2))
        };
        let registry = FunctionRegistry::new().with("double", double);

        let function = registry.get("double").unwrap();
        let output = function.call(&json!({ "n": 21 })).await.unwrap();
        assert_eq!(output, json!(42));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = FunctionRegistry::new()
            .with("b", |_: Value| async { Ok::<_, ComputationError>(Value::Null) })
            .with("a", |_: Value| async { Ok::<_, ComputationError>(Value::Null) });
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}

//! Decentralized computation definitions loaded from YAML

use crate::computation::{
    Computation, ComputationError, ComputationSpec, ComputationSpecKind, FactoryOptions,
    FunctionRegistry, PipelineSpec,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

/// Where a participant runs a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Remote,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Local => write!(f, "local"),
            Environment::Remote => write!(f, "remote"),
        }
    }
}

/// Source repository of a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
}

/// Descriptive metadata of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationMeta {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A versioned definition bundling the local and remote pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecentralizedComputation {
    pub name: String,

    /// Semantic version, e.g. `1.0.0`
    pub version: String,

    /// Pipeline each participant runs
    pub local: PipelineSpec,

    /// Pipeline the aggregator runs
    pub remote: PipelineSpec,

    /// Plugin names applied to both pipelines
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Preparation step executed once before first use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<ComputationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,

    /// Working directory for every computation
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ComputationMeta>,
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

impl DecentralizedComputation {
    /// Registry id, `<name>--<version>`
    pub fn id(&self) -> String {
        Self::registry_id(&self.name, &self.version)
    }

    pub fn registry_id(name: &str, version: &str) -> String {
        format!("{}--{}", name, version)
    }

    /// Load a definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Self =
            serde_yaml::from_str(yaml).context("Failed to parse computation definition")?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load a definition from a file; a relative `cwd` resolves against the file's directory
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut definition = Self::from_yaml(&content)?;
        if definition.cwd.is_relative() {
            if let Some(dir) = path.parent() {
                definition.cwd = dir.join(&definition.cwd);
            }
        }
        Ok(definition)
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().len() < 2 {
            bail!("Computation name must be at least 2 characters");
        }
        if self.version.len() < 5 {
            bail!("Computation version '{}' must look like x.y.z", self.version);
        }

        for (env, spec) in [("local", &self.local), ("remote", &self.remote)] {
            if spec.computations().is_empty() {
                bail!("{} pipeline must define at least one computation", env);
            }
            for computation in spec.computations() {
                Self::validate_spec(env, computation)?;
            }
        }

        if let Some(setup) = &self.setup {
            Self::validate_spec("setup", setup)?;
        }

        for plugin in &self.plugins {
            if !crate::core::plugin::PluginRegistry::is_builtin(plugin) {
                bail!("Unknown plugin '{}'", plugin);
            }
        }

        Ok(())
    }

    fn validate_spec(env: &str, spec: &ComputationSpec) -> Result<()> {
        match &spec.kind {
            ComputationSpecKind::Function { name } if name.trim().is_empty() => {
                bail!("{} function computation requires a name", env)
            }
            ComputationSpecKind::Cmd { cmd, .. } if cmd.trim().is_empty() => {
                bail!("{} cmd computation requires a command", env)
            }
            _ => {}
        }
        if let Some(next) = &spec.next {
            Self::validate_spec(env, next)?;
        }
        Ok(())
    }

    pub fn pipeline_spec(&self, env: Environment) -> &PipelineSpec {
        match env {
            Environment::Local => &self.local,
            Environment::Remote => &self.remote,
        }
    }

    /// Build the computations for one environment
    pub fn computations(
        &self,
        env: Environment,
        functions: &FunctionRegistry,
    ) -> Result<Vec<Computation>, ComputationError> {
        let opts = FactoryOptions::new(self.cwd.clone()).with_functions(functions.clone());
        Computation::factory(self.pipeline_spec(env).computations(), &opts)
    }

    /// Summary document describing this definition to participants
    ///
    /// Carries `name`, `version`, `url`, `meta`, and `inputs` gathered from
    /// the local computations that declare any.
    pub fn computation_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("name".to_string(), json!(self.name));
        doc.insert("version".to_string(), json!(self.version));
        doc.insert(
            "url".to_string(),
            json!(self.repository.as_ref().map(|r| r.url.clone())),
        );
        doc.insert(
            "meta".to_string(),
            serde_json::to_value(&self.meta).unwrap_or(Value::Null),
        );

        let inputs: Vec<Value> = self
            .local
            .computations()
            .iter()
            .filter(|c| !c.inputs.is_empty())
            .map(|c| Value::Array(c.inputs.clone()))
            .collect();
        if !inputs.is_empty() {
            doc.insert("inputs".to_string(), Value::Array(inputs));
        }

        Value::Object(doc)
    }
}

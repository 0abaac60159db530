//! Executable pipeline steps
//!
//! A [`Computation`] is one step of a pipeline. Every step exposes the same
//! `run(input) -> output` contract regardless of how it executes, and may
//! carry a `next` computation whose output gates advancing past the step.

pub mod command;
pub mod error;
pub mod function;
pub mod registry;

pub use command::CommandComputation;
pub use error::ComputationError;
pub use function::{ComputationFn, FunctionRegistry};
pub use registry::{ComputationRegistry, LocalComputationRegistry, RegistryError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Execution strategy of a computation
#[derive(Clone)]
pub enum ComputationKind {
    /// In-process callable
    Function {
        name: String,
        function: Arc<dyn ComputationFn>,
    },

    /// External program invoked once per run
    Command(CommandComputation),
}

impl fmt::Debug for ComputationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputationKind::Function { name, .. } => {
                f.debug_struct("Function").field("name", name).finish()
            }
            ComputationKind::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
        }
    }
}

/// A single executable pipeline step
#[derive(Debug, Clone)]
pub struct Computation {
    kind: ComputationKind,
    cwd: PathBuf,
    inputs: Vec<Value>,
    next: Option<Box<Computation>>,
    verbose: bool,
    timeout: Option<Duration>,
}

impl Computation {
    /// Wrap an in-process callable
    pub fn function<F>(name: impl Into<String>, function: F) -> Self
    where
        F: ComputationFn + 'static,
    {
        Self::new(ComputationKind::Function {
            name: name.into(),
            function: Arc::new(function),
        })
    }

    /// Run `cmd args... --run <input>` per step
    pub fn command(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(ComputationKind::Command(CommandComputation::new(cmd, args)))
    }

    fn new(kind: ComputationKind) -> Self {
        Self {
            kind,
            cwd: PathBuf::from("."),
            inputs: Vec::new(),
            next: None,
            verbose: false,
            timeout: None,
        }
    }

    pub fn with_next(mut self, next: Computation) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> &ComputationKind {
        &self.kind
    }

    /// Declared type tag, as written in definitions
    pub fn type_tag(&self) -> &'static str {
        match self.kind {
            ComputationKind::Function { .. } => "function",
            ComputationKind::Command(_) => "cmd",
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    /// Gate deciding whether to advance past this step
    pub fn next(&self) -> Option<&Computation> {
        self.next.as_deref()
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Execute the step
    pub async fn run(&self, input: &Value) -> Result<Value, ComputationError> {
        debug!("Running {} computation", self.type_tag());

        let execution = async {
            match &self.kind {
                ComputationKind::Function { function, .. } => function.call(input).await,
                ComputationKind::Command(cmd) => cmd.execute(input, &self.cwd, self.verbose).await,
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .map_err(|_| ComputationError::Timeout(limit))?,
            None => execution.await,
        }
    }

    /// Build computations from their definitions
    ///
    /// `function` definitions resolve against `opts.functions`; every built
    /// computation runs in `opts.cwd`.
    pub fn factory(
        specs: &[ComputationSpec],
        opts: &FactoryOptions,
    ) -> Result<Vec<Computation>, ComputationError> {
        specs.iter().map(|spec| Self::from_spec(spec, opts)).collect()
    }

    pub fn from_spec(spec: &ComputationSpec, opts: &FactoryOptions) -> Result<Self, ComputationError> {
        let mut computation = match &spec.kind {
            ComputationSpecKind::Function { name } => {
                let function = opts
                    .functions
                    .get(name)
                    .ok_or_else(|| ComputationError::UnknownFunction(name.clone()))?;
                Self::new(ComputationKind::Function {
                    name: name.clone(),
                    function,
                })
            }
            ComputationSpecKind::Cmd { cmd, args } => Self::command(cmd.clone(), args.clone()),
        };

        computation.cwd = opts.cwd.clone();
        computation.inputs = spec.inputs.clone();
        computation.verbose = spec.verbose || opts.verbose;
        computation.timeout = spec.timeout_secs.map(Duration::from_secs);
        if let Some(next) = &spec.next {
            computation.next = Some(Box::new(Self::from_spec(next, opts)?));
        }

        Ok(computation)
    }
}

/// Options shared by every computation built in one factory call
#[derive(Debug, Clone)]
pub struct FactoryOptions {
    pub cwd: PathBuf,
    pub functions: FunctionRegistry,
    pub verbose: bool,
}

impl FactoryOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            functions: FunctionRegistry::new(),
            verbose: false,
        }
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Computation definition as written in YAML/JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationSpec {
    #[serde(flatten)]
    pub kind: ComputationSpecKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<ComputationSpec>>,

    #[serde(default)]
    pub verbose: bool,

    /// Abort the step after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ComputationSpec {
    pub fn function(name: impl Into<String>) -> Self {
        Self::from_kind(ComputationSpecKind::Function { name: name.into() })
    }

    pub fn cmd(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self::from_kind(ComputationSpecKind::Cmd {
            cmd: cmd.into(),
            args,
        })
    }

    fn from_kind(kind: ComputationSpecKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
            next: None,
            verbose: false,
            timeout_secs: None,
        }
    }

    pub fn with_next(mut self, next: ComputationSpec) -> Self {
        self.next = Some(Box::new(next));
        self
    }
}

/// Strategy selector, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComputationSpecKind {
    Function {
        name: String,
    },
    Cmd {
        cmd: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// A pipeline definition: a single computation or an ordered list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineSpec {
    Many(Vec<ComputationSpec>),
    One(ComputationSpec),
}

impl PipelineSpec {
    pub fn computations(&self) -> &[ComputationSpec] {
        match self {
            PipelineSpec::Many(specs) => specs,
            PipelineSpec::One(spec) => std::slice::from_ref(spec),
        }
    }
}

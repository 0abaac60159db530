//! Computation result documents
//!
//! A result document records one participant's (local) or the aggregator's
//! (remote) contribution to a run. The document `_id` encodes the `runId`:
//! local documents are named `<runId>-<username>`, remote documents are
//! named `<runId>`. The run id is extracted once at construction and never
//! changes afterwards.

use crate::core::state::{signals_complete, ErrorInfo, PipelineState};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

static LOCAL_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^-]+)-.+$").expect("Invalid local id pattern"));

static REMOTE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^-]+)$").expect("Invalid remote id pattern"));

/// Errors raised while building or decoding result documents
#[derive(Debug, Error)]
pub enum ResultError {
    #[error("runId could not be extracted out of result id: {0}")]
    RunIdExtraction(String),

    #[error("cannot change protected runId of {id} (attempted {attempted})")]
    ImmutableRunId { id: String, attempted: String },

    #[error("malformed result document: {0}")]
    Malformed(#[from] serde_json::Error),
}

fn extract_run_id(pattern: &Regex, id: &str) -> Result<String, ResultError> {
    pattern
        .captures(id)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ResultError::RunIdExtraction(id.to_string()))
}

/// Fields shared by every result document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultCore {
    /// Store revision, absent until first persisted
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Latest computation output (`null` when none)
    #[serde(default)]
    pub data: Value,

    /// Error recorded by the most recent save cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default)]
    pub pipeline_state: PipelineState,

    /// Opaque state owned by pipeline plugins, keyed by plugin name
    #[serde(default)]
    pub plugin_state: Map<String, Value>,

    pub computation_id: String,

    pub consortium_id: String,

    /// Prior `data` values, oldest first
    #[serde(default)]
    pub history: Vec<Value>,
}

impl ResultCore {
    pub fn new(computation_id: impl Into<String>, consortium_id: impl Into<String>) -> Self {
        Self {
            computation_id: computation_id.into(),
            consortium_id: consortium_id.into(),
            ..Default::default()
        }
    }
}

/// Behaviour shared by local and remote result documents
pub trait ComputationResult:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Store document id
    fn id(&self) -> &str;

    /// Run id derived from the document id
    fn run_id(&self) -> &str;

    fn core(&self) -> &ResultCore;

    fn core_mut(&mut self) -> &mut ResultCore;

    /// Decode a stored document, validating its id
    fn from_value(value: Value) -> Result<Self, ResultError>;

    /// Wrap into the environment-agnostic document enum
    fn to_document(&self) -> ResultDocument;

    /// Participant owning this document, if any
    fn username(&self) -> Option<&str> {
        None
    }

    /// Fields the owning runner writes alongside every patch
    fn owned_fields(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Whether the latest data marks the whole run as finished
    fn signals_completion(&self) -> bool {
        signals_complete(&self.core().data)
    }

    fn rev(&self) -> Option<&str> {
        self.core().rev.as_deref()
    }

    fn data(&self) -> &Value {
        &self.core().data
    }

    fn computation_id(&self) -> &str {
        &self.core().computation_id
    }

    fn consortium_id(&self) -> &str {
        &self.core().consortium_id
    }

    fn to_value(&self) -> Result<Value, ResultError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Wire shape of a local result document
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    core: ResultCore,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_data: Option<Value>,
}

/// One participant's result document, `_id = <runId>-<username>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LocalDocument", into = "LocalDocument")]
pub struct LocalComputationResult {
    id: String,
    run_id: String,
    core: ResultCore,
    username: String,

    /// Kickoff data supplied by the participant
    pub user_data: Option<Value>,
}

impl LocalComputationResult {
    pub fn new(
        id: impl Into<String>,
        computation_id: impl Into<String>,
        consortium_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Result<Self, ResultError> {
        Self::from_parts(LocalDocument {
            id: id.into(),
            core: ResultCore::new(computation_id, consortium_id),
            username: username.into(),
            user_data: None,
        })
    }

    /// Document id for a participant's result in a run
    pub fn document_id(run_id: &str, username: &str) -> String {
        format!("{}-{}", run_id, username)
    }

    fn from_parts(doc: LocalDocument) -> Result<Self, ResultError> {
        let run_id = extract_run_id(&LOCAL_ID_PATTERN, &doc.id)?;
        Ok(Self {
            id: doc.id,
            run_id,
            core: doc.core,
            username: doc.username,
            user_data: doc.user_data,
        })
    }

    /// Re-point the document id; only ids for the same run are accepted
    pub fn set_id(&mut self, id: impl Into<String>) -> Result<(), ResultError> {
        let id = id.into();
        let run_id = extract_run_id(&LOCAL_ID_PATTERN, &id)?;
        if run_id != self.run_id {
            return Err(ResultError::ImmutableRunId {
                id: self.id.clone(),
                attempted: id,
            });
        }
        self.id = id;
        Ok(())
    }
}

impl TryFrom<LocalDocument> for LocalComputationResult {
    type Error = ResultError;

    fn try_from(doc: LocalDocument) -> Result<Self, Self::Error> {
        Self::from_parts(doc)
    }
}

impl From<LocalComputationResult> for LocalDocument {
    fn from(result: LocalComputationResult) -> Self {
        Self {
            id: result.id,
            core: result.core,
            username: result.username,
            user_data: result.user_data,
        }
    }
}

impl ComputationResult for LocalComputationResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn core(&self) -> &ResultCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ResultCore {
        &mut self.core
    }

    fn from_value(value: Value) -> Result<Self, ResultError> {
        let doc: LocalDocument = serde_json::from_value(value)?;
        Self::from_parts(doc)
    }

    fn to_document(&self) -> ResultDocument {
        ResultDocument::Local(self.clone())
    }

    fn username(&self) -> Option<&str> {
        Some(&self.username)
    }

    fn owned_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(user_data) = &self.user_data {
            fields.insert("userData".to_string(), user_data.clone());
        }
        fields
    }
}

/// Wire shape of a remote result document
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    core: ResultCore,
    #[serde(default)]
    usernames: Vec<String>,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    user_errors: Vec<ErrorInfo>,
    #[serde(default)]
    computation_inputs: Vec<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    end_date: Option<DateTime<Utc>>,
}

/// The aggregator's result document, `_id = <runId>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RemoteDocument", into = "RemoteDocument")]
pub struct RemoteComputationResult {
    id: String,
    run_id: String,
    core: ResultCore,

    /// Participants locked in when the run started
    pub usernames: Vec<String>,

    /// Set once the run has been marked finished
    pub complete: bool,

    /// Errors reported by participants in the latest round
    pub user_errors: Vec<ErrorInfo>,

    /// Consortium inputs captured at run start
    pub computation_inputs: Vec<Value>,

    pub end_date: Option<DateTime<Utc>>,
}

impl RemoteComputationResult {
    pub fn new(
        run_id: impl Into<String>,
        computation_id: impl Into<String>,
        consortium_id: impl Into<String>,
        usernames: Vec<String>,
    ) -> Result<Self, ResultError> {
        Self::from_parts(RemoteDocument {
            id: run_id.into(),
            core: ResultCore::new(computation_id, consortium_id),
            usernames,
            complete: false,
            user_errors: Vec::new(),
            computation_inputs: Vec::new(),
            end_date: None,
        })
    }

    fn from_parts(doc: RemoteDocument) -> Result<Self, ResultError> {
        let run_id = extract_run_id(&REMOTE_ID_PATTERN, &doc.id)?;
        Ok(Self {
            id: doc.id,
            run_id,
            core: doc.core,
            usernames: doc.usernames,
            complete: doc.complete,
            user_errors: doc.user_errors,
            computation_inputs: doc.computation_inputs,
            end_date: doc.end_date,
        })
    }

    pub fn with_computation_inputs(mut self, inputs: Vec<Value>) -> Self {
        self.computation_inputs = inputs;
        self
    }
}

impl TryFrom<RemoteDocument> for RemoteComputationResult {
    type Error = ResultError;

    fn try_from(doc: RemoteDocument) -> Result<Self, Self::Error> {
        Self::from_parts(doc)
    }
}

impl From<RemoteComputationResult> for RemoteDocument {
    fn from(result: RemoteComputationResult) -> Self {
        Self {
            id: result.id,
            core: result.core,
            usernames: result.usernames,
            complete: result.complete,
            user_errors: result.user_errors,
            computation_inputs: result.computation_inputs,
            end_date: result.end_date,
        }
    }
}

impl ComputationResult for RemoteComputationResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn core(&self) -> &ResultCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ResultCore {
        &mut self.core
    }

    fn from_value(value: Value) -> Result<Self, ResultError> {
        let doc: RemoteDocument = serde_json::from_value(value)?;
        Self::from_parts(doc)
    }

    fn to_document(&self) -> ResultDocument {
        ResultDocument::Remote(self.clone())
    }

    fn owned_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        let errors = self
            .user_errors
            .iter()
            .filter_map(|e| serde_json::to_value(e).ok())
            .collect();
        fields.insert("userErrors".to_string(), Value::Array(errors));
        fields
    }
}

/// A result document of either environment
#[derive(Debug, Clone, PartialEq)]
pub enum ResultDocument {
    Local(LocalComputationResult),
    Remote(RemoteComputationResult),
}

impl ResultDocument {
    pub fn id(&self) -> &str {
        match self {
            ResultDocument::Local(r) => r.id(),
            ResultDocument::Remote(r) => r.id(),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            ResultDocument::Local(r) => r.run_id(),
            ResultDocument::Remote(r) => r.run_id(),
        }
    }

    pub fn core(&self) -> &ResultCore {
        match self {
            ResultDocument::Local(r) => r.core(),
            ResultDocument::Remote(r) => r.core(),
        }
    }

    pub fn consortium_id(&self) -> &str {
        &self.core().consortium_id
    }

    pub fn signals_completion(&self) -> bool {
        match self {
            ResultDocument::Local(r) => r.signals_completion(),
            ResultDocument::Remote(r) => r.signals_completion(),
        }
    }
}

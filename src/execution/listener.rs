//! Live change subscription for a single store

use crate::persistence::DocumentStore;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Event re-emitted by a [`ChangeListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// Document created or updated
    Change { name: String, doc: Value },
    /// Document deleted; `doc` is the tombstone
    Delete { name: String, doc: Value },
    /// The subscription reported a failure
    Error { name: String, error: String },
}

/// Forwards a store's changes, starting from "now", to a handler
///
/// The subscription is taken before `new` returns, so any write issued after
/// construction is delivered. Nothing earlier is replayed.
pub struct ChangeListener {
    name: String,
    task: Option<JoinHandle<()>>,
}

impl ChangeListener {
    pub fn new<F>(store: &dyn DocumentStore, handler: F) -> Self
    where
        F: Fn(ListenerEvent) + Send + Sync + 'static,
    {
        let name = store.name().to_string();
        let mut feed = store.changes();
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            while let Some(change) = feed.next().await {
                let event = match change {
                    Ok(change) if change.deleted => ListenerEvent::Delete {
                        name: task_name.clone(),
                        doc: change.doc,
                    },
                    Ok(change) => ListenerEvent::Change {
                        name: task_name.clone(),
                        doc: change.doc,
                    },
                    Err(e) => {
                        warn!("Change feed error on {}: {}", task_name, e);
                        ListenerEvent::Error {
                            name: task_name.clone(),
                            error: e.to_string(),
                        }
                    }
                };
                handler(event);
            }
            debug!("Change feed for {} closed", task_name);
        });

        debug!("Listening to {}", name);
        Self {
            name,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the subscription; no handler call happens afterwards
    pub fn destroy(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Stopped listening to {}", self.name);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeListener")
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

//! Consortium membership documents

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named group of participants sharing a decentralized computation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consortium {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    /// Usernames of every member
    #[serde(default)]
    pub users: Vec<String>,

    #[serde(default)]
    pub owners: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_computation_id: Option<String>,

    /// Inputs the owners chose for the active computation
    #[serde(default)]
    pub active_computation_inputs: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl Consortium {
    pub fn new(id: impl Into<String>, users: Vec<String>) -> Self {
        Self {
            id: id.into(),
            users,
            ..Default::default()
        }
    }

    pub fn has_member(&self, username: &str) -> bool {
        self.users.iter().any(|u| Self::compare_usernames(username, u))
    }

    pub fn is_owned_by(&self, username: &str) -> bool {
        self.owners.iter().any(|u| Self::compare_usernames(username, u))
    }

    /// Case-insensitive, whitespace-trimmed username comparison
    pub fn compare_usernames(a: &str, b: &str) -> bool {
        a.trim().to_lowercase() == b.trim().to_lowercase()
    }

    /// Store holding participants' results for this consortium
    pub fn local_store_name(id: &str) -> String {
        format!("local-consortium-{}", id)
    }

    /// Store holding the aggregator's results for this consortium
    pub fn remote_store_name(id: &str) -> String {
        format!("remote-consortium-{}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_membership_is_normalized() {
        let mut consortium = Consortium::new("c1", vec!["Alice".to_string(), " bob ".to_string()]);
        consortium.owners = vec!["ALICE".to_string()];

        assert!(consortium.has_member("alice"));
        assert!(consortium.has_member("BOB"));
        assert!(!consortium.has_member("carol"));
        assert!(consortium.is_owned_by(" alice"));
        assert!(!consortium.is_owned_by("bob"));
    }

    #[test]
    fn test_owners_empty_means_unowned() {
        let consortium = Consortium::new("c1", vec!["alice".to_string()]);
        assert!(!consortium.is_owned_by("alice"));
    }

    #[test]
    fn test_store_names() {
        assert_eq!(Consortium::local_store_name("abc"), "local-consortium-abc");
        assert_eq!(Consortium::remote_store_name("abc"), "remote-consortium-abc");
    }

    #[test]
    fn test_decodes_store_document() {
        let consortium: Consortium = serde_json::from_value(json!({
            "_id": "c9",
            "_rev": "1-aa",
            "label": "Lab",
            "users": ["a", "b"],
            "owners": ["a"],
            "activeComputationId": "ridge",
            "activeComputationInputs": [[["x"]]],
        }))
        .unwrap();
        assert_eq!(consortium.active_computation_id.as_deref(), Some("ridge"));
        assert_eq!(consortium.active_computation_inputs, vec![json!([["x"]])]);
    }
}

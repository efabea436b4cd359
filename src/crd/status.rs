//! # Stack Status
//!
//! Status types recording the outcome of the last automation run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of the Stack resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    /// Stack outputs from the last successful update; secret outputs are masked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<StackUpdateState>,
}

/// Details of the last update attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackUpdateState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StackUpdateStateMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<Permalink>,
    /// RFC3339 timestamp of the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resync_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StackUpdateStateMessage {
    Succeeded,
    Failed,
}

/// Human-followable URL for an update. Not every backend produces one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct Permalink(pub String);

impl Permalink {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Permalink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl StackStatus {
    /// Mutable access to `lastUpdate`, created empty when absent
    pub fn last_update_mut(&mut self) -> &mut StackUpdateState {
        self.last_update.get_or_insert_with(StackUpdateState::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let status = StackStatus {
            outputs: None,
            last_update: Some(StackUpdateState {
                state: Some(StackUpdateStateMessage::Succeeded),
                last_attempted_commit: Some("abc".to_string()),
                last_successful_commit: Some("abc".to_string()),
                permalink: Some(Permalink("https://app.example.com/u/1".to_string())),
                last_resync_time: None,
            }),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "lastUpdate": {
                    "state": "succeeded",
                    "lastAttemptedCommit": "abc",
                    "lastSuccessfulCommit": "abc",
                    "permalink": "https://app.example.com/u/1"
                }
            })
        );
    }
}

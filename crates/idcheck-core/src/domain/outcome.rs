//! Validation outcome and the response body sent back to callers.

use serde::{Deserialize, Serialize};

/// Status of a response.
///
/// `Validating` is internal: it means the work was forwarded and no direct
/// reply was issued by the validation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Validating,
    Error,
    Success,
}

impl ValidationStatus {
    /// Does this status end the saga for the caller?
    pub fn is_terminal(self) -> bool {
        !matches!(self, ValidationStatus::Validating)
    }
}

/// A contact whose identity number resolved in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedContact {
    pub dni: String,

    /// Resolved display name.
    #[serde(rename = "nombre")]
    pub name: String,
}

/// Declared contacts split by registry membership. Each side keeps the
/// caller's input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPartition {
    pub matched: Vec<MatchedContact>,
    pub unmatched: Vec<String>,
}

impl ContactPartition {
    pub fn all_matched(&self) -> bool {
        self.unmatched.is_empty()
    }
}

/// Response body published to a caller's reply destination.
///
/// The validation stage fills the contact partitions; the persistence stage
/// fills `user_id`, `linked_contacts` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub status: ValidationStatus,
    pub message: String,

    /// Milliseconds spent in the stage that produced this response.
    #[serde(rename = "processingTime", default)]
    pub processing_time_ms: u64,

    #[serde(default)]
    pub correlation_id: String,

    #[serde(rename = "validFriends", default, skip_serializing_if = "Option::is_none")]
    pub valid_friends: Option<Vec<MatchedContact>>,

    #[serde(rename = "invalidFriends", default, skip_serializing_if = "Option::is_none")]
    pub invalid_friends: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,

    #[serde(rename = "amigos_guardados", default, skip_serializing_if = "Option::is_none")]
    pub linked_contacts: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ValidationResponse {
    pub fn error(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Error,
            message: message.into(),
            processing_time_ms: 0,
            correlation_id: correlation_id.into(),
            valid_friends: None,
            invalid_friends: None,
            user_id: None,
            linked_contacts: None,
            timestamp: None,
        }
    }

    pub fn success(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Success,
            ..Self::error(message, correlation_id)
        }
    }

    /// Attach both sides of a contact partition.
    pub fn with_partition(mut self, partition: ContactPartition) -> Self {
        self.valid_friends = Some(partition.matched);
        self.invalid_friends = Some(partition.unmatched);
        self
    }

    pub fn with_processing_time(mut self, ms: u64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ValidationStatus::Success
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_lowercase_wire_form() {
        let json = serde_json::to_string(&ValidationStatus::Validating).unwrap();
        assert_eq!(json, "\"validating\"");
        assert!(!ValidationStatus::Validating.is_terminal());
        assert!(ValidationStatus::Error.is_terminal());
    }

    #[test]
    fn contact_failure_carries_both_partitions() {
        let partition = ContactPartition {
            matched: vec![MatchedContact {
                dni: "12345678".into(),
                name: "María López Díaz".into(),
            }],
            unmatched: vec!["99999999".into()],
        };
        let resp = ValidationResponse::error("DNIs de amigos no encontrados: 99999999", "corr-x")
            .with_partition(partition);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["invalidFriends"], serde_json::json!(["99999999"]));
        assert_eq!(value["validFriends"][0]["nombre"], "María López Díaz");
        assert_eq!(value["processingTime"], 0);
        assert!(value.get("user_id").is_none());
    }

    #[test]
    fn decodes_persistence_stage_reply() {
        let raw = br#"{"status":"success","message":"Usuario Ana guardado correctamente","user_id":7,"amigos_guardados":["12345678"],"timestamp":"2024-01-01T00:00:00","correlation_id":"corr-1"}"#;
        let resp = ValidationResponse::from_json(raw).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.user_id, Some(7));
        assert_eq!(resp.linked_contacts.as_deref(), Some(&["12345678".to_string()][..]));
        assert_eq!(resp.processing_time_ms, 0);
    }
}

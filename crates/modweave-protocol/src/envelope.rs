use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Settlement state of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseStatus {
    Pending,
    Resolved,
    Rejected,
}

/// Error as it travels the bus. Rehydrated into a real error only at the
/// receiving boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

impl WireError {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }
}

/// Correlation id plus the request data as sent by the requester.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromisePayload {
    pub id: u64,
    #[serde(default)]
    pub data: Value,
}

/// The promise half of an envelope: the original payload plus the
/// responder's settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromiseBody {
    pub payload: PromisePayload,
    pub status: PromiseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl PromiseBody {
    pub fn pending(id: u64, data: Value) -> Self {
        Self {
            payload: PromisePayload { id, data },
            status: PromiseStatus::Pending,
            data: None,
            error: None,
        }
    }

    pub fn resolved(id: u64, data: Value) -> Self {
        Self {
            payload: PromisePayload {
                id,
                data: Value::Null,
            },
            status: PromiseStatus::Resolved,
            data: Some(data),
            error: None,
        }
    }

    pub fn rejected(id: u64, error: WireError) -> Self {
        Self {
            payload: PromisePayload {
                id,
                data: Value::Null,
            },
            status: PromiseStatus::Rejected,
            data: None,
            error: Some(error),
        }
    }
}

/// One unit on the broadcast bus. `signature` identifies the sender role
/// so contexts can drop their own broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promise: Option<PromiseBody>,
    pub signature: i32,
}

impl Envelope {
    pub fn message(kind: impl Into<String>, data: Value, signature: i32) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            promise: None,
            signature,
        }
    }

    pub fn promise(kind: impl Into<String>, body: PromiseBody, signature: i32) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            promise: Some(body),
            signature,
        }
    }
}

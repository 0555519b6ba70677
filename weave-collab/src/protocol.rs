//! JSON sync protocol.
//!
//! Every frame is one JSON object:
//! ```text
//! {
//!   "type":       "join" | "syncStep1" | "syncStep2" | "update"
//!                 | "awarenessUpdate" | "heartbeat" | "leave",
//!   "documentId": "<document id>",
//!   "payload":    { ...type specific... }
//! }
//! ```
//!
//! Handshake on every (re)connect:
//! ```text
//! client                                relay
//!   │ ── join {userId} ─────────────────► │
//!   │ ── syncStep1 {stateVector} ───────► │
//!   │ ◄──────────── syncStep2 {ops} ───── │  ops the client is missing
//!   │ ◄──────── syncStep1 {stateVector} ─ │
//!   │ ── syncStep2 {ops} ───────────────► │  ops the relay is missing
//!   │ ◄─────────────── update {ops} ───── │  live edits from now on
//! ```
//!
//! Frames are decoded into [`SyncMessage`] whose [`Payload`] is a closed
//! sum type, so handlers dispatch with a single `match`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::awareness::AwarenessState;
use crate::crdt::{Operation, StateVector};

/// Message kinds as they appear in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Join,
    SyncStep1,
    SyncStep2,
    Update,
    AwarenessUpdate,
    Heartbeat,
    Leave,
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Join { user_id: String },
    SyncStep1 { state_vector: StateVector },
    SyncStep2 { ops: Vec<Operation> },
    Update { ops: Vec<Operation> },
    AwarenessUpdate { client_id: String, state: AwarenessState },
    Heartbeat,
    /// `client_id` names the connection that left; without it every entry
    /// of `user_id` is gone.
    Leave { user_id: String, client_id: Option<String> },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Join { .. } => MessageType::Join,
            Payload::SyncStep1 { .. } => MessageType::SyncStep1,
            Payload::SyncStep2 { .. } => MessageType::SyncStep2,
            Payload::Update { .. } => MessageType::Update,
            Payload::AwarenessUpdate { .. } => MessageType::AwarenessUpdate,
            Payload::Heartbeat => MessageType::Heartbeat,
            Payload::Leave { .. } => MessageType::Leave,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub document_id: String,
    pub payload: Payload,
}

/// On-the-wire envelope; the payload is decoded in a second step once the
/// type is known.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: MessageType,
    document_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    user_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeavePayload {
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateVectorPayload {
    state_vector: StateVector,
}

#[derive(Serialize, Deserialize)]
struct OpsPayload {
    ops: Vec<Operation>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwarenessPayload {
    client_id: String,
    state: AwarenessState,
}

impl SyncMessage {
    pub fn new(document_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            document_id: document_id.into(),
            payload,
        }
    }

    pub fn join(document_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(document_id, Payload::Join { user_id: user_id.into() })
    }

    pub fn sync_step1(document_id: impl Into<String>, state_vector: StateVector) -> Self {
        Self::new(document_id, Payload::SyncStep1 { state_vector })
    }

    pub fn sync_step2(document_id: impl Into<String>, ops: Vec<Operation>) -> Self {
        Self::new(document_id, Payload::SyncStep2 { ops })
    }

    pub fn update(document_id: impl Into<String>, ops: Vec<Operation>) -> Self {
        Self::new(document_id, Payload::Update { ops })
    }

    pub fn awareness(document_id: impl Into<String>, state: AwarenessState) -> Self {
        Self::new(
            document_id,
            Payload::AwarenessUpdate {
                client_id: state.client_id.clone(),
                state,
            },
        )
    }

    pub fn heartbeat(document_id: impl Into<String>) -> Self {
        Self::new(document_id, Payload::Heartbeat)
    }

    pub fn leave(document_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(
            document_id,
            Payload::Leave {
                user_id: user_id.into(),
                client_id: None,
            },
        )
    }

    /// Leave for one awareness client of `user_id`; other tabs stay.
    pub fn leave_client(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self::new(
            document_id,
            Payload::Leave {
                user_id: user_id.into(),
                client_id: Some(client_id.into()),
            },
        )
    }

    pub fn msg_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let payload = match &self.payload {
            Payload::Join { user_id } => serde_json::to_value(UserPayload { user_id: user_id.clone() }),
            Payload::Leave { user_id, client_id } => serde_json::to_value(LeavePayload {
                user_id: user_id.clone(),
                client_id: client_id.clone(),
            }),
            Payload::SyncStep1 { state_vector } => serde_json::to_value(StateVectorPayload {
                state_vector: state_vector.clone(),
            }),
            Payload::SyncStep2 { ops } | Payload::Update { ops } => {
                serde_json::to_value(OpsPayload { ops: ops.clone() })
            }
            Payload::AwarenessUpdate { client_id, state } => serde_json::to_value(AwarenessPayload {
                client_id: client_id.clone(),
                state: state.clone(),
            }),
            Payload::Heartbeat => Ok(serde_json::Value::Object(serde_json::Map::new())),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let envelope = Envelope {
            msg_type: self.msg_type(),
            document_id: self.document_id.clone(),
            payload,
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let msg_type = envelope.msg_type;
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            msg_type,
            reason: e.to_string(),
        };

        let payload = match msg_type {
            MessageType::Join => {
                let p: UserPayload = serde_json::from_value(envelope.payload).map_err(invalid)?;
                Payload::Join { user_id: p.user_id }
            }
            MessageType::Leave => {
                let p: LeavePayload = serde_json::from_value(envelope.payload).map_err(invalid)?;
                Payload::Leave {
                    user_id: p.user_id,
                    client_id: p.client_id,
                }
            }
            MessageType::SyncStep1 => {
                let p: StateVectorPayload = serde_json::from_value(envelope.payload).map_err(invalid)?;
                Payload::SyncStep1 {
                    state_vector: p.state_vector,
                }
            }
            MessageType::SyncStep2 => {
                let p: OpsPayload = serde_json::from_value(envelope.payload).map_err(invalid)?;
                Payload::SyncStep2 { ops: p.ops }
            }
            MessageType::Update => {
                let p: OpsPayload = serde_json::from_value(envelope.payload).map_err(invalid)?;
                Payload::Update { ops: p.ops }
            }
            MessageType::AwarenessUpdate => {
                let p: AwarenessPayload = serde_json::from_value(envelope.payload).map_err(invalid)?;
                Payload::AwarenessUpdate {
                    client_id: p.client_id,
                    state: p.state,
                }
            }
            MessageType::Heartbeat => Payload::Heartbeat,
        };

        Ok(Self {
            document_id: envelope.document_id,
            payload,
        })
    }

    /// Reject messages addressed to another document.
    pub fn ensure_document(&self, expected: &str) -> Result<(), ProtocolError> {
        if self.document_id == expected {
            Ok(())
        } else {
            Err(ProtocolError::DocumentMismatch {
                expected: expected.to_string(),
                actual: self.document_id.clone(),
            })
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid {msg_type:?} payload: {reason}")]
    InvalidPayload { msg_type: MessageType, reason: String },
    #[error("message for document {actual:?}, expected {expected:?}")]
    DocumentMismatch { expected: String, actual: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

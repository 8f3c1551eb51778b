use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    domain::{ParticipantId, RecipientSelector},
    error::ProtocolError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub message_id: Uuid,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub recipient: RecipientSelector,
    pub sent_at: DateTime<Utc>,
}

/// Application events carried over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    WaitingAnnouncement {
        subject_id: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    AdmittedNotification {
        subject_id: ParticipantId,
    },
    ChatMessage(ChatPayload),
}

impl BroadcastEvent {
    pub fn decode(payload: &Value) -> Result<Self, ProtocolError> {
        Ok(Self::deserialize(payload)?)
    }

    pub fn encode(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }
}

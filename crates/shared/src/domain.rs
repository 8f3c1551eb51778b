use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Annotation key carrying the admission status of a member.
pub const STATUS_FIELD: &str = "status";

/// Custom key/value fields attached to a roster member.
pub type AnnotationFields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Admission status of a member. Ordered: a status only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    #[default]
    Unset,
    Waiting,
    Admitted,
}

impl AdmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Waiting => "waiting",
            Self::Admitted => "admitted",
        }
    }

    /// Parses an annotation value; anything unrecognised reads as `Unset`.
    pub fn from_annotation(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("waiting") => Self::Waiting,
            Some("admitted") => Self::Admitted,
            _ => Self::Unset,
        }
    }

    /// Annotation fields that set this status.
    pub fn annotation(self) -> AnnotationFields {
        let mut fields = AnnotationFields::new();
        fields.insert(STATUS_FIELD.to_string(), Value::from(self.as_str()));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSelector {
    Everyone,
    Participant(ParticipantId),
}

impl RecipientSelector {
    pub fn is_everyone(&self) -> bool {
        matches!(self, Self::Everyone)
    }

    /// Raw identity comparison; display labels never take part in this.
    pub fn is_visible_to(&self, local: &ParticipantId) -> bool {
        match self {
            Self::Everyone => true,
            Self::Participant(target) => target == local,
        }
    }
}

impl fmt::Display for RecipientSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => f.write_str("Everyone"),
            Self::Participant(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub participant_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub custom: AnnotationFields,
}

impl MemberRecord {
    pub fn status(&self) -> AdmissionStatus {
        AdmissionStatus::from_annotation(self.custom.get(STATUS_FIELD))
    }
}

/// Roster query filter. A member matches when the identity (if set) is equal
/// and every custom field is present with an equal value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberFilter {
    pub participant_id: Option<ParticipantId>,
    pub custom: AnnotationFields,
}

impl MemberFilter {
    pub fn status(status: AdmissionStatus) -> Self {
        Self {
            participant_id: None,
            custom: status.annotation(),
        }
    }

    pub fn participant(participant_id: ParticipantId) -> Self {
        Self {
            participant_id: Some(participant_id),
            custom: AnnotationFields::new(),
        }
    }

    pub fn matches(&self, member: &MemberRecord) -> bool {
        if let Some(participant_id) = &self.participant_id {
            if participant_id != &member.participant_id {
                return false;
            }
        }
        self.custom
            .iter()
            .all(|(key, expected)| member.custom.get(key) == Some(expected))
    }
}

use shared::domain::ParticipantId;

/// Label rendered for the local participant's own identity.
pub const LOCAL_LABEL: &str = "You";

const IDENTITY_DELIMITERS: [char; 3] = ['_', '|', ':'];

/// Human-friendly label for `participant_id`.
///
/// A non-empty provided name that is not just the raw identity wins verbatim.
/// Otherwise identities shaped like `prefix_suffix` render as the capitalised
/// suffix, and anything else falls back to the raw identity.
pub fn resolve_display_name(participant_id: &ParticipantId, provided: Option<&str>) -> String {
    let raw = participant_id.as_str();
    if let Some(name) = provided {
        if !name.trim().is_empty() && name != raw {
            return name.to_string();
        }
    }

    extract_suffix(raw)
        .map(capitalize_first)
        .unwrap_or_else(|| raw.to_string())
}

fn extract_suffix(raw: &str) -> Option<&str> {
    let (prefix, suffix) = raw.split_once(|c| IDENTITY_DELIMITERS.contains(&c))?;
    if prefix.is_empty() || suffix.trim().is_empty() {
        return None;
    }
    Some(suffix)
}

fn capitalize_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct DisplayNameResolver {
    local: ParticipantId,
}

impl DisplayNameResolver {
    pub fn new(local: ParticipantId) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Rendering only. Recipient filtering compares raw identities.
    pub fn label_for(&self, participant_id: &ParticipantId, provided: Option<&str>) -> String {
        if participant_id == &self.local {
            return LOCAL_LABEL.to_string();
        }
        resolve_display_name(participant_id, provided)
    }
}

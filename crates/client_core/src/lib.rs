use shared::domain::ParticipantId;
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod admission;
pub mod chat;
pub mod config;
pub mod display_name;
pub mod error;
pub mod host_lobby;
pub mod waiting_room;

pub use admission::{AdmissionTracker, Transition};
pub use chat::{ChatEntry, ChatHistory, DeliveryState, MessageRouter};
pub use config::{load_settings, load_settings_from, SessionSettings};
pub use display_name::{resolve_display_name, DisplayNameResolver, LOCAL_LABEL};
pub use error::AdmissionError;
pub use host_lobby::{AdmitOutcome, HostLobby, WaitingEntry};
pub use waiting_room::{format_wait_time, WaitingRoom};

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum MeetingEvent {
    Admitted { participant_id: ParticipantId },
    /// Joining failed; the caller should leave the meeting page.
    AdmissionFailed { reason: String },
    WaitingListUpdated { entries: Vec<WaitingEntry> },
    ChatReceived(ChatEntry),
    ChatUnconfirmed { message_id: Uuid },
}

pub fn event_bus(settings: &SessionSettings) -> broadcast::Sender<MeetingEvent> {
    broadcast::channel(settings.event_buffer).0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDescriptor {
    pub room_id: String,
    /// Personal rooms are owned by the participant whose identity is the
    /// room id and gate everyone else through the waiting room.
    pub personal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPlan {
    /// Owner of a personal room: joins directly and runs the lobby.
    Host,
    WaitingRoom,
    DirectJoin,
}

pub fn plan_entry(room: &RoomDescriptor, local: &ParticipantId) -> EntryPlan {
    match (room.personal, local.as_str() == room.room_id) {
        (true, true) => EntryPlan::Host,
        (true, false) => EntryPlan::WaitingRoom,
        (false, _) => EntryPlan::DirectJoin,
    }
}

#[cfg(test)]
#[path = "tests/admission_tests.rs"]
mod admission_tests;

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod chat_tests;

#[cfg(test)]
#[path = "tests/meeting_flow_tests.rs"]
mod meeting_flow_tests;

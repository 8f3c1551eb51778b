use async_trait::async_trait;
use serde_json::Value;
use shared::domain::{AnnotationFields, MemberFilter, MemberRecord, ParticipantId};
use tokio::sync::broadcast;

pub mod memory;

pub use memory::{ChannelFaults, InMemoryChannel, InMemoryHub};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOptions {
    pub name: Option<String>,
    pub custom: AnnotationFields,
}

/// A broadcast event as delivered by the channel, tagged with the member
/// the transport saw sending it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub sender_id: ParticipantId,
    pub payload: Value,
}

/// Session-scoped pub/sub plus roster access offered by the call service.
///
/// Broadcasts carry no delivery or ordering guarantee. Dropping a receiver
/// returned by [`RealtimeChannel::subscribe_events`] unsubscribes it.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn local_participant(&self) -> &ParticipantId;
    async fn join(&self, options: JoinOptions) -> anyhow::Result<()>;
    async fn send_broadcast_event(&self, payload: Value) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
    async fn query_members(&self, filter: &MemberFilter) -> anyhow::Result<Vec<MemberRecord>>;
    async fn update_member_annotation(
        &self,
        participant_id: &ParticipantId,
        fields: AnnotationFields,
    ) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
}

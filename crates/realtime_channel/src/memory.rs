//! Process-local channel used by tests and the demo binary.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use shared::domain::{AnnotationFields, MemberFilter, MemberRecord, ParticipantId};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::{ChannelEvent, JoinOptions, RealtimeChannel};

const CHANNEL_EVENT_BUFFER: usize = 256;

#[derive(Default)]
struct HubState {
    members: BTreeMap<ParticipantId, MemberRecord>,
    subscribers: HashMap<ParticipantId, broadcast::Sender<ChannelEvent>>,
}

/// Shared roster and fanout for every [`InMemoryChannel`] connected to it.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, participant_id: impl Into<ParticipantId>) -> Arc<InMemoryChannel> {
        let (events, _) = broadcast::channel(CHANNEL_EVENT_BUFFER);
        Arc::new(InMemoryChannel {
            hub: self.clone(),
            local: participant_id.into(),
            events,
            faults: Arc::new(ChannelFaults::default()),
        })
    }

    pub async fn member(&self, participant_id: &ParticipantId) -> Option<MemberRecord> {
        self.state.lock().await.members.get(participant_id).cloned()
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }
}

/// Failure switches for one channel. All off by default.
#[derive(Default)]
pub struct ChannelFaults {
    pub fail_join: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_query: AtomicBool,
    pub fail_annotation: AtomicBool,
    /// Sends report success but reach nobody.
    pub drop_broadcasts: AtomicBool,
    pub echo_to_sender: AtomicBool,
}

impl ChannelFaults {
    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    fn is_set(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

pub struct InMemoryChannel {
    hub: InMemoryHub,
    local: ParticipantId,
    events: broadcast::Sender<ChannelEvent>,
    faults: Arc<ChannelFaults>,
}

impl InMemoryChannel {
    pub fn faults(&self) -> &ChannelFaults {
        &self.faults
    }

    /// Live receivers handed out by `subscribe_events`.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl RealtimeChannel for InMemoryChannel {
    fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    async fn join(&self, options: JoinOptions) -> anyhow::Result<()> {
        if ChannelFaults::is_set(&self.faults.fail_join) {
            bail!("join rejected for {}", self.local);
        }
        let mut state = self.hub.state.lock().await;
        let member = state
            .members
            .entry(self.local.clone())
            .or_insert_with(|| MemberRecord {
                participant_id: self.local.clone(),
                name: None,
                custom: AnnotationFields::new(),
            });
        if options.name.is_some() {
            member.name = options.name;
        }
        member.custom.extend(options.custom);
        state
            .subscribers
            .insert(self.local.clone(), self.events.clone());
        debug!(participant_id = %self.local, "memory channel: joined");
        Ok(())
    }

    async fn send_broadcast_event(&self, payload: Value) -> anyhow::Result<()> {
        if ChannelFaults::is_set(&self.faults.fail_send) {
            bail!("broadcast transport unavailable");
        }
        let state = self.hub.state.lock().await;
        if !state.subscribers.contains_key(&self.local) {
            bail!("{} is not joined to the channel", self.local);
        }
        if ChannelFaults::is_set(&self.faults.drop_broadcasts) {
            debug!(participant_id = %self.local, "memory channel: broadcast dropped");
            return Ok(());
        }
        let echo = ChannelFaults::is_set(&self.faults.echo_to_sender);
        let event = ChannelEvent {
            sender_id: self.local.clone(),
            payload,
        };
        for (participant_id, subscriber) in &state.subscribers {
            if participant_id == &self.local && !echo {
                continue;
            }
            let _ = subscriber.send(event.clone());
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn query_members(&self, filter: &MemberFilter) -> anyhow::Result<Vec<MemberRecord>> {
        if ChannelFaults::is_set(&self.faults.fail_query) {
            bail!("member query failed");
        }
        let state = self.hub.state.lock().await;
        Ok(state
            .members
            .values()
            .filter(|member| filter.matches(member))
            .cloned()
            .collect())
    }

    async fn update_member_annotation(
        &self,
        participant_id: &ParticipantId,
        fields: AnnotationFields,
    ) -> anyhow::Result<()> {
        if ChannelFaults::is_set(&self.faults.fail_annotation) {
            bail!("annotation update rejected for {participant_id}");
        }
        let mut state = self.hub.state.lock().await;
        let member = state
            .members
            .get_mut(participant_id)
            .ok_or_else(|| anyhow!("unknown member {participant_id}"))?;
        member.custom.extend(fields);
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        let mut state = self.hub.state.lock().await;
        state.subscribers.remove(&self.local);
        state.members.remove(&self.local);
        debug!(participant_id = %self.local, "memory channel: left");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shared::domain::AdmissionStatus;

    use super::*;

    async fn joined(hub: &InMemoryHub, id: &str) -> Arc<InMemoryChannel> {
        let channel = hub.connect(id);
        channel.join(JoinOptions::default()).await.expect("join");
        channel
    }

    #[tokio::test]
    async fn broadcasts_reach_other_members_but_not_sender() {
        let hub = InMemoryHub::new();
        let alice = joined(&hub, "alice").await;
        let bob = joined(&hub, "bob").await;
        let mut alice_rx = alice.subscribe_events();
        let mut bob_rx = bob.subscribe_events();

        alice
            .send_broadcast_event(json!({ "type": "ping" }))
            .await
            .expect("send");

        let event = bob_rx.recv().await.expect("bob event");
        assert_eq!(event.sender_id, ParticipantId::from("alice"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_broadcasts_report_success() {
        let hub = InMemoryHub::new();
        let alice = joined(&hub, "alice").await;
        let bob = joined(&hub, "bob").await;
        let mut bob_rx = bob.subscribe_events();
        ChannelFaults::set(&alice.faults().drop_broadcasts, true);

        alice
            .send_broadcast_event(json!({ "type": "ping" }))
            .await
            .expect("send");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn annotations_merge_and_filter() {
        let hub = InMemoryHub::new();
        let host = joined(&hub, "host").await;
        let guest = hub.connect("guest");
        guest
            .join(JoinOptions {
                name: Some("Guest".into()),
                custom: AdmissionStatus::Waiting.annotation(),
            })
            .await
            .expect("join");

        let waiting = host
            .query_members(&MemberFilter::status(AdmissionStatus::Waiting))
            .await
            .expect("query");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].name.as_deref(), Some("Guest"));

        host.update_member_annotation(
            &ParticipantId::from("guest"),
            AdmissionStatus::Admitted.annotation(),
        )
        .await
        .expect("annotate");
        let member = hub.member(&"guest".into()).await.expect("member");
        assert_eq!(member.status(), AdmissionStatus::Admitted);
    }

    #[tokio::test]
    async fn dropping_a_receiver_unsubscribes() {
        let hub = InMemoryHub::new();
        let alice = joined(&hub, "alice").await;
        let rx = alice.subscribe_events();
        assert_eq!(alice.subscriber_count(), 1);
        drop(rx);
        assert_eq!(alice.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn leaving_removes_member_from_roster() {
        let hub = InMemoryHub::new();
        let alice = joined(&hub, "alice").await;
        assert_eq!(hub.member_count().await, 1);
        alice.leave().await.expect("leave");
        assert_eq!(hub.member_count().await, 0);
        assert!(alice.send_broadcast_event(json!({})).await.is_err());
    }
}

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use realtime_channel::{ChannelEvent, RealtimeChannel};
use shared::{
    domain::{ParticipantId, RecipientSelector},
    error::ProtocolError,
    protocol::{BroadcastEvent, ChatPayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{display_name::DisplayNameResolver, MeetingEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    /// The broadcast call failed; shown locally, never retried.
    Unconfirmed,
    Received,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message_id: Uuid,
    pub sender_id: ParticipantId,
    pub sender_label: String,
    pub content: String,
    pub recipient: RecipientSelector,
    pub sent_at: DateTime<Utc>,
    pub is_private: bool,
    pub delivery: DeliveryState,
}

/// Per-client chat log: bounded, oldest first, one entry per message id.
#[derive(Debug)]
pub struct ChatHistory {
    entries: VecDeque<ChatEntry>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false when the message id is already present.
    pub fn push(&mut self, entry: ChatEntry) -> bool {
        if !self.seen.insert(entry.message_id) {
            return false;
        }
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.seen.remove(&evicted.message_id);
            }
        }
        self.entries.push_back(entry);
        true
    }

    pub fn set_delivery(&mut self, message_id: Uuid, delivery: DeliveryState) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|entry| entry.message_id == message_id)
        {
            entry.delivery = delivery;
        }
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct RouterInner {
    channel: Arc<dyn RealtimeChannel>,
    resolver: DisplayNameResolver,
    local_name: Option<String>,
    history: Mutex<ChatHistory>,
    events: broadcast::Sender<MeetingEvent>,
}

impl RouterInner {
    async fn accept(&self, event: ChannelEvent) -> Option<ChatEntry> {
        let chat = match decode_chat(&event) {
            Ok(Some(chat)) => chat,
            Ok(None) => return None,
            Err(err) => {
                debug!("chat: dropping event: {err}");
                return None;
            }
        };
        if !chat.recipient.is_visible_to(self.resolver.local()) {
            return None;
        }

        let entry = ChatEntry {
            sender_label: self
                .resolver
                .label_for(&chat.sender_id, chat.sender_name.as_deref()),
            is_private: !chat.recipient.is_everyone(),
            message_id: chat.message_id,
            sender_id: chat.sender_id,
            content: chat.content,
            recipient: chat.recipient,
            sent_at: chat.sent_at,
            delivery: DeliveryState::Received,
        };
        if !self.history.lock().await.push(entry.clone()) {
            debug!(message_id = %entry.message_id, "chat: duplicate message ignored");
            return None;
        }
        let _ = self.events.send(MeetingEvent::ChatReceived(entry.clone()));
        Some(entry)
    }
}

fn decode_chat(event: &ChannelEvent) -> Result<Option<ChatPayload>, ProtocolError> {
    let BroadcastEvent::ChatMessage(chat) = BroadcastEvent::decode(&event.payload)? else {
        return Ok(None);
    };
    if chat.sender_id != event.sender_id {
        return Err(ProtocolError::SenderMismatch {
            envelope: event.sender_id.to_string(),
            payload: chat.sender_id.to_string(),
        });
    }
    Ok(Some(chat))
}

/// Routes chat between admitted participants over the realtime channel.
pub struct MessageRouter {
    inner: Arc<RouterInner>,
    task: JoinHandle<()>,
}

impl MessageRouter {
    pub fn start(
        channel: Arc<dyn RealtimeChannel>,
        local_name: Option<String>,
        history_capacity: usize,
        events: broadcast::Sender<MeetingEvent>,
    ) -> Self {
        let push_events = channel.subscribe_events();
        let inner = Arc::new(RouterInner {
            resolver: DisplayNameResolver::new(channel.local_participant().clone()),
            channel,
            local_name,
            history: Mutex::new(ChatHistory::new(history_capacity)),
            events,
        });
        let task = tokio::spawn(run_receive_loop(Arc::clone(&inner), push_events));
        Self { inner, task }
    }

    /// Appends to local history before broadcasting. Blank content is
    /// dropped without touching the channel and yields `None`.
    pub async fn send_chat(
        &self,
        content: &str,
        recipient: RecipientSelector,
    ) -> Option<ChatEntry> {
        if content.trim().is_empty() {
            return None;
        }

        let local = self.inner.resolver.local().clone();
        let payload = ChatPayload {
            message_id: Uuid::new_v4(),
            sender_id: local.clone(),
            sender_name: self.inner.local_name.clone(),
            content: content.to_string(),
            recipient,
            sent_at: Utc::now(),
        };
        let mut entry = ChatEntry {
            message_id: payload.message_id,
            sender_label: self.inner.resolver.label_for(&local, None),
            sender_id: local,
            content: payload.content.clone(),
            is_private: !payload.recipient.is_everyone(),
            recipient: payload.recipient.clone(),
            sent_at: payload.sent_at,
            delivery: DeliveryState::Pending,
        };
        self.inner.history.lock().await.push(entry.clone());

        let sent = match BroadcastEvent::ChatMessage(payload).encode() {
            Ok(wire) => self
                .inner
                .channel
                .send_broadcast_event(wire)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        entry.delivery = match sent {
            Ok(()) => DeliveryState::Sent,
            Err(err) => {
                warn!(message_id = %entry.message_id, "chat: broadcast failed: {err}");
                let _ = self.inner.events.send(MeetingEvent::ChatUnconfirmed {
                    message_id: entry.message_id,
                });
                DeliveryState::Unconfirmed
            }
        };
        self.inner
            .history
            .lock()
            .await
            .set_delivery(entry.message_id, entry.delivery);
        Some(entry)
    }

    pub async fn history(&self) -> Vec<ChatEntry> {
        self.inner.history.lock().await.entries()
    }

    /// Stops receiving and drops the channel subscription.
    pub fn close(self) {
        self.task.abort();
    }

    #[cfg(test)]
    pub(crate) async fn accept(&self, event: ChannelEvent) -> Option<ChatEntry> {
        self.inner.accept(event).await
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_receive_loop(inner: Arc<RouterInner>, mut push_events: broadcast::Receiver<ChannelEvent>) {
    loop {
        match push_events.recv().await {
            Ok(event) => {
                inner.accept(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "chat: receive lagged, messages lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

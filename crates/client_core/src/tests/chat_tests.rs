use super::*;
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use realtime_channel::{
    ChannelEvent, ChannelFaults, InMemoryChannel, InMemoryHub, JoinOptions, RealtimeChannel,
};
use serde_json::json;
use shared::{
    domain::RecipientSelector,
    protocol::{BroadcastEvent, ChatPayload},
};

struct Client {
    channel: Arc<InMemoryChannel>,
    router: MessageRouter,
    events: broadcast::Receiver<MeetingEvent>,
}

async fn admitted_client(hub: &InMemoryHub, id: &str) -> Client {
    let channel = hub.connect(id);
    channel
        .join(JoinOptions::default())
        .await
        .expect("join");
    let bus = event_bus(&SessionSettings::default());
    let events = bus.subscribe();
    let shared: Arc<dyn RealtimeChannel> = channel.clone();
    let router = MessageRouter::start(shared, None, 500, bus);
    Client {
        channel,
        router,
        events,
    }
}

async fn next_chat(events: &mut broadcast::Receiver<MeetingEvent>) -> ChatEntry {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(MeetingEvent::ChatReceived(entry)) = events.recv().await {
                break entry;
            }
        }
    })
    .await
    .expect("chat received")
}

fn chat_event(
    envelope_sender: &str,
    payload_sender: &str,
    sender_name: Option<&str>,
    recipient: RecipientSelector,
    content: &str,
) -> ChannelEvent {
    let payload = BroadcastEvent::ChatMessage(ChatPayload {
        message_id: Uuid::new_v4(),
        sender_id: payload_sender.into(),
        sender_name: sender_name.map(str::to_string),
        content: content.into(),
        recipient,
        sent_at: Utc::now(),
    })
    .encode()
    .expect("encode");
    ChannelEvent {
        sender_id: envelope_sender.into(),
        payload,
    }
}

#[tokio::test]
async fn broadcast_message_reaches_every_other_client() {
    let hub = InMemoryHub::new();
    let alice = admitted_client(&hub, "user_alice").await;
    let mut bob = admitted_client(&hub, "user_bob").await;
    let mut carol = admitted_client(&hub, "user_carol").await;

    let sent = alice
        .router
        .send_chat("hello all", RecipientSelector::Everyone)
        .await
        .expect("sent");
    assert_eq!(sent.delivery, DeliveryState::Sent);
    assert_eq!(sent.sender_label, LOCAL_LABEL);

    for client in [&mut bob, &mut carol] {
        let received = next_chat(&mut client.events).await;
        assert_eq!(received.message_id, sent.message_id);
        assert_eq!(received.content, "hello all");
        assert_eq!(received.sender_id.as_str(), "user_alice");
        assert_eq!(received.sender_label, "Alice");
        assert!(!received.is_private);
        assert_eq!(client.router.history().await.len(), 1);
    }
}

#[tokio::test]
async fn private_message_is_only_visible_to_its_recipient() {
    let hub = InMemoryHub::new();
    let alice = admitted_client(&hub, "user_alice").await;
    let mut bob = admitted_client(&hub, "user_bob").await;
    let carol = admitted_client(&hub, "user_carol").await;

    alice
        .router
        .send_chat("for bob", RecipientSelector::Participant("user_bob".into()))
        .await
        .expect("sent");

    let received = next_chat(&mut bob.events).await;
    assert!(received.is_private);
    assert_eq!(received.content, "for bob");

    let leaked = chat_event(
        "user_alice",
        "user_alice",
        None,
        RecipientSelector::Participant("user_bob".into()),
        "for bob again",
    );
    assert!(carol.router.accept(leaked).await.is_none());
    assert!(carol
        .router
        .history()
        .await
        .iter()
        .all(|entry| !entry.content.starts_with("for bob")));

    let alice_history = alice.router.history().await;
    assert_eq!(alice_history.len(), 1);
    assert!(alice_history[0].is_private);
}

#[tokio::test]
async fn blank_content_is_rejected_without_broadcast() {
    let hub = InMemoryHub::new();
    let alice = admitted_client(&hub, "user_alice").await;
    let observer = hub.connect("user_observer");
    observer
        .join(JoinOptions::default())
        .await
        .expect("join");
    let mut observed = observer.subscribe_events();

    assert!(alice
        .router
        .send_chat("", RecipientSelector::Everyone)
        .await
        .is_none());
    assert!(alice
        .router
        .send_chat(" \t\n ", RecipientSelector::Everyone)
        .await
        .is_none());

    assert!(alice.router.history().await.is_empty());
    assert!(observed.try_recv().is_err());
}

#[tokio::test]
async fn failed_broadcast_stays_in_history_as_unconfirmed() {
    let hub = InMemoryHub::new();
    let mut alice = admitted_client(&hub, "user_alice").await;
    ChannelFaults::set(&alice.channel.faults().fail_send, true);

    let entry = alice
        .router
        .send_chat("are you there?", RecipientSelector::Everyone)
        .await
        .expect("kept locally");
    assert_eq!(entry.delivery, DeliveryState::Unconfirmed);

    let history = alice.router.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].delivery, DeliveryState::Unconfirmed);

    match alice.events.try_recv() {
        Ok(MeetingEvent::ChatUnconfirmed { message_id }) => {
            assert_eq!(message_id, entry.message_id)
        }
        other => panic!("expected unconfirmed event, got {other:?}"),
    }
}

#[tokio::test]
async fn echoed_message_is_not_duplicated() {
    let hub = InMemoryHub::new();
    let alice = admitted_client(&hub, "user_alice").await;
    ChannelFaults::set(&alice.channel.faults().echo_to_sender, true);

    let sent = alice
        .router
        .send_chat("only once", RecipientSelector::Everyone)
        .await
        .expect("sent");

    let echo = ChannelEvent {
        sender_id: "user_alice".into(),
        payload: BroadcastEvent::ChatMessage(ChatPayload {
            message_id: sent.message_id,
            sender_id: "user_alice".into(),
            sender_name: None,
            content: sent.content.clone(),
            recipient: RecipientSelector::Everyone,
            sent_at: sent.sent_at,
        })
        .encode()
        .expect("encode"),
    };
    assert!(alice.router.accept(echo).await.is_none());

    let history = alice.router.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender_label, LOCAL_LABEL);
}

#[tokio::test]
async fn provided_sender_name_wins_over_identity() {
    let hub = InMemoryHub::new();
    let bob = admitted_client(&hub, "user_bob").await;

    let entry = bob
        .router
        .accept(chat_event(
            "user_a1",
            "user_a1",
            Some("Alice Liddell"),
            RecipientSelector::Everyone,
            "hi",
        ))
        .await
        .expect("accepted");
    assert_eq!(entry.sender_label, "Alice Liddell");
}

#[tokio::test]
async fn spoofed_and_malformed_events_are_dropped() {
    let hub = InMemoryHub::new();
    let bob = admitted_client(&hub, "user_bob").await;

    let spoofed = chat_event(
        "user_mallory",
        "user_alice",
        None,
        RecipientSelector::Everyone,
        "trust me",
    );
    assert!(bob.router.accept(spoofed).await.is_none());

    let missing_id = ChannelEvent {
        sender_id: "user_alice".into(),
        payload: json!({
            "type": "chat_message",
            "sender_id": "user_alice",
            "content": "no id",
            "recipient": "everyone",
            "sent_at": "2026-01-01T00:00:00Z"
        }),
    };
    assert!(bob.router.accept(missing_id).await.is_none());

    let not_chat = ChannelEvent {
        sender_id: "user_alice".into(),
        payload: json!({ "type": "waiting_announcement", "subject_id": "user_alice" }),
    };
    assert!(bob.router.accept(not_chat).await.is_none());
    assert!(bob.router.history().await.is_empty());
}

#[tokio::test]
async fn history_is_bounded() {
    let hub = InMemoryHub::new();
    let channel = hub.connect("user_alice");
    channel
        .join(JoinOptions::default())
        .await
        .expect("join");
    let shared: Arc<dyn RealtimeChannel> = channel.clone();
    let router = MessageRouter::start(shared, None, 3, event_bus(&SessionSettings::default()));

    for n in 0..5 {
        router
            .send_chat(&format!("message {n}"), RecipientSelector::Everyone)
            .await
            .expect("sent");
    }
    let contents = router
        .history()
        .await
        .into_iter()
        .map(|entry| entry.content)
        .collect::<Vec<_>>();
    assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
}

#[tokio::test]
async fn closed_router_drops_its_subscription() {
    let hub = InMemoryHub::new();
    let channel = hub.connect("user_alice");
    channel
        .join(JoinOptions::default())
        .await
        .expect("join");
    let before = channel.subscriber_count();

    let shared: Arc<dyn RealtimeChannel> = channel.clone();
    let router = MessageRouter::start(shared, None, 500, event_bus(&SessionSettings::default()));
    assert_eq!(channel.subscriber_count(), before + 1);

    router.close();
    tokio::time::timeout(Duration::from_secs(1), async {
        while channel.subscriber_count() > before {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscription released");
}

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    event_bus, load_settings, load_settings_from, plan_entry, EntryPlan, HostLobby, MeetingEvent,
    MessageRouter, RoomDescriptor, WaitingRoom,
};
use realtime_channel::{ChannelFaults, InMemoryHub, JoinOptions, RealtimeChannel};
use shared::domain::{AdmissionStatus, RecipientSelector};
use tracing::info;

/// Runs a personal-room meeting against an in-process channel: guests wait,
/// the host admits them, and everyone exchanges a few chat messages.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "user_host")]
    host: String,
    #[arg(long, num_args = 1.., default_values = ["user_ann", "user_ben"])]
    guests: Vec<String>,
    /// Settings file; `meeting.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    participant_poll_ms: Option<u64>,
    #[arg(long)]
    host_poll_ms: Option<u64>,
    /// Lose every broadcast the host sends, so guests are admitted by polling.
    #[arg(long)]
    drop_notices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(ms) = args.participant_poll_ms.filter(|ms| *ms > 0) {
        settings.participant_poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = args.host_poll_ms.filter(|ms| *ms > 0) {
        settings.host_poll_interval = Duration::from_millis(ms);
    }
    info!(?settings, "meeting: settings loaded");

    let hub = InMemoryHub::new();
    let room = RoomDescriptor {
        room_id: args.host.clone(),
        personal: true,
    };

    let host_channel = hub.connect(args.host.as_str());
    if plan_entry(&room, host_channel.local_participant()) != EntryPlan::Host {
        bail!("{} does not own room {}", args.host, room.room_id);
    }
    host_channel
        .join(JoinOptions {
            name: None,
            custom: AdmissionStatus::Admitted.annotation(),
        })
        .await
        .context("host join")?;
    ChannelFaults::set(&host_channel.faults().drop_broadcasts, args.drop_notices);

    let host_events = event_bus(&settings);
    let mut host_rx = host_events.subscribe();
    let host: Arc<dyn RealtimeChannel> = host_channel.clone();
    let lobby = HostLobby::open(
        Arc::clone(&host),
        settings.host_poll_interval,
        host_events.clone(),
    );

    let mut waiting_rooms = Vec::new();
    for guest in &args.guests {
        let channel = hub.connect(guest.as_str());
        if plan_entry(&room, channel.local_participant()) != EntryPlan::WaitingRoom {
            bail!("{guest} cannot enter {} as a guest", room.room_id);
        }
        let events = event_bus(&settings);
        let shared: Arc<dyn RealtimeChannel> = channel.clone();
        let waiting = WaitingRoom::enter(Arc::clone(&shared), None, &settings, events.clone())
            .await
            .with_context(|| format!("{guest} entering waiting room"))?;
        waiting_rooms.push((shared, waiting, events));
    }

    lobby.refresh_now().await;
    for entry in lobby.waiting_list().await {
        let outcome = lobby.admit(&entry.participant_id).await;
        println!(
            "admit {} ({}): {outcome:?}",
            entry.display_name, entry.participant_id
        );
    }

    let admission_deadline = settings.participant_poll_interval * 2;
    let mut routers = Vec::new();
    for (channel, waiting, events) in waiting_rooms {
        tokio::time::timeout(admission_deadline, waiting.wait_until_admitted())
            .await
            .with_context(|| format!("{} still waiting", waiting.participant_id()))??;
        println!(
            "{} admitted after {}",
            waiting.participant_id(),
            waiting.formatted_wait_time()
        );
        routers.push(MessageRouter::start(
            channel,
            None,
            settings.chat_history_capacity,
            events,
        ));
    }
    lobby.close();

    ChannelFaults::set(&host_channel.faults().drop_broadcasts, false);
    let host_router = MessageRouter::start(
        host,
        None,
        settings.chat_history_capacity,
        host_events,
    );
    host_router
        .send_chat("welcome, everyone", RecipientSelector::Everyone)
        .await;
    for router in &routers {
        router
            .send_chat(
                "thanks for letting me in",
                RecipientSelector::Participant(room.room_id.as_str().into()),
            )
            .await;
    }

    let expected = routers.len();
    let mut received = 0;
    while received < expected {
        match tokio::time::timeout(Duration::from_secs(1), host_rx.recv()).await {
            Ok(Ok(MeetingEvent::ChatReceived(_))) => received += 1,
            Ok(Ok(_)) => {}
            Ok(Err(err)) => bail!("host event bus: {err}"),
            Err(_) => bail!("host received {received} of {expected} messages"),
        }
    }

    for entry in host_router.history().await {
        let scope = if entry.is_private { " (private)" } else { "" };
        println!(
            "[{}]{scope} {}: {}",
            entry.sent_at.format("%H:%M:%S"),
            entry.sender_label,
            entry.content
        );
    }
    Ok(())
}

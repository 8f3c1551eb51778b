use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use realtime_channel::{ChannelEvent, RealtimeChannel};
use shared::{
    domain::{AdmissionStatus, MemberFilter, MemberRecord, ParticipantId},
    protocol::BroadcastEvent,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{display_name::resolve_display_name, MeetingEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    /// Already admitted from this lobby and not waiting again; nothing sent.
    AlreadyAdmitted,
    /// The annotation write failed; the next poll restores the entry.
    Unconfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Annotation write in flight; every pull still reads `waiting`.
    Pending,
    /// Written; holds the pull generation current at confirmation.
    Confirmed(u64),
}

/// Host's view of the participants waiting to be let in.
#[derive(Debug, Default)]
struct LobbyState {
    entries: BTreeMap<ParticipantId, WaitingEntry>,
    /// Identities admitted from this lobby. A confirmed record is cleared
    /// when a pull started after the write shows the identity waiting again.
    admissions: HashMap<ParticipantId, Admission>,
    generation: u64,
}

impl LobbyState {
    fn begin_pull(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Replaces the view with the roster's waiting members. Returns whether
    /// the visible list changed.
    fn apply_roster(
        &mut self,
        members: Vec<MemberRecord>,
        pull_generation: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut next = BTreeMap::new();
        for member in members {
            if member.status() != AdmissionStatus::Waiting {
                continue;
            }
            let participant_id = member.participant_id;
            match self.admissions.get(&participant_id) {
                None => {}
                Some(Admission::Pending) => continue,
                // Pull began before the write landed; it cannot know yet.
                Some(Admission::Confirmed(at)) if *at >= pull_generation => continue,
                Some(Admission::Confirmed(_)) => {
                    debug!(participant_id = %participant_id, "lobby: admitted member is waiting again");
                    self.admissions.remove(&participant_id);
                }
            }
            let previous = self.entries.get(&participant_id);
            let provided = member
                .name
                .or_else(|| previous.map(|entry| entry.display_name.clone()));
            let entry = WaitingEntry {
                display_name: resolve_display_name(&participant_id, provided.as_deref()),
                first_seen_at: previous.map(|entry| entry.first_seen_at).unwrap_or(now),
                last_seen_at: now,
                participant_id: participant_id.clone(),
            };
            next.insert(participant_id, entry);
        }
        let changed = !same_visible_entries(&self.entries, &next);
        self.entries = next;
        changed
    }

    /// Announcements never clear an admission record. A rejoin after a
    /// confirmed admission is picked up by the re-pull every announcement
    /// triggers.
    fn apply_announcement(
        &mut self,
        participant_id: ParticipantId,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.admissions.contains_key(&participant_id) {
            debug!(participant_id = %participant_id, "lobby: announcement for admitted member ignored");
            return false;
        }
        let display_name = resolve_display_name(&participant_id, display_name.as_deref());
        match self.entries.get_mut(&participant_id) {
            Some(entry) => {
                let changed = entry.display_name != display_name;
                entry.display_name = display_name;
                entry.last_seen_at = now;
                changed
            }
            None => {
                self.entries.insert(
                    participant_id.clone(),
                    WaitingEntry {
                        participant_id,
                        display_name,
                        first_seen_at: now,
                        last_seen_at: now,
                    },
                );
                true
            }
        }
    }

    fn waiting_list(&self) -> Vec<WaitingEntry> {
        let mut entries = self.entries.values().cloned().collect::<Vec<_>>();
        entries.sort_by(|a, b| {
            a.first_seen_at
                .cmp(&b.first_seen_at)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        entries
    }
}

fn same_visible_entries(
    current: &BTreeMap<ParticipantId, WaitingEntry>,
    next: &BTreeMap<ParticipantId, WaitingEntry>,
) -> bool {
    current.len() == next.len()
        && current.iter().zip(next.iter()).all(|((a_id, a), (b_id, b))| {
            a_id == b_id && a.display_name == b.display_name
        })
}

struct LobbyInner {
    channel: Arc<dyn RealtimeChannel>,
    state: Mutex<LobbyState>,
    events: broadcast::Sender<MeetingEvent>,
}

impl LobbyInner {
    async fn refresh(&self) {
        let pull_generation = self.state.lock().await.begin_pull();
        let members = match self
            .channel
            .query_members(&MemberFilter::status(AdmissionStatus::Waiting))
            .await
        {
            Ok(members) => members,
            Err(err) => {
                warn!("lobby: waiting member query failed: {err:#}");
                return;
            }
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            state
                .apply_roster(members, pull_generation, Utc::now())
                .then(|| state.waiting_list())
        };
        if let Some(entries) = snapshot {
            self.publish(entries);
        }
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        let decoded = match BroadcastEvent::decode(&event.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(sender_id = %event.sender_id, "lobby: dropping malformed event: {err}");
                return;
            }
        };
        let BroadcastEvent::WaitingAnnouncement {
            subject_id,
            display_name,
        } = decoded
        else {
            return;
        };

        if subject_id == event.sender_id {
            let snapshot = {
                let mut state = self.state.lock().await;
                state
                    .apply_announcement(subject_id, display_name, Utc::now())
                    .then(|| state.waiting_list())
            };
            if let Some(entries) = snapshot {
                self.publish(entries);
            }
        } else {
            debug!(
                sender_id = %event.sender_id,
                subject_id = %subject_id,
                "lobby: announcement on behalf of another member, re-pulling only"
            );
        }
        self.refresh().await;
    }

    fn publish(&self, entries: Vec<WaitingEntry>) {
        let _ = self
            .events
            .send(MeetingEvent::WaitingListUpdated { entries });
    }
}

pub struct HostLobby {
    inner: Arc<LobbyInner>,
    task: JoinHandle<()>,
}

impl HostLobby {
    /// Starts watching the roster of an already joined `channel`: one pull
    /// immediately, then every `host_poll_interval` and on each announcement.
    pub fn open(
        channel: Arc<dyn RealtimeChannel>,
        host_poll_interval: Duration,
        events: broadcast::Sender<MeetingEvent>,
    ) -> Self {
        let push_events = channel.subscribe_events();
        let inner = Arc::new(LobbyInner {
            channel,
            state: Mutex::new(LobbyState::default()),
            events,
        });
        let task = tokio::spawn(run_lobby_loop(
            Arc::clone(&inner),
            push_events,
            host_poll_interval,
        ));
        info!(
            host_id = %inner.channel.local_participant(),
            "lobby: opened"
        );
        Self { inner, task }
    }

    pub async fn waiting_list(&self) -> Vec<WaitingEntry> {
        self.inner.state.lock().await.waiting_list()
    }

    pub async fn waiting_count(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn refresh_now(&self) {
        self.inner.refresh().await;
    }

    /// Removes the entry right away, then writes `status = admitted` and
    /// notifies the participant. The next poll corrects a failed write.
    pub async fn admit(&self, participant_id: &ParticipantId) -> AdmitOutcome {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let was_waiting = state.entries.remove(participant_id).is_some();
            if !was_waiting && state.admissions.contains_key(participant_id) {
                debug!(participant_id = %participant_id, "lobby: duplicate admit ignored");
                return AdmitOutcome::AlreadyAdmitted;
            }
            state
                .admissions
                .insert(participant_id.clone(), Admission::Pending);
            was_waiting.then(|| state.waiting_list())
        };
        if let Some(entries) = snapshot {
            self.inner.publish(entries);
        }

        if let Err(err) = self
            .inner
            .channel
            .update_member_annotation(participant_id, AdmissionStatus::Admitted.annotation())
            .await
        {
            warn!(participant_id = %participant_id, "lobby: admission write failed: {err:#}");
            self.inner.state.lock().await.admissions.remove(participant_id);
            return AdmitOutcome::Unconfirmed;
        }
        {
            let mut state = self.inner.state.lock().await;
            let generation = state.generation;
            state
                .admissions
                .insert(participant_id.clone(), Admission::Confirmed(generation));
        }

        let notice = BroadcastEvent::AdmittedNotification {
            subject_id: participant_id.clone(),
        };
        match notice.encode() {
            Ok(payload) => {
                if let Err(err) = self.inner.channel.send_broadcast_event(payload).await {
                    warn!(participant_id = %participant_id, "lobby: admission notice not sent: {err:#}");
                }
            }
            Err(err) => warn!(participant_id = %participant_id, "lobby: admission notice not encoded: {err}"),
        }

        info!(participant_id = %participant_id, "lobby: admitted");
        AdmitOutcome::Admitted
    }

    /// Stops polling and drops the channel subscription.
    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for HostLobby {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_lobby_loop(
    inner: Arc<LobbyInner>,
    mut push_events: broadcast::Receiver<ChannelEvent>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut push_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.refresh().await,
            received = push_events.recv(), if push_open => match received {
                Ok(event) => inner.handle_channel_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "lobby: push events lagged, re-pulling");
                    inner.refresh().await;
                }
                Err(broadcast::error::RecvError::Closed) => push_open = false,
            },
        }
    }
}

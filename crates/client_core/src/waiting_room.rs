use std::{sync::Arc, time::Duration};

use realtime_channel::{ChannelEvent, JoinOptions, RealtimeChannel};
use shared::{
    domain::{AdmissionStatus, MemberFilter, ParticipantId},
    protocol::BroadcastEvent,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    admission::{AdmissionTracker, Transition},
    config::SessionSettings,
    display_name::resolve_display_name,
    error::AdmissionError,
    MeetingEvent,
};

/// Joining side of a personal room: holds the participant until the host
/// admits them.
pub struct WaitingRoom {
    channel: Arc<dyn RealtimeChannel>,
    status: watch::Receiver<AdmissionStatus>,
    waiting_since: Instant,
    task: JoinHandle<()>,
}

impl WaitingRoom {
    /// Joins with `status = waiting`, announces the participant, and starts
    /// watching for admission. A rejected join is fatal for this attempt.
    pub async fn enter(
        channel: Arc<dyn RealtimeChannel>,
        display_name: Option<String>,
        settings: &SessionSettings,
        events: broadcast::Sender<MeetingEvent>,
    ) -> Result<Self, AdmissionError> {
        let local = channel.local_participant().clone();
        let push_events = channel.subscribe_events();

        if let Err(err) = channel
            .join(JoinOptions {
                name: display_name.clone(),
                custom: AdmissionStatus::Waiting.annotation(),
            })
            .await
        {
            error!(participant_id = %local, "waiting room: join rejected: {err:#}");
            let _ = events.send(MeetingEvent::AdmissionFailed {
                reason: err.to_string(),
            });
            return Err(AdmissionError::JoinRejected(err.to_string()));
        }

        let announcement = BroadcastEvent::WaitingAnnouncement {
            subject_id: local.clone(),
            display_name: Some(resolve_display_name(&local, display_name.as_deref())),
        }
        .encode()?;
        if let Err(err) = channel.send_broadcast_event(announcement).await {
            warn!(participant_id = %local, "waiting room: announcement not sent: {err:#}");
        }

        info!(participant_id = %local, "waiting room: waiting for host");
        let (status_tx, status) = watch::channel(AdmissionStatus::Waiting);
        let task = tokio::spawn(run_admission_loop(
            Arc::clone(&channel),
            push_events,
            settings.participant_poll_interval,
            status_tx,
            events,
        ));

        Ok(Self {
            channel,
            status,
            waiting_since: Instant::now(),
            task,
        })
    }

    pub fn participant_id(&self) -> &ParticipantId {
        self.channel.local_participant()
    }

    pub fn is_admitted(&self) -> bool {
        *self.status.borrow() == AdmissionStatus::Admitted
    }

    /// Display only; waiting never times out.
    pub fn wait_duration_seconds(&self) -> u64 {
        self.waiting_since.elapsed().as_secs()
    }

    pub fn formatted_wait_time(&self) -> String {
        format_wait_time(self.wait_duration_seconds())
    }

    pub async fn wait_until_admitted(&self) -> Result<(), AdmissionError> {
        let mut status = self.status.clone();
        status
            .wait_for(|status| *status == AdmissionStatus::Admitted)
            .await
            .map(|_| ())
            .map_err(|_| AdmissionError::Closed)
    }

    /// Leaves the channel and stops watching for admission.
    pub async fn cancel(self) {
        self.task.abort();
        if let Err(err) = self.channel.leave().await {
            warn!(
                participant_id = %self.channel.local_participant(),
                "waiting room: leave failed: {err:#}"
            );
        }
    }
}

impl Drop for WaitingRoom {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// `MM:SS`, minutes unbounded.
pub fn format_wait_time(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

async fn run_admission_loop(
    channel: Arc<dyn RealtimeChannel>,
    mut push_events: broadcast::Receiver<ChannelEvent>,
    poll_interval: Duration,
    status_tx: watch::Sender<AdmissionStatus>,
    events: broadcast::Sender<MeetingEvent>,
) {
    let local = channel.local_participant().clone();
    let mut tracker = AdmissionTracker::new(AdmissionStatus::Waiting);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut push_open = true;

    loop {
        let observed = tokio::select! {
            _ = ticker.tick() => poll_own_status(channel.as_ref(), &local).await,
            received = push_events.recv(), if push_open => match received {
                Ok(event) if is_admission_notice_for(&event, &local) => {
                    debug!(participant_id = %local, "waiting room: admission notice, corroborating");
                    poll_own_status(channel.as_ref(), &local).await
                }
                Ok(_) => None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(participant_id = %local, skipped, "waiting room: push events lagged");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => {
                    push_open = false;
                    None
                }
            },
        };

        let Some(observed) = observed else {
            continue;
        };
        if let Transition::Advanced { to, .. } = tracker.advance(observed) {
            status_tx.send_replace(to);
        }
        if tracker.is_admitted() {
            info!(participant_id = %local, "waiting room: admitted");
            let _ = events.send(MeetingEvent::Admitted {
                participant_id: local.clone(),
            });
            break;
        }
    }
}

// Only notices from another member count; the roster read that follows is
// what actually admits.
fn is_admission_notice_for(event: &ChannelEvent, local: &ParticipantId) -> bool {
    if &event.sender_id == local {
        return false;
    }
    match BroadcastEvent::decode(&event.payload) {
        Ok(BroadcastEvent::AdmittedNotification { subject_id }) => &subject_id == local,
        Ok(_) => false,
        Err(err) => {
            debug!("waiting room: dropping malformed event: {err}");
            false
        }
    }
}

async fn poll_own_status(
    channel: &dyn RealtimeChannel,
    local: &ParticipantId,
) -> Option<AdmissionStatus> {
    match channel
        .query_members(&MemberFilter::participant(local.clone()))
        .await
    {
        Ok(members) => Some(
            members
                .iter()
                .find(|member| &member.participant_id == local)
                .map(|member| member.status())
                .unwrap_or_default(),
        ),
        Err(err) => {
            warn!(participant_id = %local, "waiting room: status poll failed: {err:#}");
            None
        }
    }
}

//! Watches one QR payment session until it settles.
//!
//! A monitor owns two timers: a one second countdown for the UI and a
//! status poll. Both live inside a single task, so stopping the task stops
//! both. The task stops on a terminal status, on expiry, on
//! [`MonitorHandle::cancel`], when the handle is dropped, or when nobody is
//! listening for events any more.

use async_trait::async_trait;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::SessionStatus;
use crate::errors::ServiceError;

/// One status lookup
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self) -> Result<SessionStatus, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Tick { remaining_secs: u64 },
    Pending,
    PollFailed { message: String },
    Completed,
    Expired,
    Cancelled,
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::Tick { .. } => "tick",
            MonitorEvent::Pending => "pending",
            MonitorEvent::PollFailed { .. } => "poll_failed",
            MonitorEvent::Completed => "completed",
            MonitorEvent::Expired => "expired",
            MonitorEvent::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed,
    Expired,
    Cancelled,
    /// The event receiver went away
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Time left before the session expires
    pub expires_in: Duration,
    pub poll_interval: Duration,
    pub tick_interval: Duration,
}

impl MonitorSettings {
    pub fn new(expires_in: Duration, poll_interval: Duration) -> Self {
        Self {
            expires_in,
            poll_interval,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Cancellation handle for a running monitor. Dropping it cancels too.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<MonitorOutcome>,
}

impl MonitorHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the monitor to stop and report why.
    pub async fn outcome(self) -> MonitorOutcome {
        let MonitorHandle { cancel, task } = self;
        let outcome = task.await.unwrap_or(MonitorOutcome::Cancelled);
        drop(cancel);
        outcome
    }
}

pub struct PaymentMonitor;

impl PaymentMonitor {
    pub fn spawn(
        probe: Arc<dyn StatusProbe>,
        settings: MonitorSettings,
        events: mpsc::Sender<MonitorEvent>,
    ) -> MonitorHandle {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(run(probe, settings, events, cancelled));
        MonitorHandle { cancel, task }
    }
}

async fn run(
    probe: Arc<dyn StatusProbe>,
    settings: MonitorSettings,
    events: mpsc::Sender<MonitorEvent>,
    mut cancelled: watch::Receiver<bool>,
) -> MonitorOutcome {
    let started = Instant::now();
    let deadline = started + settings.expires_in;

    let mut countdown = time::interval(settings.tick_interval);
    countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll = time::interval_at(started + settings.poll_interval, settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let expiry = time::sleep_until(deadline);
    tokio::pin!(expiry);

    let outcome = loop {
        tokio::select! {
            biased;

            changed = cancelled.changed() => {
                // Err means the handle was dropped.
                if changed.is_err() || *cancelled.borrow() {
                    break finish(&events, MonitorEvent::Cancelled, MonitorOutcome::Cancelled).await;
                }
            }
            _ = &mut expiry => {
                break finish(&events, MonitorEvent::Expired, MonitorOutcome::Expired).await;
            }
            _ = countdown.tick() => {
                let remaining_secs = deadline.saturating_duration_since(Instant::now()).as_secs();
                if events.send(MonitorEvent::Tick { remaining_secs }).await.is_err() {
                    break MonitorOutcome::Abandoned;
                }
            }
            _ = poll.tick() => {
                // a slow lookup must not hold up cancellation
                let probed = tokio::select! {
                    biased;
                    _ = cancelled.wait_for(|stop| *stop) => None,
                    result = probe.probe() => Some(result),
                };
                let Some(probed) = probed else {
                    break finish(&events, MonitorEvent::Cancelled, MonitorOutcome::Cancelled).await;
                };
                let event = match probed {
                    Ok(SessionStatus::Completed) => {
                        break finish(&events, MonitorEvent::Completed, MonitorOutcome::Completed).await;
                    }
                    Ok(SessionStatus::Expired) => {
                        break finish(&events, MonitorEvent::Expired, MonitorOutcome::Expired).await;
                    }
                    Ok(SessionStatus::Cancelled) => {
                        break finish(&events, MonitorEvent::Cancelled, MonitorOutcome::Cancelled).await;
                    }
                    Ok(SessionStatus::Pending) => MonitorEvent::Pending,
                    Err(e) => {
                        warn!(error = %e, "payment status poll failed; retrying on next tick");
                        MonitorEvent::PollFailed { message: e.response_message() }
                    }
                };
                if events.send(event).await.is_err() {
                    break MonitorOutcome::Abandoned;
                }
            }
        }
    };

    debug!(elapsed = ?started.elapsed(), ?outcome, "payment monitor stopped");
    if outcome != MonitorOutcome::Abandoned {
        info!(?outcome, "payment session settled");
    }
    outcome
}

/// Deliver the final event, if anyone is still listening.
async fn finish(
    events: &mpsc::Sender<MonitorEvent>,
    event: MonitorEvent,
    outcome: MonitorOutcome,
) -> MonitorOutcome {
    let _ = events.send(event).await;
    outcome
}

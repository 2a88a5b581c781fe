//! Lock actuation state machine.
//!
//! One task owns the output line; everyone else holds a clone-safe
//! [`ActuatorHandle`] whose `trigger` never blocks. The line is forced to
//! the locked level before the task serves its first trigger, when the
//! trigger channel closes, and on every doubtful error path.

use sesame_hw::{Level, OutputLine};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Queue depth for pending triggers. Anything beyond this is chatter: the
/// unlock window is already open or about to be.
const TRIGGER_QUEUE: usize = 8;

/// Retry cadence when the relock write itself fails.
const RELOCK_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    FaceMatch { identity_id: String },
    OverrideInput,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::FaceMatch { identity_id } => write!(f, "face-match:{identity_id}"),
            TriggerReason::OverrideInput => write!(f, "override-input"),
        }
    }
}

/// One pulse window, for the log.
#[derive(Debug, Clone)]
pub struct ActuationEvent {
    pub triggered_by: TriggerReason,
    pub started_at: Instant,
    pub ends_at: Instant,
}

#[derive(Clone, Copy)]
enum LockState {
    Locked,
    Unlocked { relock_at: Instant },
}

/// Clone-safe handle to the actuator task.
#[derive(Clone)]
pub struct ActuatorHandle {
    tx: mpsc::Sender<TriggerReason>,
}

impl ActuatorHandle {
    /// Request an unlock pulse. Non-blocking and safe from any thread or
    /// task; concurrent callers are serialized by the actuator task.
    pub fn trigger(&self, reason: TriggerReason) {
        match self.tx.try_send(reason) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(reason)) => {
                tracing::debug!(%reason, "actuator queue full, trigger dropped");
            }
            Err(mpsc::error::TrySendError::Closed(reason)) => {
                tracing::warn!(%reason, "actuator stopped, trigger dropped");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::Receiver<TriggerReason>) {
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        (Self { tx }, rx)
    }
}

/// Spawn the actuator task.
///
/// The line is driven to locked before the task starts serving triggers.
/// Dropping every handle closes the trigger channel; the task then forces
/// locked one last time and exits.
pub fn spawn_actuator(
    line: Arc<dyn OutputLine>,
    pulse: Duration,
    relock_debounce: Duration,
) -> (ActuatorHandle, tokio::task::JoinHandle<()>) {
    // Fail-safe initial state, before any trigger can be observed.
    if let Err(e) = line.set(Level::Active) {
        tracing::error!(error = %e, "failed to force initial locked state, assuming locked");
    }

    let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
    let task = tokio::spawn(run(line, rx, pulse, relock_debounce));
    (ActuatorHandle { tx }, task)
}

async fn run(
    line: Arc<dyn OutputLine>,
    mut rx: mpsc::Receiver<TriggerReason>,
    pulse: Duration,
    relock_debounce: Duration,
) {
    let mut state = LockState::Locked;
    let mut last_locked_at: Option<Instant> = None;

    tracing::info!(
        pulse_ms = pulse.as_millis() as u64,
        relock_debounce_ms = relock_debounce.as_millis() as u64,
        "actuator started"
    );

    loop {
        match state {
            LockState::Locked => {
                let Some(reason) = rx.recv().await else {
                    break;
                };

                if let Some(at) = last_locked_at {
                    if at.elapsed() < relock_debounce {
                        tracing::debug!(%reason, "trigger within relock debounce, ignored");
                        continue;
                    }
                }

                match line.set(Level::Inactive) {
                    Ok(()) => {
                        let started_at = Instant::now();
                        let event = ActuationEvent {
                            triggered_by: reason,
                            started_at,
                            ends_at: started_at + pulse,
                        };
                        tracing::info!(
                            reason = %event.triggered_by,
                            pulse_ms = (event.ends_at - event.started_at).as_millis() as u64,
                            "unlocked"
                        );
                        state = LockState::Unlocked {
                            relock_at: event.ends_at,
                        };
                    }
                    Err(e) => {
                        // Never assume unlocked on a failed write.
                        tracing::error!(error = %e, %reason, "unlock write failed, staying locked");
                    }
                }
            }
            LockState::Unlocked { relock_at } => {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(reason) => {
                            // Extend the single pending window; timers never stack.
                            let extended = Instant::now() + pulse;
                            tracing::debug!(%reason, "retrigger while unlocked, window extended");
                            state = LockState::Unlocked { relock_at: extended };
                        }
                        None => {
                            relock(&line).await;
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(relock_at) => {
                        relock(&line).await;
                        last_locked_at = Some(Instant::now());
                        state = LockState::Locked;
                    }
                }
            }
        }
    }

    // Channel closed while locked: re-assert the fail-safe level anyway.
    if let Err(e) = line.set(Level::Active) {
        tracing::error!(error = %e, "failed to assert locked on shutdown");
    }
    tracing::info!("actuator stopped");
}

/// Drive the line back to locked, retrying until the write lands. The
/// reported state is locked throughout — a door we cannot prove unlocked
/// is treated as locked.
async fn relock(line: &Arc<dyn OutputLine>) {
    loop {
        match line.set(Level::Active) {
            Ok(()) => {
                tracing::info!("locked");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "relock write failed, retrying");
                tokio::time::sleep(RELOCK_RETRY).await;
            }
        }
    }
}

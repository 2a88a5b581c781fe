//! Manual-exit override listener.
//!
//! Watches the exit-button line and fires the actuator on a debounced
//! press. Runs beside the frame pipeline and never touches the cache or
//! matcher; the actuator's `trigger` contract is the whole coupling.

use crate::actuator::{ActuatorHandle, TriggerReason};
use sesame_hw::{InputLine, Level};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(100);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Spawn the listener task. Aborted by the orchestrator on shutdown; it
/// holds no state worth cleaning up.
pub fn spawn_override_listener(
    line: Arc<dyn InputLine>,
    actuator: ActuatorHandle,
    debounce: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(line, actuator, debounce))
}

async fn run(line: Arc<dyn InputLine>, actuator: ActuatorHandle, debounce: Duration) {
    tracing::info!(debounce_ms = debounce.as_millis() as u64, "override listener started");
    let mut error_backoff = ERROR_BACKOFF_BASE;

    loop {
        match line.get() {
            Ok(Level::Inactive) => {
                error_backoff = ERROR_BACKOFF_BASE;
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok(Level::Active) => {
                error_backoff = ERROR_BACKOFF_BASE;

                // Delay-then-reconfirm: only a level still active after the
                // debounce window counts as a press.
                tokio::time::sleep(debounce).await;
                match line.get() {
                    Ok(Level::Active) => {
                        tracing::info!("override input confirmed");
                        actuator.trigger(TriggerReason::OverrideInput);
                        wait_for_release(&line).await;
                    }
                    Ok(Level::Inactive) => {
                        tracing::debug!("override transient rejected by debounce");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "override re-read failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    backoff_ms = error_backoff.as_millis() as u64,
                    "override input read failed, backing off"
                );
                tokio::time::sleep(error_backoff).await;
                error_backoff = (error_backoff * 2).min(ERROR_BACKOFF_MAX);
            }
        }
    }
}

/// Hold off re-arming until the button is released, so one long press is
/// one trigger. Read errors end the wait; the main loop's backoff takes
/// over from there.
async fn wait_for_release(line: &Arc<dyn InputLine>) {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        match line.get() {
            Ok(Level::Active) => continue,
            Ok(Level::Inactive) => return,
            Err(e) => {
                tracing::warn!(error = %e, "override read failed while waiting for release");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorHandle;
    use sesame_hw::GpioError;
    use std::sync::Mutex;

    /// Replays a scripted sequence of reads; the final entry repeats.
    struct ScriptedLine {
        script: Mutex<Vec<Result<Level, ()>>>,
        cursor: Mutex<usize>,
    }

    impl ScriptedLine {
        fn new(script: Vec<Result<Level, ()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                cursor: Mutex::new(0),
            })
        }
    }

    impl InputLine for ScriptedLine {
        fn get(&self) -> Result<Level, GpioError> {
            let script = self.script.lock().unwrap();
            let mut cursor = self.cursor.lock().unwrap();
            let idx = (*cursor).min(script.len() - 1);
            *cursor += 1;
            script[idx]
                .map_err(|_| GpioError::Ioctl(std::io::Error::other("injected")))
        }
    }

    async fn drain_one(rx: &mut tokio::sync::mpsc::Receiver<TriggerReason>) -> Option<TriggerReason> {
        rx.try_recv().ok()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_press_triggers_once() {
        // Active through the debounce re-read, released afterwards.
        let line = ScriptedLine::new(vec![
            Ok(Level::Active),   // initial detect
            Ok(Level::Active),   // debounce re-read
            Ok(Level::Active),   // still held
            Ok(Level::Inactive), // released; repeats
        ]);
        let (handle, mut rx) = ActuatorHandle::for_tests();
        let task = spawn_override_listener(line, handle, Duration::from_millis(200));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            drain_one(&mut rx).await,
            Some(TriggerReason::OverrideInput)
        );
        assert_eq!(drain_one(&mut rx).await, None, "one press, one trigger");
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_noise_rejected() {
        // Active blip that is gone by the debounce re-read.
        let line = ScriptedLine::new(vec![
            Ok(Level::Active),
            Ok(Level::Inactive),
        ]);
        let (handle, mut rx) = ActuatorHandle::for_tests();
        let task = spawn_override_listener(line, handle, Duration::from_millis(200));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain_one(&mut rx).await, None);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_back_off_and_recover() {
        let line = ScriptedLine::new(vec![
            Err(()),
            Err(()),
            Err(()),
            Ok(Level::Active),
            Ok(Level::Active),
            Ok(Level::Inactive),
        ]);
        let (handle, mut rx) = ActuatorHandle::for_tests();
        let task = spawn_override_listener(line, handle, Duration::from_millis(200));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            drain_one(&mut rx).await,
            Some(TriggerReason::OverrideInput),
            "listener survives read failures"
        );
        task.abort();
    }
}

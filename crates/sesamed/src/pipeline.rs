//! Frame-processing loop: camera → extractor → matcher → actuator.
//!
//! Runs on a dedicated OS thread because frame acquisition and inference
//! both block. Coordination with the rest of the agent is one-way and
//! non-blocking: cache snapshots in, actuator triggers and access events
//! out, plus a stop flag checked between frames.

use crate::actuator::{ActuatorHandle, TriggerReason};
use crate::cache::EnrollmentCache;
use crate::sync::{AccessEvent, EventReporter};
use chrono::Utc;
use sesame_core::{CosineMatcher, EmbeddingExtractor, MatchResult, Matcher};
use sesame_hw::{CameraError, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(10);

pub struct FramePipeline {
    pub source: Box<dyn FrameSource>,
    pub extractor: Box<dyn EmbeddingExtractor>,
    pub cache: Arc<EnrollmentCache>,
    pub actuator: ActuatorHandle,
    pub events: EventReporter,
    pub device_id: String,
    pub threshold: f32,
    pub cooldown: Duration,
}

impl FramePipeline {
    /// Spawn the loop on its own thread; it exits when `stop` is set.
    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("sesame-pipeline".into())
            .spawn(move || self.run(stop))
            .expect("failed to spawn pipeline thread")
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        tracing::info!(threshold = self.threshold, "pipeline thread started");
        let matcher = CosineMatcher;
        let mut retry_backoff = RETRY_BACKOFF_BASE;
        let mut last_grant: Option<Instant> = None;

        while !stop.load(Ordering::Relaxed) {
            let frame = match self.source.next_frame() {
                Ok(frame) => {
                    retry_backoff = RETRY_BACKOFF_BASE;
                    frame
                }
                Err(CameraError::Interrupted(e)) => {
                    tracing::warn!(error = %e, "frame source interrupted, retrying");
                    std::thread::sleep(retry_backoff);
                    retry_backoff = (retry_backoff * 2).min(RETRY_BACKOFF_MAX);
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame source failed, retrying");
                    std::thread::sleep(retry_backoff);
                    retry_backoff = (retry_backoff * 2).min(RETRY_BACKOFF_MAX);
                    continue;
                }
            };

            if frame.is_dark {
                tracing::trace!(sequence = frame.sequence, "dark frame skipped");
                continue;
            }

            let embedding =
                match self.extractor.extract(&frame.data, frame.width, frame.height) {
                    Ok(Some(embedding)) => embedding,
                    Ok(None) => continue, // no face in frame
                    Err(e) => {
                        tracing::warn!(error = %e, "extraction failed, frame skipped");
                        continue;
                    }
                };

            let snapshot = self.cache.snapshot();
            let result = match matcher.compare(&embedding, snapshot.records(), self.threshold) {
                Ok(result) => result,
                Err(e) => {
                    // Dimensionality is validated at startup and at merge;
                    // reaching this is a wiring bug worth shouting about.
                    tracing::error!(error = %e, "matcher rejected probe embedding");
                    continue;
                }
            };

            self.handle_result(result, &mut last_grant);
        }

        tracing::info!("pipeline thread stopped");
    }

    fn handle_result(&self, result: MatchResult, last_grant: &mut Option<Instant>) {
        if result.matched {
            let (Some(identity_id), Some(display_name)) =
                (result.identity_id.as_ref(), result.display_name.as_ref())
            else {
                tracing::error!("matched result without identity");
                return;
            };

            if let Some(at) = *last_grant {
                if at.elapsed() < self.cooldown {
                    tracing::debug!(
                        identity_id = %identity_id,
                        remaining_ms =
                            (self.cooldown - at.elapsed()).as_millis() as u64,
                        "access granted but within cooldown"
                    );
                    return;
                }
            }

            tracing::info!(
                identity_id = %identity_id,
                display_name = %display_name,
                score = result.score,
                "access granted"
            );
            self.actuator.trigger(TriggerReason::FaceMatch {
                identity_id: identity_id.clone(),
            });
            *last_grant = Some(Instant::now());
            self.events.report(AccessEvent {
                identity_id: Some(identity_id.clone()),
                status: "granted",
                score: result.score,
                device_id: self.device_id.clone(),
                occurred_at: Utc::now(),
            });
        } else {
            tracing::debug!(
                score = result.score,
                threshold = self.threshold,
                "access denied, best candidate below threshold"
            );
            self.events.report(AccessEvent {
                identity_id: None,
                status: "denied",
                score: result.score,
                device_id: self.device_id.clone(),
                occurred_at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorHandle;
    use chrono::TimeZone;
    use sesame_core::{EnrollmentRecord, HashedExtractor};
    use sesame_hw::Frame;
    use std::collections::VecDeque;

    /// Serves queued frames, then flips the stop flag and reports an
    /// interruption so the loop winds down.
    struct QueuedSource {
        frames: VecDeque<Frame>,
        stop: Arc<AtomicBool>,
    }

    impl FrameSource for QueuedSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(frame),
                None => {
                    self.stop.store(true, Ordering::Relaxed);
                    Err(CameraError::Interrupted("drained".into()))
                }
            }
        }
    }

    fn gray_frame(fill: u8) -> Frame {
        Frame {
            data: vec![fill; 64 * 64],
            width: 64,
            height: 64,
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark: false,
        }
    }

    fn enrolled_from_frame(id: &str, frame: &Frame) -> EnrollmentRecord {
        let embedding = HashedExtractor
            .extract(&frame.data, frame.width, frame.height)
            .unwrap()
            .unwrap();
        EnrollmentRecord {
            identity_id: id.to_string(),
            display_name: id.to_uppercase(),
            embedding,
            updated_at: chrono::Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            revision: 1,
        }
    }

    fn run_pipeline(
        frames: Vec<Frame>,
        records: Vec<EnrollmentRecord>,
        cooldown: Duration,
    ) -> (
        Vec<TriggerReason>,
        Vec<AccessEvent>,
    ) {
        let stop = Arc::new(AtomicBool::new(false));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(EnrollmentCache::load(&dir.path().join("cache.json"), 128));
        if !records.is_empty() {
            cache.merge(records, 1).unwrap();
        }

        let (actuator, mut trigger_rx) = ActuatorHandle::for_tests();
        let (events, mut event_rx) = EventReporter::for_tests();

        let pipeline = FramePipeline {
            source: Box::new(QueuedSource {
                frames: frames.into(),
                stop: stop.clone(),
            }),
            extractor: Box::new(HashedExtractor),
            cache,
            actuator,
            events,
            device_id: "dev-test".into(),
            threshold: 0.99,
            cooldown,
        };

        pipeline.spawn(stop).join().unwrap();

        let mut triggers = Vec::new();
        while let Ok(reason) = trigger_rx.try_recv() {
            triggers.push(reason);
        }
        let mut reported = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            reported.push(event);
        }
        (triggers, reported)
    }

    #[test]
    fn test_matching_frame_triggers_actuator() {
        let frame = gray_frame(100);
        let record = enrolled_from_frame("alice", &frame);
        let (triggers, events) = run_pipeline(vec![frame], vec![record], Duration::ZERO);

        assert_eq!(
            triggers,
            vec![TriggerReason::FaceMatch {
                identity_id: "alice".into()
            }]
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "granted");
        assert_eq!(events[0].identity_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_non_matching_frame_reports_denied() {
        let frame = gray_frame(100);
        let record = enrolled_from_frame("alice", &gray_frame(200));
        let (triggers, events) = run_pipeline(vec![frame], vec![record], Duration::ZERO);

        assert!(triggers.is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "denied");
        assert_eq!(events[0].identity_id, None);
    }

    #[test]
    fn test_cooldown_limits_triggers() {
        let frame = gray_frame(100);
        let record = enrolled_from_frame("alice", &frame);
        let frames = vec![frame.clone(), frame.clone(), frame];
        let (triggers, events) =
            run_pipeline(frames, vec![record], Duration::from_secs(60));

        assert_eq!(triggers.len(), 1, "repeat matches inside cooldown are quiet");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_dark_frames_skipped() {
        let mut frame = gray_frame(100);
        frame.is_dark = true;
        let record = enrolled_from_frame("alice", &gray_frame(100));
        let (triggers, events) = run_pipeline(vec![frame], vec![record], Duration::ZERO);

        assert!(triggers.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn test_empty_cache_denies() {
        let (triggers, events) =
            run_pipeline(vec![gray_frame(100)], Vec::new(), Duration::ZERO);
        assert!(triggers.is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "denied");
        assert_eq!(events[0].score, 0.0);
    }
}

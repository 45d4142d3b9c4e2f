use presence_core::{
    FrameReport, Outcome, SessionEvent, TrackStatus, VerificationSession,
};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::source::FrameSource;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine for status queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub source: String,
    pub running: bool,
    pub source_exhausted: bool,
    pub matcher_available: bool,
    pub frames_processed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub inconclusive: u64,
    pub discarded: u64,
    pub warnings: u64,
    pub tracks: Vec<TrackStatus>,
}

impl EngineStatus {
    fn record(&mut self, report: &FrameReport) {
        self.frames_processed += 1;
        self.warnings += report.warnings.len() as u64;
        for event in &report.events {
            match event {
                SessionEvent::Decided(d) => match d.outcome {
                    Outcome::Accepted => self.accepted += 1,
                    Outcome::Rejected => self.rejected += 1,
                    Outcome::Inconclusive => self.inconclusive += 1,
                },
                SessionEvent::Discarded { .. } => self.discarded += 1,
                _ => {}
            }
        }
        self.tracks = report.tracks.clone();
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Stop {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Abort the session and end the engine thread. Returns the final status.
    pub async fn stop(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Stop { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread pulls a frame from `source` every `interval`, runs it through
/// the session and answers requests between frames. Once the source is
/// exhausted it only answers requests.
pub fn spawn_engine(
    mut session: VerificationSession,
    mut source: Box<dyn FrameSource>,
    interval: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let mut status = EngineStatus {
        source: source.describe(),
        running: true,
        matcher_available: session.matcher_available(),
        ..EngineStatus::default()
    };

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!(source = %status.source, "engine thread started");
            'run: loop {
                let tick = Instant::now();

                loop {
                    let request = if status.source_exhausted {
                        match rx.blocking_recv() {
                            Some(request) => request,
                            None => break 'run,
                        }
                    } else {
                        match rx.try_recv() {
                            Ok(request) => request,
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => break 'run,
                        }
                    };
                    match request {
                        EngineRequest::Status { reply } => {
                            let _ = reply.send(status.clone());
                        }
                        EngineRequest::Stop { reply } => {
                            session.abort();
                            status.running = false;
                            let _ = reply.send(status.clone());
                            break 'run;
                        }
                    }
                }

                match source.next_frame() {
                    Ok(Some(frame)) => {
                        let report = session.process_frame(&frame);
                        for warning in &report.warnings {
                            tracing::debug!(frame = report.frame_index, ?warning, "pipeline warning");
                        }
                        status.record(&report);
                    }
                    Ok(None) => {
                        tracing::info!(
                            frames = status.frames_processed,
                            "frame source exhausted; idling"
                        );
                        status.source_exhausted = true;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "frame read failed; skipping");
                    }
                }

                if let Some(rest) = interval.checked_sub(tick.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
            session.abort();
            tracing::info!(frames = status.frames_processed, "engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use chrono::{Duration as ChronoDuration, Local};
    use image::GrayImage;
    use presence_core::liveness::EyeLocator;
    use presence_core::{
        AttendanceLedger, AttendanceSink, FaceLocalizer, FaceRegion, Frame, IdentityMatcher,
        LivenessEvaluator, LocalizerError, PipelineConfig, SessionParts, SinkError, Ack,
        StaticRoster, VerificationDecision,
    };
    use std::sync::Arc;

    struct OneFace;

    impl FaceLocalizer for OneFace {
        fn locate_gray(&self, _gray: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError> {
            Ok(vec![FaceRegion::new(20, 20, 40, 40)])
        }
    }

    struct NoEyes;

    impl EyeLocator for NoEyes {
        fn locate_eyes(&self, _face: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError> {
            Ok(Vec::new())
        }
    }

    struct NullSink;

    impl AttendanceSink for NullSink {
        fn commit(&self, _decision: &VerificationDecision) -> Result<Ack, SinkError> {
            Err(SinkError::Unavailable("test sink".into()))
        }
    }

    struct CountedFrames {
        remaining: usize,
    }

    impl FrameSource for CountedFrames {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let at = Local::now() - ChronoDuration::milliseconds(self.remaining as i64);
            Ok(Some(Frame::from_gray(&GrayImage::new(120, 90), at)))
        }

        fn describe(&self) -> String {
            "counted".to_string()
        }
    }

    fn session() -> VerificationSession {
        let mut config = PipelineConfig::default();
        config.matcher.threads = 0;
        VerificationSession::new(
            config.clone(),
            SessionParts {
                localizer: Box::new(OneFace),
                liveness: LivenessEvaluator::new(config.liveness.clone(), Box::new(NoEyes)),
                matcher: IdentityMatcher::unavailable(config.accept_cutoff),
                ledger: Arc::new(AttendanceLedger::new()),
                sink: Arc::new(NullSink),
                roster: Arc::new(StaticRoster::default()),
            },
        )
        .unwrap()
    }

    async fn wait_for_exhaustion(engine: &EngineHandle) -> EngineStatus {
        for _ in 0..200 {
            let status = engine.status().await.unwrap();
            if status.source_exhausted {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("frame source never exhausted");
    }

    #[tokio::test]
    async fn test_processes_all_frames_then_idles() {
        let engine = spawn_engine(
            session(),
            Box::new(CountedFrames { remaining: 5 }),
            Duration::ZERO,
        )
        .unwrap();
        let status = wait_for_exhaustion(&engine).await;
        assert_eq!(status.frames_processed, 5);
        assert_eq!(status.source, "counted");
        assert!(status.running);
        assert!(!status.matcher_available);
        assert_eq!(status.tracks.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_ends_thread() {
        let engine = spawn_engine(
            session(),
            Box::new(CountedFrames { remaining: 3 }),
            Duration::ZERO,
        )
        .unwrap();
        wait_for_exhaustion(&engine).await;
        let last = engine.stop().await.unwrap();
        assert!(!last.running);
        assert!(matches!(
            engine.status().await,
            Err(EngineError::ChannelClosed)
        ));
    }
}

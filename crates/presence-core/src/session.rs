//! Per-camera verification session.
//!
//! Drives one frame at a time through localization, track association,
//! liveness and identity matching, and turns the results into attendance
//! decisions. Each track moves through
//!
//! ```text
//! Tracking → AwaitingLiveness ─┬─ Live  → Gating ─┬─ Accepted
//!                              │                  └─ Rejected (DuplicateToday)
//!                              └─ Spoof → Discarded (SpoofDetected)
//! ```
//!
//! and is evicted once it has gone unmatched for longer than the grace
//! period. A track lost while still Gating ends Inconclusive. Tracks that
//! reached a terminal phase stay associated with their face until it leaves,
//! so the same person is not verified twice in a row.
//!
//! Faults are isolated per track: a failing matcher or eye locator discards
//! only the track it was working on.

use chrono::{DateTime, Local};
use image::GrayImage;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::frame::{crop_gray, Frame, FrameError};
use crate::ledger::{AttendanceLedger, CommitOutcome};
use crate::liveness::{
    LivenessError, LivenessEvaluator, LivenessStatus, LivenessVerdict, TrackLiveness,
};
use crate::localizer::{FaceLocalizer, LocalizerError};
use crate::matcher::{IdentityMatcher, MatchError, MatchResult};
use crate::pool::{panic_message, MatcherPool, PoolError};
use crate::sink::{AttendanceSink, Roster, SinkError};
use crate::tracker::associate;
use crate::types::{FaceRegion, IdentityId, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Accepted,
    Rejected,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecisionReason {
    Matched,
    DuplicateToday,
    NoConfidentMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationDecision {
    pub track_id: TrackId,
    pub identity_id: Option<IdentityId>,
    pub display_name: Option<String>,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Local>,
    pub outcome: Outcome,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DiscardReason {
    SpoofDetected,
    InternalError(String),
    CommitFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrackPhase {
    Tracking,
    AwaitingLiveness,
    Gating,
    Accepted,
    Rejected,
    Discarded(DiscardReason),
}

impl TrackPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackPhase::Accepted | TrackPhase::Rejected | TrackPhase::Discarded(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TrackStarted { track: TrackId, region: FaceRegion },
    LivenessResolved { track: TrackId, verdict: LivenessVerdict },
    Decided(VerificationDecision),
    Discarded { track: TrackId, reason: DiscardReason },
    /// Track evicted after the grace period; no decision unless it was Gating.
    Lost { track: TrackId },
}

/// Recoverable faults, reported to the caller without stopping the session.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineWarning {
    InvalidFrame(FrameError),
    DetectorFault(String),
    ModelUnavailable { track: TrackId },
    SinkFailed { track: TrackId, error: SinkError },
}

/// Operator overlay entry for one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackStatus {
    pub track_id: TrackId,
    pub region: FaceRegion,
    pub phase: TrackPhase,
    pub liveness: LivenessStatus,
    pub liveness_confidence: u8,
    pub match_confidence: Option<f32>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame_index: u64,
    pub events: Vec<SessionEvent>,
    pub warnings: Vec<PipelineWarning>,
    pub tracks: Vec<TrackStatus>,
}

impl FrameReport {
    pub fn decisions(&self) -> impl Iterator<Item = &VerificationDecision> {
        self.events.iter().filter_map(|e| match e {
            SessionEvent::Decided(d) => Some(d),
            _ => None,
        })
    }
}

struct Track {
    id: TrackId,
    last_region: FaceRegion,
    created_at: DateTime<Local>,
    missed: u32,
    seen: bool,
    liveness: TrackLiveness,
    verdict: Option<LivenessVerdict>,
    phase: TrackPhase,
    match_result: Option<MatchResult>,
    decision: Option<VerificationDecision>,
    match_attempts: u32,
}

impl Track {
    fn status(&self) -> TrackStatus {
        TrackStatus {
            track_id: self.id,
            region: self.last_region,
            phase: self.phase.clone(),
            liveness: self.liveness.status(),
            liveness_confidence: self.verdict.as_ref().map_or(0, |v| v.confidence),
            match_confidence: self.match_result.as_ref().map(|m| m.confidence),
            label: self
                .decision
                .as_ref()
                .and_then(|d| d.display_name.clone())
                .or_else(|| {
                    self.match_result
                        .as_ref()
                        .and_then(|m| m.candidate.as_ref())
                        .map(|c| c.to_string())
                }),
        }
    }

    fn discard(&mut self, reason: DiscardReason, report: &mut FrameReport) {
        match &reason {
            DiscardReason::SpoofDetected => {
                tracing::info!(track = %self.id, "track discarded: spoof detected")
            }
            _ => tracing::warn!(track = %self.id, reason = ?reason, "track discarded"),
        }
        self.phase = TrackPhase::Discarded(reason.clone());
        report.events.push(SessionEvent::Discarded {
            track: self.id,
            reason,
        });
    }
}

/// Shared collaborators of a session.
pub struct SessionParts {
    pub localizer: Box<dyn FaceLocalizer>,
    pub liveness: LivenessEvaluator,
    pub matcher: IdentityMatcher,
    pub ledger: Arc<AttendanceLedger>,
    pub sink: Arc<dyn AttendanceSink>,
    pub roster: Arc<dyn Roster>,
}

pub struct VerificationSession {
    config: PipelineConfig,
    localizer: Box<dyn FaceLocalizer>,
    liveness: LivenessEvaluator,
    pool: MatcherPool,
    ledger: Arc<AttendanceLedger>,
    sink: Arc<dyn AttendanceSink>,
    roster: Arc<dyn Roster>,
    tracks: Vec<Track>,
    next_track: u64,
    frames_seen: u64,
    aborted: bool,
}

impl VerificationSession {
    pub fn new(config: PipelineConfig, parts: SessionParts) -> Result<Self, PoolError> {
        let pool = MatcherPool::new(parts.matcher, config.matcher.threads)?;
        Ok(Self {
            config,
            localizer: parts.localizer,
            liveness: parts.liveness,
            pool,
            ledger: parts.ledger,
            sink: parts.sink,
            roster: parts.roster,
            tracks: Vec::new(),
            next_track: 1,
            frames_seen: 0,
            aborted: false,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn matcher_available(&self) -> bool {
        self.pool.matcher().is_available()
    }

    pub fn track_statuses(&self) -> Vec<TrackStatus> {
        self.tracks.iter().map(Track::status).collect()
    }

    /// Stop the session: cancel in-flight matches and refuse further frames.
    ///
    /// Commits happen synchronously inside `process_frame`, so an abort
    /// between frames can never leave one half-done.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        let in_flight = self.pool.in_flight();
        self.pool.cancel();
        self.aborted = true;
        tracing::info!(
            in_flight,
            tracks = self.tracks.len(),
            "verification session aborted"
        );
    }

    /// Run one captured frame through the pipeline.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameReport {
        let started = Instant::now();
        let mut report = FrameReport {
            frame_index: self.frames_seen,
            ..FrameReport::default()
        };
        self.frames_seen += 1;
        if self.aborted {
            return report;
        }

        let gray = match frame.to_gray() {
            Ok(gray) => gray,
            Err(e) => {
                tracing::warn!(error = %e, "skipping invalid frame");
                report.warnings.push(PipelineWarning::InvalidFrame(e));
                return report;
            }
        };

        let located = catch_unwind(AssertUnwindSafe(|| self.localizer.locate_gray(&gray)))
            .unwrap_or_else(|panic| Err(LocalizerError::Internal(panic_message(panic))));
        let regions: Vec<FaceRegion> = match located {
            Ok(regions) => regions
                .into_iter()
                .filter_map(|r| r.clamp_to(frame.width, frame.height))
                .collect(),
            Err(LocalizerError::InvalidFrame(e)) => {
                tracing::warn!(error = %e, "skipping invalid frame");
                report.warnings.push(PipelineWarning::InvalidFrame(e));
                return report;
            }
            Err(LocalizerError::Internal(msg)) => {
                tracing::warn!(error = %msg, "face localizer fault; skipping frame");
                report.warnings.push(PipelineWarning::DetectorFault(msg));
                return report;
            }
        };

        self.associate(&regions, frame.captured_at, &mut report);
        self.evict_lost(frame.captured_at, &mut report);
        self.advance_tracks(&gray, frame.captured_at, &mut report);
        self.collect_matches(started, frame.captured_at, &mut report);

        report.tracks = self.track_statuses();
        report
    }

    fn associate(
        &mut self,
        regions: &[FaceRegion],
        at: DateTime<Local>,
        report: &mut FrameReport,
    ) {
        let last: Vec<FaceRegion> = self.tracks.iter().map(|t| t.last_region).collect();
        let association = associate(&last, regions, &self.config.tracking);

        for track in &mut self.tracks {
            track.seen = false;
        }
        for (t, r) in association.matched {
            let track = &mut self.tracks[t];
            track.last_region = regions[r];
            track.missed = 0;
            track.seen = true;
        }
        for t in association.missed {
            self.tracks[t].missed += 1;
        }
        for r in association.spawn {
            let id = TrackId(self.next_track);
            self.next_track += 1;
            tracing::info!(track = %id, region = ?regions[r], "track started");
            self.tracks.push(Track {
                id,
                last_region: regions[r],
                created_at: at,
                missed: 0,
                seen: true,
                liveness: self.liveness.new_track(at),
                verdict: None,
                phase: TrackPhase::Tracking,
                match_result: None,
                decision: None,
                match_attempts: 0,
            });
            report.events.push(SessionEvent::TrackStarted {
                track: id,
                region: regions[r],
            });
        }
    }

    fn evict_lost(&mut self, at: DateTime<Local>, report: &mut FrameReport) {
        let grace = self.config.tracking.grace_frames;
        let pool = &mut self.pool;
        self.tracks.retain(|track| {
            if track.missed <= grace {
                return true;
            }
            pool.forget(track.id);
            if track.phase == TrackPhase::Gating {
                let decision = VerificationDecision {
                    track_id: track.id,
                    identity_id: None,
                    display_name: None,
                    confidence: track.match_result.as_ref().map(|m| m.confidence),
                    timestamp: at,
                    outcome: Outcome::Inconclusive,
                    reason: DecisionReason::NoConfidentMatch,
                };
                tracing::info!(
                    track = %track.id,
                    attempts = track.match_attempts,
                    "track lost before a confident match"
                );
                report.events.push(SessionEvent::Decided(decision));
            }
            tracing::info!(
                track = %track.id,
                age_ms = (at - track.created_at).num_milliseconds(),
                "track lost"
            );
            report.events.push(SessionEvent::Lost { track: track.id });
            false
        });
    }

    fn advance_tracks(&mut self, gray: &GrayImage, at: DateTime<Local>, report: &mut FrameReport) {
        for track in self.tracks.iter_mut().filter(|t| t.seen) {
            if matches!(
                track.phase,
                TrackPhase::Tracking | TrackPhase::AwaitingLiveness
            ) {
                let liveness = &self.liveness;
                let region = track.last_region;
                let updated = catch_unwind(AssertUnwindSafe(|| {
                    liveness.update(&mut track.liveness, &region, gray, at)
                }))
                .unwrap_or_else(|panic| Err(LivenessError::Analysis(panic_message(panic))));
                match updated {
                    Ok(verdict) => apply_verdict(track, verdict, report),
                    Err(LivenessError::InvalidFrame(e)) => {
                        tracing::warn!(track = %track.id, error = %e, "skipping track frame");
                        report.warnings.push(PipelineWarning::InvalidFrame(e));
                    }
                    Err(e) => track.discard(DiscardReason::InternalError(e.to_string()), report),
                }
            }

            if track.phase == TrackPhase::Gating && !self.pool.is_in_flight(track.id) {
                match crop_gray(gray, &track.last_region) {
                    Ok(face) => {
                        if self.pool.dispatch(track.id, face) {
                            track.match_attempts += 1;
                        }
                    }
                    Err(e) => report.warnings.push(PipelineWarning::InvalidFrame(e)),
                }
            }
        }
    }

    fn collect_matches(&mut self, started: Instant, at: DateTime<Local>, report: &mut FrameReport) {
        let deadline = started + self.config.matcher.frame_budget();
        for outcome in self.pool.collect(deadline) {
            let Some(track) = self.tracks.iter_mut().find(|t| t.id == outcome.track) else {
                continue;
            };
            if track.phase != TrackPhase::Gating {
                continue;
            }
            match outcome.result {
                Ok(result) => {
                    tracing::debug!(
                        track = %track.id,
                        candidate = ?result.candidate,
                        confidence = result.confidence,
                        elapsed_ms = outcome.elapsed.as_millis() as u64,
                        "match result"
                    );
                    let accepted = result.identity_id.clone().map(|id| (id, result.confidence));
                    track.match_result = Some(result);
                    if let Some((identity, confidence)) = accepted {
                        commit(
                            track,
                            identity,
                            confidence,
                            at,
                            &self.ledger,
                            self.sink.as_ref(),
                            self.roster.as_ref(),
                            report,
                        );
                    }
                }
                Err(MatchError::ModelUnavailable) => {
                    tracing::debug!(track = %track.id, "no appearance model; match skipped");
                    report
                        .warnings
                        .push(PipelineWarning::ModelUnavailable { track: track.id });
                }
                Err(MatchError::Internal(msg)) => {
                    track.discard(DiscardReason::InternalError(msg), report)
                }
                Err(MatchError::Cancelled) => {}
            }
        }
    }
}

fn apply_verdict(track: &mut Track, verdict: LivenessVerdict, report: &mut FrameReport) {
    let status = verdict.status;
    track.verdict = Some(verdict.clone());
    match status {
        LivenessStatus::Pending => track.phase = TrackPhase::AwaitingLiveness,
        LivenessStatus::Live => {
            tracing::info!(track = %track.id, confidence = verdict.confidence, "liveness: live");
            track.phase = TrackPhase::Gating;
            report.events.push(SessionEvent::LivenessResolved {
                track: track.id,
                verdict,
            });
        }
        LivenessStatus::Spoof => {
            tracing::info!(track = %track.id, confidence = verdict.confidence, "liveness: spoof");
            report.events.push(SessionEvent::LivenessResolved {
                track: track.id,
                verdict,
            });
            track.discard(DiscardReason::SpoofDetected, report);
        }
    }
}

/// Serialized dedup check and attendance commit for a confidently matched track.
#[allow(clippy::too_many_arguments)]
fn commit(
    track: &mut Track,
    identity: IdentityId,
    confidence: f32,
    at: DateTime<Local>,
    ledger: &AttendanceLedger,
    sink: &dyn AttendanceSink,
    roster: &dyn Roster,
    report: &mut FrameReport,
) {
    let accepted = VerificationDecision {
        track_id: track.id,
        identity_id: Some(identity.clone()),
        display_name: Some(roster.label(&identity)),
        confidence: Some(confidence),
        timestamp: at,
        outcome: Outcome::Accepted,
        reason: DecisionReason::Matched,
    };

    match ledger.commit_once(&identity, at.date_naive(), || sink.commit(&accepted)) {
        Ok(CommitOutcome::Committed(ack)) => {
            tracing::info!(
                track = %track.id,
                identity = %identity,
                confidence,
                record = %ack.record_id,
                "attendance committed"
            );
            track.phase = TrackPhase::Accepted;
            track.decision = Some(accepted.clone());
            report.events.push(SessionEvent::Decided(accepted));
        }
        Ok(CommitOutcome::Duplicate) => {
            tracing::info!(track = %track.id, identity = %identity, "already recorded today");
            let rejected = VerificationDecision {
                outcome: Outcome::Rejected,
                reason: DecisionReason::DuplicateToday,
                ..accepted
            };
            track.phase = TrackPhase::Rejected;
            track.decision = Some(rejected.clone());
            report.events.push(SessionEvent::Decided(rejected));
        }
        Err(error) => {
            tracing::warn!(track = %track.id, identity = %identity, error = %error, "attendance commit failed");
            report.warnings.push(PipelineWarning::SinkFailed {
                track: track.id,
                error: error.clone(),
            });
            track.discard(DiscardReason::CommitFailed(error.to_string()), report);
        }
    }
}

//! presence-core — real-time identity verification and liveness pipeline.
//!
//! Localizes faces with a boosted cascade, follows them across frames,
//! fuses four liveness signals over a rolling window, matches the face
//! against enrolled LBPH templates and gates the attendance commit on
//! confidence and once-per-day deduplication.

pub mod cascade;
pub mod config;
pub mod frame;
pub mod lbph;
pub mod ledger;
pub mod liveness;
pub mod localizer;
pub mod matcher;
pub mod pool;
pub mod ring;
pub mod session;
pub mod sink;
pub mod tracker;
pub mod types;

pub use config::PipelineConfig;
pub use frame::{Frame, FrameError};
pub use ledger::AttendanceLedger;
pub use liveness::{LivenessEvaluator, LivenessStatus, LivenessVerdict, SignalName};
pub use localizer::{CascadeLocalizer, FaceLocalizer, LocalizerError};
pub use matcher::{AppearanceModel, IdentityMatcher, MatchError, MatchResult};
pub use session::{
    DecisionReason, DiscardReason, FrameReport, Outcome, PipelineWarning, SessionEvent,
    SessionParts, TrackPhase, TrackStatus, VerificationDecision, VerificationSession,
};
pub use sink::{Ack, AttendanceSink, Roster, SinkError, StaticRoster};
pub use types::{FaceRegion, IdentityId, TrackId};

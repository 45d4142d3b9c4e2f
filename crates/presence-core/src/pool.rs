//! Worker pool for identity matches.
//!
//! Matches for different tracks are independent and share nothing but the
//! read-only model, so they run on a small rayon pool while the frame thread
//! keeps localizing and updating liveness. Results come back over a channel;
//! whatever has not arrived by the end of a frame's budget is picked up on a
//! later frame.

use image::GrayImage;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::matcher::{IdentityMatcher, MatchError, MatchResult};
use crate::types::TrackId;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to build matcher pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug)]
pub struct MatchOutcome {
    pub track: TrackId,
    pub result: Result<MatchResult, MatchError>,
    pub elapsed: Duration,
}

pub struct MatcherPool {
    matcher: IdentityMatcher,
    /// `None` runs every match inline on the caller's thread.
    workers: Option<rayon::ThreadPool>,
    tx: mpsc::Sender<MatchOutcome>,
    rx: mpsc::Receiver<MatchOutcome>,
    cancelled: Arc<AtomicBool>,
    in_flight: HashSet<TrackId>,
}

impl MatcherPool {
    pub fn new(matcher: IdentityMatcher, threads: usize) -> Result<Self, PoolError> {
        let workers = if threads == 0 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("presence-match-{i}"))
                    .build()?,
            )
        };
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            matcher,
            workers,
            tx,
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            in_flight: HashSet::new(),
        })
    }

    pub fn matcher(&self) -> &IdentityMatcher {
        &self.matcher
    }

    pub fn is_in_flight(&self, track: TrackId) -> bool {
        self.in_flight.contains(&track)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue a match for `track`. At most one match per track is in flight.
    pub fn dispatch(&mut self, track: TrackId, face: GrayImage) -> bool {
        if self.cancelled.load(Ordering::Acquire) || !self.in_flight.insert(track) {
            return false;
        }
        let matcher = self.matcher.clone();
        let cancelled = Arc::clone(&self.cancelled);
        let tx = self.tx.clone();
        let job = move || {
            let started = Instant::now();
            let result = run_match(&matcher, &cancelled, &face);
            // The receiver only goes away with the pool itself.
            let _ = tx.send(MatchOutcome {
                track,
                result,
                elapsed: started.elapsed(),
            });
        };
        match &self.workers {
            Some(pool) => pool.spawn(job),
            None => job(),
        }
        true
    }

    /// Drop interest in a track's pending match; its result is discarded on arrival.
    pub fn forget(&mut self, track: TrackId) {
        self.in_flight.remove(&track);
    }

    /// Collect finished matches, waiting for in-flight ones until `deadline`.
    pub fn collect(&mut self, deadline: Instant) -> Vec<MatchOutcome> {
        let mut out = Vec::new();
        loop {
            let next = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(_) if self.in_flight.is_empty() => None,
                Err(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        None
                    } else {
                        self.rx.recv_timeout(deadline - now).ok()
                    }
                }
            };
            let Some(outcome) = next else { break };
            if !self.in_flight.remove(&outcome.track) {
                continue;
            }
            if matches!(outcome.result, Err(MatchError::Cancelled)) {
                continue;
            }
            out.push(outcome);
        }
        out
    }

    /// Cancel every in-flight and future match. Jobs not yet started return
    /// immediately; results of running jobs are discarded.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.in_flight.clear();
    }
}

fn run_match(
    matcher: &IdentityMatcher,
    cancelled: &AtomicBool,
    face: &GrayImage,
) -> Result<MatchResult, MatchError> {
    if cancelled.load(Ordering::Acquire) {
        return Err(MatchError::Cancelled);
    }
    catch_unwind(AssertUnwindSafe(|| matcher.match_face(face)))
        .unwrap_or_else(|panic| Err(MatchError::Internal(panic_message(panic))))
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}

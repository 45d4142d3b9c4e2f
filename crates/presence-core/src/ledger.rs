use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sink::{Ack, SinkError};
use crate::types::IdentityId;

/// Outcome of a serialized check-and-commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(Ack),
    /// The identity was already recorded for that date; nothing was committed.
    Duplicate,
}

/// Which identities have been accepted on which day.
///
/// This is the only mutable state shared between sessions (one per camera).
/// The check, the sink call and the insert all happen under one lock, so two
/// tracks resolving the same identity at the same time commit at most once.
/// The first commit of a new day forgets earlier days, so a long-running
/// daemon holds at most one day of entries.
#[derive(Debug, Default)]
pub struct AttendanceLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    accepted: HashSet<(IdentityId, NaiveDate)>,
    /// Latest date a commit was attempted for.
    current: Option<NaiveDate>,
}

impl LedgerState {
    fn roll_to(&mut self, date: NaiveDate) {
        if self.current.is_some_and(|c| date <= c) {
            return;
        }
        let before = self.accepted.len();
        self.accepted.retain(|(_, d)| *d >= date);
        let pruned = before - self.accepted.len();
        if pruned > 0 {
            tracing::info!(date = %date, pruned, "dedup ledger rolled over");
        }
        self.current = Some(date);
    }
}

impl AttendanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate from records already persisted (e.g. after a restart).
    pub fn seed(&self, entries: impl IntoIterator<Item = (IdentityId, NaiveDate)>) -> usize {
        let mut state = self.lock();
        let before = state.accepted.len();
        state.accepted.extend(entries);
        state.accepted.len() - before
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, identity: &IdentityId, date: NaiveDate) -> bool {
        self.lock().accepted.contains(&(identity.clone(), date))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().accepted.len()
    }

    /// Run `commit` unless `(identity, date)` is already recorded.
    ///
    /// The entry is recorded only if `commit` succeeds, so a failed sink call
    /// leaves no trace. A sink that reports the record as already present is
    /// treated as a duplicate and the ledger catches up.
    pub fn commit_once<F>(
        &self,
        identity: &IdentityId,
        date: NaiveDate,
        commit: F,
    ) -> Result<CommitOutcome, SinkError>
    where
        F: FnOnce() -> Result<Ack, SinkError>,
    {
        let mut state = self.lock();
        state.roll_to(date);
        let key = (identity.clone(), date);
        if state.accepted.contains(&key) {
            return Ok(CommitOutcome::Duplicate);
        }
        match commit() {
            Ok(ack) => {
                state.accepted.insert(key);
                Ok(CommitOutcome::Committed(ack))
            }
            Err(SinkError::AlreadyRecorded { .. }) => {
                state.accepted.insert(key);
                Ok(CommitOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn ack() -> Result<Ack, SinkError> {
        Ok(Ack {
            record_id: "r1".into(),
        })
    }

    #[test]
    fn test_second_commit_is_duplicate() {
        let ledger = AttendanceLedger::new();
        let id = IdentityId::new("S1042");
        assert!(matches!(
            ledger.commit_once(&id, day(), ack).unwrap(),
            CommitOutcome::Committed(_)
        ));
        let outcome = ledger
            .commit_once(&id, day(), || panic!("sink must not be called"))
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Duplicate);
    }

    #[test]
    fn test_next_day_commits_again() {
        let ledger = AttendanceLedger::new();
        let id = IdentityId::new("S1042");
        ledger.commit_once(&id, day(), ack).unwrap();
        let next = day().succ_opt().unwrap();
        assert!(matches!(
            ledger.commit_once(&id, next, ack).unwrap(),
            CommitOutcome::Committed(_)
        ));
    }

    #[test]
    fn test_failed_commit_is_not_recorded() {
        let ledger = AttendanceLedger::new();
        let id = IdentityId::new("S1042");
        let err = ledger
            .commit_once(&id, day(), || Err(SinkError::Unavailable("disk full".into())))
            .unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
        assert!(!ledger.contains(&id, day()));
    }

    #[test]
    fn test_sink_duplicate_catches_up() {
        let ledger = AttendanceLedger::new();
        let id = IdentityId::new("S1042");
        let outcome = ledger
            .commit_once(&id, day(), || {
                Err(SinkError::AlreadyRecorded {
                    identity: IdentityId::new("S1042"),
                    date: day(),
                })
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Duplicate);
        assert!(ledger.contains(&id, day()));
    }

    #[test]
    fn test_concurrent_commits_happen_once() {
        let ledger = Arc::new(AttendanceLedger::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    ledger
                        .commit_once(&IdentityId::new("S1042"), day(), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            ack()
                        })
                        .unwrap()
                })
            })
            .collect();
        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, CommitOutcome::Committed(_)))
            .count();
        assert_eq!(committed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_seed_then_duplicate() {
        let ledger = AttendanceLedger::new();
        let added = ledger.seed([(IdentityId::new("S1042"), day())]);
        assert_eq!(added, 1);
        let outcome = ledger
            .commit_once(&IdentityId::new("S1042"), day(), || panic!("already seeded"))
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Duplicate);
    }

    #[test]
    fn test_new_day_forgets_previous_days() {
        let ledger = AttendanceLedger::new();
        let yesterday = day().pred_opt().unwrap();
        ledger.seed([
            (IdentityId::new("S1"), yesterday),
            (IdentityId::new("S2"), day()),
        ]);
        ledger.commit_once(&IdentityId::new("S3"), day(), ack).unwrap();
        assert!(!ledger.contains(&IdentityId::new("S1"), yesterday));
        assert!(ledger.contains(&IdentityId::new("S2"), day()));
        assert_eq!(ledger.len(), 2);

        let next = day().succ_opt().unwrap();
        ledger.commit_once(&IdentityId::new("S2"), next, ack).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains(&IdentityId::new("S2"), next));
    }

    #[test]
    fn test_many_days_stay_bounded() {
        let ledger = AttendanceLedger::new();
        let mut date = day();
        for _ in 0..60 {
            for id in ["S1", "S2", "S3"] {
                ledger.commit_once(&IdentityId::new(id), date, ack).unwrap();
            }
            date = date.succ_opt().unwrap();
        }
        assert_eq!(ledger.len(), 3);
    }
}

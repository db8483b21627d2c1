//! Execution accounting for one claim: suspension and checkpoint counters,
//! and the once-per-activation lifecycle timestamps.
//!
//! The mutators here are called by the manager once per genuine state
//! transition, never per duplicate report; the manager owns that filtering.
//! Times are wall-clock because they end up in the job record, which other
//! parts of the scheduling system read.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Idempotent counters and timers for suspend/resume/checkpoint events.
#[derive(Debug, Clone)]
pub struct AccountingLedger {
    slot_weight: f64,
    total_suspensions: u32,
    cumulative_suspension_time: Duration,
    /// Suspension time accrued since the last checkpoint committed it.
    uncommitted_suspension_time: Duration,
    committed_suspension_time: Duration,
    /// `Some` while the job is suspended.
    last_suspension_time: Option<DateTime<Utc>>,
    checkpoint_count: u32,
    last_checkpoint_time: Option<DateTime<Utc>>,
    committed_time: Duration,
    committed_slot_time_secs: f64,
}

impl AccountingLedger {
    pub fn new(slot_weight: f64) -> Self {
        Self {
            slot_weight,
            total_suspensions: 0,
            cumulative_suspension_time: Duration::ZERO,
            uncommitted_suspension_time: Duration::ZERO,
            committed_suspension_time: Duration::ZERO,
            last_suspension_time: None,
            checkpoint_count: 0,
            last_checkpoint_time: None,
            committed_time: Duration::ZERO,
            committed_slot_time_secs: 0.0,
        }
    }

    /// The job was suspended on the remote slot.
    pub fn on_suspend(&mut self, now: DateTime<Utc>) {
        self.total_suspensions += 1;
        self.last_suspension_time = Some(now);
    }

    /// The job resumed. Only advances the cumulative time when a real
    /// suspension preceded it; a resume with no matching suspend adds zero.
    pub fn on_resume(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.last_suspension_time.take() {
            let gap = (now - since).to_std().unwrap_or_default();
            self.cumulative_suspension_time += gap;
            self.uncommitted_suspension_time += gap;
        }
    }

    /// The peer durably saved job state. Commits execution time since the
    /// later of the last checkpoint and the activation start.
    pub fn on_checkpoint(&mut self, now: DateTime<Utc>, activation_start: Option<DateTime<Utc>>) {
        self.checkpoint_count += 1;

        let anchor = match (self.last_checkpoint_time, activation_start) {
            (Some(c), Some(s)) => Some(c.max(s)),
            (c, s) => c.or(s),
        };
        if let Some(anchor) = anchor {
            let gap = (now - anchor).to_std().unwrap_or_default();
            self.committed_time += gap;
            self.committed_slot_time_secs += self.slot_weight * gap.as_secs_f64();
        }

        // Suspension time that happened before this checkpoint is now
        // durably part of the job's history.
        self.committed_suspension_time += self.uncommitted_suspension_time;
        self.uncommitted_suspension_time = Duration::ZERO;

        self.last_checkpoint_time = Some(now);
    }

    pub fn slot_weight(&self) -> f64 {
        self.slot_weight
    }

    pub fn total_suspensions(&self) -> u32 {
        self.total_suspensions
    }

    pub fn cumulative_suspension_time(&self) -> Duration {
        self.cumulative_suspension_time
    }

    pub fn uncommitted_suspension_time(&self) -> Duration {
        self.uncommitted_suspension_time
    }

    pub fn committed_suspension_time(&self) -> Duration {
        self.committed_suspension_time
    }

    pub fn is_suspended(&self) -> bool {
        self.last_suspension_time.is_some()
    }

    pub fn last_suspension_time(&self) -> Option<DateTime<Utc>> {
        self.last_suspension_time
    }

    pub fn checkpoint_count(&self) -> u32 {
        self.checkpoint_count
    }

    pub fn last_checkpoint_time(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint_time
    }

    pub fn committed_time(&self) -> Duration {
        self.committed_time
    }

    pub fn committed_slot_time_secs(&self) -> f64 {
        self.committed_slot_time_secs
    }
}

/// Lifecycle timestamps for one activation of the claim. Each is recorded
/// at most once; a claim that checkpoints and resumes under the same
/// manager starts a fresh set via `reset`.
#[derive(Debug, Clone, Default)]
pub struct ActivationMetrics {
    start_time: Option<DateTime<Utc>>,
    start_execution_time: Option<DateTime<Utc>>,
    exit_execution_time: Option<DateTime<Utc>>,
    termination_time: Option<DateTime<Utc>>,
}

impl ActivationMetrics {
    pub fn record_start(&mut self, now: DateTime<Utc>) {
        self.start_time.get_or_insert(now);
    }

    pub fn record_execution_start(&mut self, now: DateTime<Utc>) {
        self.start_execution_time.get_or_insert(now);
    }

    pub fn record_execution_exit(&mut self, now: DateTime<Utc>) {
        self.exit_execution_time.get_or_insert(now);
    }

    pub fn record_termination(&mut self, now: DateTime<Utc>) {
        self.termination_time.get_or_insert(now);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn start_execution_time(&self) -> Option<DateTime<Utc>> {
        self.start_execution_time
    }

    pub fn exit_execution_time(&self) -> Option<DateTime<Utc>> {
        self.exit_execution_time
    }

    pub fn termination_time(&self) -> Option<DateTime<Utc>> {
        self.termination_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn suspend_resume_advances_cumulative_by_exact_gap() {
        let mut ledger = AccountingLedger::new(1.0);

        ledger.on_suspend(t(10));
        assert_eq!(ledger.total_suspensions(), 1);
        assert!(ledger.is_suspended());

        ledger.on_resume(t(40));
        assert!(!ledger.is_suspended());
        assert_eq!(ledger.cumulative_suspension_time(), Duration::from_secs(30));
        assert_eq!(
            ledger.uncommitted_suspension_time(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn resume_without_suspend_adds_zero() {
        let mut ledger = AccountingLedger::new(1.0);
        ledger.on_resume(t(100));
        assert_eq!(ledger.cumulative_suspension_time(), Duration::ZERO);
        assert_eq!(ledger.total_suspensions(), 0);
    }

    #[test]
    fn repeated_resumes_count_the_gap_once() {
        let mut ledger = AccountingLedger::new(1.0);
        ledger.on_suspend(t(0));
        ledger.on_resume(t(20));
        ledger.on_resume(t(50));
        assert_eq!(ledger.cumulative_suspension_time(), Duration::from_secs(20));
    }

    #[test]
    fn checkpoint_commits_from_activation_start() {
        let mut ledger = AccountingLedger::new(2.0);

        ledger.on_checkpoint(t(100), Some(t(0)));
        assert_eq!(ledger.checkpoint_count(), 1);
        assert_eq!(ledger.committed_time(), Duration::from_secs(100));
        assert_eq!(ledger.committed_slot_time_secs(), 200.0);
    }

    #[test]
    fn checkpoint_anchor_is_later_of_checkpoint_and_start() {
        let mut ledger = AccountingLedger::new(1.0);

        ledger.on_checkpoint(t(100), Some(t(0)));
        // Second checkpoint anchors on the first, not the activation start.
        ledger.on_checkpoint(t(150), Some(t(0)));
        assert_eq!(ledger.checkpoint_count(), 2);
        assert_eq!(ledger.committed_time(), Duration::from_secs(150));
    }

    #[test]
    fn checkpoint_without_any_anchor_commits_nothing() {
        let mut ledger = AccountingLedger::new(1.0);
        ledger.on_checkpoint(t(100), None);
        assert_eq!(ledger.checkpoint_count(), 1);
        assert_eq!(ledger.committed_time(), Duration::ZERO);
    }

    #[test]
    fn checkpoint_absorbs_uncommitted_suspension_time() {
        let mut ledger = AccountingLedger::new(1.0);
        ledger.on_suspend(t(10));
        ledger.on_resume(t(25));
        assert_eq!(
            ledger.uncommitted_suspension_time(),
            Duration::from_secs(15)
        );

        ledger.on_checkpoint(t(50), Some(t(0)));
        assert_eq!(ledger.uncommitted_suspension_time(), Duration::ZERO);
        assert_eq!(
            ledger.committed_suspension_time(),
            Duration::from_secs(15)
        );
        // Cumulative total is unchanged by the commit.
        assert_eq!(ledger.cumulative_suspension_time(), Duration::from_secs(15));
    }

    #[test]
    fn metrics_record_only_once_until_reset() {
        let mut metrics = ActivationMetrics::default();

        metrics.record_start(t(0));
        metrics.record_start(t(99));
        assert_eq!(metrics.start_time(), Some(t(0)));

        metrics.record_execution_start(t(5));
        metrics.record_execution_start(t(50));
        assert_eq!(metrics.start_execution_time(), Some(t(5)));

        metrics.reset();
        assert!(metrics.start_time().is_none());
        metrics.record_start(t(200));
        assert_eq!(metrics.start_time(), Some(t(200)));
    }
}

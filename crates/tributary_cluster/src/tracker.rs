//! Completion tracking of submissions.
//!
//! Runs on the submission node. Every finished chain execution reports
//! its child counter; a chain is resolved once all its segments reported
//! and every descendant it is parent of record for resolved. The
//! submission completes when its root chain resolves.
//!
//! A descendant accounted through a counter delta may finish before the
//! report carrying that delta arrives. Its release is therefore held
//! back until the chain that created it has completed, which is when
//! every increment it caused is known.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tributary_core::{Chain, ChainId, CoreError, CoreResult, CounterDeltas, SubmissionId};
use tributary_runtime::ExecutionSummary;

/// Outcome of one chain execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    /// Submission
    pub submission: SubmissionId,
    /// Chain
    pub chain: ChainId,
    /// Parent of record
    pub parent: Option<ChainId>,
    /// Chain that created this one
    pub creator: Option<ChainId>,
    /// Segment that ran
    pub generation: u32,
    /// Final child counter of the segment
    pub children: i32,
    /// Whether another segment continues the chain
    pub transferred: bool,
    /// Deltas left unforwarded; each one stands for one descendant
    pub deltas: CounterDeltas,
    /// Error that aborted the chain
    pub failure: Option<String>,
}

impl ChainReport {
    /// Report of a chain that ran to the end
    #[must_use]
    pub fn finished(summary: ExecutionSummary) -> Self {
        Self {
            submission: summary.submission_id,
            chain: summary.chain_id,
            parent: summary.parent_chain_id,
            creator: summary.creator_chain_id,
            generation: summary.generation,
            children: summary.children,
            transferred: summary.transferred,
            deltas: summary.unforwarded,
            failure: None,
        }
    }

    /// Report of a chain that has not run yet, carrying only its lineage
    #[must_use]
    pub fn for_chain(chain: &Chain) -> Self {
        Self {
            submission: chain.submission_id,
            chain: chain.chain_id,
            parent: chain.parent_chain_id,
            creator: chain.creator_chain_id,
            generation: chain.generation,
            children: 0,
            transferred: false,
            deltas: CounterDeltas::new(),
            failure: None,
        }
    }

    /// Mark the report as a failure
    #[must_use]
    pub fn failed(mut self, error: &CoreError) -> Self {
        self.failure = Some(error.to_string());
        self
    }
}

/// Observable state of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Chains still outstanding
    Running,
    /// Every chain resolved
    Completed,
    /// A chain failed
    Failed(String),
}

impl SubmissionStatus {
    /// Whether the submission reached a final state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Default)]
struct ChainRecord {
    parent: Option<ChainId>,
    creator: Option<ChainId>,
    pending: i64,
    segments: u32,
    final_generation: Option<u32>,
    released: bool,
    resolved: bool,
    /// Resolved descendants waiting for this chain to complete
    held: Vec<ChainId>,
}

impl ChainRecord {
    fn is_complete(&self) -> bool {
        self.final_generation
            .is_some_and(|generation| self.segments == generation + 1)
    }
}

struct SubmissionRecord {
    root: ChainId,
    chains: HashMap<ChainId, ChainRecord>,
    status: watch::Sender<SubmissionStatus>,
    started: Instant,
    reports: u64,
}

impl SubmissionRecord {
    fn apply(&mut self, report: ChainReport) {
        self.reports += 1;
        let record = self.chains.entry(report.chain).or_default();
        record.parent = report.parent;
        record.creator = report.creator;
        record.pending += i64::from(report.children);
        record.segments += 1;
        if !report.transferred {
            record.final_generation = Some(report.generation);
        }

        let mut work = vec![report.chain];
        for (target, deltas) in report.deltas {
            self.chains.entry(target).or_default().pending += deltas.len() as i64;
            work.push(target);
        }
        self.settle(work);
    }

    fn settle(&mut self, mut work: Vec<ChainId>) {
        while let Some(id) = work.pop() {
            let Some(record) = self.chains.get_mut(&id) else {
                continue;
            };
            if record.resolved || !record.is_complete() {
                continue;
            }

            if !record.released {
                record.released = true;
                let held = std::mem::take(&mut record.held);
                for child in held {
                    if let Some(parent) = self.release(child) {
                        work.push(parent);
                    }
                }
            }

            let Some(record) = self.chains.get_mut(&id) else {
                continue;
            };
            if record.pending != 0 {
                continue;
            }
            record.resolved = true;
            let (parent, creator) = (record.parent, record.creator);

            match parent {
                None if id == self.root => {
                    let _ = self.status.send(SubmissionStatus::Completed);
                    return;
                }
                None => {}
                Some(parent) => {
                    let holder = creator.filter(|creator| {
                        !self.chains.get(creator).is_some_and(|record| record.released)
                    });
                    match holder {
                        Some(creator) => self.chains.entry(creator).or_default().held.push(id),
                        None => {
                            self.chains.entry(parent).or_default().pending -= 1;
                            work.push(parent);
                        }
                    }
                }
            }
        }
    }

    /// Decrement the parent of a held descendant
    fn release(&mut self, child: ChainId) -> Option<ChainId> {
        let parent = self.chains.get(&child)?.parent?;
        self.chains.entry(parent).or_default().pending -= 1;
        Some(parent)
    }
}

/// Completion state of every submission made on this node
#[derive(Default)]
pub struct CompletionTracker {
    submissions: Mutex<HashMap<SubmissionId, SubmissionRecord>>,
}

impl CompletionTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a submission whose root chain is `root`
    pub fn register(&self, submission: SubmissionId, root: ChainId) -> watch::Receiver<SubmissionStatus> {
        let (status, rx) = watch::channel(SubmissionStatus::Running);
        self.submissions.lock().insert(
            submission,
            SubmissionRecord {
                root,
                chains: HashMap::new(),
                status,
                started: Instant::now(),
                reports: 0,
            },
        );
        rx
    }

    /// Watch a submission's status
    #[must_use]
    pub fn subscribe(&self, submission: SubmissionId) -> Option<watch::Receiver<SubmissionStatus>> {
        self.submissions
            .lock()
            .get(&submission)
            .map(|record| record.status.subscribe())
    }

    /// Current status of a submission
    #[must_use]
    pub fn status(&self, submission: SubmissionId) -> Option<SubmissionStatus> {
        self.submissions
            .lock()
            .get(&submission)
            .map(|record| record.status.borrow().clone())
    }

    /// Time since a submission was registered
    #[must_use]
    pub fn elapsed(&self, submission: SubmissionId) -> Option<Duration> {
        self.submissions
            .lock()
            .get(&submission)
            .map(|record| record.started.elapsed())
    }

    /// Apply a chain report
    ///
    /// # Errors
    ///
    /// Returns error if the submission is not tracked here
    pub fn report(&self, report: ChainReport) -> CoreResult<()> {
        let mut submissions = self.submissions.lock();
        let record = submissions
            .get_mut(&report.submission)
            .ok_or_else(|| CoreError::NotFound {
                kind: "Submission".to_string(),
                id: report.submission.to_string(),
            })?;
        if record.status.borrow().is_finished() {
            tracing::debug!(submission = %report.submission, chain = %report.chain, "late report ignored");
            return Ok(());
        }

        if let Some(failure) = report.failure {
            tracing::error!(
                submission = %report.submission,
                chain = %report.chain,
                error = %failure,
                "chain failed"
            );
            let _ = record.status.send(SubmissionStatus::Failed(failure));
            return Ok(());
        }

        let submission = report.submission;
        record.apply(report);
        if *record.status.borrow() == SubmissionStatus::Completed {
            tracing::info!(
                %submission,
                chains = record.chains.len(),
                reports = record.reports,
                elapsed_ms = record.started.elapsed().as_millis() as u64,
                "submission completed"
            );
        }
        Ok(())
    }

    /// Stop tracking a submission
    pub fn forget(&self, submission: SubmissionId) {
        self.submissions.lock().remove(&submission);
    }
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("submissions", &self.submissions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SUB: SubmissionId = SubmissionId::new(1);

    fn id(n: u64) -> ChainId {
        ChainId::from_raw(n)
    }

    fn report(chain: u64, parent: Option<u64>, creator: Option<u64>, children: i32) -> ChainReport {
        ChainReport {
            submission: SUB,
            chain: id(chain),
            parent: parent.map(id),
            creator: creator.map(id),
            generation: 0,
            children,
            transferred: false,
            deltas: CounterDeltas::new(),
            failure: None,
        }
    }

    fn tracker() -> (CompletionTracker, watch::Receiver<SubmissionStatus>) {
        let tracker = CompletionTracker::new();
        let rx = tracker.register(SUB, id(1));
        (tracker, rx)
    }

    #[test]
    fn test_lone_root_completes() {
        let (tracker, rx) = tracker();
        tracker.report(report(1, None, None, 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_waits_for_children() {
        let (tracker, rx) = tracker();
        tracker.report(report(1, None, None, 2)).unwrap();
        tracker.report(report(2, Some(1), Some(1), 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Running);
        tracker.report(report(3, Some(1), Some(1), 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_child_reporting_before_parent() {
        let (tracker, rx) = tracker();
        tracker.report(report(2, Some(1), Some(1), 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Running);
        tracker.report(report(1, None, None, 1)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_grandchildren_cascade() {
        let (tracker, rx) = tracker();
        tracker.report(report(1, None, None, 1)).unwrap();
        tracker.report(report(2, Some(1), Some(1), 1)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Running);
        tracker.report(report(3, Some(2), Some(2), 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_migrated_root_needs_every_segment() {
        let (tracker, rx) = tracker();
        let mut first = report(1, None, None, 0);
        first.transferred = true;
        tracker.report(first).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Running);

        let mut second = report(1, None, None, 0);
        second.generation = 1;
        tracker.report(second).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_delta_child_held_until_creator_completes() {
        // Chain 2 (child of 1) creates chain 3, attributed to chain 1
        // through a delta carried by chain 2's report
        let (tracker, rx) = tracker();
        tracker.report(report(1, None, None, 1)).unwrap();
        tracker.report(report(3, Some(1), Some(2), 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Running);

        let mut creator = report(2, Some(1), Some(1), 0);
        creator.deltas.push(id(1), -1);
        tracker.report(creator).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_delta_for_self() {
        let (tracker, rx) = tracker();
        let mut root = report(1, None, None, 0);
        root.deltas.push(id(1), -2);
        tracker.report(root).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Running);
        tracker.report(report(2, Some(1), Some(1), 0)).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Completed);
    }

    #[test]
    fn test_failure() {
        let (tracker, rx) = tracker();
        let mut failed = report(2, Some(1), Some(1), 0);
        failed.failure = Some("boom".to_string());
        tracker.report(failed).unwrap();
        assert_eq!(*rx.borrow(), SubmissionStatus::Failed("boom".to_string()));
        // Later reports do not change the outcome
        tracker.report(report(1, None, None, 0)).unwrap();
        assert!(matches!(tracker.status(SUB), Some(SubmissionStatus::Failed(_))));
    }

    #[test]
    fn test_unknown_submission() {
        let tracker = CompletionTracker::new();
        let err = tracker.report(report(1, None, None, 0)).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_status_observable() {
        let (tracker, _rx) = tracker();
        let mut rx = tracker.subscribe(SUB).unwrap();
        tracker.report(report(1, None, None, 0)).unwrap();
        let status = rx
            .wait_for(SubmissionStatus::is_finished)
            .await
            .unwrap()
            .clone();
        assert_eq!(status, SubmissionStatus::Completed);
        tracker.forget(SUB);
        assert!(tracker.status(SUB).is_none());
    }

    #[test]
    fn test_lineage_report() {
        let chain = Chain::root(
            id(1),
            SUB,
            tributary_core::NodeId::new(0),
            &tributary_core::ActionSequence::new().then(tributary_core::ActionConf::new("a")),
            tributary_core::InputSource::Dummy,
        );
        let report = ChainReport::for_chain(&chain).failed(&CoreError::Cancelled);
        assert_eq!(report.chain, id(1));
        assert_eq!(report.parent, None);
        assert_eq!(report.failure.as_deref(), Some("Operation cancelled"));
    }

    /// Reports of a root with direct children and grandchildren; some
    /// children also create a chain attributed to the root by delta
    fn family(fanout: &[u8], delegated: &[bool]) -> Vec<ChainReport> {
        let mut next = 2;
        let mut fresh = || {
            next += 1;
            next - 1
        };
        let mut reports = vec![report(1, None, None, fanout.len() as i32)];
        for (i, grandchildren) in fanout.iter().enumerate() {
            let child = fresh();
            let mut child_report = report(child, Some(1), Some(1), i32::from(*grandchildren));
            for _ in 0..*grandchildren {
                reports.push(report(fresh(), Some(child), Some(child), 0));
            }
            if delegated.get(i).copied().unwrap_or(false) {
                child_report.deltas.push(id(1), -1);
                reports.push(report(fresh(), Some(1), Some(child), 0));
            }
            reports.push(child_report);
        }
        reports
    }

    fn shuffled_family() -> impl Strategy<Value = Vec<ChainReport>> {
        (
            proptest::collection::vec(0u8..3, 1..5),
            proptest::collection::vec(any::<bool>(), 5),
        )
            .prop_map(|(fanout, delegated)| family(&fanout, &delegated))
            .prop_flat_map(|reports| Just(reports).prop_shuffle())
    }

    proptest! {
        #[test]
        fn test_completes_on_last_report_in_any_order(reports in shuffled_family()) {
            let (tracker, rx) = tracker();
            let (last, rest) = reports.split_last().unwrap();
            for report in rest {
                tracker.report(report.clone()).unwrap();
                prop_assert_eq!(rx.borrow().clone(), SubmissionStatus::Running);
            }
            tracker.report(last.clone()).unwrap();
            prop_assert_eq!(rx.borrow().clone(), SubmissionStatus::Completed);
        }
    }
}

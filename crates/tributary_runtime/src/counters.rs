//! Child counter bookkeeping of a running chain.
//!
//! A chain's counter counts descendants still outstanding. Children whose
//! parent of record is not the running chain, or that belong to a segment
//! running elsewhere, are recorded as deltas keyed by the chain that owns
//! them; the delta is the reconnection offset minus the steps left in the
//! current chain, so the receiver can tell which of its steps it targets.

use crate::executor::ChainFrame;
use tributary_core::{ChainId, CounterDeltas};

impl ChainFrame {
    /// Record a child owned by `chain`, reconnecting `offset` steps after
    /// `current`
    pub(crate) fn increment_children(&mut self, chain: ChainId, offset: i32, current: usize) {
        let remaining = (self.local_steps - current) as i32;
        let delta = offset - remaining;
        tracing::trace!(chain = %self.chain.chain_id, target = %chain, delta, "counter delta recorded");
        self.new_children.push(chain, delta);
    }

    pub(crate) fn record_runtime_branch(&mut self, current: usize) {
        self.runtime_branching[current] += 1;
        self.smallest_runtime_branching = Some(
            self.smallest_runtime_branching
                .map_or(current, |smallest| smallest.min(current)),
        );
    }

    /// Children to report from step `current`, leaving out those created
    /// at runtime by steps that run after it
    pub(crate) fn adjusted_children(&self, current: usize) -> i32 {
        let children = self.chain.total_chain_children;
        match self.smallest_runtime_branching {
            Some(smallest) if children != 0 && current < smallest => {
                children - self.runtime_branching[smallest..].iter().sum::<i32>()
            }
            _ => children,
        }
    }

    pub(crate) fn add_and_update_counters(&mut self, counters: CounterDeltas) {
        let own = self.chain.chain_id;
        let local_steps = self.local_steps as i32;
        let migrating = self.migration.is_some();
        let mut added = 0;

        for (chain, deltas) in counters {
            for delta in deltas {
                let ours = chain == own && (!migrating || (0..local_steps).contains(&delta));
                if ours {
                    added += 1;
                } else {
                    self.increment_children(chain, delta, 0);
                }
            }
        }

        if added != 0 {
            self.chain.total_chain_children += added;
            tracing::debug!(
                chain = %own,
                added,
                children = self.chain.total_chain_children,
                "forwarded children absorbed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{Harness, journal_step, seq};
    use proptest::prelude::*;
    use tributary_core::{ActionConf, ChainId, CounterDeltas, Tuple};

    #[test]
    fn test_absorb_own_deltas() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[journal_step("a"), journal_step("b")]));
        let own = chain.chain_id;
        let other = ChainId::from_raw(12345);
        let mut executor = harness.build(chain);

        let mut deltas = CounterDeltas::new();
        deltas.push(own, 0);
        deltas.push(own, -3);
        deltas.push(other, 1);
        executor.add_and_update_counters(deltas);

        // Not migrating: every delta for this chain counts as a child
        assert_eq!(executor.total_chain_children(), 2);
        // Foreign deltas are re-queued, shifted by the local step count
        assert_eq!(executor.pending_deltas().get(other), &[-1]);
    }

    #[test]
    fn test_migrating_chain_requeues_out_of_range() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[
            journal_step("a"),
            ActionConf::new("migrate_branch").with_param("bucket", 1i64),
            journal_step("c"),
        ]));
        let own = chain.chain_id;
        let mut executor = harness.build(chain);
        assert_eq!(executor.local_steps(), 2);

        let mut deltas = CounterDeltas::new();
        deltas.push(own, 0);
        deltas.push(own, 1);
        deltas.push(own, 2);
        deltas.push(own, -1);
        executor.add_and_update_counters(deltas);

        assert_eq!(executor.total_chain_children(), 2);
        assert_eq!(executor.pending_deltas().get(own), &[0, -3]);
    }

    #[test]
    fn test_adjusted_children_without_runtime_branching() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[journal_step("a")]));
        let mut executor = harness.build(chain);
        let mut deltas = CounterDeltas::new();
        deltas.push(executor.chain().chain_id, 0);
        executor.add_and_update_counters(deltas);
        assert_eq!(executor.frame_for_tests().adjusted_children(0), 1);
    }

    proptest! {
        #[test]
        fn test_zero_sum_in_closed_system(
            ops in prop::collection::vec((0usize..3, 0u8..3), 1..24)
        ) {
            // Every chain created is either a direct child or a pending
            // delta, never both and never neither
            let harness = Harness::local();
            let chain = harness.root(seq(&[
                ActionConf::new("scripted"),
                ActionConf::new("scripted"),
                ActionConf::new("scripted"),
                journal_step("end"),
            ]));
            let mut executor = harness.build(chain);
            harness.set_script(ops.clone());
            executor.start().unwrap();
            executor.push(&Tuple::new()).unwrap();
            executor.stop().unwrap();

            let created = harness.recorder().dispatched().len() + harness.recorder().separate().len();
            let summary = executor.finish();
            prop_assert_eq!(summary.children as usize + summary.unforwarded.len(), created);
        }
    }
}

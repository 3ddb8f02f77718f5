//! Incremental reset: priming freshly created network nodes
//!
//! When a rule lands in a non-empty engine, the nodes it created must end
//! up exactly as if the rule had existed before any entity was asserted.
//! Shared structure keeps its state; fresh joins are primed from a sibling
//! sharing their prefix, from the pre-existing alpha memory, or from the
//! beginning-of-rule empty match; fresh alpha terminals are filled by the
//! pattern parsers re-walking the entity list.

use crate::compile::RuleId;
use crate::{Engine, EngineResult};
use rete::{link_lineage, JoinId, MemoryRef, Owner, PartialMatch, PartialMatchId, TerminalId};
use rustc_hash::FxHashSet;
use tracing::debug;

impl Engine {
    /// Prime the fresh structure of a just-compiled rule.
    ///
    /// Post-condition: network state is identical to the state a
    /// define-before-assert ordering would have produced.
    pub(crate) fn incremental_reset(
        &mut self,
        rule: RuleId,
        fresh_joins: &FxHashSet<JoinId>,
        fresh_terminals: &[TerminalId],
    ) -> EngineResult<()> {
        self.incremental_reset_in_progress = true;
        self.network.begin_drive();

        let joins = self
            .rules
            .get(rule)
            .map(|r| r.joins.clone())
            .unwrap_or_default();

        for &join in &joins {
            if !fresh_joins.contains(&join) {
                continue;
            }
            match self.network.joins[join].left_parent {
                // First joins (including subnetwork roots) re-drive their
                // empty left match against whatever the right memory holds.
                None => {
                    if let Some(empty) = self.network.joins[join].empty_left {
                        self.network_assert_left(empty, join);
                    }
                }
                // A fresh join under a shared prefix copies the prefix's
                // emissions from an established sibling, then drives them.
                Some(parent) if !fresh_joins.contains(&parent) => {
                    self.prime_from_prefix(join, parent, fresh_joins);
                }
                // A fresh parent populates this join through its own drive.
                Some(_) => {}
            }
        }

        // Parser callbacks walk the entity list for their flavour; only
        // initialize-marked terminals accept insertions, so established
        // paths are idempotent no-ops.
        self.parsers_incremental_reset()?;

        // Clear the marks.
        for &join in &joins {
            if let Some(node) = self.network.joins.get_mut(join) {
                node.initialize = false;
            }
        }
        for &terminal in fresh_terminals {
            if let Some(node) = self.network.patterns.terminals.get_mut(terminal) {
                node.initialize = false;
            }
        }

        self.network.end_drive();
        self.incremental_reset_in_progress = false;
        self.atoms.sweep();
        debug!(rule = ?rule, "incremental reset complete");
        Ok(())
    }

    // Copy the shared prefix's emissions into a fresh join's left memory.
    // The copies come from an established sibling's left memory, or from
    // the prefix's activation bases when the prefix only terminated a rule.
    fn prime_from_prefix(&mut self, join: JoinId, parent: JoinId, fresh: &FxHashSet<JoinId>) {
        let sibling = self.network.joins[parent]
            .children
            .iter()
            .filter(|(child, side)| {
                *side == rete::Side::Left && *child != join && !fresh.contains(child)
            })
            .map(|(child, _)| *child)
            .next();

        let sources: Vec<PartialMatchId> = match sibling {
            Some(sibling) => {
                let mut entries = self.network.joins[sibling].left_mem.all(&self.network.pms);
                // The sibling's beginning-of-rule empty match, if it is a
                // first join, is recreated by this join's own empty match.
                entries.retain(|&pm| Some(pm) != self.network.joins[sibling].empty_left);
                entries
            }
            None => {
                let mut out = Vec::new();
                let mut cursor = self.network.joins[parent].terminal_matches;
                while let Some(pm) = cursor {
                    out.push(pm);
                    cursor = self.network.pms[pm].next_in_memory;
                }
                // Activation chains are newest-first; restore emission order.
                out.reverse();
                out
            }
        };

        for source in sources {
            if !self.network.pms.contains(source) || self.network.pms[source].deleting {
                continue;
            }
            let (binds, lhs_parent, rhs_parent) = {
                let pm = &self.network.pms[source];
                (pm.binds.clone(), pm.lhs_parent, pm.rhs_parent)
            };
            let mut copy = PartialMatch::new(Owner::Join(join), binds);
            copy.lhs_parent = lhs_parent;
            copy.rhs_parent = rhs_parent;
            let copy = self.network.pms.insert(copy);
            link_lineage(&mut self.network.pms, copy);
            let hash = self.left_hash_of(join, copy);
            self.network.pms[copy].hash_value = hash;
            self.network.insert_pm(MemoryRef::Left(join), copy);
            self.network_assert_left(copy, join);
        }
    }
}

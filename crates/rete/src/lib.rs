//! Rete discrimination network: shared pattern DAG, two-input joins, and
//! partial-match storage
//!
//! The network is pure structure: it owns the pattern nodes, alpha
//! terminals, joins, and partial matches, and provides the memory and
//! lineage plumbing. Driving entities through the structure (evaluation,
//! emission, retraction ordering) is the propagation engine's job, which
//! keeps this crate free of expression-evaluation concerns.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

/// Alpha terminals and bitmap helpers
pub mod alpha;
/// Join nodes and beta memories
pub mod join;
/// Partial matches and link management
pub mod partial;
/// Pattern (alpha) network
pub mod pattern;

pub use alpha::{bitmap_bit_set, bitmap_bytes, AlphaTerminal, TerminalId};
pub use join::{
    BetaMemory, JoinId, JoinKind, JoinNode, RightInput, Side, INITIAL_BETA_SIZE,
};
pub use partial::{
    attach_blocker, children_of, detach_blocker, link_lineage, unlink_lineage, Bind, Owner,
    PartialMatch, PartialMatchId, SlotMarker,
};
pub use pattern::{FieldTest, ParsedPattern, PatternNetwork, PatternNode, PatternNodeId};

use rule_model::arena::Arena;
use rule_model::atom::AtomTable;
use rule_model::expr::ExprPool;
use smallvec::SmallVec;
use tracing::trace;

/// Identity of a matched entity (fact or instance), assigned by its base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

/// Opaque back-pointer from a terminal join to its rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuleToken(pub u64);

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A parsed pattern carried no field tests
    #[error("parsed pattern has no field tests")]
    EmptyPattern,

    /// A join was removed while downstream joins still referenced it
    #[error("join still has downstream joins")]
    JoinHasChildren,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Addresses one beta memory in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRef {
    /// An alpha terminal's memory
    Alpha(TerminalId),
    /// A join's left memory
    Left(JoinId),
    /// A join's owned right memory (from-the-right joins)
    Right(JoinId),
}

/// The whole discrimination network.
pub struct Network {
    /// Pattern network (alpha side)
    pub patterns: PatternNetwork,
    /// Join arena (beta side)
    pub joins: Arena<JoinNode>,
    /// Partial-match arena
    pub pms: Arena<PartialMatch>,
    /// Matches awaiting reclamation at drive depth zero
    garbage: Vec<PartialMatchId>,
    /// Nesting depth of in-progress drives (the reclamation epoch)
    drive_depth: u32,
    /// Beta memories may grow when the load factor is exceeded
    pub resize_memories: bool,
}

impl Network {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            patterns: PatternNetwork::new(),
            joins: Arena::new(),
            pms: Arena::new(),
            garbage: Vec::new(),
            drive_depth: 0,
            resize_memories: true,
        }
    }

    /// Insert a join and link it to its parents; first joins get their empty
    /// left match installed.
    pub fn add_join(&mut self, mut join: JoinNode) -> JoinId {
        join.first_join = join.left_parent.is_none();
        let first = join.first_join;
        let left_parent = join.left_parent;
        let right_input = join.right_input;
        let id = self.joins.insert(join);

        match right_input {
            RightInput::Alpha(terminal) => self.patterns.terminals[terminal].joins.push(id),
            RightInput::Join(upstream) => self.joins[upstream].children.push((id, Side::Right)),
        }
        if let Some(parent) = left_parent {
            self.joins[parent].children.push((id, Side::Left));
        }
        if first {
            let pm = self
                .pms
                .insert(PartialMatch::new(Owner::Join(id), SmallVec::new()));
            self.joins[id].empty_left = Some(pm);
            let (mem, pms) = self.memory_and_pms_mut(MemoryRef::Left(id));
            mem.insert(pms, pm);
        }
        trace!(join = ?id, "added join");
        id
    }

    /// Remove a join with no downstream joins, flushing its memories and
    /// releasing its test expressions.
    ///
    /// Activations based on its terminal matches must be removed first.
    pub fn remove_join(
        &mut self,
        pool: &mut ExprPool,
        atoms: &mut AtomTable,
        id: JoinId,
    ) -> NetworkResult<()> {
        if !self.joins[id].children.is_empty() {
            return Err(NetworkError::JoinHasChildren);
        }

        // Flush both owned memories.
        for mem_ref in [MemoryRef::Left(id), MemoryRef::Right(id)] {
            if matches!(mem_ref, MemoryRef::Right(_)) && self.joins[id].right_mem.is_none() {
                continue;
            }
            let entries = {
                let (mem, pms) = self.memory_and_pms_mut(mem_ref);
                mem.all(pms)
            };
            for pm in entries {
                let (mem, pms) = self.memory_and_pms_mut(mem_ref);
                mem.remove(pms, pm);
                self.discard_pm_links(pm);
                self.retire_pm(pm);
            }
        }

        // Flush activation-basis matches.
        let mut cursor = self.joins[id].terminal_matches;
        while let Some(pm) = cursor {
            cursor = self.pms[pm].next_in_memory;
            self.discard_pm_links(pm);
            self.retire_pm(pm);
        }
        self.joins[id].terminal_matches = None;

        // Release expression references.
        let (network_test, secondary, left_hash, right_hash) = {
            let join = &self.joins[id];
            (
                join.network_test,
                join.secondary_test,
                join.left_hash,
                join.right_hash,
            )
        };
        for expr in [network_test, secondary, left_hash, right_hash].into_iter().flatten() {
            pool.release_hashed(expr, atoms);
        }

        // Unlink from upstream structures.
        let (left_parent, right_input) = {
            let join = &self.joins[id];
            (join.left_parent, join.right_input)
        };
        if let Some(parent) = left_parent {
            self.joins[parent].children.retain(|&(child, _)| child != id);
        }
        match right_input {
            RightInput::Alpha(terminal) => {
                self.patterns.terminals[terminal].joins.retain(|&j| j != id);
            }
            RightInput::Join(upstream) => {
                self.joins[upstream].children.retain(|&(child, _)| child != id);
            }
        }

        self.joins.remove(id);
        trace!(join = ?id, "removed join");
        Ok(())
    }

    /// The memory a join reads right inputs from.
    pub fn right_memory_ref(&self, id: JoinId) -> MemoryRef {
        let join = &self.joins[id];
        if join.right_mem.is_some() {
            MemoryRef::Right(id)
        } else {
            match join.right_input {
                RightInput::Alpha(terminal) => MemoryRef::Alpha(terminal),
                // A join right input without an owned memory cannot be
                // constructed through `JoinNode::new`.
                RightInput::Join(_) => MemoryRef::Right(id),
            }
        }
    }

    /// Split borrow of one memory and the partial-match arena.
    pub fn memory_and_pms_mut(
        &mut self,
        mem: MemoryRef,
    ) -> (&mut BetaMemory, &mut Arena<PartialMatch>) {
        match mem {
            MemoryRef::Alpha(terminal) => {
                (&mut self.patterns.terminals[terminal].memory, &mut self.pms)
            }
            MemoryRef::Left(join) => (&mut self.joins[join].left_mem, &mut self.pms),
            MemoryRef::Right(join) => match self.joins[join].right_mem.as_mut() {
                Some(mem) => (mem, &mut self.pms),
                None => unreachable!("right memory is shared with the alpha terminal"),
            },
        }
    }

    /// Borrow one memory immutably.
    pub fn memory(&self, mem: MemoryRef) -> &BetaMemory {
        match mem {
            MemoryRef::Alpha(terminal) => &self.patterns.terminals[terminal].memory,
            MemoryRef::Left(join) => &self.joins[join].left_mem,
            MemoryRef::Right(join) => match self.joins[join].right_mem.as_ref() {
                Some(mem) => mem,
                None => unreachable!("right memory is shared with the alpha terminal"),
            },
        }
    }

    /// Insert a match into a memory, growing it when permitted.
    pub fn insert_pm(&mut self, mem: MemoryRef, pm: PartialMatchId) {
        let resize = self.resize_memories;
        let (memory, pms) = self.memory_and_pms_mut(mem);
        memory.insert(pms, pm);
        if resize {
            memory.maybe_resize(pms);
        }
    }

    /// Remove a match from a memory.
    pub fn remove_pm(&mut self, mem: MemoryRef, pm: PartialMatchId) {
        let (memory, pms) = self.memory_and_pms_mut(mem);
        memory.remove(pms, pm);
    }

    /// Enter a drive (propagation traversal); reclamation is deferred while
    /// any drive is in progress.
    pub fn begin_drive(&mut self) {
        self.drive_depth += 1;
    }

    /// Leave a drive; at depth zero the garbage list is drained.
    pub fn end_drive(&mut self) {
        self.drive_depth -= 1;
        if self.drive_depth == 0 && !self.garbage.is_empty() {
            let garbage = std::mem::take(&mut self.garbage);
            trace!(count = garbage.len(), "draining retired partial matches");
            for pm in garbage {
                self.pms.remove(pm);
            }
        }
    }

    /// True while a drive is in progress (rule removal is refused).
    pub fn drive_in_progress(&self) -> bool {
        self.drive_depth > 0
    }

    /// Retire an unlinked match: freed immediately outside a drive, queued
    /// on the garbage list otherwise.
    pub fn retire_pm(&mut self, pm: PartialMatchId) {
        if self.drive_depth > 0 {
            self.pms[pm].deleting = true;
            self.garbage.push(pm);
        } else {
            self.pms.remove(pm);
        }
    }

    /// Detach every link of a match (lineage, blockers in both roles).
    pub fn discard_pm_links(&mut self, pm: PartialMatchId) {
        unlink_lineage(&mut self.pms, pm);
        detach_blocker(&mut self.pms, pm);
        let mut blocked = self.pms[pm].first_blocked;
        while let Some(left) = blocked {
            blocked = self.pms[left].next_blocked;
            detach_blocker(&mut self.pms, left);
        }
    }

    /// Unlink a terminal match from its join's activation chain.
    pub fn unlink_terminal_match(&mut self, join: JoinId, pm: PartialMatchId) {
        let (prev, next) = (self.pms[pm].prev_in_memory, self.pms[pm].next_in_memory);
        match prev {
            Some(prev) => self.pms[prev].next_in_memory = next,
            None => self.joins[join].terminal_matches = next,
        }
        if let Some(next) = next {
            self.pms[next].prev_in_memory = prev;
        }
        self.pms[pm].next_in_memory = None;
        self.pms[pm].prev_in_memory = None;
    }

    /// Link a terminal match at the head of its join's activation chain.
    pub fn link_terminal_match(&mut self, join: JoinId, pm: PartialMatchId) {
        let head = self.joins[join].terminal_matches;
        self.pms[pm].next_in_memory = head;
        self.pms[pm].prev_in_memory = None;
        if let Some(head) = head {
            self.pms[head].prev_in_memory = Some(pm);
        }
        self.joins[join].terminal_matches = Some(pm);
    }

    /// Drop the entire network (clear/load path).
    pub fn reset(&mut self) {
        self.patterns.reset();
        self.joins.clear();
        self.pms.clear();
        self.garbage.clear();
        self.drive_depth = 0;
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_gets_empty_left() {
        let mut network = Network::new();
        let mut atoms = AtomTable::new();
        let mut pool = ExprPool::new();
        let mut templates = rule_model::template::TemplateTable::new();
        let modules = rule_model::module::ModuleTable::new(&mut atoms);
        let template = templates
            .define(&mut atoms, modules.main, "signal", vec![])
            .unwrap();

        let pattern = ParsedPattern {
            template,
            tests: vec![FieldTest {
                slot: 0,
                field: 0,
                multifield: false,
                leave_fields: 0,
                end_slot: true,
                selector: None,
                test: None,
            }],
            right_hash: None,
        };
        let terminal = network
            .patterns
            .add_pattern(&mut pool, &mut atoms, pattern)
            .unwrap();

        let join = network.add_join(JoinNode::new(JoinKind::Positive, RightInput::Alpha(terminal)));
        assert!(network.joins[join].first_join);
        let empty = network.joins[join].empty_left.unwrap();
        assert!(network.pms[empty].in_memory);
        assert_eq!(network.pms[empty].bind_count(), 0);
        assert_eq!(network.patterns.terminals[terminal].joins, vec![join]);
    }

    #[test]
    fn test_remove_join_refuses_with_children() {
        let mut network = Network::new();
        let mut atoms = AtomTable::new();
        let mut pool = ExprPool::new();
        let mut templates = rule_model::template::TemplateTable::new();
        let modules = rule_model::module::ModuleTable::new(&mut atoms);
        let template = templates
            .define(&mut atoms, modules.main, "signal", vec![])
            .unwrap();

        let pattern = ParsedPattern {
            template,
            tests: vec![FieldTest {
                slot: 0,
                field: 0,
                multifield: false,
                leave_fields: 0,
                end_slot: true,
                selector: None,
                test: None,
            }],
            right_hash: None,
        };

        let t1 = network
            .patterns
            .add_pattern(&mut pool, &mut atoms, pattern)
            .unwrap();
        let parent = network.add_join(JoinNode::new(JoinKind::Positive, RightInput::Alpha(t1)));

        let mut child = JoinNode::new(JoinKind::Positive, RightInput::Alpha(t1));
        child.left_parent = Some(parent);
        let child = network.add_join(child);

        assert!(network.remove_join(&mut pool, &mut atoms, parent).is_err());
        network.remove_join(&mut pool, &mut atoms, child).unwrap();
        network.remove_join(&mut pool, &mut atoms, parent).unwrap();
        assert_eq!(network.joins.len(), 0);
    }

    #[test]
    fn test_retire_defers_during_drive() {
        let mut network = Network::new();
        let pm = network.pms.insert(PartialMatch::new(
            Owner::Join(rule_model::arena::Id::from_raw_parts(0, 0)),
            SmallVec::new(),
        ));

        network.begin_drive();
        network.retire_pm(pm);
        assert!(network.pms[pm].deleting);
        assert!(network.pms.get(pm).is_some());

        network.end_drive();
        assert!(network.pms.get(pm).is_none());
    }
}

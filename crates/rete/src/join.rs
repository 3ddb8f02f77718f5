//! Two-input join nodes and hashed beta memories

use crate::partial::{PartialMatch, PartialMatchId};
use crate::{RuleToken, TerminalId};
use rule_model::arena::{Arena, Id};
use rule_model::atom::NULL_ID;
use rule_model::expr::HashedExprId;

/// Handle to a join node.
pub type JoinId = Id<JoinNode>;

/// Initial bucket count of a hashed beta memory.
pub const INITIAL_BETA_SIZE: usize = 17;

/// Resize threshold: average chain length before a conditional resize.
const RESIZE_LOAD: usize = 4;

/// Join behaviour.
///
/// "From the right" is not a behaviour of its own: a join of any kind can
/// take another join as its right input (nested not/and groups), which
/// [`RightInput`] carries orthogonally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    /// Emit one combined match per passing (left, right) pair
    Positive,
    /// Emit left only while no right passes
    Negated,
    /// Emit left once as soon as any right passes
    Exists,
}

/// Right input of a join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RightInput {
    /// An alpha terminal; its memory is shared as this join's right memory
    Alpha(TerminalId),
    /// Another join (nested not/and group); the join owns its right memory
    Join(JoinId),
}

/// Which input of a downstream join an emission enters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Enters the child's left memory
    Left,
    /// Enters the child's right memory (from-the-right children)
    Right,
}

/// Open-addressed bucketed memory holding one side's partial matches.
///
/// A memory without a hash expression degenerates to a single bucket and
/// behaves identically to a larger table whose keys all collide. Insertion
/// order is preserved within a bucket by appending at the tail.
pub struct BetaMemory {
    buckets: Vec<Option<PartialMatchId>>,
    tails: Vec<Option<PartialMatchId>>,
    count: usize,
    hashed: bool,
}

impl BetaMemory {
    /// Create a memory; `hashed` selects 17 buckets over 1.
    pub fn new(hashed: bool) -> Self {
        let size = if hashed { INITIAL_BETA_SIZE } else { 1 };
        Self {
            buckets: vec![None; size],
            tails: vec![None; size],
            count: 0,
            hashed,
        }
    }

    /// Number of matches held.
    pub fn count(&self) -> usize {
        self.count
    }

    /// True when no matches are held.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bucket count.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    /// Head of the bucket a hash selects.
    pub fn bucket_head(&self, hash: u64) -> Option<PartialMatchId> {
        self.buckets[self.bucket_of(hash)]
    }

    /// Append a match (its `hash_value` must be set) at its bucket's tail.
    pub fn insert(&mut self, pms: &mut Arena<PartialMatch>, pm: PartialMatchId) {
        let bucket = self.bucket_of(pms[pm].hash_value);
        match self.tails[bucket] {
            Some(tail) => {
                pms[tail].next_in_memory = Some(pm);
                pms[pm].prev_in_memory = Some(tail);
            }
            None => {
                self.buckets[bucket] = Some(pm);
                pms[pm].prev_in_memory = None;
            }
        }
        pms[pm].next_in_memory = None;
        self.tails[bucket] = Some(pm);
        pms[pm].in_memory = true;
        self.count += 1;
    }

    /// Unlink a match from its bucket chain.
    pub fn remove(&mut self, pms: &mut Arena<PartialMatch>, pm: PartialMatchId) {
        let bucket = self.bucket_of(pms[pm].hash_value);
        let (prev, next) = (pms[pm].prev_in_memory, pms[pm].next_in_memory);
        match prev {
            Some(prev) => pms[prev].next_in_memory = next,
            None => self.buckets[bucket] = next,
        }
        match next {
            Some(next) => pms[next].prev_in_memory = prev,
            None => self.tails[bucket] = prev,
        }
        let entry = &mut pms[pm];
        entry.next_in_memory = None;
        entry.prev_in_memory = None;
        entry.in_memory = false;
        self.count -= 1;
    }

    /// Snapshot every match in bucket order, insertion order within buckets.
    pub fn all(&self, pms: &Arena<PartialMatch>) -> Vec<PartialMatchId> {
        let mut out = Vec::with_capacity(self.count);
        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(pm) = cursor {
                out.push(pm);
                cursor = pms[pm].next_in_memory;
            }
        }
        out
    }

    /// Grow and relink when the load factor is exceeded.
    ///
    /// Single-bucket (unhashed) memories never resize.
    pub fn maybe_resize(&mut self, pms: &mut Arena<PartialMatch>) {
        if !self.hashed || self.count < self.buckets.len() * RESIZE_LOAD {
            return;
        }
        let entries = self.all(pms);
        let new_size = self.buckets.len() * 2 + 1;
        self.buckets = vec![None; new_size];
        self.tails = vec![None; new_size];
        self.count = 0;
        for pm in entries {
            // Re-bucket by the stored hash; chain order inside each new
            // bucket follows the old traversal order.
            pms[pm].in_memory = false;
            self.insert(pms, pm);
        }
    }

    /// Drop all links (matches themselves are reclaimed by the caller).
    pub fn reset(&mut self) {
        for slot in &mut self.buckets {
            *slot = None;
        }
        for slot in &mut self.tails {
            *slot = None;
        }
        self.count = 0;
    }
}

/// Two-input join node.
pub struct JoinNode {
    /// Behaviour of this join
    pub kind: JoinKind,
    /// True for the first join of a rule (left parent is the empty match)
    pub first_join: bool,
    /// Upstream join supplying left inputs
    pub left_parent: Option<JoinId>,
    /// Right input: alpha terminal or upstream join
    pub right_input: RightInput,
    /// Downstream joins with the side they enter, in left-to-right order
    pub children: Vec<(JoinId, Side)>,
    /// Inter-pattern test evaluated per candidate pair
    pub network_test: Option<HashedExprId>,
    /// Test run for negated/exists/from-the-right joins after membership
    pub secondary_test: Option<HashedExprId>,
    /// Hash expression over the left match
    pub left_hash: Option<HashedExprId>,
    /// Hash expression over the right match
    pub right_hash: Option<HashedExprId>,
    /// Left memory (always owned)
    pub left_mem: BetaMemory,
    /// Owned right memory; `None` shares the right alpha terminal's memory
    pub right_mem: Option<BetaMemory>,
    /// The empty left match of a first join
    pub empty_left: Option<PartialMatchId>,
    /// Terminal back-pointer to the rule this join activates
    pub rule: Option<RuleToken>,
    /// Activation-basis matches produced by a terminal join (chain head)
    pub terminal_matches: Option<PartialMatchId>,
    /// Incremental-reset mark: true only while this join is freshly created
    pub initialize: bool,
    /// Dense id assigned transiently during save; [`NULL_ID`] otherwise
    pub bsave_id: u64,
}

impl JoinNode {
    /// Fresh unlinked join.
    pub fn new(kind: JoinKind, right_input: RightInput) -> Self {
        let owns_right = matches!(right_input, RightInput::Join(_));
        Self {
            kind,
            first_join: false,
            left_parent: None,
            right_input,
            children: Vec::new(),
            network_test: None,
            secondary_test: None,
            left_hash: None,
            right_hash: None,
            left_mem: BetaMemory::new(false),
            right_mem: owns_right.then(|| BetaMemory::new(false)),
            empty_left: None,
            rule: None,
            terminal_matches: None,
            initialize: false,
            bsave_id: NULL_ID,
        }
    }

    /// True for negated and exists joins (no right bind in emissions).
    pub fn emits_without_right_bind(&self) -> bool {
        matches!(self.kind, JoinKind::Negated | JoinKind::Exists)
    }

    /// True when the right parent is another join rather than an alpha
    /// terminal; such a join always owns its right memory.
    pub fn join_from_the_right(&self) -> bool {
        matches!(self.right_input, RightInput::Join(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partial::{Bind, Owner, PartialMatch};
    use crate::EntityId;
    use smallvec::SmallVec;

    fn pm_with_hash(pms: &mut Arena<PartialMatch>, entity: u64, hash: u64) -> PartialMatchId {
        let mut pm = PartialMatch::new(
            Owner::Join(Id::from_raw_parts(0, 0)),
            SmallVec::from_iter([Bind::entity(EntityId(entity))]),
        );
        pm.hash_value = hash;
        pms.insert(pm)
    }

    #[test]
    fn test_insert_preserves_bucket_order() {
        let mut pms = Arena::new();
        let mut mem = BetaMemory::new(true);

        // Same bucket (same hash), insertion order must hold
        let a = pm_with_hash(&mut pms, 1, 5);
        let b = pm_with_hash(&mut pms, 2, 5);
        let c = pm_with_hash(&mut pms, 3, 5 + INITIAL_BETA_SIZE as u64);
        mem.insert(&mut pms, a);
        mem.insert(&mut pms, b);
        mem.insert(&mut pms, c);

        assert_eq!(mem.count(), 3);
        assert_eq!(mem.bucket_head(5), Some(a));
        assert_eq!(pms[a].next_in_memory, Some(b));
        assert_eq!(pms[b].next_in_memory, Some(c));
    }

    #[test]
    fn test_remove_relinks() {
        let mut pms = Arena::new();
        let mut mem = BetaMemory::new(true);
        let a = pm_with_hash(&mut pms, 1, 0);
        let b = pm_with_hash(&mut pms, 2, 0);
        let c = pm_with_hash(&mut pms, 3, 0);
        for pm in [a, b, c] {
            mem.insert(&mut pms, pm);
        }

        mem.remove(&mut pms, b);
        assert_eq!(mem.count(), 2);
        assert_eq!(pms[a].next_in_memory, Some(c));
        assert_eq!(pms[c].prev_in_memory, Some(a));

        mem.remove(&mut pms, a);
        assert_eq!(mem.bucket_head(0), Some(c));
    }

    #[test]
    fn test_join_right_input_owns_memory() {
        let alpha_join = JoinNode::new(
            JoinKind::Positive,
            RightInput::Alpha(Id::from_raw_parts(0, 0)),
        );
        assert!(!alpha_join.join_from_the_right());
        assert!(alpha_join.right_mem.is_none());

        let group_join = JoinNode::new(
            JoinKind::Negated,
            RightInput::Join(Id::from_raw_parts(0, 0)),
        );
        assert!(group_join.join_from_the_right());
        assert!(group_join.right_mem.is_some());
    }

    #[test]
    fn test_single_bucket_memory_collides_everything() {
        let mut pms = Arena::new();
        let mut mem = BetaMemory::new(false);
        assert_eq!(mem.size(), 1);

        let a = pm_with_hash(&mut pms, 1, 12345);
        let b = pm_with_hash(&mut pms, 2, 9999);
        mem.insert(&mut pms, a);
        mem.insert(&mut pms, b);

        // Different hashes, same (only) bucket
        assert_eq!(mem.bucket_head(0), Some(a));
        assert_eq!(pms[a].next_in_memory, Some(b));

        // Unhashed memories never resize
        mem.maybe_resize(&mut pms);
        assert_eq!(mem.size(), 1);
    }

    #[test]
    fn test_resize_rebuckets_by_stored_hash() {
        let mut pms = Arena::new();
        let mut mem = BetaMemory::new(true);
        let ids: Vec<_> = (0..(INITIAL_BETA_SIZE * RESIZE_LOAD) as u64)
            .map(|i| pm_with_hash(&mut pms, i, i))
            .collect();
        for &pm in &ids {
            mem.insert(&mut pms, pm);
        }
        mem.maybe_resize(&mut pms);

        assert!(mem.size() > INITIAL_BETA_SIZE);
        assert_eq!(mem.count(), ids.len());
        for &pm in &ids {
            let hash = pms[pm].hash_value;
            let mut cursor = mem.bucket_head(hash);
            let mut found = false;
            while let Some(entry) = cursor {
                if entry == pm {
                    found = true;
                    break;
                }
                cursor = pms[entry].next_in_memory;
            }
            assert!(found);
        }
    }
}

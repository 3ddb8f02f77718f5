//! Partial matches: the tuples flowing through the join network
//!
//! A partial match records one entity binding per pattern matched so far.
//! Three intrusive link families keep retraction cheap:
//! - the by-memory chain inside one beta-memory bucket,
//! - the left/right lineage chains rooted at the producing parents, giving
//!   O(descendants) retraction without memory scans,
//! - the blocked chain hanging off the right match that blocks a negated
//!   join's left match.

use crate::{EntityId, JoinId, TerminalId};
use rule_model::arena::{Arena, Id};
use smallvec::SmallVec;

/// Handle to a partial match.
pub type PartialMatchId = Id<PartialMatch>;

/// Span of fields bound by a multifield variable within one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotMarker {
    /// Slot index within the entity's template
    pub slot: u16,
    /// First field of the span
    pub start: u16,
    /// One past the last field of the span
    pub end: u16,
}

/// One pattern's binding inside a partial match.
///
/// `entity` is `None` for the slot a not-CE occupies.
#[derive(Clone, Debug, Default)]
pub struct Bind {
    /// Matched entity, when the pattern is positive
    pub entity: Option<EntityId>,
    /// Multifield spans bound within the entity
    pub markers: SmallVec<[SlotMarker; 2]>,
}

impl Bind {
    /// Binding for a concrete entity with no multifield spans.
    pub fn entity(id: EntityId) -> Self {
        Self {
            entity: Some(id),
            markers: SmallVec::new(),
        }
    }

    /// The empty binding a not-CE occupies.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Which structure's memory owns a partial match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// An alpha terminal's memory (arity-1, right-side entries)
    Terminal(TerminalId),
    /// A join's left memory, or the join itself for activation bases
    Join(JoinId),
}

/// A partial match.
pub struct PartialMatch {
    /// Memory holding this match
    pub owner: Owner,
    /// True while linked into a beta memory (activation bases are not)
    pub in_memory: bool,
    /// True for right-side (alpha) entries
    pub rhs_memory: bool,
    /// Set at the start of deletion; traversals skip marked matches
    pub deleting: bool,
    /// Hash of this match under its memory's hash expression
    pub hash_value: u64,
    /// One binding per pattern matched so far
    pub binds: SmallVec<[Bind; 2]>,

    /// Producing left parent
    pub lhs_parent: Option<PartialMatchId>,
    /// Producing right parent
    pub rhs_parent: Option<PartialMatchId>,

    /// Next match in the same memory bucket
    pub next_in_memory: Option<PartialMatchId>,
    /// Previous match in the same memory bucket
    pub prev_in_memory: Option<PartialMatchId>,

    /// Head of the chain of matches produced from this one as left parent
    pub first_left_child: Option<PartialMatchId>,
    /// Sibling chain under `lhs_parent`
    pub next_left_sibling: Option<PartialMatchId>,
    /// Sibling chain under `lhs_parent`
    pub prev_left_sibling: Option<PartialMatchId>,

    /// Head of the chain of matches produced from this one as right parent
    pub first_right_child: Option<PartialMatchId>,
    /// Sibling chain under `rhs_parent`
    pub next_right_sibling: Option<PartialMatchId>,
    /// Sibling chain under `rhs_parent`
    pub prev_right_sibling: Option<PartialMatchId>,

    /// For a negated/exists left match: the right match blocking (or, for
    /// exists, witnessing) it
    pub blocker: Option<PartialMatchId>,
    /// For a right match: head of the left matches it blocks
    pub first_blocked: Option<PartialMatchId>,
    /// Sibling chain under `blocker`
    pub next_blocked: Option<PartialMatchId>,
    /// Sibling chain under `blocker`
    pub prev_blocked: Option<PartialMatchId>,

    /// Opaque token of the activation based on this match, if any
    pub activation: Option<u64>,
}

impl PartialMatch {
    /// Fresh unlinked match.
    pub fn new(owner: Owner, binds: SmallVec<[Bind; 2]>) -> Self {
        Self {
            owner,
            in_memory: false,
            rhs_memory: false,
            deleting: false,
            hash_value: 0,
            binds,
            lhs_parent: None,
            rhs_parent: None,
            next_in_memory: None,
            prev_in_memory: None,
            first_left_child: None,
            next_left_sibling: None,
            prev_left_sibling: None,
            first_right_child: None,
            next_right_sibling: None,
            prev_right_sibling: None,
            blocker: None,
            first_blocked: None,
            next_blocked: None,
            prev_blocked: None,
            activation: None,
        }
    }

    /// Number of bindings.
    pub fn bind_count(&self) -> usize {
        self.binds.len()
    }
}

/// Link `child` into its parents' lineage chains.
///
/// `child.lhs_parent` / `child.rhs_parent` must already be set.
pub fn link_lineage(pms: &mut Arena<PartialMatch>, child: PartialMatchId) {
    let (lhs, rhs) = {
        let pm = &pms[child];
        (pm.lhs_parent, pm.rhs_parent)
    };
    if let Some(parent) = lhs {
        let old_head = pms[parent].first_left_child;
        pms[child].next_left_sibling = old_head;
        pms[child].prev_left_sibling = None;
        if let Some(head) = old_head {
            pms[head].prev_left_sibling = Some(child);
        }
        pms[parent].first_left_child = Some(child);
    }
    if let Some(parent) = rhs {
        let old_head = pms[parent].first_right_child;
        pms[child].next_right_sibling = old_head;
        pms[child].prev_right_sibling = None;
        if let Some(head) = old_head {
            pms[head].prev_right_sibling = Some(child);
        }
        pms[parent].first_right_child = Some(child);
    }
}

/// Unlink `child` from both lineage chains.
pub fn unlink_lineage(pms: &mut Arena<PartialMatch>, child: PartialMatchId) {
    let (lhs, rhs, nl, pl, nr, pr) = {
        let pm = &pms[child];
        (
            pm.lhs_parent,
            pm.rhs_parent,
            pm.next_left_sibling,
            pm.prev_left_sibling,
            pm.next_right_sibling,
            pm.prev_right_sibling,
        )
    };
    if let Some(parent) = lhs {
        if pms[parent].first_left_child == Some(child) {
            pms[parent].first_left_child = nl;
        }
        if let Some(prev) = pl {
            pms[prev].next_left_sibling = nl;
        }
        if let Some(next) = nl {
            pms[next].prev_left_sibling = pl;
        }
    }
    if let Some(parent) = rhs {
        if pms[parent].first_right_child == Some(child) {
            pms[parent].first_right_child = nr;
        }
        if let Some(prev) = pr {
            pms[prev].next_right_sibling = nr;
        }
        if let Some(next) = nr {
            pms[next].prev_right_sibling = pr;
        }
    }
    let pm = &mut pms[child];
    pm.lhs_parent = None;
    pm.rhs_parent = None;
    pm.next_left_sibling = None;
    pm.prev_left_sibling = None;
    pm.next_right_sibling = None;
    pm.prev_right_sibling = None;
}

/// Record that `right` blocks (or witnesses, for exists) `left`.
pub fn attach_blocker(pms: &mut Arena<PartialMatch>, left: PartialMatchId, right: PartialMatchId) {
    let old_head = pms[right].first_blocked;
    pms[left].blocker = Some(right);
    pms[left].next_blocked = old_head;
    pms[left].prev_blocked = None;
    if let Some(head) = old_head {
        pms[head].prev_blocked = Some(left);
    }
    pms[right].first_blocked = Some(left);
}

/// Clear `left`'s blocker link.
pub fn detach_blocker(pms: &mut Arena<PartialMatch>, left: PartialMatchId) {
    let (blocker, next, prev) = {
        let pm = &pms[left];
        (pm.blocker, pm.next_blocked, pm.prev_blocked)
    };
    if let Some(right) = blocker {
        if pms[right].first_blocked == Some(left) {
            pms[right].first_blocked = next;
        }
    }
    if let Some(prev) = prev {
        pms[prev].next_blocked = next;
    }
    if let Some(next) = next {
        pms[next].prev_blocked = prev;
    }
    let pm = &mut pms[left];
    pm.blocker = None;
    pm.next_blocked = None;
    pm.prev_blocked = None;
}

/// Collect the left/right children of a match (lineage snapshot).
pub fn children_of(
    pms: &Arena<PartialMatch>,
    parent: PartialMatchId,
) -> SmallVec<[PartialMatchId; 8]> {
    let mut out = SmallVec::new();
    let mut cursor = pms[parent].first_left_child;
    while let Some(child) = cursor {
        out.push(child);
        cursor = pms[child].next_left_sibling;
    }
    let mut cursor = pms[parent].first_right_child;
    while let Some(child) = cursor {
        if !out.contains(&child) {
            out.push(child);
        }
        cursor = pms[child].next_right_sibling;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(n: usize) -> (Arena<PartialMatch>, Vec<PartialMatchId>) {
        let mut pms = Arena::new();
        let ids = (0..n)
            .map(|i| {
                pms.insert(PartialMatch::new(
                    Owner::Join(Id::from_raw_parts(0, 0)),
                    SmallVec::from_iter([Bind::entity(EntityId(i as u64))]),
                ))
            })
            .collect();
        (pms, ids)
    }

    #[test]
    fn test_lineage_link_unlink() {
        let (mut pms, ids) = arena_with(3);
        let parent = ids[0];
        let a = ids[1];
        let b = ids[2];

        pms[a].lhs_parent = Some(parent);
        link_lineage(&mut pms, a);
        pms[b].lhs_parent = Some(parent);
        link_lineage(&mut pms, b);

        // Newest child at the head
        assert_eq!(pms[parent].first_left_child, Some(b));
        assert_eq!(pms[b].next_left_sibling, Some(a));

        unlink_lineage(&mut pms, b);
        assert_eq!(pms[parent].first_left_child, Some(a));
        assert_eq!(pms[a].prev_left_sibling, None);
    }

    #[test]
    fn test_blocker_chain() {
        let (mut pms, ids) = arena_with(3);
        let right = ids[0];
        let l1 = ids[1];
        let l2 = ids[2];

        attach_blocker(&mut pms, l1, right);
        attach_blocker(&mut pms, l2, right);
        assert_eq!(pms[right].first_blocked, Some(l2));
        assert_eq!(pms[l2].next_blocked, Some(l1));

        detach_blocker(&mut pms, l2);
        assert_eq!(pms[right].first_blocked, Some(l1));
        assert_eq!(pms[l1].blocker, Some(right));

        detach_blocker(&mut pms, l1);
        assert_eq!(pms[right].first_blocked, None);
    }

    #[test]
    fn test_children_snapshot() {
        let (mut pms, ids) = arena_with(3);
        let parent = ids[0];
        let child = ids[1];

        pms[child].lhs_parent = Some(parent);
        pms[child].rhs_parent = Some(ids[2]);
        link_lineage(&mut pms, child);

        assert_eq!(children_of(&pms, parent).as_slice(), &[child]);
        assert_eq!(children_of(&pms, ids[2]).as_slice(), &[child]);
    }
}

//! Expression trees: owned during construction, hashed once attached
//!
//! A network test lives in the hashed pool: structurally identical trees are
//! interned to a single refcounted entry so shared joins share their test
//! expressions. Interning installs the tree (retains every atom it
//! references); releasing the last reference deinstalls and frees the nodes.

use crate::arena::{Arena, Id};
use crate::atom::{AtomId, AtomTable, NULL_ID};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Handle to one expression node.
pub type ExprId = Id<ExprNode>;

/// Handle to an interned (hashed) expression tree.
pub type HashedExprId = Id<HashedExpr>;

/// Index into the engine's function registry.
///
/// Expressions reference functions by this id; the binary image encodes the
/// function's *name* atom and re-resolves the id on load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// Tag and payload of one expression node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExprValue {
    /// Interned constant
    Atom(AtomId),
    /// Function call; arguments are the child list
    Call(FuncId),
    /// Join-time access to a field of the left partial match
    GetLhsField {
        /// Pattern index within the partial match
        pattern: u16,
        /// Slot index within that pattern's template
        slot: u16,
        /// Field index within the slot (0 for single-field slots)
        field: u16,
    },
    /// Pattern-time / right-side access to a field of the candidate entity
    GetRhsField {
        /// Slot index within the template
        slot: u16,
        /// Field index within the slot
        field: u16,
    },
    /// Pattern-time length of a (multifield) slot
    RhsSlotLength {
        /// Slot index within the template
        slot: u16,
    },
}

/// One node of an expression tree.
#[derive(Clone, Debug)]
pub struct ExprNode {
    /// Tag and payload
    pub value: ExprValue,
    /// First child (argument list head)
    pub first_arg: Option<ExprId>,
    /// Next sibling in the parent's argument list
    pub next_arg: Option<ExprId>,
}

/// An interned expression tree.
#[derive(Debug)]
pub struct HashedExpr {
    /// Root node of the immutable tree
    pub root: ExprId,
    /// Number of live references
    pub count: u32,
    /// Deep structural hash (dedupe key)
    pub hash: u64,
    /// Dense id assigned transiently during save; [`NULL_ID`] otherwise
    pub bsave_id: u64,
}

/// Arena-backed pool of owned nodes and the hashed-expression table.
pub struct ExprPool {
    nodes: Arena<ExprNode>,
    hashed: Arena<HashedExpr>,
    index: FxHashMap<u64, SmallVec<[HashedExprId; 2]>>,
}

impl ExprPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            nodes: Arena::with_capacity(128),
            hashed: Arena::new(),
            index: FxHashMap::default(),
        }
    }

    /// Allocate a leaf node.
    pub fn alloc(&mut self, value: ExprValue) -> ExprId {
        self.nodes.insert(ExprNode {
            value,
            first_arg: None,
            next_arg: None,
        })
    }

    /// Allocate a call node with its argument list linked in order.
    pub fn alloc_call(&mut self, func: FuncId, args: &[ExprId]) -> ExprId {
        let call = self.alloc(ExprValue::Call(func));
        let mut prev: Option<ExprId> = None;
        for &arg in args {
            match prev {
                None => self.nodes[call].first_arg = Some(arg),
                Some(p) => self.nodes[p].next_arg = Some(arg),
            }
            prev = Some(arg);
        }
        call
    }

    /// Borrow a node.
    pub fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id]
    }

    /// Mutably borrow a node (owned trees only; hashed trees are immutable).
    pub fn node_mut(&mut self, id: ExprId) -> &mut ExprNode {
        &mut self.nodes[id]
    }

    /// Arguments of a node, in order.
    pub fn args(&self, id: ExprId) -> SmallVec<[ExprId; 4]> {
        let mut out = SmallVec::new();
        let mut cursor = self.nodes[id].first_arg;
        while let Some(arg) = cursor {
            out.push(arg);
            cursor = self.nodes[arg].next_arg;
        }
        out
    }

    /// Node count of a tree.
    pub fn size(&self, root: ExprId) -> usize {
        let mut count = 0;
        self.walk(root, &mut |_| count += 1);
        count
    }

    /// Deep structural hash of a tree.
    pub fn deep_hash(&self, root: ExprId) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        self.walk(root, &mut |node| {
            let tag_mix = match node.value {
                ExprValue::Atom(a) => {
                    0x01_u64 ^ ((a.index() as u64) << 8) ^ ((u64::from(a.generation())) << 40)
                }
                ExprValue::Call(FuncId(f)) => 0x02_u64 ^ (u64::from(f) << 8),
                ExprValue::GetLhsField { pattern, slot, field } => {
                    0x03_u64
                        ^ (u64::from(pattern) << 8)
                        ^ (u64::from(slot) << 24)
                        ^ (u64::from(field) << 40)
                }
                ExprValue::GetRhsField { slot, field } => {
                    0x04_u64 ^ (u64::from(slot) << 8) ^ (u64::from(field) << 24)
                }
                ExprValue::RhsSlotLength { slot } => 0x05_u64 ^ (u64::from(slot) << 8),
            };
            h ^= tag_mix;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        });
        h
    }

    /// Structural equality of two trees.
    pub fn deep_eq(&self, a: ExprId, b: ExprId) -> bool {
        if self.nodes[a].value != self.nodes[b].value {
            return false;
        }
        let args_a = self.args(a);
        let args_b = self.args(b);
        if args_a.len() != args_b.len() {
            return false;
        }
        args_a
            .iter()
            .zip(args_b.iter())
            .all(|(&x, &y)| self.deep_eq(x, y))
    }

    /// Intern a tree into the hashed table.
    ///
    /// On a structural hit the owned tree is freed and the existing entry's
    /// count bumped; on a miss the tree is installed (every referenced atom
    /// retained) and becomes immutable.
    pub fn intern(&mut self, root: ExprId, atoms: &mut AtomTable) -> HashedExprId {
        let hash = self.deep_hash(root);
        if let Some(candidates) = self.index.get(&hash) {
            for &hid in candidates.clone().iter() {
                let existing_root = self.hashed[hid].root;
                if self.deep_eq(existing_root, root) {
                    self.free_tree(root);
                    self.hashed[hid].count += 1;
                    return hid;
                }
            }
        }
        self.install(root, atoms);
        let hid = self.hashed.insert(HashedExpr {
            root,
            count: 1,
            hash,
            bsave_id: NULL_ID,
        });
        self.index.entry(hash).or_default().push(hid);
        hid
    }

    /// Bump the reference count of an interned tree.
    pub fn retain_hashed(&mut self, hid: HashedExprId) {
        self.hashed[hid].count += 1;
    }

    /// Drop one reference; the last reference deinstalls atoms and frees the
    /// tree nodes.
    pub fn release_hashed(&mut self, hid: HashedExprId, atoms: &mut AtomTable) {
        let remaining = {
            let entry = &mut self.hashed[hid];
            entry.count = entry.count.saturating_sub(1);
            entry.count
        };
        if remaining > 0 {
            return;
        }
        let (root, hash) = {
            let entry = &self.hashed[hid];
            (entry.root, entry.hash)
        };
        self.deinstall(root, atoms);
        self.free_tree(root);
        if let Some(candidates) = self.index.get_mut(&hash) {
            candidates.retain(|c| *c != hid);
            if candidates.is_empty() {
                self.index.remove(&hash);
            }
        }
        self.hashed.remove(hid);
    }

    /// Borrow an interned entry.
    pub fn hashed(&self, hid: HashedExprId) -> &HashedExpr {
        &self.hashed[hid]
    }

    /// Mutably borrow an interned entry (save-phase id assignment).
    pub fn hashed_mut(&mut self, hid: HashedExprId) -> &mut HashedExpr {
        &mut self.hashed[hid]
    }

    /// Root node of an interned tree.
    pub fn hashed_root(&self, hid: HashedExprId) -> ExprId {
        self.hashed[hid].root
    }

    /// Iterate interned entries in slot order.
    pub fn iter_hashed(&self) -> impl Iterator<Item = (HashedExprId, &HashedExpr)> {
        self.hashed.iter()
    }

    /// Number of interned entries.
    pub fn hashed_len(&self) -> usize {
        self.hashed.len()
    }

    /// Mark every atom a tree references as needed for the save phase.
    pub fn mark_atoms_needed(&self, root: ExprId, atoms: &mut AtomTable) {
        let mut to_mark: Vec<AtomId> = Vec::new();
        self.walk(root, &mut |node| {
            if let ExprValue::Atom(a) = node.value {
                to_mark.push(a);
            }
        });
        for a in to_mark {
            atoms.mark_needed(a);
        }
    }

    /// Free an owned tree (never call on an interned root).
    pub fn free_tree(&mut self, root: ExprId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                if let Some(child) = node.first_arg {
                    stack.push(child);
                }
                if let Some(sibling) = node.next_arg {
                    stack.push(sibling);
                }
                self.nodes.remove(id);
            }
        }
    }

    fn install(&mut self, root: ExprId, atoms: &mut AtomTable) {
        let mut to_retain: Vec<AtomId> = Vec::new();
        self.walk(root, &mut |node| {
            if let ExprValue::Atom(a) = node.value {
                to_retain.push(a);
            }
        });
        for a in to_retain {
            atoms.retain(a);
        }
    }

    fn deinstall(&mut self, root: ExprId, atoms: &mut AtomTable) {
        let mut to_release: Vec<AtomId> = Vec::new();
        self.walk(root, &mut |node| {
            if let ExprValue::Atom(a) = node.value {
                to_release.push(a);
            }
        });
        for a in to_release {
            atoms.release(a);
        }
    }

    fn walk(&self, root: ExprId, visit: &mut impl FnMut(&ExprNode)) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            visit(node);
            let mut cursor = node.first_arg;
            while let Some(arg) = cursor {
                stack.push(arg);
                cursor = self.nodes[arg].next_arg;
            }
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.hashed.clear();
        self.index.clear();
    }
}

impl Default for ExprPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EQ: FuncId = FuncId(0);

    fn sample_tree(pool: &mut ExprPool, atoms: &mut AtomTable, value: i64) -> ExprId {
        let field = pool.alloc(ExprValue::GetRhsField { slot: 0, field: 0 });
        let constant = pool.alloc(ExprValue::Atom(atoms.intern_integer(value)));
        pool.alloc_call(EQ, &[field, constant])
    }

    #[test]
    fn test_structural_interning() {
        let mut atoms = AtomTable::new();
        let mut pool = ExprPool::new();

        let t1 = sample_tree(&mut pool, &mut atoms, 7);
        let t2 = sample_tree(&mut pool, &mut atoms, 7);
        let t3 = sample_tree(&mut pool, &mut atoms, 8);

        let h1 = pool.intern(t1, &mut atoms);
        let h2 = pool.intern(t2, &mut atoms);
        let h3 = pool.intern(t3, &mut atoms);

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(pool.hashed(h1).count, 2);
    }

    #[test]
    fn test_intern_retains_atoms_release_frees() {
        let mut atoms = AtomTable::new();
        let mut pool = ExprPool::new();

        let tree = sample_tree(&mut pool, &mut atoms, 99);
        let constant = atoms.intern_integer(99);
        let h = pool.intern(tree, &mut atoms);
        assert_eq!(atoms.get(constant).map(|c| c.count), Some(1));

        pool.release_hashed(h, &mut atoms);
        atoms.sweep();
        assert!(atoms.get(constant).is_none());
        assert_eq!(pool.hashed_len(), 0);
    }

    #[test]
    fn test_args_in_order() {
        let mut atoms = AtomTable::new();
        let mut pool = ExprPool::new();
        let a = pool.alloc(ExprValue::Atom(atoms.intern_integer(1)));
        let b = pool.alloc(ExprValue::Atom(atoms.intern_integer(2)));
        let c = pool.alloc(ExprValue::Atom(atoms.intern_integer(3)));
        let call = pool.alloc_call(EQ, &[a, b, c]);

        assert_eq!(pool.args(call).as_slice(), &[a, b, c]);
        assert_eq!(pool.size(call), 4);
    }
}

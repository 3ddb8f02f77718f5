//! Pattern (alpha) discrimination network
//!
//! A parsed pattern contributes a chain of field-test nodes; chains share
//! every prefix whose (slot, field, flags, test) signature already exists.
//! Constant selectors partition a sibling group through a hash table instead
//! of a linear scan, and constant-test nodes sit last in their group so the
//! match walk can stop at the first success.

use crate::alpha::{bitmap_bytes, AlphaTerminal, TerminalId};
use crate::partial::PartialMatch;
use crate::{NetworkError, NetworkResult};
use rule_model::arena::{Arena, Id};
use rule_model::atom::{AtomId, AtomTable, NULL_ID};
use rule_model::expr::{ExprId, ExprPool, HashedExprId};
use rule_model::template::TemplateId;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Handle to a pattern node.
pub type PatternNodeId = Id<PatternNode>;

/// One field test of a parsed pattern, in network walk order.
#[derive(Debug)]
pub struct FieldTest {
    /// Slot index within the template
    pub slot: u16,
    /// Field index within the slot
    pub field: u16,
    /// This node binds a multifield span
    pub multifield: bool,
    /// Fields remaining in the slot after a multifield span
    pub leave_fields: u16,
    /// Last field test of its slot
    pub end_slot: bool,
    /// Constant partitioning this sibling group (hashed child lookup)
    pub selector: Option<AtomId>,
    /// Intra-pattern test, owned; interned on insertion
    pub test: Option<ExprId>,
}

/// A parsed LHS pattern, produced by an external pattern parser.
#[derive(Debug)]
pub struct ParsedPattern {
    /// Template the pattern applies to
    pub template: TemplateId,
    /// Field tests in walk order; never empty
    pub tests: Vec<FieldTest>,
    /// Hash expression bucketing the resulting alpha memory, owned
    pub right_hash: Option<ExprId>,
}

/// Interior node of the pattern network.
pub struct PatternNode {
    /// Upper level (None at the template root level)
    pub parent: Option<PatternNodeId>,
    /// First node of the next level
    pub first_child: Option<PatternNodeId>,
    /// Next node in this sibling group
    pub right_sibling: Option<PatternNodeId>,
    /// Previous node in this sibling group
    pub left_sibling: Option<PatternNodeId>,
    /// Template whose root level this chain descends from
    pub template: TemplateId,
    /// Slot tested
    pub slot: u16,
    /// Field tested
    pub field: u16,
    /// Fields remaining after a multifield span
    pub leave_fields: u16,
    /// Binds a multifield span
    pub multifield_node: bool,
    /// Last field test of its slot
    pub end_slot: bool,
    /// Children are found through the selector table
    pub selector: bool,
    /// Detachment in progress; the match walk skips blocked nodes
    pub blocked: bool,
    /// Incremental-reset mark
    pub initialize: bool,
    /// Partition constant of a selector node
    pub constant: Option<AtomId>,
    /// Interned intra-pattern test
    pub network_test: Option<HashedExprId>,
    /// Alpha terminals hanging off this node; non-empty iff leaf
    pub terminals: Vec<TerminalId>,
    /// Dense id assigned transiently during save; [`NULL_ID`] otherwise
    pub bsave_id: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct SelectorKey {
    template: TemplateId,
    parent: Option<PatternNodeId>,
    slot: u16,
    field: u16,
    atom: AtomId,
}

/// The shared pattern network.
pub struct PatternNetwork {
    /// Pattern-node arena
    pub nodes: Arena<PatternNode>,
    /// Alpha-terminal arena
    pub terminals: Arena<AlphaTerminal>,
    roots: FxHashMap<TemplateId, PatternNodeId>,
    selector_table: FxHashMap<SelectorKey, PatternNodeId>,
    relevant: FxHashMap<TemplateId, Vec<TerminalId>>,
}

impl PatternNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            nodes: Arena::new(),
            terminals: Arena::new(),
            roots: FxHashMap::default(),
            selector_table: FxHashMap::default(),
            relevant: FxHashMap::default(),
        }
    }

    /// Head of a sibling group.
    pub fn child_head(
        &self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
    ) -> Option<PatternNodeId> {
        match parent {
            Some(p) => self.nodes[p].first_child,
            None => self.roots.get(&template).copied(),
        }
    }

    /// Selector child for a constant, if the group is partitioned on it.
    pub fn selector_child(
        &self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        slot: u16,
        field: u16,
        atom: AtomId,
    ) -> Option<PatternNodeId> {
        self.selector_table
            .get(&SelectorKey {
                template,
                parent,
                slot,
                field,
                atom,
            })
            .copied()
    }

    /// Terminals relevant to a template (invariant: exactly those whose
    /// class bitmap has the template's bit set).
    pub fn relevant_terminals(&self, template: TemplateId) -> &[TerminalId] {
        self.relevant
            .get(&template)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Add a parsed pattern, sharing every matching prefix, and return the
    /// (possibly shared) alpha terminal.
    pub fn add_pattern(
        &mut self,
        pool: &mut ExprPool,
        atoms: &mut AtomTable,
        pattern: ParsedPattern,
    ) -> NetworkResult<TerminalId> {
        if pattern.tests.is_empty() {
            return Err(NetworkError::EmptyPattern);
        }
        let template = pattern.template;
        let mut tested_slots: Vec<usize> = Vec::new();
        let mut parent: Option<PatternNodeId> = None;

        for field_test in pattern.tests {
            if field_test.test.is_some() || field_test.selector.is_some() {
                let slot = field_test.slot as usize;
                if !tested_slots.contains(&slot) {
                    tested_slots.push(slot);
                }
            }
            let hid = field_test.test.map(|t| pool.intern(t, atoms));
            let node = match self.find_matching_child(template, parent, &field_test, hid) {
                Some(existing) => {
                    if let Some(h) = hid {
                        // The shared node already holds its reference.
                        pool.release_hashed(h, atoms);
                    }
                    existing
                }
                None => self.create_node(atoms, template, parent, &field_test, hid),
            };
            parent = Some(node);
        }

        let leaf = match parent {
            Some(leaf) => leaf,
            None => return Err(NetworkError::EmptyPattern),
        };

        // Terminal identity: {class bitmap, slot bitmap, right hash}
        let class_bitmap = atoms.intern_bitmap(&bitmap_bytes(&[template.index()]));
        tested_slots.sort_unstable();
        let slot_bitmap = if tested_slots.is_empty() {
            None
        } else {
            Some(atoms.intern_bitmap(&bitmap_bytes(&tested_slots)))
        };
        let right_hash = pattern.right_hash.map(|t| pool.intern(t, atoms));

        for &tid in &self.nodes[leaf].terminals {
            let terminal = &self.terminals[tid];
            if terminal.class_bitmap == class_bitmap
                && terminal.slot_bitmap == slot_bitmap
                && terminal.right_hash == right_hash
            {
                if let Some(h) = right_hash {
                    pool.release_hashed(h, atoms);
                }
                self.terminals[tid].use_count += 1;
                debug!(terminal = ?tid, "pattern shares existing alpha terminal");
                return Ok(tid);
            }
        }

        atoms.retain(class_bitmap);
        if let Some(s) = slot_bitmap {
            atoms.retain(s);
        }
        let tid = self.terminals.insert(AlphaTerminal::new(
            leaf,
            template,
            class_bitmap,
            slot_bitmap,
            right_hash,
        ));
        self.nodes[leaf].terminals.push(tid);
        self.relevant.entry(template).or_default().push(tid);
        debug!(terminal = ?tid, "created alpha terminal");
        Ok(tid)
    }

    /// Drop one use of a terminal; the last use clears its memory and prunes
    /// the network upward from its leaf.
    pub fn detach_terminal(
        &mut self,
        pool: &mut ExprPool,
        atoms: &mut AtomTable,
        pms: &mut Arena<PartialMatch>,
        tid: TerminalId,
    ) {
        {
            let terminal = &mut self.terminals[tid];
            terminal.use_count -= 1;
            if terminal.use_count > 0 {
                return;
            }
        }

        // Flush remaining arity-1 entries. Downstream joins were removed
        // before detachment, so these have no lineage left.
        let entries = self.terminals[tid].memory.all(pms);
        for pm in entries {
            self.terminals[tid].memory.remove(pms, pm);
            pms.remove(pm);
        }

        let (leaf, template, class_bitmap, slot_bitmap, right_hash) = {
            let terminal = &self.terminals[tid];
            (
                terminal.pattern_node,
                terminal.template,
                terminal.class_bitmap,
                terminal.slot_bitmap,
                terminal.right_hash,
            )
        };
        atoms.release(class_bitmap);
        if let Some(s) = slot_bitmap {
            atoms.release(s);
        }
        if let Some(h) = right_hash {
            pool.release_hashed(h, atoms);
        }
        if let Some(list) = self.relevant.get_mut(&template) {
            list.retain(|&t| t != tid);
        }
        self.nodes[leaf].terminals.retain(|&t| t != tid);
        self.terminals.remove(tid);
        debug!(terminal = ?tid, "detached alpha terminal");

        // Prune childless, terminal-less nodes upward.
        let mut cursor = Some(leaf);
        while let Some(node_id) = cursor {
            let (prune, parent) = {
                let node = &self.nodes[node_id];
                (
                    node.first_child.is_none() && node.terminals.is_empty(),
                    node.parent,
                )
            };
            if !prune {
                break;
            }
            self.remove_node(pool, atoms, node_id);
            cursor = parent;
        }
    }

    fn find_matching_child(
        &self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        field_test: &FieldTest,
        hid: Option<HashedExprId>,
    ) -> Option<PatternNodeId> {
        if let Some(atom) = field_test.selector {
            return self
                .selector_child(template, parent, field_test.slot, field_test.field, atom)
                .filter(|&n| self.signature_matches(n, field_test, hid));
        }
        let mut cursor = self.child_head(template, parent);
        while let Some(node_id) = cursor {
            let node = &self.nodes[node_id];
            if !node.selector && self.signature_matches(node_id, field_test, hid) {
                return Some(node_id);
            }
            cursor = node.right_sibling;
        }
        None
    }

    fn signature_matches(
        &self,
        node_id: PatternNodeId,
        field_test: &FieldTest,
        hid: Option<HashedExprId>,
    ) -> bool {
        let node = &self.nodes[node_id];
        node.slot == field_test.slot
            && node.field == field_test.field
            && node.multifield_node == field_test.multifield
            && node.leave_fields == field_test.leave_fields
            && node.end_slot == field_test.end_slot
            && node.constant == field_test.selector
            && node.network_test == hid
    }

    fn create_node(
        &mut self,
        atoms: &mut AtomTable,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        field_test: &FieldTest,
        hid: Option<HashedExprId>,
    ) -> PatternNodeId {
        let selector = field_test.selector.is_some();
        if let Some(atom) = field_test.selector {
            atoms.retain(atom);
        }
        let node_id = self.nodes.insert(PatternNode {
            parent,
            first_child: None,
            right_sibling: None,
            left_sibling: None,
            template,
            slot: field_test.slot,
            field: field_test.field,
            leave_fields: field_test.leave_fields,
            multifield_node: field_test.multifield,
            end_slot: field_test.end_slot,
            selector,
            blocked: false,
            initialize: false,
            constant: field_test.selector,
            network_test: hid,
            terminals: Vec::new(),
            bsave_id: NULL_ID,
        });
        if let Some(atom) = field_test.selector {
            self.selector_table.insert(
                SelectorKey {
                    template,
                    parent,
                    slot: field_test.slot,
                    field: field_test.field,
                    atom,
                },
                node_id,
            );
        }
        self.link_sibling(template, parent, node_id, selector);
        node_id
    }

    // Constant (selector) nodes go last in their group so the match walk can
    // short-circuit on the first passing constant; everything else is
    // inserted before the first constant sibling.
    fn link_sibling(
        &mut self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        node_id: PatternNodeId,
        is_constant: bool,
    ) {
        let head = self.child_head(template, parent);
        let mut insert_before: Option<PatternNodeId> = None;
        let mut tail: Option<PatternNodeId> = None;
        let mut cursor = head;
        while let Some(current) = cursor {
            if !is_constant && insert_before.is_none() && self.nodes[current].selector {
                insert_before = Some(current);
            }
            tail = Some(current);
            cursor = self.nodes[current].right_sibling;
        }

        match insert_before {
            Some(next) => {
                let prev = self.nodes[next].left_sibling;
                self.nodes[node_id].right_sibling = Some(next);
                self.nodes[node_id].left_sibling = prev;
                self.nodes[next].left_sibling = Some(node_id);
                match prev {
                    Some(prev) => self.nodes[prev].right_sibling = Some(node_id),
                    None => self.set_child_head(template, parent, Some(node_id)),
                }
            }
            None => match tail {
                Some(tail) => {
                    self.nodes[tail].right_sibling = Some(node_id);
                    self.nodes[node_id].left_sibling = Some(tail);
                }
                None => self.set_child_head(template, parent, Some(node_id)),
            },
        }
    }

    fn set_child_head(
        &mut self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        head: Option<PatternNodeId>,
    ) {
        match parent {
            Some(p) => self.nodes[p].first_child = head,
            None => match head {
                Some(h) => {
                    self.roots.insert(template, h);
                }
                None => {
                    self.roots.remove(&template);
                }
            },
        }
    }

    fn remove_node(&mut self, pool: &mut ExprPool, atoms: &mut AtomTable, node_id: PatternNodeId) {
        let (template, parent, left, right, selector_key, network_test) = {
            let node = &self.nodes[node_id];
            let key = node.constant.map(|atom| SelectorKey {
                template: node.template,
                parent: node.parent,
                slot: node.slot,
                field: node.field,
                atom,
            });
            (
                node.template,
                node.parent,
                node.left_sibling,
                node.right_sibling,
                key,
                node.network_test,
            )
        };
        match left {
            Some(left) => self.nodes[left].right_sibling = right,
            None => self.set_child_head(template, parent, right),
        }
        if let Some(right) = right {
            self.nodes[right].left_sibling = left;
        }
        if let Some(key) = selector_key {
            self.selector_table.remove(&key);
            atoms.release(key.atom);
        }
        if let Some(h) = network_test {
            pool.release_hashed(h, atoms);
        }
        self.nodes.remove(node_id);
    }

    /// Drop everything (clear/load path); referenced atoms and expressions
    /// must be released by the caller beforehand via `detach_terminal`.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.terminals.clear();
        self.roots.clear();
        self.selector_table.clear();
        self.relevant.clear();
    }

    /// Rebuild the root, selector, and relevant-terminal indexes from the
    /// node and terminal arenas (image load: the arenas are restored from
    /// flat records, the derived tables are not serialized).
    pub fn rebuild_indexes(&mut self) {
        self.roots.clear();
        self.selector_table.clear();
        self.relevant.clear();
        let nodes: Vec<PatternNodeId> = self.nodes.iter().map(|(id, _)| id).collect();
        for id in nodes {
            let node = &self.nodes[id];
            if node.parent.is_none() && node.left_sibling.is_none() {
                self.roots.insert(node.template, id);
            }
            if let (true, Some(atom)) = (node.selector, node.constant) {
                self.selector_table.insert(
                    SelectorKey {
                        template: node.template,
                        parent: node.parent,
                        slot: node.slot,
                        field: node.field,
                        atom,
                    },
                    id,
                );
            }
        }
        let terminals: Vec<TerminalId> = self.terminals.iter().map(|(id, _)| id).collect();
        for id in terminals {
            let template = self.terminals[id].template;
            self.relevant.entry(template).or_default().push(id);
        }
    }
}

impl Default for PatternNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rule_model::expr::{ExprValue, FuncId};
    use rule_model::module::ModuleTable;
    use rule_model::template::{SlotDef, TemplateTable};

    const EQ: FuncId = FuncId(0);

    fn setup() -> (AtomTable, ExprPool, TemplateTable, TemplateId) {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        let mut templates = TemplateTable::new();
        let x = atoms.intern_symbol("x");
        let y = atoms.intern_symbol("y");
        let template = templates
            .define(
                &mut atoms,
                modules.main,
                "point",
                vec![SlotDef::single(x), SlotDef::single(y)],
            )
            .unwrap();
        (atoms, ExprPool::new(), templates, template)
    }

    fn const_test(
        pool: &mut ExprPool,
        atoms: &mut AtomTable,
        slot: u16,
        value: i64,
    ) -> (Option<AtomId>, Option<ExprId>) {
        let constant = atoms.intern_integer(value);
        let field = pool.alloc(ExprValue::GetRhsField { slot, field: 0 });
        let atom = pool.alloc(ExprValue::Atom(constant));
        (Some(constant), Some(pool.alloc_call(EQ, &[field, atom])))
    }

    fn pattern_with_constant(
        pool: &mut ExprPool,
        atoms: &mut AtomTable,
        template: TemplateId,
        value: i64,
    ) -> ParsedPattern {
        let (selector, test) = const_test(pool, atoms, 0, value);
        ParsedPattern {
            template,
            tests: vec![
                FieldTest {
                    slot: 0,
                    field: 0,
                    multifield: false,
                    leave_fields: 0,
                    end_slot: true,
                    selector,
                    test,
                },
                FieldTest {
                    slot: 1,
                    field: 0,
                    multifield: false,
                    leave_fields: 0,
                    end_slot: true,
                    selector: None,
                    test: None,
                },
            ],
            right_hash: None,
        }
    }

    #[test]
    fn test_identical_patterns_share_terminal() {
        let (mut atoms, mut pool, _templates, template) = setup();
        let mut network = PatternNetwork::new();

        let p1 = pattern_with_constant(&mut pool, &mut atoms, template, 5);
        let p2 = pattern_with_constant(&mut pool, &mut atoms, template, 5);

        let t1 = network.add_pattern(&mut pool, &mut atoms, p1).unwrap();
        let t2 = network.add_pattern(&mut pool, &mut atoms, p2).unwrap();

        assert_eq!(t1, t2);
        assert_eq!(network.terminals[t1].use_count, 2);
        assert_eq!(network.nodes.len(), 2);
    }

    #[test]
    fn test_divergent_patterns_share_prefixless() {
        let (mut atoms, mut pool, _templates, template) = setup();
        let mut network = PatternNetwork::new();

        let p1 = pattern_with_constant(&mut pool, &mut atoms, template, 5);
        let p2 = pattern_with_constant(&mut pool, &mut atoms, template, 6);

        let t1 = network.add_pattern(&mut pool, &mut atoms, p1).unwrap();
        let t2 = network.add_pattern(&mut pool, &mut atoms, p2).unwrap();

        assert_ne!(t1, t2);
        // Two selector roots, one shared second-level wildcard each
        assert_eq!(network.relevant_terminals(template).len(), 2);
    }

    #[test]
    fn test_selector_lookup() {
        let (mut atoms, mut pool, _templates, template) = setup();
        let mut network = PatternNetwork::new();

        let p = pattern_with_constant(&mut pool, &mut atoms, template, 5);
        network.add_pattern(&mut pool, &mut atoms, p).unwrap();

        let five = atoms.intern_integer(5);
        let six = atoms.intern_integer(6);
        assert!(network.selector_child(template, None, 0, 0, five).is_some());
        assert!(network.selector_child(template, None, 0, 0, six).is_none());
    }

    #[test]
    fn test_detach_prunes_upward() {
        let (mut atoms, mut pool, _templates, template) = setup();
        let mut network = PatternNetwork::new();
        let mut pms = Arena::new();

        let p1 = pattern_with_constant(&mut pool, &mut atoms, template, 5);
        let p2 = pattern_with_constant(&mut pool, &mut atoms, template, 6);
        let t1 = network.add_pattern(&mut pool, &mut atoms, p1).unwrap();
        let t2 = network.add_pattern(&mut pool, &mut atoms, p2).unwrap();

        network.detach_terminal(&mut pool, &mut atoms, &mut pms, t1);
        assert!(network.terminals.get(t1).is_none());
        assert_eq!(network.relevant_terminals(template), &[t2]);

        network.detach_terminal(&mut pool, &mut atoms, &mut pms, t2);
        assert_eq!(network.nodes.len(), 0);
        assert!(network.child_head(template, None).is_none());
    }

    #[test]
    fn test_constant_nodes_ordered_last() {
        let (mut atoms, mut pool, _templates, template) = setup();
        let mut network = PatternNetwork::new();

        // Constant first, then a non-constant test on the same level
        let p1 = pattern_with_constant(&mut pool, &mut atoms, template, 5);
        network.add_pattern(&mut pool, &mut atoms, p1).unwrap();

        let var_pattern = ParsedPattern {
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
        network.add_pattern(&mut pool, &mut atoms, var_pattern).unwrap();

        // The wildcard node must precede the selector node
        let head = network.child_head(template, None).unwrap();
        assert!(!network.nodes[head].selector);
        let next = network.nodes[head].right_sibling.unwrap();
        assert!(network.nodes[next].selector);
    }
}

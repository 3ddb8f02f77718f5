//! Fact base: the working memory of template facts
//!
//! Facts are identified by a monotonically increasing id and carry the
//! timetag the conflict-resolution strategies compare. Asserting a fact
//! equal to a live one is a no-op returning the existing id.

use rete::{EntityId, PartialMatchId};
use rule_model::atom::{hash_value, AtomTable};
use rule_model::template::TemplateId;
use rule_model::value::Value;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// One asserted fact.
#[derive(Debug)]
pub struct Fact {
    /// Fact id
    pub id: EntityId,
    /// Template this fact instantiates
    pub template: TemplateId,
    /// Slot values, in template slot order
    pub slots: Vec<Value>,
    /// Assertion timetag (monotone)
    pub timetag: u64,
    /// Alpha-memory entries this fact produced (retraction roots)
    pub alpha_matches: Vec<PartialMatchId>,
}

/// The fact store.
///
/// Iteration is in id order, which equals assertion order; the incremental
/// reset and the binary image rely on that determinism.
pub struct FactBase {
    facts: BTreeMap<u64, Fact>,
    by_content: FxHashMap<u64, SmallVec<[EntityId; 2]>>,
    next_id: u64,
    next_timetag: u64,
}

fn content_hash(atoms: &AtomTable, template: TemplateId, slots: &[Value]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ template.index() as u64;
    for slot in slots {
        match slot {
            Value::Atom(a) => {
                h ^= hash_value(atoms.value(*a));
            }
            Value::Multi(items) => {
                h ^= 0x9e37_79b9;
                for item in items {
                    h ^= hash_value(atoms.value(*item));
                    h = h.wrapping_mul(0x0000_0100_0000_01b3);
                }
            }
        }
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

impl FactBase {
    /// Empty fact base.
    pub fn new() -> Self {
        Self {
            facts: BTreeMap::new(),
            by_content: FxHashMap::default(),
            next_id: 0,
            next_timetag: 1,
        }
    }

    /// Number of live facts.
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// True when no facts are asserted.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Look up a live fact equal to (template, slots).
    pub fn find_equal(
        &self,
        atoms: &AtomTable,
        template: TemplateId,
        slots: &[Value],
    ) -> Option<EntityId> {
        let hash = content_hash(atoms, template, slots);
        let candidates = self.by_content.get(&hash)?;
        candidates.iter().copied().find(|id| {
            self.facts
                .get(&id.0)
                .map(|fact| fact.template == template && fact.slots == slots)
                .unwrap_or(false)
        })
    }

    /// Store a fact, assigning id and timetag. Slot atoms must already be
    /// retained by the caller.
    pub fn insert(&mut self, atoms: &AtomTable, template: TemplateId, slots: Vec<Value>) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        let timetag = self.next_timetag;
        self.next_timetag += 1;
        let hash = content_hash(atoms, template, &slots);
        self.by_content.entry(hash).or_default().push(id);
        self.facts.insert(
            id.0,
            Fact {
                id,
                template,
                slots,
                timetag,
                alpha_matches: Vec::new(),
            },
        );
        id
    }

    /// Remove a fact, returning it for atom release.
    pub fn remove(&mut self, atoms: &AtomTable, id: EntityId) -> Option<Fact> {
        let fact = self.facts.remove(&id.0)?;
        let hash = content_hash(atoms, fact.template, &fact.slots);
        if let Some(candidates) = self.by_content.get_mut(&hash) {
            candidates.retain(|c| *c != id);
            if candidates.is_empty() {
                self.by_content.remove(&hash);
            }
        }
        Some(fact)
    }

    /// Borrow a fact.
    pub fn get(&self, id: EntityId) -> Option<&Fact> {
        self.facts.get(&id.0)
    }

    /// Mutably borrow a fact.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Fact> {
        self.facts.get_mut(&id.0)
    }

    /// Iterate facts in id (assertion) order.
    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    /// Ids of all live facts, in assertion order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.facts.values().map(|f| f.id).collect()
    }

    /// Drop everything, resetting counters (clear/load path).
    pub fn reset(&mut self) {
        self.facts.clear();
        self.by_content.clear();
        self.next_id = 0;
        self.next_timetag = 1;
    }

    /// Reinstall a fact under its original id and timetag (image load).
    /// The caller retains the slot atoms, exactly as on first assertion.
    pub fn restore(
        &mut self,
        atoms: &AtomTable,
        id: EntityId,
        timetag: u64,
        template: TemplateId,
        slots: Vec<Value>,
    ) {
        let hash = content_hash(atoms, template, &slots);
        self.by_content.entry(hash).or_default().push(id);
        self.facts.insert(
            id.0,
            Fact {
                id,
                template,
                slots,
                timetag,
                alpha_matches: Vec::new(),
            },
        );
    }

    /// Saved id/timetag counters (image save).
    pub fn counters(&self) -> (u64, u64) {
        (self.next_id, self.next_timetag)
    }

    /// Restore the id/timetag counters (image load).
    pub fn set_counters(&mut self, next_id: u64, next_timetag: u64) {
        self.next_id = next_id;
        self.next_timetag = next_timetag;
    }
}

impl Default for FactBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rule_model::module::ModuleTable;
    use rule_model::template::{SlotDef, TemplateTable};

    fn setup() -> (AtomTable, TemplateId) {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        let mut templates = TemplateTable::new();
        let slot = atoms.intern_symbol("value");
        let template = templates
            .define(&mut atoms, modules.main, "reading", vec![SlotDef::single(slot)])
            .unwrap();
        (atoms, template)
    }

    #[test]
    fn test_insert_assigns_monotone_ids_and_timetags() {
        let (mut atoms, template) = setup();
        let mut facts = FactBase::new();

        let a = atoms.intern_integer(1);
        let b = atoms.intern_integer(2);
        let f1 = facts.insert(&atoms, template, vec![Value::Atom(a)]);
        let f2 = facts.insert(&atoms, template, vec![Value::Atom(b)]);

        assert!(f1 < f2);
        assert!(facts.get(f1).unwrap().timetag < facts.get(f2).unwrap().timetag);
    }

    #[test]
    fn test_find_equal() {
        let (mut atoms, template) = setup();
        let mut facts = FactBase::new();

        let a = atoms.intern_integer(1);
        let id = facts.insert(&atoms, template, vec![Value::Atom(a)]);

        assert_eq!(facts.find_equal(&atoms, template, &[Value::Atom(a)]), Some(id));

        let b = atoms.intern_integer(2);
        assert_eq!(facts.find_equal(&atoms, template, &[Value::Atom(b)]), None);

        facts.remove(&atoms, id);
        assert_eq!(facts.find_equal(&atoms, template, &[Value::Atom(a)]), None);
    }
}

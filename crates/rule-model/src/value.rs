//! Slot values carried by facts and instances

use crate::atom::{AtomId, AtomTable};
use smallvec::SmallVec;

/// One slot's value: a single interned atom or an ordered multifield.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Single-field slot value
    Atom(AtomId),
    /// Multifield slot value (ordered)
    Multi(SmallVec<[AtomId; 4]>),
}

impl Value {
    /// Number of fields this value spans.
    pub fn field_count(&self) -> usize {
        match self {
            Value::Atom(_) => 1,
            Value::Multi(fields) => fields.len(),
        }
    }

    /// Field at `index`, counting multifield members individually.
    pub fn field(&self, index: usize) -> Option<AtomId> {
        match self {
            Value::Atom(a) => (index == 0).then_some(*a),
            Value::Multi(fields) => fields.get(index).copied(),
        }
    }

    /// Retain every atom in this value.
    pub fn retain_all(&self, atoms: &mut AtomTable) {
        match self {
            Value::Atom(a) => atoms.retain(*a),
            Value::Multi(fields) => {
                for a in fields {
                    atoms.retain(*a);
                }
            }
        }
    }

    /// Release every atom in this value.
    pub fn release_all(&self, atoms: &mut AtomTable) {
        match self {
            Value::Atom(a) => atoms.release(*a),
            Value::Multi(fields) => {
                for a in fields {
                    atoms.release(*a);
                }
            }
        }
    }
}

impl From<AtomId> for Value {
    fn from(atom: AtomId) -> Self {
        Value::Atom(atom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_access() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_integer(1);
        let b = atoms.intern_integer(2);

        let single = Value::Atom(a);
        assert_eq!(single.field_count(), 1);
        assert_eq!(single.field(0), Some(a));
        assert_eq!(single.field(1), None);

        let multi = Value::Multi(SmallVec::from_slice(&[a, b]));
        assert_eq!(multi.field_count(), 2);
        assert_eq!(multi.field(1), Some(b));
    }
}

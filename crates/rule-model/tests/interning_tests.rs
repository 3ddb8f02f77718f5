//! Property tests for the interning tables

use proptest::prelude::*;
use rule_model::{AtomKind, AtomTable};

proptest! {
    #[test]
    fn intern_is_idempotent(text in "[a-zA-Z][a-zA-Z0-9_-]{0,24}") {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_symbol(&text);
        let b = atoms.intern_symbol(&text);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn distinct_integers_get_distinct_atoms(x in any::<i64>(), y in any::<i64>()) {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_integer(x);
        let b = atoms.intern_integer(y);
        prop_assert_eq!(a == b, x == y);
    }

    #[test]
    fn refcount_matches_live_references(n in 1usize..20) {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_symbol("counted");
        for _ in 0..n {
            atoms.retain(a);
        }
        for _ in 0..n {
            atoms.release(a);
        }
        // All references gone: the sweep reclaims the atom.
        prop_assert_eq!(atoms.sweep(), 1);
        prop_assert!(atoms.get(a).is_none());
    }

    #[test]
    fn sweep_never_touches_referenced_atoms(texts in prop::collection::vec("[a-z]{1,8}", 1..16)) {
        let mut atoms = AtomTable::new();
        let ids: Vec<_> = texts.iter().map(|t| {
            let id = atoms.intern_symbol(t);
            atoms.retain(id);
            id
        }).collect();

        atoms.sweep();
        for id in ids {
            prop_assert!(atoms.get(id).is_some());
        }
    }

    #[test]
    fn float_interning_uses_canonical_bits(v in any::<f64>()) {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_float(v);
        let b = atoms.intern_float(v);
        prop_assert_eq!(a, b);
        prop_assert_eq!(atoms.kind(a), AtomKind::Float);
    }

    #[test]
    fn bitmap_interning_compares_bytes(bytes in prop::collection::vec(any::<u8>(), 0..32)) {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_bitmap(&bytes);
        let b = atoms.intern_bitmap(&bytes);
        prop_assert_eq!(a, b);

        let mut other = bytes.clone();
        other.push(0xA5);
        let c = atoms.intern_bitmap(&other);
        prop_assert_ne!(a, c);
    }

    #[test]
    fn external_interning_uses_handle_and_subtype(handle in any::<u64>(), subtype in any::<u16>()) {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_external(handle, subtype);
        let b = atoms.intern_external(handle, subtype);
        prop_assert_eq!(a, b);
        prop_assert_eq!(atoms.kind(a), AtomKind::ExternalAddress);

        let c = atoms.intern_external(handle, subtype.wrapping_add(1));
        prop_assert_ne!(a, c);
    }
}

//! Property tests over the assert/retract surface

use engine::{Engine, Lit, RuleDef, Term};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn assert_retract_restores_state(values in prop::collection::vec(any::<i64>(), 1..12)) {
        let mut engine = Engine::new();
        engine.define_template("sample", &["v"]).unwrap();
        engine
            .add_rule(RuleDef::new("watch").pattern("sample", &[("v", Term::var("x"))]))
            .unwrap();

        let baseline = engine.stats();
        let mut ids = Vec::new();
        for value in &values {
            ids.push(engine.assert_fact("sample", &[("v", Lit::Int(*value))]).unwrap());
        }
        for id in ids {
            engine.retract(id).unwrap();
        }
        prop_assert_eq!(engine.stats(), baseline);
        prop_assert_eq!(engine.agenda_len(), 0);
    }

    #[test]
    fn duplicate_assertion_returns_same_id(value in any::<i64>()) {
        let mut engine = Engine::new();
        engine.define_template("sample", &["v"]).unwrap();

        let first = engine.assert_fact("sample", &[("v", Lit::Int(value))]).unwrap();
        let second = engine.assert_fact("sample", &[("v", Lit::Int(value))]).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn activation_count_tracks_matching_facts(values in prop::collection::vec(0i64..8, 1..16)) {
        let mut engine = Engine::new();
        engine.define_template("sample", &["v"]).unwrap();
        engine
            .add_rule(RuleDef::new("watch").pattern("sample", &[("v", Term::var("x"))]))
            .unwrap();

        let mut distinct = std::collections::BTreeSet::new();
        for value in values {
            engine.assert_fact("sample", &[("v", Lit::Int(value))]).unwrap();
            distinct.insert(value);
        }
        // One activation per distinct fact (duplicates are no-ops).
        prop_assert_eq!(engine.agenda_len(), distinct.len());
    }
}

//! Round-trip law: loading a saved image restores an equivalent engine

use engine::{Engine, Lit, RuleDef, Term};
use image::{load, save, save_to_path, load_from_path, BinaryRegistry, ImageError};

fn two_rule_engine() -> Engine {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine.define_template("b", &["v"]).unwrap();
    engine.define_template("c", &["v"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("r1")
                .pattern("a", &[("v", Term::var("x"))])
                .pattern("b", &[("v", Term::var("x"))]),
        )
        .unwrap();
    engine
        .add_rule(
            RuleDef::new("r2")
                .pattern("a", &[("v", Term::var("x"))])
                .pattern("c", &[("v", Term::var("x"))]),
        )
        .unwrap();
    engine
}

#[test]
fn round_trip_restores_pending_activation() {
    // With r1, r2, (a 1), (b 1): one pending r1 activation survives the
    // save/clear/load cycle with identical memory contents.
    let mut engine = two_rule_engine();
    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    engine.assert_fact("b", &[("v", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_snapshot(), vec![("r1".to_owned(), 0)]);

    let r1 = {
        let name = engine.atoms.intern_symbol("r1");
        engine.rules.find(engine.modules.main, name).unwrap()
    };
    let r2 = {
        let name = engine.atoms.intern_symbol("r2");
        engine.rules.find(engine.modules.main, name).unwrap()
    };
    let counts_before = (
        engine.join_memory_counts(r1),
        engine.join_memory_counts(r2),
    );

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();

    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();

    assert_eq!(restored.agenda_snapshot(), vec![("r1".to_owned(), 0)]);
    assert_eq!(restored.facts.len(), engine.facts.len());
    assert_eq!(restored.rules.len(), 2);

    let r1_restored = {
        let name = restored.atoms.intern_symbol("r1");
        restored.rules.find(restored.modules.main, name).unwrap()
    };
    let r2_restored = {
        let name = restored.atoms.intern_symbol("r2");
        restored.rules.find(restored.modules.main, name).unwrap()
    };
    let counts_after = (
        restored.join_memory_counts(r1_restored),
        restored.join_memory_counts(r2_restored),
    );
    assert_eq!(counts_before, counts_after);
}

#[test]
fn round_trip_preserves_match_behaviour() {
    // The restored network keeps matching: completing the join fires r2.
    let mut engine = two_rule_engine();
    engine.assert_fact("a", &[("v", Lit::Int(7))]).unwrap();

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();

    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();
    assert_eq!(restored.agenda_len(), 0);

    restored.assert_fact("c", &[("v", Lit::Int(7))]).unwrap();
    assert_eq!(restored.agenda_snapshot(), vec![("r2".to_owned(), 0)]);

    // Duplicate detection still works against restored facts.
    let first = restored.assert_fact("a", &[("v", Lit::Int(7))]).unwrap();
    assert_eq!(restored.facts.get(first).unwrap().slots.len(), 1);
}

#[test]
fn round_trip_negated_rule() {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine.define_template("blocker", &["v"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("guarded")
                .pattern("a", &[("v", Term::var("x"))])
                .not_pattern("blocker", &[]),
        )
        .unwrap();
    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();
    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();

    assert_eq!(restored.agenda_len(), 1);
    let blocker = restored
        .assert_fact("blocker", &[("v", Lit::Int(1))])
        .unwrap();
    assert_eq!(restored.agenda_len(), 0);
    restored.retract(blocker).unwrap();
    assert_eq!(restored.agenda_len(), 1);
}

#[test]
fn round_trip_salience_and_strategy_order() {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("low").pattern("a", &[("v", Term::var("x"))]))
        .unwrap();
    engine
        .add_rule(
            RuleDef::new("high")
                .salience(100)
                .pattern("a", &[("v", Term::var("x"))]),
        )
        .unwrap();
    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();
    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();

    let snapshot = restored.agenda_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0], ("high".to_owned(), 100));
    assert_eq!(snapshot[1], ("low".to_owned(), 0));
}

#[test]
fn empty_engine_round_trips() {
    let mut engine = Engine::new();
    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();

    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();
    assert_eq!(restored.rules.len(), 0);
    // The initial fact travels with the image.
    assert_eq!(restored.facts.len(), 1);
}

#[test]
fn save_is_repeatable() {
    // Saving twice from the same engine produces identical images: the
    // find phase restores all transient state.
    let mut engine = two_rule_engine();
    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();

    let registry = BinaryRegistry::standard();
    let first = save(&mut engine, &registry).unwrap();
    let second = save(&mut engine, &registry).unwrap();
    assert_eq!(first, second);
}

#[test]
fn load_after_save_then_save_again_matches() {
    // bsave(bload(bsave(S))) == bsave(S) up to dense renumbering; compare
    // via a second round trip's observable state.
    let mut engine = two_rule_engine();
    engine.assert_fact("a", &[("v", Lit::Int(3))]).unwrap();
    engine.assert_fact("b", &[("v", Lit::Int(3))]).unwrap();

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();

    let mut mid = Engine::new();
    load(&mut mid, &registry, &bytes).unwrap();
    let bytes_again = save(&mut mid, &registry).unwrap();

    let mut last = Engine::new();
    load(&mut last, &registry, &bytes_again).unwrap();
    assert_eq!(last.agenda_snapshot(), engine.agenda_snapshot());
    assert_eq!(last.facts.len(), engine.facts.len());
}

#[test]
fn prefix_mismatch_rejected_and_engine_cleared() {
    let mut engine = two_rule_engine();
    let registry = BinaryRegistry::standard();
    let mut bytes = save(&mut engine, &registry).unwrap();
    bytes[0] ^= 0xff;

    let mut target = two_rule_engine();
    let err = load(&mut target, &registry, &bytes).unwrap_err();
    assert!(matches!(err, ImageError::FormatMismatch(_)));
    // The failed load leaves the engine in its cleared pre-load state.
    assert_eq!(target.rules.len(), 0);
    assert_eq!(target.facts.len(), 1);
}

#[test]
fn truncated_image_rejected() {
    let mut engine = two_rule_engine();
    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();

    let mut target = Engine::new();
    let err = load(&mut target, &registry, &bytes[..bytes.len() / 2]).unwrap_err();
    assert!(matches!(
        err,
        ImageError::Truncated | ImageError::Corrupt(_)
    ));
}

#[test]
fn image_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.img");

    let mut engine = two_rule_engine();
    engine.assert_fact("a", &[("v", Lit::Int(5))]).unwrap();

    let registry = BinaryRegistry::standard();
    save_to_path(&mut engine, &registry, &path).unwrap();

    let mut restored = Engine::new();
    load_from_path(&mut restored, &registry, &path).unwrap();
    assert_eq!(restored.facts.len(), engine.facts.len());
}

#[test]
fn forall_rule_round_trips() {
    // A forall group serializes a join whose right parent is another join;
    // the loader must resolve that forward reference and rebuild the owned
    // right memory.
    let mut engine = Engine::new();
    engine.define_template("light", &["id"]).unwrap();
    engine.define_template("power", &["id"]).unwrap();
    engine
        .add_rule(RuleDef::new("all-powered").forall(
            ("light", &[("id", Term::var("i"))]),
            ("power", &[("id", Term::var("i"))]),
        ))
        .unwrap();

    engine.assert_fact("light", &[("id", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);
    engine.assert_fact("power", &[("id", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();
    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();

    // Every light still has power after the round trip.
    assert_eq!(restored.agenda_snapshot(), vec![("all-powered".to_owned(), 0)]);

    // The restored group keeps tracking universal satisfaction.
    let l2 = restored
        .assert_fact("light", &[("id", Lit::Int(2))])
        .unwrap();
    assert_eq!(restored.agenda_len(), 0);

    let p2 = restored
        .assert_fact("power", &[("id", Lit::Int(2))])
        .unwrap();
    assert_eq!(restored.agenda_len(), 1);

    restored.retract(p2).unwrap();
    assert_eq!(restored.agenda_len(), 0);
    restored.retract(l2).unwrap();
    assert_eq!(restored.agenda_len(), 1);
}

#[test]
fn exists_rule_round_trips() {
    let mut engine = Engine::new();
    engine.define_template("p", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("some-p").exists_pattern("p", &[]))
        .unwrap();
    engine.assert_fact("p", &[("v", Lit::Int(1))]).unwrap();
    engine.assert_fact("p", &[("v", Lit::Int(2))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    let registry = BinaryRegistry::standard();
    let bytes = save(&mut engine, &registry).unwrap();
    let mut restored = Engine::new();
    load(&mut restored, &registry, &bytes).unwrap();

    assert_eq!(restored.agenda_len(), 1);
    for fact in restored.facts.ids() {
        restored.retract(fact).unwrap();
    }
    assert_eq!(restored.agenda_len(), 0);
}

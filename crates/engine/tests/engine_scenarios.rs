//! End-to-end scenarios for the match/propagate/agenda pipeline

use engine::{Engine, EngineConfig, Lit, RuleDef, SalienceEvaluation, Strategy, Term, TestSpec};

fn engine_with_point() -> Engine {
    let mut engine = Engine::new();
    engine.define_template("point", &["x", "y"]).unwrap();
    engine
}

#[test]
fn simple_match_two_activations() {
    // S1: one positive pattern, two matching facts.
    let mut engine = engine_with_point();
    engine
        .add_rule(
            RuleDef::new("record-point")
                .pattern("point", &[("x", Term::var("x")), ("y", Term::var("y"))]),
        )
        .unwrap();

    let f1 = engine
        .assert_fact("point", &[("x", Lit::Int(1)), ("y", Lit::Int(2))])
        .unwrap();
    engine
        .assert_fact("point", &[("x", Lit::Int(3)), ("y", Lit::Int(4))])
        .unwrap();

    assert_eq!(engine.agenda_len(), 2);

    // Firing both empties the agenda.
    let mut recorded = Vec::new();
    engine.run_with(None, |engine, fired| {
        let entity = fired.bindings[0].unwrap();
        let fact = engine.facts.get(entity).unwrap();
        let x = fact.slots[0].field(0).and_then(|a| engine.atoms.integer_value(a));
        let y = fact.slots[1].field(0).and_then(|a| engine.atoms.integer_value(a));
        recorded.push((x.unwrap(), y.unwrap()));
    });
    assert_eq!(recorded.len(), 2);
    assert!(recorded.contains(&(1, 2)));
    assert!(recorded.contains(&(3, 4)));
    assert_eq!(engine.agenda_len(), 0);

    // Retracting after firing has no further agenda effect.
    engine.retract(f1).unwrap();
    assert_eq!(engine.agenda_len(), 0);
}

#[test]
fn retract_unfired_activation_removes_it() {
    let mut engine = engine_with_point();
    engine
        .add_rule(RuleDef::new("r").pattern("point", &[("x", Term::var("x"))]))
        .unwrap();
    let fact = engine
        .assert_fact("point", &[("x", Lit::Int(1)), ("y", Lit::Int(2))])
        .unwrap();
    assert_eq!(engine.agenda_len(), 1);

    engine.retract(fact).unwrap();
    assert_eq!(engine.agenda_len(), 0);
}

#[test]
fn negated_pattern_blocks_and_unblocks() {
    // S2: (a-sig) (not (b-sig)) => r
    let mut engine = Engine::new();
    engine.define_template("a-sig", &["v"]).unwrap();
    engine.define_template("b-sig", &["v"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("a-without-b")
                .pattern("a-sig", &[("v", Term::var("v"))])
                .not_pattern("b-sig", &[]),
        )
        .unwrap();

    engine.assert_fact("a-sig", &[("v", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    let b = engine.assert_fact("b-sig", &[("v", Lit::Int(9))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.retract(b).unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn shared_prefix_primes_new_rule() {
    // S3: R2 added after (A 1) is asserted must see the shared prefix's
    // match without the assertion being re-driven.
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine.define_template("b", &["v"]).unwrap();
    engine.define_template("c", &["v"]).unwrap();

    let r1 = engine
        .add_rule(
            RuleDef::new("r1")
                .pattern("a", &[("v", Term::var("x"))])
                .pattern("b", &[("v", Term::var("x"))]),
        )
        .unwrap();

    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();

    let r2 = engine
        .add_rule(
            RuleDef::new("r2")
                .pattern("a", &[("v", Term::var("x"))])
                .pattern("c", &[("v", Term::var("x"))]),
        )
        .unwrap();

    // The A-pattern alpha and the first join are shared.
    assert_eq!(engine.rule_joins(r1)[0], engine.rule_joins(r2)[0]);

    // R2's second join was primed with the ?x=1 partial match.
    let counts = engine.join_memory_counts(r2);
    assert_eq!(counts[1], 1);

    // Completing the join activates R2.
    engine.assert_fact("c", &[("v", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_snapshot().len(), 1);
    assert_eq!(engine.agenda_snapshot()[0].0, "r2");
}

#[test]
fn salience_orders_firing() {
    // S5: salience 100 fires before salience 0 regardless of order.
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
    assert_eq!(engine.agenda_len(), 2);

    let order: Vec<String> = {
        let mut names = Vec::new();
        engine.run_with(None, |_, fired| names.push(fired.rule_name.clone()));
        names
    };
    assert_eq!(order, vec!["high".to_owned(), "low".to_owned()]);
}

#[test]
fn exists_activates_exactly_once() {
    // S6: one activation while any matching fact exists.
    let mut engine = Engine::new();
    engine.define_template("p", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("some-p").exists_pattern("p", &[]))
        .unwrap();

    assert_eq!(engine.agenda_len(), 0);

    let f1 = engine.assert_fact("p", &[("v", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    // A second matching fact does not add another activation.
    let f2 = engine.assert_fact("p", &[("v", Lit::Int(2))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    // Retracting one of two keeps the activation.
    engine.retract(f1).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    // Retracting the last removes it.
    engine.retract(f2).unwrap();
    assert_eq!(engine.agenda_len(), 0);
}

#[test]
fn incremental_reset_equals_define_first() {
    // Law: state(rule added after asserts) == state(rule added before).
    let build_def = || {
        RuleDef::new("pair")
            .pattern("a", &[("v", Term::var("x"))])
            .pattern("b", &[("v", Term::var("x"))])
    };
    let assert_all = |engine: &mut Engine| {
        engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
        engine.assert_fact("a", &[("v", Lit::Int(2))]).unwrap();
        engine.assert_fact("b", &[("v", Lit::Int(1))]).unwrap();
    };

    let mut before = Engine::new();
    before.define_template("a", &["v"]).unwrap();
    before.define_template("b", &["v"]).unwrap();
    let rule_before = before.add_rule(build_def()).unwrap();
    assert_all(&mut before);

    let mut after = Engine::new();
    after.define_template("a", &["v"]).unwrap();
    after.define_template("b", &["v"]).unwrap();
    assert_all(&mut after);
    let rule_after = after.add_rule(build_def()).unwrap();

    assert_eq!(
        before.join_memory_counts(rule_before),
        after.join_memory_counts(rule_after)
    );
    assert_eq!(before.agenda_snapshot(), after.agenda_snapshot());
    assert_eq!(before.agenda_len(), 1);
}

#[test]
fn retraction_is_idempotent() {
    let mut engine = engine_with_point();
    let fact = engine
        .assert_fact("point", &[("x", Lit::Int(1)), ("y", Lit::Int(2))])
        .unwrap();

    assert!(engine.retract(fact).unwrap());
    let stats_after_first = engine.stats();
    assert!(!engine.retract(fact).unwrap());
    assert_eq!(engine.stats(), stats_after_first);
}

#[test]
fn assert_retract_leaves_agenda_unchanged() {
    // Law: for a rule with no RHS side effects, assert;retract is an
    // agenda no-op.
    let mut engine = engine_with_point();
    engine
        .add_rule(RuleDef::new("r").pattern("point", &[("x", Term::var("x"))]))
        .unwrap();

    engine
        .assert_fact("point", &[("x", Lit::Int(7)), ("y", Lit::Int(8))])
        .unwrap();
    let baseline = engine.agenda_snapshot();

    let transient = engine
        .assert_fact("point", &[("x", Lit::Int(9)), ("y", Lit::Int(10))])
        .unwrap();
    assert_eq!(engine.agenda_len(), baseline.len() + 1);
    engine.retract(transient).unwrap();

    assert_eq!(engine.agenda_snapshot(), baseline);
}

#[test]
fn duplicate_assert_is_noop() {
    let mut engine = engine_with_point();
    let first = engine
        .assert_fact("point", &[("x", Lit::Int(1)), ("y", Lit::Int(1))])
        .unwrap();
    let second = engine
        .assert_fact("point", &[("x", Lit::Int(1)), ("y", Lit::Int(1))])
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.facts.len(), 2); // the fact plus initial-fact
}

#[test]
fn test_only_rule_follows_verdict() {
    let mut engine = Engine::new();
    engine
        .add_rule(RuleDef::new("tautology").test("<", &[Term::int(1), Term::int(2)]))
        .unwrap();
    assert_eq!(engine.agenda_len(), 1);

    engine
        .add_rule(RuleDef::new("contradiction").test("<", &[Term::int(2), Term::int(1)]))
        .unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn test_ce_filters_join() {
    let mut engine = Engine::new();
    engine.define_template("reading", &["value"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("hot")
                .pattern("reading", &[("value", Term::var("v"))])
                .test(">", &[Term::var("v"), Term::int(50)]),
        )
        .unwrap();

    engine
        .assert_fact("reading", &[("value", Lit::Int(10))])
        .unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine
        .assert_fact("reading", &[("value", Lit::Int(90))])
        .unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn forall_tracks_universal_satisfaction() {
    // forall ≡ not-and-not: active exactly while every light has power.
    let mut engine = Engine::new();
    engine.define_template("light", &["id"]).unwrap();
    engine.define_template("power", &["id"]).unwrap();
    engine
        .add_rule(RuleDef::new("all-powered").forall(
            ("light", &[("id", Term::var("i"))]),
            ("power", &[("id", Term::var("i"))]),
        ))
        .unwrap();

    // Vacuously true with no lights.
    assert_eq!(engine.agenda_len(), 1);

    let l1 = engine.assert_fact("light", &[("id", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    let p1 = engine.assert_fact("power", &[("id", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    engine.assert_fact("light", &[("id", Lit::Int(2))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.assert_fact("power", &[("id", Lit::Int(2))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    // Breaking one satisfaction deactivates again.
    engine.retract(p1).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.retract(l1).unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn variable_join_requires_equality() {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine.define_template("b", &["v"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("same")
                .pattern("a", &[("v", Term::var("x"))])
                .pattern("b", &[("v", Term::var("x"))]),
        )
        .unwrap();

    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    engine.assert_fact("b", &[("v", Lit::Int(2))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.assert_fact("b", &[("v", Lit::Int(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn rule_removal_drops_activations_and_structure() {
    let mut engine = engine_with_point();
    let rule = engine
        .add_rule(RuleDef::new("r").pattern("point", &[("x", Term::var("x"))]))
        .unwrap();
    engine
        .assert_fact("point", &[("x", Lit::Int(1)), ("y", Lit::Int(2))])
        .unwrap();
    assert_eq!(engine.agenda_len(), 1);

    engine.remove_rule(rule).unwrap();
    assert_eq!(engine.agenda_len(), 0);
    assert_eq!(engine.rules.len(), 0);
    assert_eq!(engine.network.joins.len(), 0);
}

#[test]
fn breadth_strategy_fires_oldest_first() {
    let mut engine = Engine::with_config(EngineConfig {
        strategy: Strategy::Breadth,
        ..EngineConfig::default()
    });
    engine.define_template("a", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("r").pattern("a", &[("v", Term::var("x"))]))
        .unwrap();

    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    engine.assert_fact("a", &[("v", Lit::Int(2))]).unwrap();

    let mut values = Vec::new();
    engine.run_with(None, |engine, fired| {
        let entity = fired.bindings[0].unwrap();
        let fact = engine.facts.get(entity).unwrap();
        values.push(
            fact.slots[0]
                .field(0)
                .and_then(|a| engine.atoms.integer_value(a))
                .unwrap(),
        );
    });
    assert_eq!(values, vec![1, 2]);
}

#[test]
fn depth_strategy_fires_newest_first() {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("r").pattern("a", &[("v", Term::var("x"))]))
        .unwrap();

    engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    engine.assert_fact("a", &[("v", Lit::Int(2))]).unwrap();

    let mut values = Vec::new();
    engine.run_with(None, |engine, fired| {
        let entity = fired.bindings[0].unwrap();
        let fact = engine.facts.get(entity).unwrap();
        values.push(
            fact.slots[0]
                .field(0)
                .and_then(|a| engine.atoms.integer_value(a))
                .unwrap(),
        );
    });
    assert_eq!(values, vec![2, 1]);
}

#[test]
fn dynamic_salience_reevaluated_per_activation() {
    let mut engine = Engine::with_config(EngineConfig {
        salience_evaluation: SalienceEvaluation::WhenActivated,
        ..EngineConfig::default()
    });
    engine.define_template("task", &["prio"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("by-priority")
                .pattern("task", &[("prio", Term::var("p"))])
                .dynamic_salience(TestSpec {
                    func: "+".to_owned(),
                    args: vec![Term::var("p"), Term::int(0)],
                }),
        )
        .unwrap();

    engine.assert_fact("task", &[("prio", Lit::Int(5))]).unwrap();
    engine
        .assert_fact("task", &[("prio", Lit::Int(50))])
        .unwrap();
    engine.assert_fact("task", &[("prio", Lit::Int(20))]).unwrap();

    let saliences: Vec<i32> = engine.agenda_snapshot().iter().map(|(_, s)| *s).collect();
    assert_eq!(saliences, vec![50, 20, 5]);
}

#[test]
fn rhs_reentry_asserts_chain() {
    // Handler-driven chaining: firing asserts a follow-up fact.
    let mut engine = Engine::new();
    engine.define_template("seed", &["v"]).unwrap();
    engine.define_template("grown", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("grow").pattern("seed", &[("v", Term::var("x"))]))
        .unwrap();
    engine
        .add_rule(RuleDef::new("harvest").pattern("grown", &[("v", Term::var("x"))]))
        .unwrap();

    engine.assert_fact("seed", &[("v", Lit::Int(1))]).unwrap();

    let mut harvested = 0;
    engine.run_with(None, |engine, fired| match fired.rule_name.as_str() {
        "grow" => {
            engine.assert_fact("grown", &[("v", Lit::Int(1))]).unwrap();
        }
        "harvest" => harvested += 1,
        _ => {}
    });
    assert_eq!(harvested, 1);
}

#[test]
fn strategy_switch_reorders_pending_agenda() {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine
        .add_rule(RuleDef::new("r").pattern("a", &[("v", Term::var("x"))]))
        .unwrap();
    let first = engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    engine.assert_fact("a", &[("v", Lit::Int(2))]).unwrap();

    // Depth order: newest first.
    let depth_first = engine.fire_next().unwrap();
    assert_ne!(depth_first.bindings[0], Some(first));

    // Re-assert and flip to breadth: the pending agenda reorders.
    engine.retract(first).unwrap();
    let re_asserted = engine.assert_fact("a", &[("v", Lit::Int(1))]).unwrap();
    engine.set_strategy(Strategy::Breadth);
    engine.assert_fact("a", &[("v", Lit::Int(3))]).unwrap();

    let next = engine.fire_next().unwrap();
    assert_eq!(next.bindings[0], Some(re_asserted));
}

#[test]
fn constraint_violation_on_bad_salience() {
    let mut engine = Engine::new();
    let result = engine.add_rule(RuleDef::new("r").salience(20_000));
    assert!(result.is_err());
}

#[test]
fn unbound_variable_rejected() {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    let result = engine.add_rule(
        RuleDef::new("r")
            .pattern("a", &[("v", Term::int(1))])
            .test(">", &[Term::var("ghost"), Term::int(0)]),
    );
    assert!(result.is_err());
}

//! Expression evaluation with an explicit context
//!
//! Join and pattern tests are evaluated against an [`EvalContext`] value
//! instead of engine-global bindings; recursive evaluations simply build a
//! new context. An evaluation error inside a network test is treated as a
//! match (a later test cannot spuriously suppress matches) and recorded on
//! the context so the outer operation can report it.

use crate::{Engine, COMPONENT_EVAL};
use rete::{EntityId, JoinId, PartialMatchId};
use rule_model::atom::{
    hash_float, hash_integer, AtomId, AtomValue, LexemeKind,
};
use rule_model::expr::{ExprId, ExprValue, FuncId};
use smallvec::SmallVec;

/// Evaluation context threaded through every evaluator call.
#[derive(Clone, Copy, Debug, Default)]
pub struct EvalContext {
    /// Left partial match of the join under evaluation
    pub lhs: Option<PartialMatchId>,
    /// Right (alpha) partial match of the join under evaluation
    pub rhs: Option<PartialMatchId>,
    /// Entity walking the pattern network (before any match exists)
    pub rhs_entity: Option<EntityId>,
    /// Join under evaluation
    pub join: Option<JoinId>,
    /// Sticky evaluation-error flag
    pub error: bool,
}

/// A computed value: an interned atom or an unintered scalar.
///
/// Arithmetic produces scalars without touching the atom tables, so the
/// evaluator never needs mutable engine access.
#[derive(Clone, Debug)]
pub enum EvalValue {
    /// Interned atom
    Atom(AtomId),
    /// Unintered integer
    Int(i64),
    /// Unintered float
    Float(f64),
    /// Boolean verdict
    Bool(bool),
    /// Multifield of interned atoms
    Multi(SmallVec<[AtomId; 4]>),
}

/// Error raised inside a native function.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// Argument had the wrong type
    #[error("wrong argument type for {0}")]
    WrongType(&'static str),
    /// Argument count mismatch
    #[error("wrong argument count for {0}")]
    WrongArity(&'static str),
    /// Field access outside the bound entity
    #[error("unbound field access")]
    UnboundAccess,
    /// Division by zero
    #[error("division by zero")]
    DivideByZero,
}

/// Native function signature.
pub type NativeFn = fn(&Engine, &[EvalValue]) -> Result<EvalValue, EvalError>;

/// One registered function.
pub struct FunctionDef {
    /// Function name atom
    pub name: AtomId,
    /// Handler
    pub handler: NativeFn,
}

/// Registry mapping [`FuncId`]s to native handlers.
///
/// Expressions store the id; the binary image stores the name and
/// re-resolves the id on load.
pub struct FunctionRegistry {
    funcs: Vec<FunctionDef>,
    by_name: rustc_hash::FxHashMap<AtomId, FuncId>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            funcs: Vec::new(),
            by_name: rustc_hash::FxHashMap::default(),
        }
    }

    /// Register a function under an interned name atom.
    pub fn register(&mut self, name: AtomId, handler: NativeFn) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(FunctionDef { name, handler });
        self.by_name.insert(name, id);
        id
    }

    /// Handler for a function id.
    pub fn get(&self, id: FuncId) -> Option<&FunctionDef> {
        self.funcs.get(id.0 as usize)
    }

    /// Id for a function name atom.
    pub fn lookup(&self, name: AtomId) -> Option<FuncId> {
        self.by_name.get(&name).copied()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical comparable form of a value.
enum Canon<'a> {
    Lexeme(LexemeKind, &'a str),
    Int(i64),
    Float(f64),
    Bitmap(&'a [u8]),
    External(u64, u16),
}

fn canon<'a>(engine: &'a Engine, value: &'a EvalValue) -> Option<Canon<'a>> {
    match value {
        EvalValue::Int(v) => Some(Canon::Int(*v)),
        EvalValue::Float(v) => Some(Canon::Float(*v)),
        // Verdicts compare equal to the interned boolean symbols.
        EvalValue::Bool(v) => Some(Canon::Lexeme(
            LexemeKind::Symbol,
            if *v { "TRUE" } else { "FALSE" },
        )),
        EvalValue::Multi(_) => None,
        EvalValue::Atom(id) => match engine.atoms.value(*id) {
            AtomValue::Lexeme { kind, text } => Some(Canon::Lexeme(*kind, text)),
            AtomValue::Integer(v) => Some(Canon::Int(*v)),
            AtomValue::Float(v) => Some(Canon::Float(*v)),
            AtomValue::Bitmap(bytes) => Some(Canon::Bitmap(bytes)),
            AtomValue::External { handle, subtype } => Some(Canon::External(*handle, *subtype)),
        },
    }
}

/// Type-strict equality after interning semantics.
pub fn values_equal(engine: &Engine, a: &EvalValue, b: &EvalValue) -> bool {
    if let (EvalValue::Multi(x), EvalValue::Multi(y)) = (a, b) {
        return x == y;
    }
    match (canon(engine, a), canon(engine, b)) {
        (Some(Canon::Lexeme(ka, ta)), Some(Canon::Lexeme(kb, tb))) => ka == kb && ta == tb,
        (Some(Canon::Int(x)), Some(Canon::Int(y))) => x == y,
        (Some(Canon::Float(x)), Some(Canon::Float(y))) => {
            rule_model::atom::canonical_float_bits(x) == rule_model::atom::canonical_float_bits(y)
        }
        (Some(Canon::Bitmap(x)), Some(Canon::Bitmap(y))) => x == y,
        (Some(Canon::External(hx, sx)), Some(Canon::External(hy, sy))) => hx == hy && sx == sy,
        _ => false,
    }
}

/// Fixed hash of a value, agreeing with the atom-table hash of its interned
/// form (beta-memory bucketing).
pub fn hash_eval_value(engine: &Engine, value: &EvalValue) -> u64 {
    match value {
        EvalValue::Atom(id) => engine.atoms.hash_atom(*id),
        EvalValue::Int(v) => hash_integer(*v),
        EvalValue::Float(v) => hash_float(*v),
        EvalValue::Bool(v) => {
            let id = if *v {
                engine.atoms.true_symbol
            } else {
                engine.atoms.false_symbol
            };
            engine.atoms.hash_atom(id)
        }
        EvalValue::Multi(items) => {
            let mut h: u64 = 0xcbf2_9ce4_8422_2325;
            for item in items {
                h ^= engine.atoms.hash_atom(*item);
                h = h.wrapping_mul(0x0000_0100_0000_01b3);
            }
            h
        }
    }
}

/// Truth verdict: everything except boolean false and the FALSE symbol
/// passes.
pub fn is_truthy(engine: &Engine, value: &EvalValue) -> bool {
    match value {
        EvalValue::Bool(v) => *v,
        EvalValue::Atom(id) => *id != engine.atoms.false_symbol,
        _ => true,
    }
}

impl Engine {
    /// Evaluate an expression node under a context.
    ///
    /// Returns `None` on evaluation error after setting `ctx.error`; the
    /// caller decides the policy (join tests treat it as a match).
    pub fn eval(&self, ctx: &mut EvalContext, expr: ExprId) -> Option<EvalValue> {
        let node = self.exprs.node(expr);
        match node.value {
            ExprValue::Atom(id) => Some(EvalValue::Atom(id)),
            ExprValue::GetRhsField { slot, field } => {
                let entity = ctx.rhs_entity.or_else(|| {
                    ctx.rhs
                        .and_then(|pm| self.network.pms.get(pm))
                        .and_then(|pm| pm.binds.first())
                        .and_then(|bind| bind.entity)
                });
                self.entity_field(entity, slot, field)
                    .or_else(|| self.eval_fail(ctx, "right field access failed"))
            }
            ExprValue::GetLhsField {
                pattern,
                slot,
                field,
            } => {
                let entity = ctx
                    .lhs
                    .and_then(|pm| self.network.pms.get(pm))
                    .and_then(|pm| pm.binds.get(pattern as usize))
                    .and_then(|bind| bind.entity);
                self.entity_field(entity, slot, field)
                    .or_else(|| self.eval_fail(ctx, "left field access failed"))
            }
            ExprValue::RhsSlotLength { slot } => {
                let entity = ctx.rhs_entity.or_else(|| {
                    ctx.rhs
                        .and_then(|pm| self.network.pms.get(pm))
                        .and_then(|pm| pm.binds.first())
                        .and_then(|bind| bind.entity)
                });
                entity
                    .and_then(|e| self.facts.get(e))
                    .and_then(|fact| fact.slots.get(slot as usize))
                    .map(|value| EvalValue::Int(value.field_count() as i64))
                    .or_else(|| self.eval_fail(ctx, "slot length access failed"))
            }
            ExprValue::Call(func) => {
                let mut args: SmallVec<[EvalValue; 4]> = SmallVec::new();
                for arg in self.exprs.args(expr) {
                    args.push(self.eval(ctx, arg)?);
                }
                let def = match self.functions.get(func) {
                    Some(def) => def,
                    None => return self.eval_fail(ctx, "unknown function"),
                };
                match (def.handler)(self, &args) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        crate::route_error(COMPONENT_EVAL, 1, &err.to_string());
                        ctx.error = true;
                        None
                    }
                }
            }
        }
    }

    /// Evaluate a network test; evaluation errors count as a match.
    pub fn eval_test(&self, ctx: &mut EvalContext, expr: ExprId) -> bool {
        match self.eval(ctx, expr) {
            Some(value) => is_truthy(self, &value),
            // Conservative: a failed test cannot suppress matches.
            None => true,
        }
    }

    fn entity_field(&self, entity: Option<EntityId>, slot: u16, field: u16) -> Option<EvalValue> {
        let fact = self.facts.get(entity?)?;
        let value = fact.slots.get(slot as usize)?;
        value.field(field as usize).map(EvalValue::Atom)
    }

    fn eval_fail(&self, ctx: &mut EvalContext, message: &str) -> Option<EvalValue> {
        crate::route_error(COMPONENT_EVAL, 2, message);
        ctx.error = true;
        None
    }
}

// Built-in functions. Registration order is fixed; the image encodes
// functions by name, so order only matters within one process.

fn as_number(name: &'static str, value: &EvalValue, engine: &Engine) -> Result<f64, EvalError> {
    match canon(engine, value) {
        Some(Canon::Int(v)) => Ok(v as f64),
        Some(Canon::Float(v)) => Ok(v),
        _ => Err(EvalError::WrongType(name)),
    }
}

fn native_eq(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    if args.len() < 2 {
        return Err(EvalError::WrongArity("eq"));
    }
    let all = args[1..].iter().all(|v| values_equal(engine, &args[0], v));
    Ok(EvalValue::Bool(all))
}

fn native_neq(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    match native_eq(engine, args)? {
        EvalValue::Bool(v) => Ok(EvalValue::Bool(!v)),
        _ => Err(EvalError::WrongType("neq")),
    }
}

fn native_and(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    Ok(EvalValue::Bool(args.iter().all(|v| is_truthy(engine, v))))
}

fn native_or(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    Ok(EvalValue::Bool(args.iter().any(|v| is_truthy(engine, v))))
}

fn native_not(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    match args {
        [value] => Ok(EvalValue::Bool(!is_truthy(engine, value))),
        _ => Err(EvalError::WrongArity("not")),
    }
}

fn numeric_cmp(
    name: &'static str,
    engine: &Engine,
    args: &[EvalValue],
    pass: fn(std::cmp::Ordering) -> bool,
) -> Result<EvalValue, EvalError> {
    if args.len() < 2 {
        return Err(EvalError::WrongArity(name));
    }
    for pair in args.windows(2) {
        let a = as_number(name, &pair[0], engine)?;
        let b = as_number(name, &pair[1], engine)?;
        let ordering = a.partial_cmp(&b).ok_or(EvalError::WrongType(name))?;
        if !pass(ordering) {
            return Ok(EvalValue::Bool(false));
        }
    }
    Ok(EvalValue::Bool(true))
}

fn native_lt(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    numeric_cmp("<", engine, args, |o| o == std::cmp::Ordering::Less)
}

fn native_le(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    numeric_cmp("<=", engine, args, |o| o != std::cmp::Ordering::Greater)
}

fn native_gt(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    numeric_cmp(">", engine, args, |o| o == std::cmp::Ordering::Greater)
}

fn native_ge(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    numeric_cmp(">=", engine, args, |o| o != std::cmp::Ordering::Less)
}

fn fold_arith(
    name: &'static str,
    engine: &Engine,
    args: &[EvalValue],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<EvalValue, EvalError> {
    if args.is_empty() {
        return Err(EvalError::WrongArity(name));
    }
    let mut acc = match canon(engine, &args[0]) {
        Some(Canon::Int(v)) => EvalValue::Int(v),
        Some(Canon::Float(v)) => EvalValue::Float(v),
        _ => return Err(EvalError::WrongType(name)),
    };
    for arg in &args[1..] {
        acc = match (acc, canon(engine, arg)) {
            (EvalValue::Int(a), Some(Canon::Int(b))) => match int_op(a, b) {
                Some(v) => EvalValue::Int(v),
                None => EvalValue::Float(float_op(a as f64, b as f64)),
            },
            (EvalValue::Int(a), Some(Canon::Float(b))) => EvalValue::Float(float_op(a as f64, b)),
            (EvalValue::Float(a), Some(Canon::Int(b))) => EvalValue::Float(float_op(a, b as f64)),
            (EvalValue::Float(a), Some(Canon::Float(b))) => EvalValue::Float(float_op(a, b)),
            _ => return Err(EvalError::WrongType(name)),
        };
    }
    Ok(acc)
}

fn native_add(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    fold_arith("+", engine, args, i64::checked_add, |a, b| a + b)
}

fn native_sub(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    fold_arith("-", engine, args, i64::checked_sub, |a, b| a - b)
}

fn native_mul(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    fold_arith("*", engine, args, i64::checked_mul, |a, b| a * b)
}

fn native_div(engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    for arg in &args[1..] {
        if let Some(Canon::Int(0)) = canon(engine, arg) {
            return Err(EvalError::DivideByZero);
        }
    }
    fold_arith("/", engine, args, i64::checked_div, |a, b| a / b)
}

fn native_length(_engine: &Engine, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
    match args {
        [EvalValue::Multi(items)] => Ok(EvalValue::Int(items.len() as i64)),
        [_] => Ok(EvalValue::Int(1)),
        _ => Err(EvalError::WrongArity("length$")),
    }
}

/// Install the built-in functions; returns nothing, ids are looked up by
/// name.
pub fn register_builtins(
    atoms: &mut rule_model::atom::AtomTable,
    registry: &mut FunctionRegistry,
) {
    let builtins: [(&str, NativeFn); 14] = [
        ("eq", native_eq),
        ("neq", native_neq),
        ("and", native_and),
        ("or", native_or),
        ("not", native_not),
        ("<", native_lt),
        ("<=", native_le),
        (">", native_gt),
        (">=", native_ge),
        ("+", native_add),
        ("-", native_sub),
        ("*", native_mul),
        ("/", native_div),
        ("length$", native_length),
    ];
    for (name, handler) in builtins {
        let atom = atoms.intern_symbol(name);
        atoms.retain(atom);
        registry.register(atom, handler);
    }
}

//! Hashed-expression pool chunk
//!
//! Every interned tree is written as a run of flat node records; the tree's
//! dense id is its root node's index, assigned as a running count during
//! the find phase (each tree advances the count by its node total).
//! Pointer fields become node indices; function references are encoded by
//! name atom and re-resolved against the registry on load.

use crate::codec::{ByteReader, ByteWriter};
use crate::{atom_ref, BinaryItem, ImageError, ImageResult, LoadContext};
use engine::Engine;
use rule_model::expr::{ExprId, ExprValue, HashedExprId};
use rustc_hash::FxHashMap;

const TAG_ATOM: u8 = 0;
const TAG_CALL: u8 = 1;
const TAG_GET_LHS: u8 = 2;
const TAG_GET_RHS: u8 = 3;
const TAG_SLOT_LEN: u8 = 4;

/// The hashed-expression pool binary item.
pub struct ExpressionsItem;

// Preorder node list of one tree (deterministic write order).
fn preorder(engine: &Engine, root: ExprId) -> Vec<ExprId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        out.push(id);
        let args = engine.exprs.args(id);
        for &arg in args.iter().rev() {
            stack.push(arg);
        }
    }
    out
}

impl BinaryItem for ExpressionsItem {
    fn name(&self) -> &'static str {
        "expressions"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn find(&self, engine: &mut Engine) {
        let entries: Vec<(HashedExprId, ExprId)> = engine
            .exprs
            .iter_hashed()
            .map(|(hid, entry)| (hid, entry.root))
            .collect();
        let mut count = 0u64;
        for (hid, root) in entries {
            engine.exprs.hashed_mut(hid).bsave_id = count;
            count += engine.exprs.size(root) as u64;

            // Mark the atoms (and function-name atoms) the tree references.
            let nodes = preorder(engine, root);
            for node in nodes {
                match engine.exprs.node(node).value {
                    ExprValue::Atom(atom) => engine.atoms.mark_needed(atom),
                    ExprValue::Call(func) => {
                        if let Some(def) = engine.functions.get(func) {
                            let name = def.name;
                            engine.atoms.mark_needed(name);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        let node_count: u64 = engine
            .exprs
            .iter_hashed()
            .map(|(_, entry)| engine.exprs.size(entry.root) as u64)
            .sum();
        writer.u64(node_count);
        writer.u64(engine.exprs.hashed_len() as u64);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        let mut roots: Vec<u64> = Vec::with_capacity(engine.exprs.hashed_len());

        for (_, entry) in engine.exprs.iter_hashed() {
            let base = entry.bsave_id;
            roots.push(base);
            let nodes = preorder(engine, entry.root);
            let mut index_of: FxHashMap<ExprId, u64> = FxHashMap::default();
            for (position, &node) in nodes.iter().enumerate() {
                index_of.insert(node, base + position as u64);
            }
            for &node_id in &nodes {
                let node = engine.exprs.node(node_id);
                match node.value {
                    ExprValue::Atom(atom) => {
                        writer.u8(TAG_ATOM);
                        writer.u64(atom_ref(engine, atom));
                    }
                    ExprValue::Call(func) => {
                        writer.u8(TAG_CALL);
                        let name_ref = engine
                            .functions
                            .get(func)
                            .map(|def| atom_ref(engine, def.name))
                            .unwrap_or(u64::MAX);
                        writer.u64(name_ref);
                    }
                    ExprValue::GetLhsField {
                        pattern,
                        slot,
                        field,
                    } => {
                        writer.u8(TAG_GET_LHS);
                        writer.u16(pattern);
                        writer.u16(slot);
                        writer.u16(field);
                    }
                    ExprValue::GetRhsField { slot, field } => {
                        writer.u8(TAG_GET_RHS);
                        writer.u16(slot);
                        writer.u16(field);
                    }
                    ExprValue::RhsSlotLength { slot } => {
                        writer.u8(TAG_SLOT_LEN);
                        writer.u16(slot);
                    }
                }
                writer.id(node.first_arg.map(|arg| index_of[&arg]));
                writer.id(node.next_arg.map(|arg| index_of[&arg]));
            }
        }

        for root in roots {
            writer.u64(root);
        }
    }

    fn read_storage(
        &self,
        _engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        ctx.pending_primary = reader.u64()?;
        ctx.pending_secondary = reader.u64()?;
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let node_count = ctx.pending_primary as usize;
        let hashed_count = ctx.pending_secondary as usize;

        // First pass: nodes with unresolved links.
        let mut links: Vec<(Option<u64>, Option<u64>)> = Vec::with_capacity(node_count);
        ctx.expr_nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let tag = reader.u8()?;
            let value = match tag {
                TAG_ATOM => {
                    let atom = ctx.atom(reader.u64()?)?;
                    ExprValue::Atom(atom)
                }
                TAG_CALL => {
                    let name = ctx.atom(reader.u64()?)?;
                    let func = engine.functions.lookup(name).ok_or_else(|| {
                        ImageError::Corrupt("unknown function in expression".to_owned())
                    })?;
                    ExprValue::Call(func)
                }
                TAG_GET_LHS => ExprValue::GetLhsField {
                    pattern: reader.u16()?,
                    slot: reader.u16()?,
                    field: reader.u16()?,
                },
                TAG_GET_RHS => ExprValue::GetRhsField {
                    slot: reader.u16()?,
                    field: reader.u16()?,
                },
                TAG_SLOT_LEN => ExprValue::RhsSlotLength {
                    slot: reader.u16()?,
                },
                other => {
                    return Err(ImageError::Corrupt(format!(
                        "unknown expression tag {other}"
                    )))
                }
            };
            links.push((reader.id()?, reader.id()?));
            ctx.expr_nodes.push(engine.exprs.alloc(value));
        }

        // Second pass: index fix-up of the link fields.
        for (position, (first, next)) in links.into_iter().enumerate() {
            let node = ctx.expr_nodes[position];
            let first = first
                .map(|id| {
                    ctx.expr_nodes
                        .get(id as usize)
                        .copied()
                        .ok_or_else(|| ImageError::Corrupt("expression link out of range".into()))
                })
                .transpose()?;
            let next = next
                .map(|id| {
                    ctx.expr_nodes
                        .get(id as usize)
                        .copied()
                        .ok_or_else(|| ImageError::Corrupt("expression link out of range".into()))
                })
                .transpose()?;
            let node = engine.exprs.node_mut(node);
            node.first_arg = first;
            node.next_arg = next;
        }

        // Roots: intern each tree (installing its atoms); references later
        // take their own counts, and the interning handles are dropped by
        // the after-load hooks.
        for _ in 0..hashed_count {
            let root_id = reader.u64()?;
            let root = ctx
                .expr_nodes
                .get(root_id as usize)
                .copied()
                .ok_or_else(|| ImageError::Corrupt("expression root out of range".into()))?;
            let hid = engine.exprs.intern(root, &mut engine.atoms);
            ctx.hashed_roots.insert(root_id, hid);
            ctx.root_handles.push(hid);
        }
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        engine.atoms.sweep();
    }
}

//! Atom-table chunk: the first chunk of every image
//!
//! Only atoms marked `needed` during the find phase are written. The dense
//! id of an atom is its position in the written stream (kind-major, slot
//! order within a kind); buckets are re-derived on load by re-interning.

use crate::codec::{ByteReader, ByteWriter};
use crate::{ImageError, ImageResult, LoadContext};
use engine::Engine;
use rule_model::atom::{AtomId, AtomKind, AtomValue};

const KIND_ORDER: [AtomKind; 7] = [
    AtomKind::Symbol,
    AtomKind::String,
    AtomKind::InstanceName,
    AtomKind::Integer,
    AtomKind::Float,
    AtomKind::Bitmap,
    AtomKind::ExternalAddress,
];

/// Assign dense ids to every needed atom; returns the total count.
pub(crate) fn assign_atom_ids(engine: &mut Engine) -> u64 {
    let mut next = 0u64;
    for kind in KIND_ORDER {
        let ids: Vec<AtomId> = engine
            .atoms
            .iter_kind(kind)
            .filter(|(_, cell)| cell.needed)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            if let Some(cell) = engine.atoms.get_mut(id) {
                cell.bsave_id = next;
                next += 1;
            }
        }
    }
    next
}

/// Write the atom tables (storage: counts; data: payloads).
pub fn write_atom_tables(
    engine: &Engine,
    total: u64,
    storage: &mut ByteWriter,
    data: &mut ByteWriter,
) {
    storage.u64(total);
    for kind in KIND_ORDER {
        let count = engine
            .atoms
            .iter_kind(kind)
            .filter(|(_, cell)| cell.needed)
            .count() as u64;
        storage.u64(count);
    }

    for kind in KIND_ORDER {
        for (_, cell) in engine.atoms.iter_kind(kind).filter(|(_, c)| c.needed) {
            match &cell.value {
                AtomValue::Lexeme { text, .. } => data.str(text),
                AtomValue::Integer(v) => data.i64(*v),
                AtomValue::Float(v) => data.f64(*v),
                AtomValue::Bitmap(bytes) => data.bytes(bytes),
                AtomValue::External { handle, subtype } => {
                    data.u64(*handle);
                    data.u16(*subtype);
                }
            }
        }
    }
}

/// Read the atom tables, re-interning each payload. The dense id of an atom
/// is its stream position; hitting an already-interned value maps the id to
/// the existing atom.
pub(crate) fn read_atom_tables(
    engine: &mut Engine,
    ctx: &mut LoadContext,
    storage: &mut ByteReader<'_>,
    data: &mut ByteReader<'_>,
) -> ImageResult<()> {
    let total = storage.u64()? as usize;
    let mut per_kind = [0u64; 7];
    for slot in &mut per_kind {
        *slot = storage.u64()?;
    }
    if per_kind.iter().sum::<u64>() as usize != total {
        return Err(ImageError::Corrupt("atom counts disagree".to_owned()));
    }

    ctx.atoms = Vec::with_capacity(total);
    for (index, kind) in KIND_ORDER.iter().enumerate() {
        for _ in 0..per_kind[index] {
            let id = match kind {
                AtomKind::Symbol => {
                    let text = data.str()?.to_owned();
                    engine.atoms.intern_symbol(&text)
                }
                AtomKind::String => {
                    let text = data.str()?.to_owned();
                    engine.atoms.intern_string(&text)
                }
                AtomKind::InstanceName => {
                    let text = data.str()?.to_owned();
                    engine.atoms.intern_instance_name(&text)
                }
                AtomKind::Integer => {
                    let value = data.i64()?;
                    engine.atoms.intern_integer(value)
                }
                AtomKind::Float => {
                    let value = data.f64()?;
                    engine.atoms.intern_float(value)
                }
                AtomKind::Bitmap => {
                    let bytes = data.bytes()?.to_vec();
                    engine.atoms.intern_bitmap(&bytes)
                }
                AtomKind::ExternalAddress => {
                    let handle = data.u64()?;
                    let subtype = data.u16()?;
                    engine.atoms.intern_external(handle, subtype)
                }
            };
            ctx.atoms.push(id);
        }
    }
    Ok(())
}

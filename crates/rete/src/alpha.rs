//! Alpha terminals: leaves of the pattern network owning the alpha memories

use crate::join::{BetaMemory, JoinId};
use crate::pattern::PatternNodeId;
use rule_model::arena::Id;
use rule_model::atom::{AtomId, NULL_ID};
use rule_model::expr::HashedExprId;
use rule_model::template::TemplateId;

/// Handle to an alpha terminal.
pub type TerminalId = Id<AlphaTerminal>;

/// Leaf of the pattern network.
///
/// Identity is the {class bitmap, slot bitmap, right-hash} triple: two
/// patterns ending at the same leaf with the same triple share one terminal
/// and one alpha memory.
pub struct AlphaTerminal {
    /// Leaf pattern node this terminal hangs off
    pub pattern_node: PatternNodeId,
    /// Template this terminal matches (facts match exactly one)
    pub template: TemplateId,
    /// Bitmap atom with one bit per applicable template
    pub class_bitmap: AtomId,
    /// Bitmap atom with one bit per tested slot, when slot-scoped
    pub slot_bitmap: Option<AtomId>,
    /// Hash expression bucketing the alpha memory
    pub right_hash: Option<HashedExprId>,
    /// Alpha memory: arity-1 right-side partial matches
    pub memory: BetaMemory,
    /// Joins using this terminal as their right input, in sibling order
    pub joins: Vec<JoinId>,
    /// Number of rule patterns sharing this terminal
    pub use_count: u32,
    /// Incremental-reset mark
    pub initialize: bool,
    /// Dense id assigned transiently during save; [`NULL_ID`] otherwise
    pub bsave_id: u64,
}

impl AlphaTerminal {
    /// Fresh terminal with an empty memory.
    pub fn new(
        pattern_node: PatternNodeId,
        template: TemplateId,
        class_bitmap: AtomId,
        slot_bitmap: Option<AtomId>,
        right_hash: Option<HashedExprId>,
    ) -> Self {
        let hashed = right_hash.is_some();
        Self {
            pattern_node,
            template,
            class_bitmap,
            slot_bitmap,
            right_hash,
            memory: BetaMemory::new(hashed),
            joins: Vec::new(),
            use_count: 1,
            initialize: false,
            bsave_id: NULL_ID,
        }
    }
}

/// Build the class-bitmap byte string for a set of template bit indexes.
pub fn bitmap_bytes(bits: &[usize]) -> Vec<u8> {
    let max = bits.iter().copied().max().unwrap_or(0);
    let mut bytes = vec![0u8; max / 8 + 1];
    for &bit in bits {
        bytes[bit / 8] |= 1 << (bit % 8);
    }
    bytes
}

/// True when `bit` is set in a bitmap byte string.
pub fn bitmap_bit_set(bytes: &[u8], bit: usize) -> bool {
    bytes
        .get(bit / 8)
        .map(|b| b & (1 << (bit % 8)) != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_round_trip() {
        let bytes = bitmap_bytes(&[0, 3, 9]);
        assert!(bitmap_bit_set(&bytes, 0));
        assert!(bitmap_bit_set(&bytes, 3));
        assert!(bitmap_bit_set(&bytes, 9));
        assert!(!bitmap_bit_set(&bytes, 1));
        assert!(!bitmap_bit_set(&bytes, 100));
    }
}

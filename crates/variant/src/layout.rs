//! Code-cache layout: trampoline placement and randomized block packing.
//!
//! One cache buffer is arranged in three zones. The fixed zone mirrors the
//! original file offsets of every position-fixed block and carries a
//! trampoline per entry, so external code branching to an original offset
//! lands on a jump to the relocated body. The jump-target zone, separated by
//! a fixed gap, carries one trampoline per unique switch-case target; blocks
//! dispatching through a table slide their computed target into this zone.
//! Everything after that is the block pool in a seeded random permutation.
//!
//! All addresses in this module are cache-relative byte offsets; the mapping
//! to process addresses happens in the manager.

use crate::encode::{
    self, invalid_instr, jump_rel32, jump_rel8, write_bytes, JMP32_LEN, JMP8_LEN,
    OVERLAP_JMP32_LEN,
};
use crate::rbbl::RandomBlock;
use crate::result::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Distance between the fixed-trampoline zone and the jump-target zone.
/// Keeps backward displacement searches in the second zone from aliasing
/// slots of the first while their sign bytes are being matched.
pub const TRAMP_GAP: u64 = 0x100;

/// What one layout range holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Marker at the buffer base terminating backward searches.
    Boundary,
    /// Faulting filler standing in for an unplaceable trampoline.
    InvalidFiller,
    /// Short jump chaining toward a rel32-capable slot.
    Trampoline8 { dest: u64 },
    /// Near jump to the relocated body of `target`.
    Trampoline32 { target: u64 },
    /// Four-byte slot whose rel32 high byte is shared with the following
    /// range; jumps to a regular trampoline at `dest`.
    OverlapTrampoline32 { dest: u64 },
    /// Relocated body of the block at original offset `offset`.
    Block { offset: u64 },
}

/// Ordered map of non-overlapping address ranges to placements.
#[derive(Debug, Default)]
pub struct CacheLayout {
    spans: BTreeMap<u64, (u64, Placement)>,
}

impl CacheLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `[start, start+len)` for a placement; ranges never overlap.
    pub fn insert(&mut self, start: u64, len: u64, placement: Placement) -> Result<()> {
        let end = start + len;
        if let Some((_, &(prev_end, _))) = self.spans.range(..=start).next_back() {
            if prev_end > start {
                return Err(Error::LayoutOverlap(start));
            }
        }
        if let Some((&next_start, _)) = self.spans.range(start..).next() {
            if next_start < end {
                return Err(Error::LayoutOverlap(start));
            }
        }
        self.spans.insert(start, (end, placement));
        Ok(())
    }

    pub fn remove(&mut self, start: u64) -> Option<Placement> {
        self.spans.remove(&start).map(|(_, p)| p)
    }

    /// The span covering `addr`, as `(start, end, placement)`.
    pub fn covering(&self, addr: u64) -> Option<(u64, u64, Placement)> {
        self.spans
            .range(..=addr)
            .next_back()
            .filter(|(_, &(end, _))| addr < end)
            .map(|(&start, &(end, p))| (start, end, p))
    }

    /// Spans in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, Placement)> + '_ {
        self.spans.iter().map(|(&s, &(e, p))| (s, e, p))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    fn set_jump_dest(&mut self, start: u64, new_dest: u64) {
        if let Some((_, placement)) = self.spans.get_mut(&start) {
            match placement {
                Placement::Trampoline8 { dest } | Placement::OverlapTrampoline32 { dest } => {
                    *dest = new_dest;
                }
                _ => {}
            }
        }
    }

    /// Spans at or below `limit`, ascending.
    fn spans_through(&self, limit: u64) -> Vec<(u64, u64)> {
        self.spans
            .range(..=limit)
            .map(|(&s, &(e, _))| (s, e))
            .collect()
    }
}

/// Searches backward from an entry offset too tight for a near jump, chaining
/// short jumps through earlier gaps until a slot wide enough for a rel32
/// trampoline is reached.
///
/// On success the chain of short jumps is written and recorded, and the
/// rel32-capable slot address is returned; the caller places the trampoline
/// there. `None` means no reachable slot exists; the chain is unwound and the
/// caller degrades the entry to filler.
pub fn front_to_place_trampoline32(
    layout: &mut CacheLayout,
    buf: &mut [u8],
    entry_addr: u64,
) -> Result<Option<u64>> {
    layout.insert(entry_addr, JMP8_LEN, Placement::Trampoline8 { dest: 0 })?;
    let below = layout.spans_through(entry_addr);
    let mut placed: Vec<u64> = vec![entry_addr];

    let mut idx = below.len() - 1;
    let mut curr = below[idx];
    let mut base = entry_addr;
    // Highest rel8-capable gap seen but not yet consumed, with the scan
    // index it was found at.
    let mut relay: Option<(u64, usize)> = None;

    while idx > 0 {
        let prev = below[idx - 1];
        let gap = curr.0 - prev.1;

        if curr.0 >= JMP32_LEN {
            let cand32 = curr.0 - JMP32_LEN;
            let disp8 = cand32 as i64 - (base + JMP8_LEN) as i64;
            if gap >= JMP32_LEN && disp8 >= i8::MIN as i64 {
                write_bytes(buf, base, &jump_rel8(disp8 as i8))?;
                layout.set_jump_dest(base, cand32);
                return Ok(Some(cand32));
            }
        }

        let cand8 = curr.0.saturating_sub(JMP8_LEN);
        let relay_disp = cand8 as i64 - (base + JMP8_LEN) as i64;
        if relay_disp >= i8::MIN as i64 {
            if gap >= JMP8_LEN && curr.0 >= JMP8_LEN {
                relay = Some((cand8, idx));
            }
            idx -= 1;
            curr = prev;
        } else {
            let Some((relay_addr, relay_idx)) = relay.take() else {
                unwind_chain(layout, buf, &placed)?;
                return Ok(None);
            };
            let disp = relay_addr as i64 - (base + JMP8_LEN) as i64;
            write_bytes(buf, base, &jump_rel8(disp as i8))?;
            layout.set_jump_dest(base, relay_addr);
            layout.insert(relay_addr, JMP8_LEN, Placement::Trampoline8 { dest: 0 })?;
            placed.push(relay_addr);
            base = relay_addr;
            idx = relay_idx;
            curr = (relay_addr, relay_addr + JMP8_LEN);
        }
    }

    // Ran into the boundary without finding a rel32-capable slot.
    unwind_chain(layout, buf, &placed)?;
    Ok(None)
}

fn unwind_chain(layout: &mut CacheLayout, buf: &mut [u8], placed: &[u64]) -> Result<()> {
    for &addr in placed {
        layout.remove(addr);
        write_bytes(buf, addr, &invalid_instr())?;
        write_bytes(buf, addr + 1, &invalid_instr())?;
    }
    Ok(())
}

/// Places a four-byte trampoline at `overlap_addr` whose rel32 high byte must
/// equal `required_byte` (the shared fifth byte belongs to the following
/// range). Scans backward for a gap wide enough for the rel32 trampoline the
/// overlap jump will land on, trying candidate addresses until the
/// displacement's high byte matches. Returns the slot for the caller to fill.
pub fn front_to_place_overlap_trampoline32(
    layout: &mut CacheLayout,
    buf: &mut [u8],
    overlap_addr: u64,
    required_byte: u8,
) -> Result<Option<u64>> {
    layout.insert(
        overlap_addr,
        OVERLAP_JMP32_LEN,
        Placement::OverlapTrampoline32 { dest: 0 },
    )?;
    let below = layout.spans_through(overlap_addr);

    let mut idx = below.len() - 1;
    while idx > 0 {
        let curr = below[idx];
        let prev = below[idx - 1];
        let gap = curr.0 - prev.1;
        if gap >= JMP32_LEN {
            let mut cand = curr.0 - JMP32_LEN;
            loop {
                let disp = cand as i64 - (overlap_addr + JMP32_LEN) as i64;
                if ((disp >> 24) & 0xff) as u8 == required_byte {
                    let enc = jump_rel32(disp as i32);
                    write_bytes(buf, overlap_addr, &enc[..OVERLAP_JMP32_LEN as usize])?;
                    layout.set_jump_dest(overlap_addr, cand);
                    return Ok(Some(cand));
                }
                if cand == prev.1 {
                    break;
                }
                cand -= 1;
            }
        }
        idx -= 1;
    }

    layout.remove(overlap_addr);
    Ok(None)
}

/// Everything the layout pass needs for one module.
pub struct LayoutInputs<'a> {
    /// Position-fixed block templates keyed by original offset.
    pub fixed: &'a BTreeMap<u64, RandomBlock>,
    /// Movable block templates keyed by original offset.
    pub movable: &'a BTreeMap<u64, RandomBlock>,
    /// Switch-jump block offset to its resolved target set.
    pub switch_jumps: &'a BTreeMap<u64, BTreeSet<u64>>,
    /// Offset from the module's executable mapping to its code cache.
    pub cc_offset: u64,
}

/// Finished layout for one cache buffer.
#[derive(Debug, Default)]
pub struct LayoutResult {
    pub layout: CacheLayout,
    /// Original block offset to cache-relative placement. Lock/repeat
    /// prefixed blocks carry a second entry at `offset + 1`.
    pub block_sites: BTreeMap<u64, u64>,
    /// Switch-jump block offset to the additive slide that moves its computed
    /// dispatch target into the jump-target zone.
    pub zone_slides: BTreeMap<u64, u64>,
    /// First unused byte of the buffer.
    pub used: u64,
}

/// Arranges one cache buffer: boundary, fixed-entry trampolines, the
/// jump-target zone, then every block in a seeded random permutation.
///
/// The buffer must already be cleared to filler; this pass writes only the
/// placements it records. Trampoline32 bytes are written by the relocation
/// pass once final block addresses exist.
pub fn arrange(buf: &mut [u8], inputs: &LayoutInputs, rng: &mut StdRng) -> Result<LayoutResult> {
    let mut layout = CacheLayout::new();

    write_bytes(buf, 0, &invalid_instr())?;
    layout.insert(0, 1, Placement::Boundary)?;
    let mut used: u64 = 1;

    // Fixed zone: one trampoline per position-fixed entry, at its original
    // offset when the gap to the next entry allows.
    let fixed_offsets: Vec<u64> = inputs.fixed.keys().copied().collect();
    for (i, &off) in fixed_offsets.iter().enumerate() {
        let next = fixed_offsets
            .get(i + 1)
            .copied()
            .unwrap_or(off + JMP32_LEN);
        used = place_entry_trampoline(&mut layout, buf, off, off, next - off)?;
    }

    // Jump-target zone: one trampoline per unique switch-case target, past a
    // fixed gap. Every switch jump records the same additive slide.
    let zone = used + TRAMP_GAP;
    let mut zone_slides = BTreeMap::new();
    let mut merged: BTreeSet<u64> = BTreeSet::new();
    for (&jump_block, targets) in inputs.switch_jumps {
        zone_slides.insert(jump_block, inputs.cc_offset + zone);
        merged.extend(targets.iter().copied());
    }
    let zone_offsets: Vec<u64> = merged.into_iter().collect();
    for (i, &off) in zone_offsets.iter().enumerate() {
        let next = zone_offsets
            .get(i + 1)
            .copied()
            .unwrap_or(off + JMP32_LEN);
        used = place_entry_trampoline(&mut layout, buf, zone + off, off, next - off)?;
    }

    // Block pool: a uniform random permutation over every template, fixed
    // bodies included.
    let mut pool: Vec<&RandomBlock> = inputs
        .fixed
        .values()
        .chain(inputs.movable.values())
        .collect();
    pool.shuffle(rng);

    let mut block_sites = BTreeMap::new();
    let mut cursor = used;
    for block in pool {
        block_sites.insert(block.offset, cursor);
        if block.has_lock_or_rep {
            // Branches may land after the prefix byte.
            block_sites.insert(block.offset + 1, cursor + 1);
        }
        layout.insert(cursor, block.size(), Placement::Block { offset: block.offset })?;
        cursor += block.size();
    }

    if cursor > buf.len() as u64 {
        return Err(Error::CacheCapacityExceeded {
            needed: cursor,
            capacity: buf.len() as u64,
        });
    }

    debug!(
        spans = layout.len(),
        used = cursor,
        capacity = buf.len(),
        "arranged cache layout"
    );
    Ok(LayoutResult {
        layout,
        block_sites,
        zone_slides,
        used: cursor,
    })
}

/// Places one entry trampoline at `addr` (for original offset `target`),
/// given `gap` bytes before the next reserved entry. Falls back to the
/// backward search, then to filler. Returns the updated zone cursor.
fn place_entry_trampoline(
    layout: &mut CacheLayout,
    buf: &mut [u8],
    addr: u64,
    target: u64,
    gap: u64,
) -> Result<u64> {
    if gap >= JMP32_LEN {
        layout.insert(addr, JMP32_LEN, Placement::Trampoline32 { target })?;
        return Ok(addr + JMP32_LEN);
    }
    if gap >= JMP8_LEN {
        if let Some(slot) = front_to_place_trampoline32(layout, buf, addr)? {
            layout.insert(slot, JMP32_LEN, Placement::Trampoline32 { target })?;
            return Ok(addr + gap);
        }
    }
    warn!(
        offset = target,
        at = addr,
        gap,
        "no room for an entry trampoline; placing filler, entry degraded"
    );
    write_bytes(buf, addr, &invalid_instr())?;
    layout.insert(addr, 1, Placement::InvalidFiller)?;
    Ok(addr + gap)
}

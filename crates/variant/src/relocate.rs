//! Relocation pass: walks a finished layout and emits final bytes.
//!
//! Trampoline32 displacements can only be computed once every block has a
//! recorded placement, so the layout pass defers them here. Short and overlap
//! trampolines were fully encoded when placed. Block slots invoke template
//! generation against their final address, handing switch-jump blocks the
//! dispatch slide into the jump-target zone.

use crate::encode;
use crate::layout::{LayoutResult, Placement};
use crate::rbbl::{BlockTemplates, GenContext};
use crate::result::{Error, Result};
use tracing::debug;

/// Patches every trampoline and generates every block in address order.
pub fn relocate(
    buf: &mut [u8],
    arranged: &LayoutResult,
    templates: &BlockTemplates,
    ctx: &GenContext,
) -> Result<()> {
    let mut trampolines = 0usize;
    let mut blocks = 0usize;
    for (start, _, placement) in arranged.layout.iter() {
        match placement {
            Placement::Boundary
            | Placement::InvalidFiller
            | Placement::Trampoline8 { .. }
            | Placement::OverlapTrampoline32 { .. } => {}
            Placement::Trampoline32 { target } => {
                let site = arranged
                    .block_sites
                    .get(&target)
                    .copied()
                    .ok_or(Error::MissingBlockLocation(target))?;
                let disp = encode::rel32_to(start, site)?;
                encode::write_bytes(buf, start, &encode::jump_rel32(disp))?;
                trampolines += 1;
            }
            Placement::Block { offset } => {
                let template = templates
                    .get(offset)
                    .ok_or(Error::MissingBlockLocation(offset))?;
                let slide = arranged.zone_slides.get(&offset).copied();
                template.generate(buf, start, ctx, slide)?;
                blocks += 1;
            }
        }
    }
    debug!(trampolines, blocks, "relocated cache buffer");
    Ok(())
}

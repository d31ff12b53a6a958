//! x86-64 branch templates used by the layout and relocation passes.

use crate::result::{Error, Result};

/// Encoded length of `jmp rel8`.
pub const JMP8_LEN: u64 = 2;
/// Encoded length of `jmp rel32`.
pub const JMP32_LEN: u64 = 5;
/// Span reserved for an overlap trampoline; its fifth byte is shared with
/// the following placement.
pub const OVERLAP_JMP32_LEN: u64 = 4;

pub const JMP8_OPCODE: u8 = 0xeb;
pub const JMP32_OPCODE: u8 = 0xe9;
pub const CALL32_OPCODE: u8 = 0xe8;

/// `jmp rel8`.
pub fn jump_rel8(disp: i8) -> [u8; 2] {
    [JMP8_OPCODE, disp as u8]
}

/// `jmp rel32`.
pub fn jump_rel32(disp: i32) -> [u8; 5] {
    let d = disp.to_le_bytes();
    [JMP32_OPCODE, d[0], d[1], d[2], d[3]]
}

/// The filler instruction the cache is cleared with. `hlt` faults in user
/// mode, so a stray jump into unused cache bytes traps instead of executing
/// garbage. Single-byte, so it fits any gap the layout cannot use.
pub fn invalid_instr() -> [u8; 1] {
    [0xf4]
}

/// `jmp reg` for the given register number (REX.B extended).
pub fn jump_reg(reg: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    if reg >= 8 {
        out.push(0x41);
    }
    out.push(0xff);
    out.push(0xe0 | (reg & 7));
    out
}

/// `lea reg, [reg + disp32]`, used to slide a computed dispatch target into
/// the jump-target zone. Returns the bytes and the displacement position.
pub fn lea_reg_disp32(reg: u8) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(8);
    let ext = if reg >= 8 { 0x05 } else { 0x00 };
    out.push(0x48 | ext);
    out.push(0x8d);
    out.push(0x80 | ((reg & 7) << 3) | (reg & 7));
    if reg & 7 == 4 {
        // rsp/r12 need a SIB byte.
        out.push(0x24);
    }
    let pos = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    (out, pos)
}

/// Checked rel32 between the end of a 5-byte jump at `at` and `target`.
pub fn rel32_to(at: u64, target: u64) -> Result<i32> {
    let disp = target as i64 - (at + JMP32_LEN) as i64;
    i32::try_from(disp).map_err(|_| Error::DisplacementOutOfRange {
        at,
        displacement: disp,
    })
}

/// Writes `bytes` into the buffer at `at`, bounds-checked against the cache.
pub fn write_bytes(buf: &mut [u8], at: u64, bytes: &[u8]) -> Result<()> {
    let start = at as usize;
    let end = start
        .checked_add(bytes.len())
        .filter(|&e| e <= buf.len())
        .ok_or(Error::CacheWrite {
            at,
            len: bytes.len(),
        })?;
    buf[start..end].copy_from_slice(bytes);
    Ok(())
}

/// Patches a little-endian i32 at `pos` inside the buffer.
pub fn patch_disp32(buf: &mut [u8], pos: u64, disp: i32) -> Result<()> {
    write_bytes(buf, pos, &disp.to_le_bytes())
}

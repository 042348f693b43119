//! String instructions (§4.2): MOVS, STOS, and their REP-prefixed repeated
//! forms. Only the memory-to-memory/accumulator-to-memory shapes this core
//! targets are implemented; segment overrides other than the default
//! DS:RSI/ES:RDI pair are not modeled since the guest programs in scope run
//! flat-mapped.

use crate::error::Result;
use crate::memory::Memory;
use crate::registers::{GpRegisters, Width, RDI, RSI};

/// `+1` or `-1` word-steps per iteration, in bytes, according to the
/// direction flag.
fn step(width: Width, df: bool) -> i64 {
    let n = width.bytes() as i64;
    if df {
        -n
    } else {
        n
    }
}

/// MOVS — copy `width` bytes from `[RSI]` to `[RDI]`, advancing both by
/// `±width` per §4.2's direction-flag rule.
pub fn movs(mem: &mut Memory, regs: &mut GpRegisters, width: Width, df: bool, rip: u64) -> Result<()> {
    let src = regs.read64(RSI);
    let dst = regs.read64(RDI);
    let v = match width {
        Width::W8 => mem.read_u8(src, rip)? as u64,
        Width::W16 => mem.read_u16(src, rip)? as u64,
        Width::W32 => mem.read_u32(src, rip)? as u64,
        Width::W64 => mem.read_u64(src, rip)?,
    };
    match width {
        Width::W8 => mem.write_u8(dst, v as u8, rip)?,
        Width::W16 => mem.write_u16(dst, v as u16, rip)?,
        Width::W32 => mem.write_u32(dst, v as u32, rip)?,
        Width::W64 => mem.write_u64(dst, v, rip)?,
    }
    let s = step(width, df);
    regs.write64(RSI, (src as i64 + s) as u64);
    regs.write64(RDI, (dst as i64 + s) as u64);
    Ok(())
}

/// STOS — store the accumulator (`AL`/`AX`/`EAX`/`RAX`) to `[RDI]`,
/// advancing RDI.
pub fn stos(mem: &mut Memory, regs: &mut GpRegisters, width: Width, df: bool, rip: u64) -> Result<()> {
    let dst = regs.read64(RDI);
    let acc = regs.read(0, width);
    match width {
        Width::W8 => mem.write_u8(dst, acc as u8, rip)?,
        Width::W16 => mem.write_u16(dst, acc as u16, rip)?,
        Width::W32 => mem.write_u32(dst, acc as u32, rip)?,
        Width::W64 => mem.write_u64(dst, acc, rip)?,
    }
    let s = step(width, df);
    regs.write64(RDI, (dst as i64 + s) as u64);
    Ok(())
}

/// Run `op` up to `RCX` times, decrementing `RCX` after each iteration, per
/// the REP prefix's repetition rule. `RCX == 0` on entry performs zero
/// iterations — the decrement-then-test ordering the ISA mandates doesn't
/// apply to MOVS/STOS since they carry no flag-based early exit (that's
/// REPE/REPNE's CMPS/SCAS behavior, out of scope for this core).
pub fn rep<F>(regs: &mut GpRegisters, mut op: F) -> Result<()>
where
    F: FnMut(&mut GpRegisters) -> Result<()>,
{
    const RCX: usize = 1;
    while regs.read64(RCX) != 0 {
        op(regs)?;
        regs.write64(RCX, regs.read64(RCX) - 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movs_advances_forward_without_df() {
        let mut backing = vec![0u8; 32];
        backing[0] = 0xAB;
        let mut mem = Memory::new(&mut backing, true);
        let mut regs = GpRegisters::new();
        regs.write64(RSI, 0);
        regs.write64(RDI, 16);
        movs(&mut mem, &mut regs, Width::W8, false, 0).unwrap();
        assert_eq!(mem.read_u8(16, 0).unwrap(), 0xAB);
        assert_eq!(regs.read64(RSI), 1);
        assert_eq!(regs.read64(RDI), 17);
    }

    #[test]
    fn movs_retreats_with_df_set() {
        let mut backing = vec![0u8; 32];
        let mut mem = Memory::new(&mut backing, true);
        let mut regs = GpRegisters::new();
        regs.write64(RSI, 8);
        regs.write64(RDI, 20);
        movs(&mut mem, &mut regs, Width::W32, true, 0).unwrap();
        assert_eq!(regs.read64(RSI), 4);
        assert_eq!(regs.read64(RDI), 16);
    }

    #[test]
    fn rep_stos_fills_rcx_elements() {
        let mut backing = vec![0u8; 64];
        let mut mem = Memory::new(&mut backing, true);
        let mut regs = GpRegisters::new();
        regs.write64(0, 0x7a); // rax == fill byte
        regs.write64(RDI, 0);
        regs.write64(1, 5); // rcx
        rep(&mut regs, |r| stos(&mut mem, r, Width::W8, false, 0)).unwrap();
        assert_eq!(regs.read64(1), 0);
        assert_eq!(regs.read64(RDI), 5);
    }
}

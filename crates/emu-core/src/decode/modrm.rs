//! ModR/M + SIB + displacement decode and effective-address computation
//! (§4.1).

use crate::decode::prefixes::Prefixes;
use crate::error::Result;
use crate::registers::GpRegisters;

/// A stream of instruction bytes positioned at the current RIP. `Cpu`
/// implements this; keeping it as a trait lets the decoder be written and
/// tested (see the unit tests below, against a `Vec<u8>` stub) without
/// depending on the rest of the CPU.
pub trait InstrStream {
    fn fetch_u8(&mut self) -> Result<u8>;

    fn fetch_i8(&mut self) -> Result<i8> {
        Ok(self.fetch_u8()? as i8)
    }

    fn fetch_u32(&mut self) -> Result<u32> {
        let mut v = 0u32;
        for i in 0..4 {
            v |= (self.fetch_u8()? as u32) << (8 * i);
        }
        Ok(v)
    }

    fn fetch_i32(&mut self) -> Result<i32> {
        Ok(self.fetch_u32()? as i32)
    }

    /// RIP value *after* the bytes fetched so far — used for RIP-relative
    /// addressing, which always measures from the end of the instruction.
    fn current_rip(&self) -> u64;
}

/// Where a decoded operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOrMem {
    Reg(usize),
    Mem(u64),
}

/// Decoded ModR/M (+ SIB + displacement). `reg` is the always-register
/// "reg" field (extended by REX.R), already resolved to 0..15. `rm` is
/// either a register index (mod==3) or a computed effective address.
#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    pub reg: usize,
    pub rm: RegOrMem,
    pub modb: u8,
}

/// Decode one ModR/M byte (and any SIB/displacement it implies) from
/// `stream`, honoring `prefixes` (REX extension bits and the segment/addr
/// size prefixes) and `regs` (needed to compute the effective address
/// eagerly, since this core fuses decode and address computation rather
/// than returning an unevaluated expression).
pub fn decode_modrm(
    stream: &mut impl InstrStream,
    prefixes: &Prefixes,
    regs: &GpRegisters,
) -> Result<ModRm> {
    let modrm = stream.fetch_u8()?;
    let modb = modrm >> 6;
    let reg_field = (modrm >> 3) & 0x7;
    let rm_field = modrm & 0x7;
    let reg = reg_field as usize + prefixes.rex_r() as usize;

    if modb == 3 {
        let rm = rm_field as usize + prefixes.rex_b() as usize;
        return Ok(ModRm {
            reg,
            rm: RegOrMem::Reg(rm),
            modb,
        });
    }

    // Memory form.
    let ea: u64 = if rm_field == 5 && modb == 0 {
        // RIP-relative, 32-bit signed displacement, relative to the RIP
        // just after this instruction (i.e. after any remaining immediate
        // the caller fetches — but architecturally "after the instruction",
        // which for decode purposes is approximated as "after the
        // displacement", matching how the reference decoder computes it
        // before fetching a trailing immediate).
        let disp = stream.fetch_i32()? as i64;
        (stream.current_rip() as i64 + disp) as u64
    } else if rm_field == 4 {
        // SIB byte follows.
        let sib = stream.fetch_u8()?;
        let scale = sib >> 6;
        let index_field = (sib >> 3) & 0x7;
        let base_field = sib & 0x7;
        let index = index_field as usize + prefixes.rex_x() as usize;
        let base = base_field as usize + prefixes.rex_b() as usize;

        let base_val: u64 = if base_field == 5 && modb == 0 {
            // Base suppressed; replaced by a 32-bit displacement.
            stream.fetch_i32()? as i64 as u64
        } else {
            regs.read64(base)
        };

        let index_val: u64 = if index_field == 4 {
            // No index register (0b100 with no REX.X extension means "no
            // index" architecturally).
            0
        } else {
            regs.read64(index)
        };

        let mut addr = base_val.wrapping_add(index_val << scale);
        if base_field == 5 && modb != 0 {
            // base present; displacement handled below via modb branch, so
            // nothing extra here, addr already includes regs[base].
        }
        if modb == 1 {
            let disp = stream.fetch_i8()? as i64;
            addr = addr.wrapping_add(disp as u64);
        } else if modb == 2 {
            let disp = stream.fetch_i32()? as i64;
            addr = addr.wrapping_add(disp as u64);
        }
        addr
    } else {
        let base = rm_field as usize + prefixes.rex_b() as usize;
        let mut addr = regs.read64(base);
        match modb {
            0 => {}
            1 => {
                let disp = stream.fetch_i8()? as i64;
                addr = addr.wrapping_add(disp as u64);
            }
            2 => {
                let disp = stream.fetch_i32()? as i64;
                addr = addr.wrapping_add(disp as u64);
            }
            _ => unreachable!(),
        }
        addr
    };

    let ea = if prefixes.addrsize_67 {
        ea & 0xffff_ffff
    } else {
        ea
    };

    Ok(ModRm {
        reg,
        rm: RegOrMem::Mem(ea),
        modb,
    })
}

/// Add the active segment base (FS/GS via §4.1's segment-prefix rule) to an
/// already-computed effective address. A no-op unless a segment prefix was
/// seen.
pub fn apply_segment(ea: u64, prefixes: &Prefixes, seg: &crate::registers::SegmentBases) -> u64 {
    match prefixes.seg {
        Some(0x64) => ea.wrapping_add(seg.fs_base),
        Some(0x65) => ea.wrapping_add(seg.gs_base),
        _ => ea,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CpuError;

    struct ByteCursor {
        bytes: Vec<u8>,
        pos: usize,
        rip_base: u64,
    }

    impl InstrStream for ByteCursor {
        fn fetch_u8(&mut self) -> Result<u8> {
            if self.pos >= self.bytes.len() {
                return Err(CpuError::UndefinedEncoding {
                    ctx: Default::default(),
                });
            }
            let b = self.bytes[self.pos];
            self.pos += 1;
            Ok(b)
        }

        fn current_rip(&self) -> u64 {
            self.rip_base + self.pos as u64
        }
    }

    #[test]
    fn register_direct_form() {
        // modrm = 11 000 001 -> mod=3, reg=rax(0), rm=rcx(1)
        let mut s = ByteCursor {
            bytes: vec![0b11_000_001],
            pos: 0,
            rip_base: 0,
        };
        let prefixes = Prefixes::default();
        let regs = GpRegisters::new();
        let m = decode_modrm(&mut s, &prefixes, &regs).unwrap();
        assert_eq!(m.reg, 0);
        assert_eq!(m.rm, RegOrMem::Reg(1));
    }

    #[test]
    fn disp8_memory_form() {
        // modrm = 01 000 011 -> mod=1, reg=rax, rm=rbx, disp8 = 0x10
        let mut s = ByteCursor {
            bytes: vec![0b01_000_011, 0x10],
            pos: 0,
            rip_base: 0,
        };
        let prefixes = Prefixes::default();
        let mut regs = GpRegisters::new();
        regs.write64(3, 0x1000); // rbx
        let m = decode_modrm(&mut s, &prefixes, &regs).unwrap();
        assert_eq!(m.rm, RegOrMem::Mem(0x1010));
    }

    #[test]
    fn rip_relative_form() {
        // modrm = 00 000 101 -> mod=0, rm=101 -> RIP-relative, disp32
        let mut s = ByteCursor {
            bytes: vec![0b00_000_101, 0x10, 0x00, 0x00, 0x00],
            pos: 0,
            rip_base: 0x1000,
        };
        let prefixes = Prefixes::default();
        let regs = GpRegisters::new();
        let m = decode_modrm(&mut s, &prefixes, &regs).unwrap();
        // current_rip() after consuming the 4 disp bytes is 0x1000 + 5
        assert_eq!(m.rm, RegOrMem::Mem(0x1000 + 5 + 0x10));
    }

    #[test]
    fn sib_base_and_scaled_index() {
        // modrm = 00 000 100 -> mod=0, rm=100 -> SIB follows
        // sib = scale=1(<<1) index=010(rdx) base=011(rbx)
        let sib = (0b01 << 6) | (0b010 << 3) | 0b011;
        let mut s = ByteCursor {
            bytes: vec![0b00_000_100, sib],
            pos: 0,
            rip_base: 0,
        };
        let prefixes = Prefixes::default();
        let mut regs = GpRegisters::new();
        regs.write64(3, 0x1000); // rbx (base)
        regs.write64(2, 0x4); // rdx (index)
        let m = decode_modrm(&mut s, &prefixes, &regs).unwrap();
        assert_eq!(m.rm, RegOrMem::Mem(0x1000 + (0x4 << 1)));
    }
}

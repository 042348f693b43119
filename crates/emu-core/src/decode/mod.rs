//! Instruction decode (§4.1): prefixes, opcode, ModR/M, immediates.

pub mod modrm;
pub mod prefixes;

pub use modrm::{apply_segment, decode_modrm, InstrStream, ModRm, RegOrMem};
pub use prefixes::Prefixes;

use crate::error::Result;
use crate::registers::GpRegisters;

/// A fully-fetched instruction header: every prefix byte, the (possibly
/// two-byte, 0x0F-escaped) opcode, and the ModR/M/SIB/displacement if the
/// opcode's form needs one. Immediate operands are *not* fetched here —
/// callers in `exec::*` fetch those themselves once they know the
/// instruction's shape, since the immediate's size depends on the opcode
/// and on `prefixes.opsize_66`/REX.W.
#[derive(Debug, Clone, Copy)]
pub struct DecodedHead {
    pub prefixes: Prefixes,
    /// 1 or 2 opcode bytes; `opcode[0] == 0x0f` means `opcode[1]` is the
    /// real opcode (the two-byte escape).
    pub opcode: [u8; 2],
    pub two_byte: bool,
    pub modrm: Option<ModRm>,
}

/// Accumulate prefixes, then the opcode byte(s), then (if the opcode's
/// encoding table entry says so) a ModR/M. This function only resolves
/// *whether* a ModR/M follows for the handful of opcodes this core decodes;
/// the full per-opcode dispatch lives in `exec::integer`, `exec::x87`, and
/// `exec::sse2`, which call back into `decode_modrm` directly once they've
/// matched the opcode. This entry point is used by the CPU's fetch loop to
/// get just far enough to hand off to the right executor.
pub fn fetch_prefixes_and_opcode(stream: &mut impl InstrStream) -> Result<(Prefixes, [u8; 2], bool)> {
    let mut prefixes = Prefixes::default();
    loop {
        let byte = stream.fetch_u8()?;
        if !prefixes.accept(byte) {
            if byte == 0x0f {
                let second = stream.fetch_u8()?;
                return Ok((prefixes, [byte, second], true));
            }
            return Ok((prefixes, [byte, 0], false));
        }
    }
}

/// Convenience used by one-shot tests and by executors that already know a
/// ModR/M follows.
pub fn fetch_modrm(
    stream: &mut impl InstrStream,
    prefixes: &Prefixes,
    regs: &GpRegisters,
) -> Result<ModRm> {
    decode_modrm(stream, prefixes, regs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CpuError;

    struct ByteCursor {
        bytes: Vec<u8>,
        pos: usize,
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
            self.pos as u64
        }
    }

    #[test]
    fn single_byte_opcode_after_rex() {
        let mut s = ByteCursor {
            bytes: vec![0x48, 0x01, 0xc0],
            pos: 0,
        };
        let (p, op, two) = fetch_prefixes_and_opcode(&mut s).unwrap();
        assert!(p.rex_w());
        assert!(!two);
        assert_eq!(op[0], 0x01);
    }

    #[test]
    fn two_byte_opcode_escape() {
        let mut s = ByteCursor {
            bytes: vec![0x0f, 0xaf],
            pos: 0,
        };
        let (_, op, two) = fetch_prefixes_and_opcode(&mut s).unwrap();
        assert!(two);
        assert_eq!(op, [0x0f, 0xaf]);
    }
}

//! Property-based tests against `emu-core`'s execution primitives: the
//! quantified invariants and round-trip laws a correct decoder/ALU/FPU
//! must hold for every input, not just the handful exercised by
//! `boundary_scenarios.rs`. Standard `proptest!`/`#[quickcheck]` macros
//! are used directly rather than composed through an intermediate
//! strategy-struct layer, since that composition only pays for itself
//! once more than one test shares a generator.

use emu_core::exec::flags::{add_with_flags, sub_with_flags};
use emu_core::exec::integer::{bswap, bswap64, pop, push};
use emu_core::exec::sse2::lanes::{
    cvtsi2sd, cvtsi2ss, cvttsd2si, cvttss2si, paddb, pand, por, psubb, psubusb, pxor,
};
use emu_core::exec::x87::fpu80::F80;
use emu_core::exec::x87::FpuState;
use emu_core::memory::Memory;
use emu_core::registers::{GpRegisters, RFlags, Width, RAX};
use proptest::prelude::*;
use quickcheck_macros::quickcheck;

/// `bswap` is an involution: applying it twice is the identity, for every
/// 32-bit pattern.
#[quickcheck]
fn bswap32_is_involution(v: u32) -> bool {
    bswap(bswap(v)) == v
}

#[quickcheck]
fn bswap64_is_involution(v: u64) -> bool {
    bswap64(bswap64(v)) == v
}

/// Writing a 32-bit value zero-extends into the full 64-bit register,
/// matching the real hardware's "operand size 32 always clears the upper
/// 32 bits" rule (there is no narrower rule for 64-bit reads after a
/// 32-bit write).
#[quickcheck]
fn write32_zero_extends_to_64(idx_seed: u8, v: u32) -> bool {
    let idx = (idx_seed % 16) as usize;
    let mut regs = GpRegisters::default();
    regs.write64(idx, 0xffff_ffff_ffff_ffff);
    regs.write32(idx, v);
    regs.read64(idx) == v as u64
}

/// An 8-bit or 16-bit write must leave the untouched upper bits of the
/// register exactly as they were (no partial-register zero-extension,
/// unlike the 32-bit case above).
proptest! {
    #[test]
    fn write8_preserves_upper_bits(idx_seed in 0u8..16, initial in any::<u64>(), byte in any::<u8>()) {
        let idx = idx_seed as usize;
        let mut regs = GpRegisters::default();
        regs.write64(idx, initial);
        regs.write(idx, Width::W8, byte as u64);
        let got = regs.read64(idx);
        prop_assert_eq!(got & 0xff, byte as u64);
        prop_assert_eq!(got & !0xffu64, initial & !0xffu64);
    }

    #[test]
    fn write16_preserves_upper_bits(idx_seed in 0u8..16, initial in any::<u64>(), half in any::<u16>()) {
        let idx = idx_seed as usize;
        let mut regs = GpRegisters::default();
        regs.write64(idx, initial);
        regs.write(idx, Width::W16, half as u64);
        let got = regs.read64(idx);
        prop_assert_eq!(got & 0xffff, half as u64);
        prop_assert_eq!(got & !0xffffu64, initial & !0xffffu64);
    }
}

/// `a + b - b == a` under the flags-producing adder/subtractor pair, for
/// every 32-bit operand pair — the arithmetic identity a correct ALU must
/// preserve regardless of the flags it also computes along the way.
proptest! {
    #[test]
    fn add_then_sub_is_identity_w32(a in any::<u32>(), b in any::<u32>()) {
        let mut flags = RFlags::empty();
        let sum = add_with_flags(&mut flags, a as u64, b as u64, false, Width::W32);
        let back = sub_with_flags(&mut flags, sum, b as u64, false, Width::W32);
        prop_assert_eq!(back as u32, a);
    }

    #[test]
    fn add_sets_zero_flag_iff_result_is_zero_w32(a in any::<u32>(), b in any::<u32>()) {
        let mut flags = RFlags::empty();
        let sum = add_with_flags(&mut flags, a as u64, b as u64, false, Width::W32);
        prop_assert_eq!(flags.contains(RFlags::ZF), sum as u32 == 0);
    }
}

/// PUSH followed by POP at the same width returns exactly the value that
/// was pushed, and leaves RSP back where it started — the stack-pointer
/// half of the identity the existing `cpu.rs` unit test only checks
/// indirectly through a CALL/RET shape.
proptest! {
    #[test]
    fn push_pop_round_trip_w64(value in any::<u64>()) {
        let mut backing = vec![0u8; 4096];
        let mut regs = GpRegisters::default();
        regs.write64(emu_core::registers::RSP, 2048);
        let mut mem = Memory::new(&mut backing, true);
        push(&mut mem, &mut regs, value, Width::W64, 0).unwrap();
        let rsp_after_push = regs.read64(emu_core::registers::RSP);
        let popped = pop(&mut mem, &mut regs, Width::W64, 0).unwrap();
        prop_assert_eq!(popped, value);
        prop_assert_eq!(regs.read64(emu_core::registers::RSP), rsp_after_push + 8);
    }
}

/// PXOR is its own inverse (`a ^ a == 0`), and PAND/POR are idempotent —
/// basic boolean-algebra identities every packed bitwise lane op must
/// satisfy regardless of which 128 bits are fed in.
proptest! {
    #[test]
    fn pxor_self_is_zero(hi in any::<u64>(), lo in any::<u64>()) {
        let v = ((hi as u128) << 64) | lo as u128;
        prop_assert_eq!(pxor(v, v), 0u128);
    }

    #[test]
    fn pand_por_are_idempotent(hi in any::<u64>(), lo in any::<u64>()) {
        let v = ((hi as u128) << 64) | lo as u128;
        prop_assert_eq!(pand(v, v), v);
        prop_assert_eq!(por(v, v), v);
    }

    #[test]
    fn paddb_is_lane_independent_of_psubb(hi in any::<u64>(), lo in any::<u64>(), ohi in any::<u64>(), olo in any::<u64>()) {
        let a = ((hi as u128) << 64) | lo as u128;
        let b = ((ohi as u128) << 64) | olo as u128;
        // a + b - b == a for wrapping byte-lane addition, independent of
        // the saturating variant exercised in boundary_scenarios.rs.
        prop_assert_eq!(psubb(paddb(a, b), b), a);
    }

    #[test]
    fn psubusb_matches_per_lane_saturating_sub(hi in any::<u64>(), lo in any::<u64>(), ohi in any::<u64>(), olo in any::<u64>()) {
        let a = ((hi as u128) << 64) | lo as u128;
        let b = ((ohi as u128) << 64) | olo as u128;
        let result = psubusb(a, b);
        let expected: Vec<u8> = a.to_le_bytes().iter().zip(b.to_le_bytes()).map(|(x, y)| x.saturating_sub(y)).collect();
        prop_assert_eq!(result.to_le_bytes().to_vec(), expected);
    }
}

/// `cvttsd2si(cvtsi2sd(n)) == n` for every `i32` whose magnitude is small
/// enough that the double-precision conversion is exact (all of `i32`,
/// since `f64` has 52 mantissa bits) — the round-trip law SPEC_FULL.md
/// calls out for the scalar int/float conversion pair.
#[quickcheck]
fn cvtsi2sd_cvttsd2si_round_trip(n: i32) -> bool {
    let encoded = cvtsi2sd(0, n as i64);
    cvttsd2si(encoded) == n
}

/// Same round-trip law for the single-precision scalar pair, restricted to
/// magnitudes `f32`'s 24 mantissa bits can represent exactly.
#[quickcheck]
fn cvtsi2ss_cvttss2si_round_trip(n: i16) -> bool {
    let encoded = cvtsi2ss(0, n as i64);
    cvttss2si(encoded) == n as i32
}

/// The x87 stack's push/pop pair round-trips an arbitrary finite `f64`
/// through the 80-bit extended format without losing precision (`f64`'s
/// 52-bit mantissa is a strict subset of the 80-bit format's 64-bit
/// mantissa, so the conversion is always exact).
proptest! {
    #[test]
    fn x87_push_pop_round_trip(bits in any::<u64>()) {
        let v = f64::from_bits(bits);
        prop_assume!(v.is_finite());
        let mut fpu = FpuState::default();
        fpu.push(F80::from_f64(v), 0).unwrap();
        let popped = fpu.pop(0).unwrap();
        prop_assert_eq!(popped.to_f64().to_bits(), v.to_bits());
    }
}

/// `RAX` is register index 0 — a constant the syscall ABI and the
/// `mov eax, imm32` opcode block both depend on lining up with the
/// decoder's own register table.
#[test]
fn rax_register_index_is_zero() {
    assert_eq!(RAX, 0);
}

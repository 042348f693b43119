//! x87 floating-point stack (§4.3).
//!
//! Design Note 7 resolution: the eight stack registers are modeled as a
//! fixed `[F80; 8]` array plus a `top: u8` index into it (`0..=7`, wrapping
//! modulo 8) rather than a `VecDeque` — `FDECSTP`/`FINCSTP` and the
//! push/pop bookkeeping are then just `top` arithmetic, and ST(i)
//! addressing is `(top + i) % 8` with no allocation or shifting of the
//! other seven slots.

pub mod fpu80;
pub mod transcendental;

use crate::error::{CpuError, FaultContext, Result};
pub use fpu80::F80;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord: u16 {
        const INVALID_OP   = 1 << 0;
        const DENORMAL     = 1 << 1;
        const ZERO_DIVIDE  = 1 << 2;
        const OVERFLOW     = 1 << 3;
        const UNDERFLOW    = 1 << 4;
        const PRECISION    = 1 << 5;
        const STACK_FAULT  = 1 << 6;
        const ES           = 1 << 7;
        const C0           = 1 << 8;
        const C1           = 1 << 9;
        const C2           = 1 << 10;
        const C3           = 1 << 14;
    }
}

/// Rounding mode carried in the control word's RC field; only
/// round-to-nearest is exercised by the guest programs in scope, but all
/// four are modeled since FLDCW can select any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    Nearest,
    Down,
    Up,
    TowardZero,
}

impl RoundingMode {
    fn from_rc(rc: u16) -> RoundingMode {
        match rc {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::Down,
            2 => RoundingMode::Up,
            _ => RoundingMode::TowardZero,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlWord {
    pub rounding: RoundingMode,
    raw: u16,
}

impl Default for ControlWord {
    fn default() -> Self {
        // 0x037f: all exceptions masked, 64-bit precision, round-to-nearest
        // — the value a freshly reset x87 unit powers up with.
        ControlWord {
            rounding: RoundingMode::Nearest,
            raw: 0x037f,
        }
    }
}

impl ControlWord {
    pub fn from_raw(raw: u16) -> ControlWord {
        ControlWord {
            rounding: RoundingMode::from_rc((raw >> 10) & 0x3),
            raw,
        }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }
}

/// The eight-register extended-precision stack plus control/status words.
#[derive(Debug, Clone, Copy)]
pub struct FpuState {
    stack: [F80; 8],
    tag_empty: [bool; 8],
    top: u8,
    pub control: ControlWord,
    pub status: StatusWord,
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState {
            stack: [F80::ZERO; 8],
            tag_empty: [true; 8],
            top: 0,
            control: ControlWord::default(),
            status: StatusWord::empty(),
        }
    }
}

impl FpuState {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, st_index: u8) -> usize {
        ((self.top as usize) + st_index as usize) % 8
    }

    /// ST(0) is the register the stack `top` currently names.
    pub fn st(&self, i: u8) -> F80 {
        self.stack[self.slot(i)]
    }

    pub fn set_st(&mut self, i: u8, v: F80) {
        let slot = self.slot(i);
        self.stack[slot] = v;
        self.tag_empty[slot] = false;
    }

    pub fn is_empty(&self, i: u8) -> bool {
        self.tag_empty[self.slot(i)]
    }

    /// Push a new ST(0), per FLD's "decrement top, then store" rule.
    pub fn push(&mut self, v: F80, rip: u64) -> Result<()> {
        if !self.tag_empty[self.slot(7)] {
            self.status.insert(StatusWord::STACK_FAULT | StatusWord::INVALID_OP);
            return Err(CpuError::StackWindowViolation {
                rsp: 0,
                low: 0,
                high: 8,
                ctx: FaultContext {
                    rip,
                    mnemonic_hint: Some("x87 stack overflow"),
                    ..Default::default()
                },
            });
        }
        self.top = self.top.wrapping_sub(1) & 0x7;
        self.set_st(0, v);
        Ok(())
    }

    /// Pop ST(0), per FSTP's "store, then increment top and mark empty"
    /// rule.
    pub fn pop(&mut self, rip: u64) -> Result<F80> {
        if self.tag_empty[self.slot(0)] {
            self.status.insert(StatusWord::STACK_FAULT | StatusWord::INVALID_OP);
            return Err(CpuError::StackWindowViolation {
                rsp: 0,
                low: 0,
                high: 8,
                ctx: FaultContext {
                    rip,
                    mnemonic_hint: Some("x87 stack underflow"),
                    ..Default::default()
                },
            });
        }
        let v = self.st(0);
        let slot0 = self.slot(0);
        self.tag_empty[slot0] = true;
        self.top = self.top.wrapping_add(1) & 0x7;
        Ok(v)
    }

    pub fn fincstp(&mut self) {
        self.top = self.top.wrapping_add(1) & 0x7;
    }

    pub fn fdecstp(&mut self) {
        self.top = self.top.wrapping_sub(1) & 0x7;
    }

    pub fn top_index(&self) -> u8 {
        self.top
    }

    /// FCOM/FUCOM's three-way result onto the status word's C0/C2/C3
    /// condition bits (C1 is left alone here; it's a stack-fault indicator
    /// the caller sets separately when applicable). Unordered (NaN operand)
    /// sets all three, mirroring the integer ZF/PF/CF convention
    /// [`crate::exec::flags::ucomis_flags`] uses for UCOMISS/UCOMISD.
    pub fn set_compare_status(&mut self, ordering: Option<std::cmp::Ordering>) {
        use std::cmp::Ordering::*;
        let (c0, c2, c3) = match ordering {
            None => (true, true, true),
            Some(Less) => (true, false, false),
            Some(Equal) => (false, false, true),
            Some(Greater) => (false, false, false),
        };
        self.status.set(StatusWord::C0, c0);
        self.status.set(StatusWord::C2, c2);
        self.status.set(StatusWord::C3, c3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_round_trips() {
        let mut fpu = FpuState::new();
        fpu.push(F80::from_f64(3.5), 0).unwrap();
        fpu.push(F80::from_f64(4.5), 0).unwrap();
        assert_eq!(fpu.st(0).to_f64(), 4.5);
        assert_eq!(fpu.st(1).to_f64(), 3.5);
        let popped = fpu.pop(0).unwrap();
        assert_eq!(popped.to_f64(), 4.5);
        assert_eq!(fpu.st(0).to_f64(), 3.5);
    }

    #[test]
    fn pop_on_empty_stack_faults() {
        let mut fpu = FpuState::new();
        assert!(fpu.pop(0).is_err());
        assert!(fpu.status.contains(StatusWord::STACK_FAULT));
    }

    #[test]
    fn eight_pushes_fill_the_ring_without_overflow() {
        let mut fpu = FpuState::new();
        for i in 0..8 {
            fpu.push(F80::from_f64(i as f64), 0).unwrap();
        }
        assert!(fpu.push(F80::from_f64(9.0), 0).is_err());
    }

    #[test]
    fn compare_status_unordered_sets_c0_c2_c3() {
        let mut fpu = FpuState::new();
        fpu.set_compare_status(None);
        assert!(fpu.status.contains(StatusWord::C0 | StatusWord::C2 | StatusWord::C3));
    }

    #[test]
    fn compare_status_equal_sets_only_c3() {
        let mut fpu = FpuState::new();
        fpu.set_compare_status(Some(std::cmp::Ordering::Equal));
        assert!(fpu.status.contains(StatusWord::C3));
        assert!(!fpu.status.contains(StatusWord::C0));
    }
}

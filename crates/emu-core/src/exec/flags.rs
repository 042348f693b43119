//! RFLAGS synthesis (§4.2). Every arithmetic/logical executor in
//! [`crate::exec::integer`] and [`crate::exec::shift`] funnels its result
//! through one of these so the flag rules live in exactly one place.

use crate::registers::{RFlags, Width};

/// Parity is defined over the low byte of the result regardless of operand
/// width — one of the odder ISA carry-overs, but a real one.
fn parity_even(result: u64) -> bool {
    (result as u8).count_ones() % 2 == 0
}

fn zero(result: u64, width: Width) -> bool {
    width.truncate(result) == 0
}

fn sign(result: u64, width: Width) -> bool {
    width.truncate(result) & width.sign_bit() != 0
}

fn apply_szp(flags: &mut RFlags, result: u64, width: Width) {
    flags.set_bit(RFlags::ZF, zero(result, width));
    flags.set_bit(RFlags::SF, sign(result, width));
    flags.set_bit(RFlags::PF, parity_even(result));
}

/// `dst + src`, optionally with an incoming carry (ADC). Returns the
/// truncated result; flags are written into `flags`.
pub fn add_with_flags(flags: &mut RFlags, dst: u64, src: u64, carry_in: bool, width: Width) -> u64 {
    let dst = width.truncate(dst);
    let src = width.truncate(src);
    let cin = carry_in as u64;

    let wide = dst as u128 + src as u128 + cin as u128;
    let result = width.truncate(wide as u64);

    let carry = wide > width.mask() as u128;
    let af = ((dst & 0xf) + (src & 0xf) + cin) > 0xf;
    let dst_sign = dst & width.sign_bit() != 0;
    let src_sign = src & width.sign_bit() != 0;
    let res_sign = result & width.sign_bit() != 0;
    let overflow = (dst_sign == src_sign) && (res_sign != dst_sign);

    flags.set_bit(RFlags::CF, carry);
    flags.set_bit(RFlags::AF, af);
    flags.set_bit(RFlags::OF, overflow);
    apply_szp(flags, result, width);
    result
}

/// `dst - src`, optionally with an incoming borrow (SBB). CMP uses this and
/// discards the result.
pub fn sub_with_flags(flags: &mut RFlags, dst: u64, src: u64, borrow_in: bool, width: Width) -> u64 {
    let dst = width.truncate(dst);
    let src = width.truncate(src);
    let bin = borrow_in as u64;

    let full_src = src as i128 + bin as i128;
    let wide = dst as i128 - full_src;
    let result = width.truncate(wide as u64);

    let borrow = (dst as i128) < full_src;
    let af = ((dst & 0xf) as i64) < ((src & 0xf) as i64 + bin as i64);
    let dst_sign = dst & width.sign_bit() != 0;
    let src_sign = src & width.sign_bit() != 0;
    let res_sign = result & width.sign_bit() != 0;
    let overflow = (dst_sign != src_sign) && (res_sign != dst_sign);

    flags.set_bit(RFlags::CF, borrow);
    flags.set_bit(RFlags::AF, af);
    flags.set_bit(RFlags::OF, overflow);
    apply_szp(flags, result, width);
    result
}

/// INC/DEC touch every flag add/sub would except CF, which they leave alone
/// — the one well-known exception in the flag rules.
pub fn inc_with_flags(flags: &mut RFlags, dst: u64, width: Width) -> u64 {
    let saved_cf = flags.test(RFlags::CF);
    let result = add_with_flags(flags, dst, 1, false, width);
    flags.set_bit(RFlags::CF, saved_cf);
    result
}

pub fn dec_with_flags(flags: &mut RFlags, dst: u64, width: Width) -> u64 {
    let saved_cf = flags.test(RFlags::CF);
    let result = sub_with_flags(flags, dst, 1, false, width);
    flags.set_bit(RFlags::CF, saved_cf);
    result
}

/// AND/OR/XOR: CF and OF are always cleared, AF is undefined (cleared
/// here), SF/ZF/PF follow the result.
pub fn logic_with_flags(flags: &mut RFlags, result: u64, width: Width) -> u64 {
    let result = width.truncate(result);
    flags.set_bit(RFlags::CF, false);
    flags.set_bit(RFlags::OF, false);
    flags.set_bit(RFlags::AF, false);
    apply_szp(flags, result, width);
    result
}

/// Unsigned multiply: CF/OF set iff the upper half is nonzero; SF/ZF/PF/AF
/// are left undefined architecturally, and this core zeroes them, matching
/// what real silicon does for MUL in practice.
pub fn mul_with_flags(flags: &mut RFlags, upper_nonzero: bool) {
    flags.set_bit(RFlags::CF, upper_nonzero);
    flags.set_bit(RFlags::OF, upper_nonzero);
    flags.set_bit(RFlags::SF, false);
    flags.set_bit(RFlags::ZF, false);
    flags.set_bit(RFlags::AF, false);
    flags.set_bit(RFlags::PF, false);
}

/// Signed multiply: CF/OF set iff the product doesn't fit back into the
/// source width sign-extended.
pub fn imul_with_flags(flags: &mut RFlags, fits_in_width: bool) {
    let overflow = !fits_in_width;
    flags.set_bit(RFlags::CF, overflow);
    flags.set_bit(RFlags::OF, overflow);
}

/// UCOMISS/UCOMISD/COMISS/COMISD map their three-way float comparison onto
/// integer ZF/PF/CF the same way FUCOMI/FCOMI do: unordered sets all three,
/// otherwise only the one flag implied by the ordering is set. OF/AF/SF are
/// always cleared.
pub fn ucomis_flags(flags: &mut RFlags, ordering: Option<std::cmp::Ordering>) {
    use std::cmp::Ordering::*;
    let (cf, pf, zf) = match ordering {
        None => (true, true, true),
        Some(Less) => (true, false, false),
        Some(Equal) => (false, false, true),
        Some(Greater) => (false, false, false),
    };
    flags.set_bit(RFlags::CF, cf);
    flags.set_bit(RFlags::PF, pf);
    flags.set_bit(RFlags::ZF, zf);
    flags.set_bit(RFlags::OF, false);
    flags.set_bit(RFlags::AF, false);
    flags.set_bit(RFlags::SF, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_detects_signed_overflow() {
        let mut f = RFlags::default();
        let r = add_with_flags(&mut f, 0x7f, 1, false, Width::W8);
        assert_eq!(r, 0x80);
        assert!(f.test(RFlags::OF));
        assert!(f.test(RFlags::SF));
        assert!(!f.test(RFlags::CF));
    }

    #[test]
    fn sub_sets_carry_on_borrow() {
        let mut f = RFlags::default();
        let r = sub_with_flags(&mut f, 0, 1, false, Width::W8);
        assert_eq!(r, 0xff);
        assert!(f.test(RFlags::CF));
        assert!(f.test(RFlags::SF));
    }

    #[test]
    fn inc_leaves_carry_untouched() {
        let mut f = RFlags::default();
        f.set_bit(RFlags::CF, true);
        let r = inc_with_flags(&mut f, 0xff, Width::W8);
        assert_eq!(r, 0);
        assert!(f.test(RFlags::CF));
        assert!(f.test(RFlags::ZF));
    }

    #[test]
    fn logic_clears_cf_and_of() {
        let mut f = RFlags::default();
        f.set_bit(RFlags::CF, true);
        f.set_bit(RFlags::OF, true);
        let r = logic_with_flags(&mut f, 0xff00, Width::W16);
        assert_eq!(r, 0xff00);
        assert!(!f.test(RFlags::CF));
        assert!(!f.test(RFlags::OF));
        assert!(f.test(RFlags::SF));
    }

    #[test]
    fn parity_is_over_low_byte_only() {
        let mut f = RFlags::default();
        // 0x0100 -> low byte 0x00 -> even parity (PF set)
        logic_with_flags(&mut f, 0x0100, Width::W16);
        assert!(f.test(RFlags::PF));
    }

    #[test]
    fn ucomis_unordered_sets_all_three() {
        let mut f = RFlags::default();
        ucomis_flags(&mut f, None);
        assert!(f.test(RFlags::CF) && f.test(RFlags::PF) && f.test(RFlags::ZF));
    }

    #[test]
    fn ucomis_equal_sets_only_zf() {
        let mut f = RFlags::default();
        ucomis_flags(&mut f, Some(std::cmp::Ordering::Equal));
        assert!(!f.test(RFlags::CF));
        assert!(f.test(RFlags::ZF));
    }
}

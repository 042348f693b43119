//! x87 transcendental and miscellaneous unary operations (§4.3).
//!
//! Real x87 hardware computes these directly in 80-bit extended precision;
//! this core widens to `f64`, uses the host's `libm`-backed `f64` methods,
//! and narrows back through [`super::fpu80::F80`]. That loses the last
//! eleven bits of precision real silicon would keep, which is acceptable
//! for the interpreter-correctness guarantees this core targets (bit-exact
//! integer semantics, not bit-exact transcendental rounding).

use super::fpu80::F80;

pub fn fsqrt(x: F80) -> F80 {
    F80::from_f64(x.to_f64().sqrt())
}

pub fn fabs(x: F80) -> F80 {
    x.abs()
}

pub fn fchs(x: F80) -> F80 {
    x.negate()
}

pub fn fsin(x: F80) -> F80 {
    F80::from_f64(x.to_f64().sin())
}

pub fn fcos(x: F80) -> F80 {
    F80::from_f64(x.to_f64().cos())
}

pub fn fsincos(x: F80) -> (F80, F80) {
    let (s, c) = x.to_f64().sin_cos();
    (F80::from_f64(s), F80::from_f64(c))
}

pub fn fptan(x: F80) -> F80 {
    F80::from_f64(x.to_f64().tan())
}

pub fn fpatan(y: F80, x: F80) -> F80 {
    F80::from_f64(y.to_f64().atan2(x.to_f64()))
}

/// F2XM1: `2^x - 1`, defined for `x` in `[-1, 1]`.
pub fn f2xm1(x: F80) -> F80 {
    F80::from_f64(x.to_f64().exp2() - 1.0)
}

/// FYL2X: `y * log2(x)`.
pub fn fyl2x(y: F80, x: F80) -> F80 {
    F80::from_f64(y.to_f64() * x.to_f64().log2())
}

/// FYL2XP1: `y * log2(x + 1)`, accurate near `x == 0` the way `ln_1p`-style
/// routines are.
pub fn fyl2xp1(y: F80, x: F80) -> F80 {
    let ln1p = x.to_f64().ln_1p();
    F80::from_f64(y.to_f64() * (ln1p / std::f64::consts::LN_2))
}

/// FSCALE: `x * 2^trunc(y)`.
pub fn fscale(x: F80, y: F80) -> F80 {
    let n = y.to_f64().trunc();
    F80::from_f64(x.to_f64() * n.exp2())
}

/// FXTRACT: split `x` into `(significand, exponent)` such that
/// `x == significand * 2^exponent` and `1.0 <= |significand| < 2.0`.
pub fn fxtract(x: F80) -> (F80, F80) {
    let v = x.to_f64();
    if v == 0.0 {
        return (F80::from_f64(0.0), F80::from_f64(f64::NEG_INFINITY));
    }
    let exponent = v.abs().log2().floor();
    let significand = v / exponent.exp2();
    (F80::from_f64(significand), F80::from_f64(exponent))
}

/// FPREM: IEEE partial remainder of `x / y` using truncation (round toward
/// zero), as distinct from FPREM1's round-to-nearest variant.
pub fn fprem(x: F80, y: F80) -> F80 {
    let xv = x.to_f64();
    let yv = y.to_f64();
    let q = (xv / yv).trunc();
    F80::from_f64(xv - q * yv)
}

/// FPREM1: IEEE-754 remainder, rounding the quotient to nearest-even
/// before multiplying back out.
pub fn fprem1(x: F80, y: F80) -> F80 {
    F80::from_f64(x.to_f64() % y.to_f64())
}

pub fn frndint(x: F80, rounding: super::RoundingMode) -> F80 {
    let v = x.to_f64();
    let rounded = match rounding {
        super::RoundingMode::Nearest => {
            let r = v.round();
            // `f64::round` rounds half-away-from-zero; x87's default mode
            // rounds half-to-even.
            if (v.fract().abs() - 0.5).abs() < f64::EPSILON {
                let floor = v.floor();
                if (floor as i64) % 2 == 0 {
                    floor
                } else {
                    floor + 1.0
                }
            } else {
                r
            }
        }
        super::RoundingMode::Down => v.floor(),
        super::RoundingMode::Up => v.ceil(),
        super::RoundingMode::TowardZero => v.trunc(),
    };
    F80::from_f64(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsqrt_of_four_is_two() {
        assert_eq!(fsqrt(F80::from_f64(4.0)).to_f64(), 2.0);
    }

    #[test]
    fn fscale_multiplies_by_power_of_two() {
        let r = fscale(F80::from_f64(1.5), F80::from_f64(3.0));
        assert_eq!(r.to_f64(), 12.0);
    }

    #[test]
    fn fxtract_recovers_original_value() {
        let (sig, exp) = fxtract(F80::from_f64(10.0));
        let recombined = sig.to_f64() * exp.to_f64().exp2();
        assert!((recombined - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fprem_matches_truncated_remainder() {
        let r = fprem(F80::from_f64(5.3), F80::from_f64(2.0));
        assert!((r.to_f64() - 1.3).abs() < 1e-9);
    }

    #[test]
    fn frndint_rounds_half_to_even() {
        assert_eq!(frndint(F80::from_f64(2.5), super::RoundingMode::Nearest).to_f64(), 2.0);
        assert_eq!(frndint(F80::from_f64(3.5), super::RoundingMode::Nearest).to_f64(), 4.0);
    }
}

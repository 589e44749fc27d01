//! Sign utilities and polynomial root solvers for step-size and crossing math.
//!
//! The quantization step-size and zero-crossing computations need the smallest
//! positive root of low-degree polynomials `a·t³ + b·t² + c·t + d` whose
//! coefficients are trajectory Taylor coefficients. Quadratics are closed-form;
//! cubics use the analytic solution polished by a Halley iteration, with a
//! quadratic-root warm start covering the near-singular (vanishing leading
//! coefficient) regime where the analytic formulas lose precision.
//!
//! Every solver returns `f64::INFINITY` when no positive root in range exists;
//! callers read infinity as "no event".

use smallvec::SmallVec;

/// Relative convergence tolerance for the iterative root polish.
const ROOT_TOL: f64 = 1.0e-12;

/// Iteration cap for the root polish.
const ROOT_ITERATIONS: usize = 8;

/// Sign of `x` mapped onto `{ -1, 0, +1 }`, with both zeros mapping to `0`.
#[inline]
pub fn signum(x: f64) -> i32 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Sign of `x` as a `bool`, with both zeros counted as positive.
#[inline]
pub fn bool_sign(x: f64) -> bool {
    x >= 0.0
}

/// True iff `x` and `y` have the same `signum`.
#[inline]
pub fn signs_same(x: f64, y: f64) -> bool {
    signum(x) == signum(y)
}

/// True iff `x` and `y` have differing `signum`.
#[inline]
pub fn signs_differ(x: f64, y: f64) -> bool {
    signum(x) != signum(y)
}

/// True iff `x` and `y` are both nonzero and of opposite sign.
#[inline]
pub fn nonzero_and_signs_differ(x: f64, y: f64) -> bool {
    (x != 0.0) && (y != 0.0) && signs_differ(x, y)
}

/// The smallest strictly positive value, or infinity if none is positive.
#[inline]
pub fn min_positive_or_infinity(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut min = f64::INFINITY;
    for v in values {
        if (v > 0.0) && (v < min) {
            min = v;
        }
    }
    min
}

/// Value of `a·t³ + b·t² + c·t + d`.
#[inline]
fn cubic(a: f64, b: f64, c: f64, d: f64, t: f64) -> f64 {
    d + (c + (b + (a * t)) * t) * t
}

/// Smallest positive root of `a·t + b`, or infinity.
#[inline]
pub fn zc_root_linear(a: f64, b: f64) -> f64 {
    if nonzero_and_signs_differ(a, b) {
        -(b / a)
    } else {
        f64::INFINITY
    }
}

/// Smallest positive root of `a·t² + b·t + c` for general coefficient signs.
fn min_positive_root_quadratic(a: f64, b: f64, c: f64) -> f64 {
    if a == 0.0 {
        return zc_root_linear(b, c);
    }
    let disc = (b * b) - (4.0 * a * c);
    if disc < 0.0 {
        return f64::INFINITY;
    }
    // Citardauq pairing avoids cancellation in whichever root b's sign threatens.
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    if q == 0.0 {
        // b == 0 and a·c == 0: roots are 0 (not positive) or ±sqrt(-c/a).
        let s = -(c / a);
        return if s > 0.0 { s.sqrt() } else { f64::INFINITY };
    }
    min_positive_or_infinity([q / a, c / q])
}

/// Smallest positive root of `a·t² + b·t + c`, or infinity.
#[inline]
pub fn zc_root_quadratic(a: f64, b: f64, c: f64) -> f64 {
    min_positive_root_quadratic(a, b, c)
}

/// Smallest positive upper-boundary crossing of `a·t² + b·t + c`.
///
/// Precondition (from the step-size dispatch): `a ≥ 0`, `b ≥ 0`, `c ≤ 0`, so at
/// most one sign change and at most one positive root. A positive `c` means the
/// boundary was already breached by roundoff and the step collapses to zero.
pub fn min_root_quadratic_upper(a: f64, b: f64, c: f64) -> f64 {
    if c > 0.0 {
        return 0.0;
    }
    let disc = (b * b) - (4.0 * a * c);
    let den = b + disc.sqrt();
    if den > 0.0 {
        (-2.0 * c) / den
    } else {
        f64::INFINITY
    }
}

/// Smallest positive lower-boundary crossing of `a·t² + b·t + c`.
///
/// Mirror of [`min_root_quadratic_upper`] with `a ≤ 0`, `b ≤ 0`, `c ≥ 0`.
#[inline]
pub fn min_root_quadratic_lower(a: f64, b: f64, c: f64) -> f64 {
    min_root_quadratic_upper(-a, -b, -c)
}

/// Smallest positive crossing of either boundary: `a·t² + b·t + cl` (lower) or
/// `a·t² + b·t + cu` (upper), for general signs of `a` and `b`.
pub fn min_root_quadratic_both(a: f64, b: f64, cl: f64, cu: f64) -> f64 {
    min_positive_or_infinity([
        min_positive_root_quadratic(a, b, cl),
        min_positive_root_quadratic(a, b, cu),
    ])
}

/// One Halley step toward a root of the cubic; falls back to Newton when the
/// curvature correction would divide by zero.
fn halley_step(a: f64, b: f64, c: f64, d: f64, t: f64) -> f64 {
    let f = cubic(a, b, c, d, t);
    let f1 = c + ((2.0 * b) + (3.0 * a * t)) * t;
    let f2 = (2.0 * b) + (6.0 * a * t);
    let den = (2.0 * f1 * f1) - (f * f2);
    if den != 0.0 {
        t - ((2.0 * f * f1) / den)
    } else if f1 != 0.0 {
        t - (f / f1)
    } else {
        t
    }
}

/// Polish a root estimate with Halley iterations; `None` if it fails to settle.
fn polish_root(a: f64, b: f64, c: f64, d: f64, mut t: f64) -> Option<f64> {
    for _ in 0..ROOT_ITERATIONS {
        let next = halley_step(a, b, c, d, t);
        if !next.is_finite() {
            return None;
        }
        if (next - t).abs() <= ROOT_TOL * next.abs().max(1.0) {
            return Some(next);
        }
        t = next;
    }
    // Accept when the residual is already in the noise for these coefficients.
    let scale = d.abs().max(c.abs()).max(b.abs()).max(a.abs()).max(1.0);
    if cubic(a, b, c, d, t).abs() <= 1.0e-9 * scale {
        Some(t)
    } else {
        None
    }
}

/// Real roots of `a·t³ + b·t² + c·t + d` with `a ≠ 0`, via the monic depressed
/// form: Cardano for one real root, the trigonometric form for three.
fn cubic_real_roots(a: f64, b: f64, c: f64, d: f64) -> SmallVec<[f64; 3]> {
    let bn = b / a;
    let cn = c / a;
    let dn = d / a;
    let shift = bn / 3.0;
    let p = cn - (bn * bn / 3.0);
    let q = ((2.0 * bn * bn * bn) / 27.0) - (bn * cn / 3.0) + dn;
    let disc = (0.25 * q * q) + (p * p * p / 27.0);
    let mut roots = SmallVec::new();
    if disc > 0.0 {
        let sq = disc.sqrt();
        let u = (-0.5 * q) + sq;
        let v = (-0.5 * q) - sq;
        roots.push(u.cbrt() + v.cbrt() - shift);
    } else if p == 0.0 {
        roots.push((-q).cbrt() - shift);
    } else {
        let m = 2.0 * (-p / 3.0).sqrt();
        let theta = ((3.0 * q) / (p * m)).clamp(-1.0, 1.0).acos() / 3.0;
        for k in 0..3 {
            roots.push(m * (theta - (2.0 * std::f64::consts::PI * k as f64 / 3.0)).cos() - shift);
        }
    }
    roots
}

/// Smallest positive root of `a·t³ + b·t² + c·t + d` for general coefficients.
///
/// The analytic roots are polished with the Halley iteration; a quadratic-root
/// warm start is also polished, which rescues the near-singular regime where
/// `|a|` is small enough that the monic reduction loses the short root.
fn min_positive_root_cubic(a: f64, b: f64, c: f64, d: f64) -> f64 {
    if a == 0.0 {
        return min_positive_root_quadratic(b, c, d);
    }
    let mut candidates: SmallVec<[f64; 4]> = SmallVec::new();
    for r in cubic_real_roots(a, b, c, d) {
        if r > 0.0 {
            // Estimates that cannot be polished into a root are cancellation
            // artifacts of the monic reduction, not roots.
            if let Some(p) = polish_root(a, b, c, d, r) {
                candidates.push(p);
            }
        }
    }
    let warm = min_positive_root_quadratic(b, c, d);
    if warm.is_finite() {
        if let Some(r) = polish_root(a, b, c, d, warm) {
            candidates.push(r);
        }
    }
    min_positive_or_infinity(candidates)
}

/// Smallest positive upper-boundary crossing of `a·t³ + b·t² + c·t + d`.
///
/// Precondition (from the step-size dispatch): `a ≥ 0`, `b ≥ 0`, `c ≥ 0`,
/// `d ≤ 0`. A positive `d` means roundoff already breached the boundary.
pub fn min_root_cubic_upper(a: f64, b: f64, c: f64, d: f64) -> f64 {
    if d > 0.0 {
        return 0.0;
    }
    if d == 0.0 {
        return f64::INFINITY;
    }
    min_positive_root_cubic(a, b, c, d)
}

/// Smallest positive lower-boundary crossing: mirror of [`min_root_cubic_upper`]
/// with `a ≤ 0`, `b ≤ 0`, `c ≤ 0`, `d ≥ 0`.
#[inline]
pub fn min_root_cubic_lower(a: f64, b: f64, c: f64, d: f64) -> f64 {
    min_root_cubic_upper(-a, -b, -c, -d)
}

/// Smallest positive crossing of either boundary for a cubic with general
/// coefficient signs: roots of `a·t³ + b·t² + c·t + dl` and `… + du`.
pub fn min_root_cubic_both(a: f64, b: f64, c: f64, dl: f64, du: f64) -> f64 {
    min_positive_or_infinity([
        min_positive_root_cubic(a, b, c, dl),
        min_positive_root_cubic(a, b, c, du),
    ])
}

/// Largest magnitude of `a·t² + b·t + c` at an interior critical point on
/// `(0, span]`, or zero when the vertex falls outside the span.
pub fn critical_point_magnitude_quadratic(a: f64, b: f64, c: f64, span: f64) -> f64 {
    if a == 0.0 {
        return 0.0;
    }
    let t = -b / (2.0 * a);
    if (t > 0.0) && (t <= span) {
        (c + (b + (a * t)) * t).abs()
    } else {
        0.0
    }
}

/// Largest magnitude of `a·t³ + b·t² + c·t + d` at an interior critical point
/// on `(0, span]`, or zero when no critical point falls inside.
pub fn critical_point_magnitude_cubic(a: f64, b: f64, c: f64, d: f64, span: f64) -> f64 {
    if a == 0.0 {
        return critical_point_magnitude_quadratic(b, c, d, span);
    }
    let disc = (b * b) - (3.0 * a * c);
    if disc < 0.0 {
        return 0.0;
    }
    let sq = disc.sqrt();
    let mut mag = 0.0_f64;
    for t in [(-b - sq) / (3.0 * a), (-b + sq) / (3.0 * a)] {
        if (t > 0.0) && (t <= span) {
            mag = mag.max(cubic(a, b, c, d, t).abs());
        }
    }
    mag
}

/// Magnitude of the excursion of `a·t³ + b·t² + c·t + d` strictly between two
/// of its roots `r0 < r1`.
fn excursion_magnitude_cubic(a: f64, b: f64, c: f64, d: f64, r0: f64, r1: f64) -> f64 {
    // Shift to the first root so the span form of the critical-point scan applies.
    let b_s = b + (3.0 * a * r0);
    let c_s = c + ((2.0 * b) + (3.0 * a * r0)) * r0;
    let d_s = cubic(a, b, c, d, r0);
    critical_point_magnitude_cubic(a, b_s, c_s, d_s, r1 - r0)
}

/// Smallest positive zero crossing of `a·t³ + b·t² + c·t + d` with grazing
/// suppression.
///
/// When anti-chatter is armed (`ztol > 0` and the observed trajectory magnitude
/// `x_mag` has not yet exceeded `ztol`), a root whose following excursion stays
/// within `ztol` of zero is a graze, not a crossing: that root and its return
/// partner are culled and the scan continues with the next root pair.
pub fn zc_root_cubic(a: f64, b: f64, c: f64, d: f64, ztol: f64, x_mag: f64) -> f64 {
    let mut roots: SmallVec<[f64; 4]> = SmallVec::new();
    if a == 0.0 {
        if b == 0.0 {
            return zc_root_linear(c, d);
        }
        let disc = (c * c) - (4.0 * b * d);
        if disc < 0.0 {
            return f64::INFINITY;
        }
        let q = -0.5 * (c + c.signum() * disc.sqrt());
        if q != 0.0 {
            roots.push(q / b);
            roots.push(d / q);
        } else {
            let s = -(d / b);
            if s > 0.0 {
                roots.push(s.sqrt());
            }
        }
    } else {
        for r in cubic_real_roots(a, b, c, d) {
            if let Some(p) = polish_root(a, b, c, d, r) {
                roots.push(p);
            }
        }
    }
    roots.retain(|r| *r > 0.0);
    roots.sort_by(f64::total_cmp);
    roots.dedup_by(|x, y| (*x - *y).abs() <= ROOT_TOL * x.abs().max(1.0));
    let cull = (ztol > 0.0) && (x_mag < ztol);
    let mut k = 0;
    while k < roots.len() {
        if cull && (k + 1 < roots.len()) {
            let peak = excursion_magnitude_cubic(a, b, c, d, roots[k], roots[k + 1]);
            if peak < ztol {
                k += 2; // Grazing dip: skip the crossing and its return.
                continue;
            }
        }
        return roots[k];
    }
    f64::INFINITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signs() {
        assert!(bool_sign(0.0));
        assert!(bool_sign(-0.0));
        assert!(bool_sign(3.0));
        assert!(!bool_sign(-5.0));

        assert!(signs_same(3.0, 5.0));
        assert!(signs_same(-5.0, -2.0));
        assert!(signs_same(0.0, -0.0));
        assert!(!signs_same(3.0, -5.0));

        assert!(signs_differ(3.0, -5.0));
        assert!(!signs_differ(0.0, -0.0));

        assert!(!nonzero_and_signs_differ(5.0, -0.0));
        assert!(nonzero_and_signs_differ(3.0, -5.0));
        assert!(!nonzero_and_signs_differ(3.0, 5.0));

        assert_eq!(signum(3.0), 1);
        assert_eq!(signum(-5.0), -1);
        assert_eq!(signum(0.0), 0);
        assert_eq!(signum(-0.0), 0);
    }

    #[test]
    fn test_min_positive_or_infinity() {
        assert_eq!(min_positive_or_infinity([77.0, 3.0]), 3.0);
        assert_eq!(min_positive_or_infinity([77.0, -3.0]), 77.0);
        assert_eq!(min_positive_or_infinity([-77.0, -3.0]), f64::INFINITY);
        assert_eq!(min_positive_or_infinity([77.0, -3.0, 96.0]), 77.0);
    }

    #[test]
    fn test_zc_root_linear() {
        assert_eq!(zc_root_linear(0.0, 3.0), f64::INFINITY);
        assert_eq!(zc_root_linear(-0.0, -3.0), f64::INFINITY);
        assert_eq!(zc_root_linear(3.0, 0.0), f64::INFINITY);
        assert_eq!(zc_root_linear(3.0, 5.0), f64::INFINITY);
        assert_eq!(zc_root_linear(-3.0, -2.0), f64::INFINITY);
        assert_eq!(zc_root_linear(3.0, -6.0), 2.0);
        assert_eq!(zc_root_linear(-3.0, 6.0), 2.0);
    }

    #[test]
    fn test_zc_root_quadratic() {
        assert!((zc_root_quadratic(2.0, -4.0, -3.0) - (1.0 + 2.5_f64.sqrt())).abs() < 1.0e-14);
        assert!((zc_root_quadratic(-3.0, 5.0, 0.0) - (5.0 / 3.0)).abs() < 1.0e-14);
        assert_eq!(zc_root_quadratic(0.0, 0.0, 2.0), f64::INFINITY);
        assert_eq!(zc_root_quadratic(0.0, 5.0, 2.0), f64::INFINITY);
        assert!((zc_root_quadratic(0.0, 5.0, -2.0) - 0.4).abs() < 1.0e-14);
        assert!((zc_root_quadratic(0.0, -5.0, 2.0) - 0.4).abs() < 1.0e-14);
    }

    #[test]
    fn test_min_root_quadratic() {
        let root = 2.5_f64.sqrt() - 1.0;

        assert!((min_root_quadratic_lower(-2.0, -4.0, 3.0) - root).abs() < 1.0e-14);
        assert!(
            (min_root_quadratic_lower(-3.0, -6.0, 1.0) - ((2.0 / 3.0_f64.sqrt()) - 1.0)).abs()
                < 1.0e-14
        );
        assert_eq!(min_root_quadratic_lower(0.0, 0.0, 2.0), f64::INFINITY);
        assert!((min_root_quadratic_lower(0.0, -5.0, 2.0) - 0.4).abs() < 1.0e-14);

        assert!((min_root_quadratic_upper(2.0, 4.0, -3.0) - root).abs() < 1.0e-14);
        assert_eq!(min_root_quadratic_upper(0.0, 0.0, -2.0), f64::INFINITY);
        assert!((min_root_quadratic_upper(0.0, 5.0, -2.0) - 0.4).abs() < 1.0e-14);

        assert!((min_root_quadratic_both(-2.0, -4.0, 3.0, -9.0) - root).abs() < 1.0e-14);
        assert!((min_root_quadratic_both(2.0, 4.0, 9.0, -3.0) - root).abs() < 1.0e-14);
        assert_eq!(min_root_quadratic_both(0.0, 0.0, 2.0, -9.0), f64::INFINITY);
        assert!((min_root_quadratic_both(0.0, 5.0, 9.0, -2.0) - 0.4).abs() < 1.0e-14);
    }

    #[test]
    fn test_min_root_cubic_boundaries() {
        assert!((min_root_cubic_lower(-2.25, -6.5, -7.0, 9.0) - 0.7073498763104491).abs() < 1.0e-12);
        // d on the wrong side of zero means roundoff already breached the boundary.
        assert_eq!(min_root_cubic_lower(-2.25, -6.5, -7.0, -0.01), 0.0);

        assert!((min_root_cubic_upper(2.25, 6.5, 7.0, -9.0) - 0.7073498763104491).abs() < 1.0e-12);
        assert_eq!(min_root_cubic_upper(2.25, 6.5, 7.0, 0.01), 0.0);
    }

    #[test]
    fn test_min_root_cubic_both() {
        let cases = [
            ((-2.0, 3.0, -7.0, 9.0, -9.0), 1.359787450380789),
            ((-2.0, 4.0, -8.0, 9.0, -9.0), 1.4175965758288351),
            ((-9.0, 3.0, -7.0, 2.0, -2.0), 0.29037158997385715),
            ((-9.0, 3.0, 6.0, 1.0, -3.0), 1.060647778684131),
            // Near-quadratic cubics exercise the warm-started iterative fallback.
            ((0.00001, 3.0, -6.0, 6.0, -3.0), 2.4141969797051361),
            ((-0.00001, 3.0, -6.0, 6.0, -3.0), 2.4142301455300395),
        ];
        for ((a, b, c, dl, du), expected) in cases {
            let root = min_root_cubic_both(a, b, c, dl, du);
            assert!(
                (root - expected).abs() < 1.0e-9 * expected,
                "min_root_cubic_both({a}, {b}, {c}, {dl}, {du}) = {root}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_zc_root_cubic() {
        let cases = [
            ((-2.25, -6.5, -7.0, 9.0), 0.7073498763104491),
            ((2.25, 6.5, 7.0, -9.0), 0.7073498763104491),
            ((1.0, 2000.0, 50.0, -2.0), 0.021503603166631264),
            ((1.0, 2000.0, -50.0, -2.0), 0.04650293690494123),
        ];
        for ((a, b, c, d), expected) in cases {
            let root = zc_root_cubic(a, b, c, d, 0.0, 0.0);
            assert!(
                (root - expected).abs() < 1.0e-9 * expected,
                "zc_root_cubic({a}, {b}, {c}, {d}) = {root}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_zc_root_cubic_culls_grazing() {
        // (t-1)(t-2)(t-5) swings only about 0.88 from zero between its first two roots.
        let (a, b, c, d) = (1.0, -8.0, 17.0, -10.0);
        assert!((zc_root_cubic(a, b, c, d, 0.0, 0.0) - 1.0).abs() < 1.0e-12);
        // Armed anti-chatter with the dip inside ztol: first pair culled.
        assert!((zc_root_cubic(a, b, c, d, 1.0, 0.5) - 5.0).abs() < 1.0e-9);
        // Trajectory magnitude already past ztol: no culling.
        assert!((zc_root_cubic(a, b, c, d, 1.0, 2.0) - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn test_critical_point_magnitude_quadratic() {
        assert!((critical_point_magnitude_quadratic(-3.0, 6.0, 1.0, 2.0) - 4.0).abs() < 1.0e-14);
        assert!((critical_point_magnitude_quadratic(5.0, -8.0, 2.0, 2.0) - 1.2).abs() < 1.0e-14);
        assert_eq!(critical_point_magnitude_quadratic(0.0, -8.0, 2.0, 2.0), 0.0);
        assert_eq!(critical_point_magnitude_quadratic(5.0, 0.0, 2.0, 2.0), 0.0);
        assert_eq!(critical_point_magnitude_quadratic(5.0, 8.0, 2.0, 2.0), 0.0);
        assert_eq!(critical_point_magnitude_quadratic(5.0, -8.0, 2.0, 0.75), 0.0);
    }

    #[test]
    fn test_critical_point_magnitude_cubic() {
        assert!(
            (critical_point_magnitude_cubic(9.0, -3.0, -6.0, 1.0, 1.0) - 1.7362735784511805).abs()
                < 1.0e-12
        );
        assert!(
            (critical_point_magnitude_cubic(1.0, -4.0, -6.0, 1.0, 5.0) - 26.426101068499275).abs()
                < 1.0e-12
        );
    }
}

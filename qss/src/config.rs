//! Solver settings, threaded through construction instead of process globals.

use serde::{Deserialize, Serialize};
use crate::time::Time;

/// Solver-wide settings.
///
/// Per-variable tolerances default to the values here and may be overridden at
/// construction. Settings are immutable once a simulation is built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Default relative quantization tolerance.
    pub rtol: f64,
    /// Default absolute quantization tolerance.
    pub atol: f64,
    /// Zero-crossing anti-chatter band; zero disables anti-chatter.
    pub ztol: f64,
    /// Minimum requantization time step.
    pub dt_min: Time,
    /// Maximum requantization time step.
    pub dt_max: Time,
    /// First deactivation-control step; infinity disables deactivation control.
    pub dt_inf: Time,
    /// Cap on the deactivation relaxation step growth.
    pub dt_inf_max: Time,
    /// Numerical differentiation probe step.
    pub dt_nd: Time,
    /// Fallback zero-crossing bump step when no tolerance-based bump applies.
    pub dt_zc: Time,
    /// Multiple of `ztol` the crossing bump aims past zero.
    pub z_mul: f64,
    /// Truncate steps at trajectory inflection points.
    pub inflection: bool,
    /// Use the continuous rather than quantized trajectory when propagating
    /// observee values (the xQSS policy).
    pub propagate_continuous: bool,
    /// Relaxation: slope-reversal magnitude multiplier in the yo-yo criterion.
    pub yoyo_mul: f64,
    /// Relaxation: consecutive reversals before yo-yo mode engages.
    pub m_yoyo: u32,
    /// Relaxation: bound on step growth relative to the previous step.
    pub rlx_growth: f64,
    /// Pass-index ceiling before `dt_min` relaxation kicks in.
    pub pass_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rtol: 1.0e-4,
            atol: 1.0e-6,
            ztol: 0.0,
            dt_min: 0.0,
            dt_max: f64::INFINITY,
            dt_inf: f64::INFINITY,
            dt_inf_max: f64::INFINITY,
            dt_nd: 1.0e-6,
            dt_zc: 1.0e-9,
            z_mul: 100.0,
            inflection: false,
            propagate_continuous: false,
            yoyo_mul: 100.0,
            m_yoyo: 5,
            rlx_growth: 1.5,
            pass_limit: 20,
        }
    }
}

impl Config {
    /// Settings with tolerances clamped into their valid ranges.
    pub fn validated(mut self) -> Self {
        self.rtol = self.rtol.max(0.0);
        self.atol = self.atol.max(f64::MIN_POSITIVE);
        self.ztol = self.ztol.max(0.0);
        self.dt_min = self.dt_min.max(0.0);
        self.dt_max = self.dt_max.max(self.dt_min);
        self
    }

    /// `2·dtND`.
    #[inline]
    pub(crate) fn two_dt_nd(&self) -> Time {
        2.0 * self.dt_nd
    }

    /// `1 / (2·dtND)`: forward-Euler second-derivative factor.
    #[inline]
    pub(crate) fn one_over_two_dt_nd(&self) -> f64 {
        0.5 / self.dt_nd
    }

    /// `1 / (4·dtND)`: centered and three-point second-derivative factor.
    #[inline]
    pub(crate) fn one_over_four_dt_nd(&self) -> f64 {
        0.25 / self.dt_nd
    }

    /// `1 / (6·dtND²)`: third-derivative factor.
    #[inline]
    pub(crate) fn one_over_six_dt_nd_squared(&self) -> f64 {
        1.0 / (6.0 * self.dt_nd * self.dt_nd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_clamps_tolerances() {
        let cfg = Config { rtol: -1.0, atol: 0.0, ztol: -2.0, ..Config::default() }.validated();
        assert_eq!(cfg.rtol, 0.0);
        assert_eq!(cfg.atol, f64::MIN_POSITIVE);
        assert_eq!(cfg.ztol, 0.0);
    }

    #[test]
    fn test_nd_factors() {
        let cfg = Config { dt_nd: 0.5, ..Config::default() };
        assert_eq!(cfg.two_dt_nd(), 1.0);
        assert_eq!(cfg.one_over_two_dt_nd(), 1.0);
        assert_eq!(cfg.one_over_four_dt_nd(), 0.5);
        assert_eq!(cfg.one_over_six_dt_nd_squared(), 1.0 / 1.5);
    }
}

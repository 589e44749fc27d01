//! The variable arena entry: trajectories, tolerances, and dependency wiring.
//!
//! A variable carries two polynomial representations of itself, both of degree
//! equal to its method order: the continuous trajectory `x(t)` anchored at
//! `tX`, and the quantized trajectory `q(t)` anchored at `tQ`. Between
//! requantizations the two agree to within the quantization tolerance `qTol`
//! on the active segment `[tQ, tE]`; the whole solver is the machinery that
//! keeps that invariant while only touching a variable when its own `tE`
//! arrives or one of its observees moves.
//!
//! Variables live in an arena indexed by [`VarId`] and reference each other by
//! index, so dependency cycles (feedback loops) need no special casing. The
//! per-variant behavior (explicit QSS, linearly-implicit LIQSS, zero
//! crossing, input, discrete) hangs off the [`VarKind`] tag; the staged
//! advance protocol that drives these lives in the simulation driver.

use crate::config::Config;
use crate::math;
use crate::observers::Observers;
use crate::oracle::ValueRef;
use crate::queue::EventKey;
use crate::sim::CondId;
use crate::time::Time;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Index of a variable in the simulation arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub usize);

/// An order-tagged value bundle: a value and its derivatives at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SmoothToken {
    /// Value.
    pub x0: f64,
    /// First derivative.
    pub x1: f64,
    /// Second derivative.
    pub x2: f64,
    /// Third derivative.
    pub x3: f64,
}

impl SmoothToken {
    /// A constant token.
    pub fn order_0(x0: f64) -> Self {
        SmoothToken { x0, ..Default::default() }
    }

    /// A token with one derivative.
    pub fn order_1(x0: f64, x1: f64) -> Self {
        SmoothToken { x0, x1, ..Default::default() }
    }

    /// A token with two derivatives.
    pub fn order_2(x0: f64, x1: f64, x2: f64) -> Self {
        SmoothToken { x0, x1, x2, ..Default::default() }
    }

    /// A token with three derivatives.
    pub fn order_3(x0: f64, x1: f64, x2: f64, x3: f64) -> Self {
        SmoothToken { x0, x1, x2, x3 }
    }
}

/// A recorded trajectory sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Sample time.
    pub t: Time,
    /// Continuous value.
    pub x: f64,
    /// Quantized value.
    pub q: f64,
}

/// How a zero-crossing trajectory passed through zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Crossing {
    /// Positive to negative.
    DnPN = -4,
    /// Positive to zero.
    DnPZ = -3,
    /// Downward through or onto zero.
    Dn = -2,
    /// Zero to negative.
    DnZN = -1,
    /// Stationary zero.
    Flat = 0,
    /// Zero to positive.
    UpZP = 1,
    /// Upward through or onto zero.
    Up = 2,
    /// Negative to zero.
    UpNZ = 3,
    /// Negative to positive.
    UpNP = 4,
}

impl Crossing {
    /// Crossing class from the signs before and after.
    pub fn from_signs(old: i32, new: i32) -> Self {
        match (old, new) {
            (-1, 1) => Crossing::UpNP,
            (-1, 0) => Crossing::UpNZ,
            (0, 1) => Crossing::UpZP,
            (1, -1) => Crossing::DnPN,
            (1, 0) => Crossing::DnPZ,
            (0, -1) => Crossing::DnZN,
            _ => Crossing::Flat,
        }
    }

    /// Crossing class from the slope at a zero touch.
    pub fn from_slope(slope: f64) -> Self {
        if slope > 0.0 {
            Crossing::Up
        } else if slope < 0.0 {
            Crossing::Dn
        } else {
            Crossing::Flat
        }
    }

    fn bit(self) -> u16 {
        1 << ((self as i8 + 4) as u16)
    }
}

/// The set of crossing classes a conditional cares about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrossingSet(u16);

impl CrossingSet {
    /// No crossings.
    pub const EMPTY: CrossingSet = CrossingSet(0);

    /// All upward crossings: `UpZP`, `Up`, `UpNZ`, `UpNP`.
    pub fn ups() -> Self {
        CrossingSet(0)
            .with(Crossing::UpZP)
            .with(Crossing::Up)
            .with(Crossing::UpNZ)
            .with(Crossing::UpNP)
    }

    /// All downward crossings: `DnPN`, `DnPZ`, `Dn`, `DnZN`.
    pub fn downs() -> Self {
        CrossingSet(0)
            .with(Crossing::DnPN)
            .with(Crossing::DnPZ)
            .with(Crossing::Dn)
            .with(Crossing::DnZN)
    }

    /// Both directions.
    pub fn both() -> Self {
        CrossingSet(Self::ups().0 | Self::downs().0)
    }

    /// This set plus `c`.
    pub fn with(self, c: Crossing) -> Self {
        CrossingSet(self.0 | c.bit())
    }

    /// True iff `c` is in the set.
    pub fn contains(self, c: Crossing) -> bool {
        (self.0 & c.bit()) != 0
    }
}

/// Slope-reversal (yo-yo) tracking for relaxed QSS variables.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Relax {
    /// Yo-yo mode engaged: the top coefficient is damped until a handler fires.
    pub active: bool,
    /// Consecutive alternating reversals observed.
    pub n: u32,
    /// Quantized slope from two requantizations back.
    pub q_1_2: f64,
    /// Sign of the last slope difference.
    pub sign: bool,
}

/// Zero-crossing bookkeeping.
#[derive(Debug)]
pub(crate) struct ZcState {
    /// Predicted crossing time; infinity when none.
    pub t_z: Time,
    /// Last crossing processed.
    pub t_z_last: Time,
    /// Class of the pending or reported crossing.
    pub crossing: Crossing,
    /// Class of the last crossing processed.
    pub crossing_last: Crossing,
    /// Anti-chatter trajectory magnitude since the last crossing.
    pub x_mag: f64,
    /// An unpredicted crossing was detected and reported at `tX`.
    pub detected: bool,
    /// Whether the next update should test for an unpredicted sign change.
    pub check_crossing: bool,
    /// Trajectory sign at the last update.
    pub sign_old: i32,
    /// A handler changed the indicator's operands at the crossing time.
    pub handler_modified: bool,
    /// Oracle value recorded at the post-crossing bump time.
    pub x_0_bump: f64,
    /// Crossing classes that activate the conditional.
    pub interest: CrossingSet,
    /// The conditional this indicator drives, if any.
    pub conditional: Option<CondId>,
}

impl Default for ZcState {
    fn default() -> Self {
        ZcState {
            t_z: f64::INFINITY,
            t_z_last: f64::NEG_INFINITY,
            crossing: Crossing::Flat,
            crossing_last: Crossing::Flat,
            x_mag: 0.0,
            detected: false,
            check_crossing: false,
            sign_old: 0,
            handler_modified: false,
            x_0_bump: 0.0,
            interest: CrossingSet::both(),
            conditional: None,
        }
    }
}

/// Input trajectory source.
pub type InputFn = Box<dyn Fn(Time) -> SmoothToken>;

/// Variant tag: what kind of trajectory this variable maintains and which
/// advance protocol applies to it.
pub(crate) enum VarKind {
    /// Explicit QSS state variable; `relax` carries the yo-yo tracking for the
    /// relaxed (rQSS) variants.
    Qss {
        /// Yo-yo tracking; `None` for plain QSS.
        relax: Option<Relax>,
    },
    /// Linearly-implicit state variable. `q_c` is the unquantized center the
    /// tolerance tracks; `l_0` the tentative quantized value selected in
    /// stage 3 and committed in stage F.
    Liqss {
        /// Quantized-center value.
        q_c: f64,
        /// Tentatively selected quantized value.
        l_0: f64,
    },
    /// Zero-crossing event indicator.
    ZeroCrossing(Box<ZcState>),
    /// Function-of-time input.
    Input(InputFn),
    /// Passive algebraic real, updated as an observer via directional
    /// derivatives.
    Real,
    /// Discrete real: changes value only at discrete and handler events.
    Discrete,
    /// Boolean-valued discrete variable.
    Boolean,
    /// Integer-valued discrete variable.
    Integer,
}

/// A variable in the arena.
pub struct Variable {
    /// Model name.
    pub name: String,
    pub(crate) order: usize,
    pub(crate) kind: VarKind,
    pub(crate) rtol: f64,
    pub(crate) atol: f64,
    pub(crate) ztol: f64,
    pub(crate) qtol: f64,
    /// Continuous trajectory coefficients around `t_x`.
    pub(crate) x: [f64; 4],
    /// Quantized trajectory coefficients around `t_q`.
    pub(crate) q: [f64; 3],
    pub(crate) t_x: Time,
    pub(crate) t_q: Time,
    pub(crate) t_e: Time,
    /// Previous requantization step span.
    pub(crate) t_s: Time,
    pub(crate) dt_min: Time,
    pub(crate) dt_max: Time,
    pub(crate) dt_inf_rlx: Time,
    pub(crate) x_ini: f64,
    pub(crate) var_ref: ValueRef,
    pub(crate) der_ref: Option<ValueRef>,
    pub(crate) observers: SmallVec<[VarId; 4]>,
    pub(crate) observees: SmallVec<[VarId; 4]>,
    pub(crate) self_observer: bool,
    pub(crate) event: Option<EventKey>,
    pub(crate) plan: Observers,
    pub(crate) output: Option<Vec<Sample>>,
    // First-derivative probes at the ND offsets, stashed between stages.
    pub(crate) x1m: f64,
    pub(crate) x1p: f64,
    pub(crate) x12p: f64,
    /// Incoming continuous slope at the event time, stashed by stage 0 for the
    /// relaxation bookkeeping in stage 1.
    pub(crate) x1_in: f64,
}

impl Variable {
    pub(crate) fn new(name: String, order: usize, kind: VarKind, cfg: &Config) -> Self {
        Variable {
            name,
            order,
            kind,
            rtol: cfg.rtol,
            atol: cfg.atol,
            ztol: cfg.ztol,
            qtol: cfg.atol,
            x: [0.0; 4],
            q: [0.0; 3],
            t_x: 0.0,
            t_q: 0.0,
            t_e: 0.0,
            t_s: 0.0,
            dt_min: cfg.dt_min,
            dt_max: cfg.dt_max,
            dt_inf_rlx: cfg.dt_inf,
            x_ini: 0.0,
            var_ref: 0,
            der_ref: None,
            observers: SmallVec::new(),
            observees: SmallVec::new(),
            self_observer: false,
            event: None,
            plan: Observers::default(),
            output: None,
            x1m: 0.0,
            x1p: 0.0,
            x12p: 0.0,
            x1_in: 0.0,
        }
    }

    /// Method order.
    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Scheduled requantization time.
    #[inline]
    pub fn te(&self) -> Time {
        self.t_e
    }

    /// Continuous-trajectory anchor time.
    #[inline]
    pub fn tx(&self) -> Time {
        self.t_x
    }

    /// Quantized-trajectory anchor time.
    #[inline]
    pub fn tq(&self) -> Time {
        self.t_q
    }

    /// Current quantization tolerance.
    #[inline]
    pub fn qtol(&self) -> f64 {
        self.qtol
    }

    /// Predicted crossing time, for zero-crossing variables.
    pub fn tz(&self) -> Option<Time> {
        match &self.kind {
            VarKind::ZeroCrossing(zs) => Some(zs.t_z),
            _ => None,
        }
    }

    /// Variables this one's trajectory depends on.
    pub fn observees(&self) -> &[VarId] {
        &self.observees
    }

    /// Variables whose trajectories depend on this one.
    pub fn observers(&self) -> &[VarId] {
        &self.observers
    }

    /// True iff this variable appears in its own derivative.
    pub fn self_observer(&self) -> bool {
        self.self_observer
    }

    /// For zero-crossing variables: an unpredicted crossing was detected and
    /// reported at the trajectory anchor rather than at a predicted root.
    pub fn detected_crossing(&self) -> bool {
        match &self.kind {
            VarKind::ZeroCrossing(zs) => zs.detected,
            _ => false,
        }
    }

    /// For relaxed QSS variables: yo-yo damping is currently engaged.
    pub fn yoyoing(&self) -> bool {
        self.relax_active()
    }

    pub(crate) fn is_state(&self) -> bool {
        matches!(self.kind, VarKind::Qss { .. } | VarKind::Liqss { .. })
    }

    pub(crate) fn is_liqss(&self) -> bool {
        matches!(self.kind, VarKind::Liqss { .. })
    }

    pub(crate) fn is_zc(&self) -> bool {
        matches!(self.kind, VarKind::ZeroCrossing(_))
    }

    pub(crate) fn is_input(&self) -> bool {
        matches!(self.kind, VarKind::Input(_))
    }

    pub(crate) fn is_real(&self) -> bool {
        matches!(self.kind, VarKind::Real)
    }

    /// Discrete-valued: changes only at its own discrete or handler events, so
    /// it is discarded from observee pooling.
    pub(crate) fn is_discrete_kind(&self) -> bool {
        matches!(self.kind, VarKind::Discrete | VarKind::Boolean | VarKind::Integer)
    }

    /// Sort index for observer grouping: states, then algebraic reals, then
    /// other value-only variables, then zero crossings.
    pub(crate) fn sort_index(&self) -> u8 {
        if self.is_state() {
            0
        } else if self.is_real() {
            1
        } else if self.is_zc() {
            3
        } else {
            2
        }
    }

    /// Zero-crossing bookkeeping. Panics on other variants.
    pub(crate) fn zc(&self) -> &ZcState {
        match &self.kind {
            VarKind::ZeroCrossing(zs) => zs,
            _ => panic!("zero-crossing state of a non-zero-crossing variable"),
        }
    }

    /// Mutable zero-crossing bookkeeping. Panics on other variants.
    pub(crate) fn zc_mut(&mut self) -> &mut ZcState {
        match &mut self.kind {
            VarKind::ZeroCrossing(zs) => zs,
            _ => panic!("zero-crossing state of a non-zero-crossing variable"),
        }
    }

    // --- Trajectory evaluation ---------------------------------------------

    /// Continuous value at `t`.
    #[inline]
    pub fn x(&self, t: Time) -> f64 {
        let d = t - self.t_x;
        self.x[0] + ((self.x[1] + ((self.x[2] + (self.x[3] * d)) * d)) * d)
    }

    /// Continuous first derivative at `t`.
    #[inline]
    pub fn x1(&self, t: Time) -> f64 {
        let d = t - self.t_x;
        self.x[1] + (((2.0 * self.x[2]) + (3.0 * self.x[3] * d)) * d)
    }

    /// Continuous second derivative at `t`.
    #[inline]
    pub fn x2(&self, t: Time) -> f64 {
        (2.0 * self.x[2]) + (6.0 * self.x[3] * (t - self.t_x))
    }

    /// Continuous third derivative.
    #[inline]
    pub fn x3(&self, _t: Time) -> f64 {
        6.0 * self.x[3]
    }

    /// Quantized value at `t`.
    #[inline]
    pub fn q(&self, t: Time) -> f64 {
        let d = t - self.t_q;
        self.q[0] + ((self.q[1] + (self.q[2] * d)) * d)
    }

    /// Quantized first derivative at `t`.
    #[inline]
    pub fn q1(&self, t: Time) -> f64 {
        self.q[1] + (2.0 * self.q[2] * (t - self.t_q))
    }

    /// Quantized second derivative.
    #[inline]
    pub fn q2(&self, _t: Time) -> f64 {
        2.0 * self.q[2]
    }

    /// Observee value propagated to the oracle: quantized by default,
    /// continuous under the xQSS policy, always continuous for non-states.
    #[inline]
    pub(crate) fn propagated(&self, t: Time, cfg: &Config) -> f64 {
        if self.is_state() && !cfg.propagate_continuous {
            self.q(t)
        } else {
            self.x(t)
        }
    }

    /// The zero-crossing quantized rep tracks the continuous one, truncated by
    /// one order.
    pub(crate) fn sync_zc_q(&mut self) {
        for k in 0..3 {
            self.q[k] = if k < self.order { self.x[k] } else { 0.0 };
        }
    }

    // --- Tolerances and step control ---------------------------------------

    /// Recompute `qTol` from the current quantized anchor value.
    pub(crate) fn set_qtol(&mut self) {
        let center = match &self.kind {
            VarKind::Liqss { q_c, .. } => *q_c,
            VarKind::ZeroCrossing(_) => self.x[0],
            _ => self.q[0],
        };
        self.qtol = (self.rtol * center.abs()).max(self.atol);
        debug_assert!(self.qtol > 0.0);
    }

    /// Deactivation control: bound how far out a vanishing-coefficient step may
    /// schedule, relaxing the bound geometrically while the variable stays
    /// inactive and shrinking it back once real steps return.
    pub(crate) fn dt_infinity(&mut self, dt: Time, cfg: &Config) -> Time {
        if cfg.dt_inf == f64::INFINITY {
            return dt;
        }
        if dt <= cfg.dt_inf {
            self.dt_inf_rlx = (0.5 * self.dt_inf_rlx).max(cfg.dt_inf);
            dt
        } else if dt <= self.dt_inf_rlx {
            self.dt_inf_rlx = (0.5 * self.dt_inf_rlx).max(dt);
            dt
        } else {
            let rlx = self.dt_inf_rlx;
            self.dt_inf_rlx = if rlx < f64::INFINITY {
                ((2.0 * rlx).min(dt)).min(cfg.dt_inf_max)
            } else {
                dt.min(cfg.dt_inf_max)
            };
            rlx
        }
    }

    fn relax_active(&self) -> bool {
        matches!(&self.kind, VarKind::Qss { relax: Some(r) } if r.active)
    }

    /// Relaxation factor applied to the top coefficient in yo-yo mode.
    pub(crate) fn rlx_factor(&self) -> f64 {
        if self.order >= 3 {
            0.25
        } else {
            0.5
        }
    }

    /// Set `tE` with the quantized and continuous reps aligned at `tQ`.
    pub(crate) fn set_te_aligned(&mut self, cfg: &Config) {
        debug_assert!(self.t_x <= self.t_q);
        let top = self.x[self.order];
        let mut dt = if top != 0.0 {
            let ratio = self.qtol / top.abs();
            match self.order {
                1 => ratio,
                2 => ratio.sqrt(),
                _ => ratio.cbrt(),
            }
        } else {
            f64::INFINITY
        };
        if self.relax_active() && (self.t_s > 0.0) {
            dt = dt.min(cfg.rlx_growth * self.t_s);
        }
        dt = self.dt_infinity(dt, cfg).clamp(self.dt_min, self.dt_max);
        self.t_e = if dt != f64::INFINITY { self.t_q + dt } else { f64::INFINITY };
        if cfg.inflection {
            self.truncate_at_inflection(true);
        }
        if self.t_e == self.t_q {
            self.t_e = next_up(self.t_e);
        }
    }

    /// Set `tE` with the continuous rep drifted ahead of the quantized one
    /// (the observer-update case): the step is the smallest positive root of
    /// the difference polynomial hitting either tolerance boundary.
    pub(crate) fn set_te_unaligned(&mut self, cfg: &Config) {
        debug_assert!(self.t_q <= self.t_x);
        let txq = self.t_x - self.t_q;
        let q_center = match &self.kind {
            VarKind::Liqss { q_c, .. } => *q_c,
            _ => self.q[0],
        };
        let d0 = self.x[0] - (q_center + ((self.q[1] + (self.q[2] * txq)) * txq));
        let d1 = self.x[1] - (self.q[1] + (2.0 * self.q[2] * txq));
        let d2 = self.x[2] - self.q[2];
        let mut dt = match self.order {
            1 => {
                if self.x[1] > 0.0 {
                    (self.qtol - d0) / self.x[1]
                } else if self.x[1] < 0.0 {
                    (-self.qtol - d0) / self.x[1]
                } else {
                    f64::INFINITY
                }
            }
            2 => {
                if (self.x[2] >= 0.0) && (d1 >= 0.0) {
                    math::min_root_quadratic_upper(self.x[2], d1, d0 - self.qtol)
                } else if (self.x[2] <= 0.0) && (d1 <= 0.0) {
                    math::min_root_quadratic_lower(self.x[2], d1, d0 + self.qtol)
                } else {
                    math::min_root_quadratic_both(self.x[2], d1, d0 + self.qtol, d0 - self.qtol)
                }
            }
            _ => {
                if (self.x[3] >= 0.0) && (d2 >= 0.0) && (d1 >= 0.0) {
                    math::min_root_cubic_upper(self.x[3], d2, d1, d0 - self.qtol)
                } else if (self.x[3] <= 0.0) && (d2 <= 0.0) && (d1 <= 0.0) {
                    math::min_root_cubic_lower(self.x[3], d2, d1, d0 + self.qtol)
                } else {
                    math::min_root_cubic_both(self.x[3], d2, d1, d0 + self.qtol, d0 - self.qtol)
                }
            }
        };
        dt = self.dt_infinity(dt, cfg).clamp(self.dt_min, self.dt_max);
        self.t_e = if dt != f64::INFINITY { self.t_x + dt } else { f64::INFINITY };
        if cfg.inflection {
            self.truncate_at_inflection(false);
        }
        if self.t_e == self.t_x {
            self.t_e = next_up(self.t_e);
        }
    }

    /// Pull `tE` in to the trajectory's inflection point when the top two
    /// coefficients disagree in sign, so the next requantization lands where
    /// the curvature changes.
    fn truncate_at_inflection(&mut self, aligned: bool) {
        let (lo, hi) = match self.order {
            2 => (self.x[1], self.x[2]),
            3 => (self.x[2], self.x[3]),
            _ => return,
        };
        if (hi == 0.0) || !math::nonzero_and_signs_differ(lo, hi) {
            return;
        }
        if !aligned {
            // Only truncate when the quantized rep still curves the old way.
            let q_hi = match self.order {
                2 => self.q[1],
                _ => self.q[2],
            };
            if math::signum(lo) != math::signum(q_hi) {
                return;
            }
        }
        let ti = self.t_x - (lo / (self.order as f64 * hi));
        let anchor = if aligned { self.t_q } else { self.t_x };
        if (anchor < ti) && (ti < self.t_e) {
            self.t_e = ti;
        }
    }

    // --- Numerical differentiation -----------------------------------------

    /// Second derivative from centered first-derivative probes at `tE ± dtND`.
    pub(crate) fn nd2_centered(&mut self, cfg: &Config, x1m: f64, x1p: f64) -> f64 {
        self.x1m = x1m;
        self.x1p = x1p;
        cfg.one_over_four_dt_nd() * (x1p - x1m)
    }

    /// Second derivative from forward probes at `tE + dtND` and `tE + 2·dtND`,
    /// used when the centered back step would precede simulation start.
    pub(crate) fn nd2_forward(&mut self, cfg: &Config, x1p: f64, x12p: f64) -> f64 {
        self.x1p = x1p;
        self.x12p = x12p;
        cfg.one_over_four_dt_nd() * ((3.0 * (x1p - self.x[1])) + (x1p - x12p))
    }

    /// Second derivative from a single forward probe (highest order is 2).
    pub(crate) fn nd2_single(&mut self, cfg: &Config, x1p: f64) -> f64 {
        self.x1p = x1p;
        cfg.one_over_two_dt_nd() * (x1p - self.x[1])
    }

    /// Third derivative from the stashed centered probes.
    pub(crate) fn nd3_centered(&self, cfg: &Config) -> f64 {
        cfg.one_over_six_dt_nd_squared() * ((self.x1p - self.x[1]) + (self.x1m - self.x[1]))
    }

    /// Third derivative from the stashed forward probes.
    pub(crate) fn nd3_forward(&self, cfg: &Config) -> f64 {
        cfg.one_over_six_dt_nd_squared() * ((self.x12p - self.x1p) + (self.x[1] - self.x1p))
    }

    // --- Relaxation --------------------------------------------------------

    /// Track a slope reversal at requantization. `x1_new` is the fresh slope,
    /// `x1_in` the continuous-trajectory slope entering this requantization
    /// from the prior segment. Engages yo-yo mode after `m_yoyo` consecutive
    /// alternating reversals larger than the quantized-slope scale.
    pub(crate) fn note_slope_reversal(&mut self, cfg: &Config, x1_new: f64, x1_in: f64) {
        let q1 = self.q[1];
        let (m_yoyo, yoyo_mul) = (cfg.m_yoyo, cfg.yoyo_mul);
        if let VarKind::Qss { relax: Some(r) } = &mut self.kind {
            if r.active {
                return;
            }
            let dif = x1_new - x1_in;
            let lim = yoyo_mul * (x1_new - r.q_1_2).abs().min((x1_new + r.q_1_2).abs());
            let sign = math::bool_sign(dif);
            r.q_1_2 = q1;
            if (dif.abs() > lim) && ((r.n == 0) || (sign != r.sign)) {
                r.sign = sign;
                r.n += 1;
                if r.n >= m_yoyo {
                    r.active = true;
                    tracing::debug!(name = %self.name, "yo-yo relaxation engaged");
                }
            } else {
                r.n = 0;
            }
        }
    }

    /// Handlers clear yo-yo state: a discontinuity restarts the bookkeeping.
    pub(crate) fn clear_relaxation(&mut self) {
        if let VarKind::Qss { relax: Some(r) } = &mut self.kind {
            *r = Relax::default();
        }
    }

    /// Damp the top coefficient while yo-yo mode is engaged.
    pub(crate) fn apply_relaxation(&mut self) {
        if self.relax_active() {
            let f = self.rlx_factor();
            self.x[self.order] *= f;
        }
    }

    // --- Recording ---------------------------------------------------------

    pub(crate) fn record(&mut self, t: Time) {
        if self.output.is_some() {
            let (x, q) = (self.x(t), self.q(t));
            self.output.as_mut().unwrap().push(Sample { t, x, q });
        }
    }
}

/// The next representable time after `t`.
#[inline]
pub(crate) fn next_up(t: Time) -> Time {
    // f64::next_up is not yet stable on our toolchain floor.
    if t == f64::INFINITY {
        t
    } else {
        f64::from_bits(if t >= 0.0 { t.to_bits() + 1 } else { t.to_bits() - 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qss_var(order: usize) -> Variable {
        let cfg = Config::default();
        let mut v = Variable::new("v".to_string(), order, VarKind::Qss { relax: None }, &cfg);
        v.qtol = 1.0e-4;
        v
    }

    #[test]
    fn test_horner_matches_power_form() {
        let mut v = qss_var(3);
        v.t_x = 2.0;
        v.t_q = 2.0;
        v.x = [1.0, -2.0, 0.5, 0.125];
        v.q = [1.0, -2.0, 0.5];
        for k in 0..=100 {
            let h = -1.0 + (0.02 * k as f64);
            let t = v.t_x + h;
            let power = v.x[0] + v.x[1] * h + v.x[2] * h * h + v.x[3] * h * h * h;
            assert!((v.x(t) - power).abs() <= 1.0e-14 * power.abs().max(1.0));
            let power1 = v.x[1] + 2.0 * v.x[2] * h + 3.0 * v.x[3] * h * h;
            assert!((v.x1(t) - power1).abs() <= 1.0e-13 * power1.abs().max(1.0));
            let powerq = v.q[0] + v.q[1] * h + v.q[2] * h * h;
            assert!((v.q(t) - powerq).abs() <= 1.0e-14 * powerq.abs().max(1.0));
        }
        assert_eq!(v.x2(v.t_x), 2.0 * v.x[2]);
        assert_eq!(v.x3(v.t_x), 6.0 * v.x[3]);
    }

    #[test]
    fn test_te_aligned_per_order() {
        let cfg = Config::default();
        for (order, top, expected_dt) in [
            (1, 0.01, 1.0e-4 / 0.01),
            (2, 0.01, (1.0e-4_f64 / 0.01).sqrt()),
            (3, 0.01, (1.0e-4_f64 / 0.01).cbrt()),
        ] {
            let mut v = qss_var(order);
            v.x[order] = top;
            v.set_te_aligned(&cfg);
            assert!(
                (v.t_e - expected_dt).abs() < 1.0e-12 * expected_dt,
                "order {order}: tE = {}, expected {expected_dt}",
                v.t_e
            );
        }
    }

    #[test]
    fn test_te_aligned_flat_is_infinite() {
        let cfg = Config::default();
        let mut v = qss_var(2);
        v.set_te_aligned(&cfg);
        assert_eq!(v.t_e, f64::INFINITY);
    }

    #[test]
    fn test_te_unaligned_bumps_underflow() {
        let cfg = Config::default();
        let mut v = qss_var(1);
        v.t_q = 1.0;
        v.t_x = 1.0;
        // Continuous value already at the tolerance boundary: root is zero.
        v.x = [1.0e-4, 1.0, 0.0, 0.0];
        v.q = [0.0, 0.0, 0.0];
        v.set_te_unaligned(&cfg);
        assert!(v.t_e > v.t_x);
        assert_eq!(v.t_e, next_up(1.0));
    }

    #[test]
    fn test_dt_infinity_relaxation_doubles() {
        let cfg = Config { dt_inf: 10.0, dt_inf_max: 100.0, ..Config::default() };
        let mut v = qss_var(2);
        v.dt_inf_rlx = cfg.dt_inf;
        // A deactivated variable asks for an infinite step and is granted the
        // relaxation step, which doubles on each consecutive use.
        assert_eq!(v.dt_infinity(f64::INFINITY, &cfg), 10.0);
        assert_eq!(v.dt_infinity(f64::INFINITY, &cfg), 20.0);
        assert_eq!(v.dt_infinity(f64::INFINITY, &cfg), 40.0);
        assert_eq!(v.dt_infinity(f64::INFINITY, &cfg), 80.0);
        assert_eq!(v.dt_infinity(f64::INFINITY, &cfg), 100.0);
        assert_eq!(v.dt_infinity(f64::INFINITY, &cfg), 100.0);
        // A small real step reactivates the variable and shrinks the bound.
        assert_eq!(v.dt_infinity(1.0, &cfg), 1.0);
        assert_eq!(v.dt_inf_rlx, 50.0);
    }

    #[test]
    fn test_crossing_classification() {
        assert_eq!(Crossing::from_signs(-1, 1), Crossing::UpNP);
        assert_eq!(Crossing::from_signs(-1, 0), Crossing::UpNZ);
        assert_eq!(Crossing::from_signs(0, 1), Crossing::UpZP);
        assert_eq!(Crossing::from_signs(1, -1), Crossing::DnPN);
        assert_eq!(Crossing::from_signs(1, 0), Crossing::DnPZ);
        assert_eq!(Crossing::from_signs(0, -1), Crossing::DnZN);
        assert_eq!(Crossing::from_signs(1, 1), Crossing::Flat);
        assert_eq!(Crossing::from_slope(2.0), Crossing::Up);
        assert_eq!(Crossing::from_slope(-2.0), Crossing::Dn);
        assert_eq!(Crossing::from_slope(0.0), Crossing::Flat);
    }

    #[test]
    fn test_crossing_sets() {
        let ups = CrossingSet::ups();
        assert!(ups.contains(Crossing::UpNP));
        assert!(ups.contains(Crossing::Up));
        assert!(!ups.contains(Crossing::DnPN));
        let both = CrossingSet::both();
        assert!(both.contains(Crossing::DnZN));
        assert!(both.contains(Crossing::UpZP));
        assert!(!both.contains(Crossing::Flat));
        assert!(!CrossingSet::EMPTY.contains(Crossing::Up));
    }

    #[test]
    fn test_yoyo_engages_after_alternating_reversals() {
        let cfg = Config { m_yoyo: 3, ..Config::default() };
        let mut v = Variable::new(
            "r".to_string(),
            2,
            VarKind::Qss { relax: Some(Relax::default()) },
            &cfg,
        );
        // A slope oscillating between ±1000: each requantization reverses the
        // sign while the magnitude matches the slope two requantizations back,
        // so the reversal dwarfs the quantized-slope scale in the criterion.
        let mut slope = 1.0e3;
        for step in 0..5 {
            v.note_slope_reversal(&cfg, slope, -slope);
            v.q[1] = slope;
            slope = -slope;
            assert_eq!(v.relax_active(), step >= 4, "step {step}");
        }
        // The top coefficient is damped while engaged.
        v.x[2] = 8.0;
        v.apply_relaxation();
        assert_eq!(v.x[2], 4.0);
        // A handler clears the state.
        v.clear_relaxation();
        assert!(!v.relax_active());
    }

    #[test]
    fn test_nd_recovers_polynomial_coefficients() {
        // x1(t) of x(t) = t³: probes of 3t² at ±dtND around 0 recover x2, x3.
        let cfg = Config::default();
        let mut v = qss_var(3);
        v.x[1] = 0.0;
        let dt = cfg.dt_nd;
        let x1 = |t: f64| 3.0 * t * t;
        let x2 = v.nd2_centered(&cfg, x1(-dt), x1(dt));
        let x3 = v.nd3_centered(&cfg);
        assert!(x2.abs() < 1.0e-8);
        assert!((x3 - 1.0).abs() < 1.0e-8);
        // Forward variant from the simulation start.
        let x2f = v.nd2_forward(&cfg, x1(dt), x1(2.0 * dt));
        let x3f = v.nd3_forward(&cfg);
        assert!(x2f.abs() < 1.0e-7);
        assert!((x3f - 1.0).abs() < 1.0e-8);
    }
}

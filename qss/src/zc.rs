//! Zero-crossing variables: detection, anti-chatter, and conditional coupling.
//!
//! A zero-crossing variable tracks an oracle event-indicator expression the
//! way states track their trajectories, but instead of a quantization event it
//! predicts the next sign change `tZ` of its continuous polynomial. The queue
//! entry flips between two categories: a requantization (`QssZc`) at `tE` when
//! that comes first, or a crossing (`ZeroCrossing`) at `tZ`.
//!
//! Chatter suppression: while the trajectory magnitude since the last crossing
//! stays inside `zTol`, sign wiggles are grazes: predicted crossings are
//! still scheduled (the culling in the root finder skips the grazing pairs)
//! but unpredicted sign flips are not reported.
//!
//! When a crossing fires, the variable activates its conditional, which runs
//! the oracle's discrete-event iteration at a slightly *bumped* time, far
//! enough past the crossing that the oracle's own indicator agrees the sign
//! changed, and then schedules handler events for the variables it reassigns.

use crate::math::{self, signum};
use crate::oracle::Oracle;
use crate::sim::{CondId, Sim};
use crate::time::{Category, Time};
use crate::variable::{Crossing, VarId};

impl<O: Oracle> Sim<O> {
    /// Pre-advance bookkeeping: remember the sign for unpredicted-crossing
    /// detection and fold the span `[tX, t]` into the anti-chatter magnitude,
    /// including interior extrema.
    fn zc_advance_pre(&mut self, v: VarId, t: Time) {
        let var = &self.vars[v.0];
        let ztol = var.ztol;
        let x_t = var.x(t);
        let crit = math::critical_point_magnitude_cubic(
            var.x[3],
            var.x[2],
            var.x[1],
            var.x[0],
            t - var.t_x,
        );
        let zs = self.vars[v.0].zc_mut();
        let past_tz = t > zs.t_z_last;
        zs.check_crossing = past_tz;
        if past_tz || (x_t != 0.0) {
            zs.sign_old = signum(x_t);
        }
        if (ztol > 0.0) && past_tz {
            // The trajectory can overshoot between updates; count the extremum.
            zs.x_mag = zs.x_mag.max(x_t.abs()).max(crit);
        }
    }

    /// Set the requantization time and fold the new anchor value into the
    /// anti-chatter magnitude.
    fn zc_set_te(&mut self, v: VarId) {
        let cfg = self.cfg.clone();
        let var = &mut self.vars[v.0];
        debug_assert!(var.t_q == var.t_x);
        var.set_te_aligned(&cfg);
        let mag = var.x[0].abs();
        let zs = var.zc_mut();
        zs.x_mag = zs.x_mag.max(mag);
    }

    /// Predict the next crossing on the active segment, classify it, and keep
    /// it only when its class is of interest.
    fn zc_set_tz(&mut self, v: VarId) {
        let var = &self.vars[v.0];
        let (x_mag, t_z_last) = {
            let zs = var.zc();
            (zs.x_mag, zs.t_z_last)
        };
        let dt = math::zc_root_cubic(var.x[3], var.x[2], var.x[1], var.x[0], var.ztol, x_mag);
        self.zc_commit_tz(v, var.t_x, var.x[0], var.x[1], dt, t_z_last);
    }

    /// Predict the next crossing on `(tb, tE]` using the trajectory shifted to
    /// `tb`. At the just-processed crossing time the trajectory restarts from
    /// an exact zero unless a handler moved the indicator's operands.
    fn zc_set_tz_from(&mut self, v: VarId, tb: Time) {
        let var = &self.vars[v.0];
        let (t_z_last, x_mag, handler_modified) = {
            let zs = var.zc();
            (zs.t_z_last, zs.x_mag, zs.handler_modified)
        };
        let db = tb - var.t_x;
        debug_assert!(db >= 0.0);
        let x0 = if (tb == t_z_last) && !handler_modified {
            0.0
        } else {
            var.x[0] + (var.x[1] * db) + (var.x[2] * db * db)
        };
        let x1 = var.x[1] + (2.0 * var.x[2] * db);
        let dt = math::zc_root_cubic(var.x[3], var.x[2], x1, x0, var.ztol, x_mag);
        self.zc_commit_tz(v, tb, x0, x1, dt, t_z_last);
    }

    fn zc_commit_tz(&mut self, v: VarId, tb: Time, x0: f64, x1: f64, dt: Time, t_z_last: Time) {
        if dt == f64::INFINITY {
            self.vars[v.0].zc_mut().t_z = f64::INFINITY;
            return;
        }
        debug_assert!(dt > 0.0);
        let t_z = tb + dt;
        if t_z <= t_z_last {
            self.vars[v.0].zc_mut().t_z = f64::INFINITY;
            return;
        }
        let var = &self.vars[v.0];
        let check = if x0 == 0.0 {
            if t_z == tb {
                Crossing::Flat
            } else {
                Crossing::from_slope(-x1)
            }
        } else if x0 > 0.0 {
            Crossing::from_slope(var.x1(t_z).min(0.0))
        } else {
            Crossing::from_slope(var.x1(t_z).max(0.0))
        };
        let zs = self.vars[v.0].zc_mut();
        if zs.interest.contains(check) {
            zs.crossing = check;
            zs.t_z = t_z;
        } else {
            zs.t_z = f64::INFINITY;
        }
    }

    /// Detect or schedule: report an unpredicted sign change immediately at
    /// `tX` (unless anti-chatter suppresses it), otherwise schedule the
    /// predicted crossing, and re-key the queue entry to whichever of `tE` and
    /// `tZ` comes first.
    fn zc_crossing_detect(&mut self, v: VarId) {
        let (ztol, t_x, sign_new) = {
            let var = &self.vars[v.0];
            (var.ztol, var.t_x, signum(var.x[0]))
        };
        let (x_mag, check_crossing, sign_old, t_z_last, interest) = {
            let zs = self.vars[v.0].zc();
            (zs.x_mag, zs.check_crossing, zs.sign_old, zs.t_z_last, zs.interest)
        };
        if (ztol > 0.0) && (x_mag < ztol) {
            // Anti-chatter: still inside the band, never report.
            self.zc_set_tz(v);
        } else if !check_crossing || (sign_old == sign_new) || (t_x <= t_z_last) {
            self.zc_set_tz(v);
        } else {
            let check = Crossing::from_signs(sign_old, sign_new);
            if interest.contains(check) {
                let zs = self.vars[v.0].zc_mut();
                zs.crossing = check;
                zs.detected = true;
                zs.t_z = t_x;
                self.shift_own(v, Category::ZeroCrossing, t_x);
                return;
            }
            self.zc_set_tz(v);
        }
        self.zc_schedule(v);
    }

    /// Queue entry selection: requantization at `tE` or crossing at `tZ`.
    fn zc_schedule(&mut self, v: VarId) {
        let (t_e, t_z) = (self.vars[v.0].t_e, self.vars[v.0].zc().t_z);
        if t_e < t_z {
            self.shift_own(v, Category::QssZc, t_e);
        } else {
            self.shift_own(v, Category::ZeroCrossing, t_z);
        }
    }

    /// A time just past `t` by which the oracle's own event indicator will
    /// have seen the sign change: the trajectory will be `zMul·zTol` past
    /// zero, falling back through lower-order estimates when the polynomial
    /// gives no bound.
    pub(crate) fn tzc_bump(&self, v: VarId, t: Time) -> Time {
        let cfg = &self.cfg;
        let var = &self.vars[v.0];
        if var.ztol > 0.0 {
            let d = t - var.t_x;
            let x1_t = var.x1(t);
            let x2_t = var.x[2] + (3.0 * var.x[3] * d);
            let btol = cfg.z_mul * var.ztol;
            let mut dt = if (var.x[3] >= 0.0) && (x2_t >= 0.0) && (x1_t >= 0.0) {
                math::min_root_cubic_upper(var.x[3], x2_t, x1_t, -btol)
            } else if (var.x[3] <= 0.0) && (x2_t <= 0.0) && (x1_t <= 0.0) {
                math::min_root_cubic_lower(var.x[3], x2_t, x1_t, btol)
            } else {
                math::min_root_cubic_both(var.x[3], x2_t, x1_t, btol, -btol)
            };
            if (dt <= 0.0) || (dt == f64::INFINITY) {
                dt = math::min_root_quadratic_both(x2_t, x1_t, btol, -btol);
            }
            if (dt <= 0.0) || (dt == f64::INFINITY) {
                dt = if x1_t != 0.0 { btol / x1_t.abs() } else { cfg.dt_zc };
            }
            t + dt
        } else {
            t + cfg.dt_zc
        }
    }

    /// Re-read the indicator value and rebuild the trajectory coefficients
    /// from oracle probes. Shared by initialization, requantization, and the
    /// handler path.
    fn dd_refresh_coefficients(&mut self, v: VarId, t: Time, value: Option<f64>) {
        let cfg = self.cfg.clone();
        let x0 = match value {
            Some(x0) => x0,
            None => {
                let ids = self.own_observees(v);
                self.set_observee_values_x(&ids, t);
                let r = self.vars[v.0].var_ref;
                self.oracle.get_real(r)
            }
        };
        self.vars[v.0].x[0] = x0;
        let x1 = self.x1_dd(v, t);
        self.vars[v.0].x[1] = x1;
        let order = self.vars[v.0].order;
        if order == 2 {
            let tp = t + cfg.dt_nd;
            self.oracle.set_time(tp);
            let p = self.x1_dd(v, tp);
            self.oracle.set_time(t);
            let var = &mut self.vars[v.0];
            var.x[2] = var.nd2_single(&cfg, p);
        } else if order >= 3 {
            if self.fwd_time_nd(t) {
                let tm = t - cfg.dt_nd;
                self.oracle.set_time(tm);
                let x1m = self.x1_dd(v, tm);
                let tp = t + cfg.dt_nd;
                self.oracle.set_time(tp);
                let x1p = self.x1_dd(v, tp);
                self.oracle.set_time(t);
                let var = &mut self.vars[v.0];
                var.x[2] = var.nd2_centered(&cfg, x1m, x1p);
                var.x[3] = var.nd3_centered(&cfg);
            } else {
                let tp = t + cfg.dt_nd;
                self.oracle.set_time(tp);
                let x1p = self.x1_dd(v, tp);
                let t2p = t + cfg.two_dt_nd();
                self.oracle.set_time(t2p);
                let x12p = self.x1_dd(v, t2p);
                self.oracle.set_time(t);
                let var = &mut self.vars[v.0];
                var.x[2] = var.nd2_forward(&cfg, x1p, x12p);
                var.x[3] = var.nd3_forward(&cfg);
            }
        }
        self.vars[v.0].sync_zc_q();
    }

    /// Initialize a zero-crossing variable and schedule its first event.
    pub(crate) fn init_zc(&mut self, v: VarId, t0: Time) {
        assert!(
            self.vars[v.0].observers.is_empty(),
            "zero-crossing variable {} has observers",
            self.vars[v.0].name
        );
        self.dd_refresh_coefficients(v, t0, None);
        {
            let x0 = self.vars[v.0].x[0];
            let zs = self.vars[v.0].zc_mut();
            zs.detected = false;
            zs.x_mag = x0.abs();
            zs.sign_old = signum(x0);
            zs.check_crossing = false;
        }
        self.vars[v.0].set_qtol();
        self.zc_set_te(v);
        self.zc_set_tz(v);
        let (t_e, t_z) = (self.vars[v.0].t_e, self.vars[v.0].zc().t_z);
        let key = if t_e < t_z {
            self.queue.add(Category::QssZc, t_e, crate::queue::Target::Var(v))
        } else {
            self.queue.add(Category::ZeroCrossing, t_z, crate::queue::Target::Var(v))
        };
        self.vars[v.0].event = Some(key);
        tracing::debug!(name = %self.vars[v.0].name, t_e, t_z, "zero-crossing initialized");
    }

    /// Requantize zero-crossing triggers at `tE`.
    pub(crate) fn advance_zc_requant_batch(&mut self, ids: &[VarId], t: Time) {
        for &v in ids {
            self.zc_advance_pre(v, t);
            {
                let var = &mut self.vars[v.0];
                var.t_s = t - var.t_q;
                var.t_q = t;
                var.t_x = t;
            }
            self.dd_refresh_coefficients(v, t, None);
            self.vars[v.0].set_qtol();
            self.zc_set_te(v);
            self.zc_crossing_detect(v);
            self.vars[v.0].record(t);
        }
    }

    /// Process fired crossings: activate conditionals, reset the anti-chatter
    /// magnitude, and look for the next crossing beyond this one.
    pub(crate) fn advance_zc_crossing_batch(&mut self, ids: &[VarId], t: Time) {
        for &v in ids {
            let cond = self.vars[v.0].zc().conditional;
            if let Some(c) = cond {
                let key = self.conditionals[c.0].event.expect("conditional has no queue entry");
                let key = self.queue.shift(Category::Conditional, t, key);
                self.conditionals[c.0].event = Some(key);
            }
            {
                let zs = self.vars[v.0].zc_mut();
                zs.crossing_last = zs.crossing;
                zs.x_mag = 0.0;
                zs.t_z_last = zs.t_z;
                zs.handler_modified = false;
                zs.detected = false;
            }
            tracing::debug!(name = %self.vars[v.0].name, t, crossing = ?self.vars[v.0].zc().crossing_last, "crossing fired");
            self.zc_set_tz_from(v, t);
            self.zc_schedule(v);
        }
    }

    /// Run a conditional: execute the oracle's discrete-event iteration at the
    /// bumped crossing time and schedule this conditional's handler events in
    /// the current pass.
    pub(crate) fn advance_conditional(&mut self, c: CondId, t: Time) {
        let zc = self.conditionals[c.0].zc;
        let zref = self.vars[zc.0].var_ref;

        // Present continuous values to the event iteration.
        let states: Vec<VarId> =
            (0..self.vars.len()).map(VarId).filter(|v| self.vars[v.0].is_state()).collect();
        self.set_observee_values_x(&states, t);

        let before = self.oracle.get_real(zref);
        let tb = self.tzc_bump(zc, t);
        self.oracle.set_time(tb);
        let info = self.oracle.new_discrete_states();
        self.oracle.set_time(t);
        let after = self.oracle.get_real(zref);
        {
            let zs = self.vars[zc.0].zc_mut();
            zs.handler_modified = after != before;
            zs.x_0_bump = after;
        }
        if info.terminate {
            self.terminate = true;
        }

        let handlers = self.conditionals[c.0].handlers.clone();
        for h in handlers {
            let val = self.oracle.get_real(self.vars[h.0].var_ref);
            let key = self.vars[h.0].event.expect("handler variable has no queue entry");
            let key = self.queue.shift_handler(t, val, key);
            self.vars[h.0].event = Some(key);
        }
        let key = self.conditionals[c.0].event.expect("conditional has no queue entry");
        let key = self.queue.shift_to_infinity(Category::Conditional, key);
        self.conditionals[c.0].event = Some(key);
    }

    /// Rebuild a zero-crossing variable after a handler event at `t`.
    pub(crate) fn advance_zc_handler(&mut self, v: VarId, t: Time) {
        self.zc_advance_pre(v, t);
        {
            let var = &mut self.vars[v.0];
            var.t_s = t - var.t_q;
            var.t_q = t;
            var.t_x = t;
        }
        self.dd_refresh_coefficients(v, t, None);
        self.vars[v.0].set_qtol();
        self.zc_set_te(v);
        self.zc_crossing_detect(v);
    }

    /// Observer-path update for a zero-crossing variable, given the bulk-read
    /// value and directional derivative. The trajectory restarts from an exact
    /// zero at a just-fired crossing unless a handler moved the operands.
    pub(crate) fn zc_observer_stage_1(&mut self, v: VarId, t: Time, val: f64, der: f64) {
        self.zc_advance_pre(v, t);
        let (t_z_last, handler_modified) = {
            let zs = self.vars[v.0].zc();
            (zs.t_z_last, zs.handler_modified)
        };
        let var = &mut self.vars[v.0];
        var.t_s = t - var.t_q;
        var.t_q = t;
        var.t_x = t;
        var.x[0] = if !handler_modified && (t == t_z_last) { 0.0 } else { val };
        var.x[1] = der;
    }

    /// Observer-path stage F for a zero-crossing variable.
    pub(crate) fn zc_observer_stage_f(&mut self, v: VarId) {
        self.vars[v.0].sync_zc_q();
        self.vars[v.0].set_qtol();
        self.zc_set_te(v);
        self.zc_crossing_detect(v);
    }
}

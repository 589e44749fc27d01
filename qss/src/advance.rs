//! Requantization advances for QSS, LIQSS, input, and discrete triggers.
//!
//! A single trigger runs its stages back to back with per-variable oracle
//! probes. Simultaneous triggers interleave: every stage-0 anchor advance
//! completes before any stage-1 derivative read, because the derivatives the
//! oracle hands back depend on the trigger values stage 0 just committed.
//! LIQSS self-observers replace the plain derivative stages with probe-based
//! implicit selection of the quantized value.

use crate::math::signum;
use crate::observers::uniquify;
use crate::oracle::Oracle;
use crate::sim::Sim;
use crate::time::{Category, Time};
use crate::variable::{VarId, VarKind};

impl<O: Oracle> Sim<O> {
    /// Stage 0: advance the anchors to the event time and evaluate the new
    /// trajectory value.
    fn qss_stage_0(&mut self, v: VarId, t: Time) {
        let var = &mut self.vars[v.0];
        var.t_s = t - var.t_q;
        var.x1_in = var.x1(t);
        let x0 = var.x(t);
        var.t_x = t;
        var.t_q = t;
        var.x[0] = x0;
        var.q[0] = x0;
        if let VarKind::Liqss { q_c, l_0 } = &mut var.kind {
            *q_c = x0;
            *l_0 = x0;
        }
    }

    /// Stage 1: adopt the fresh first derivative, tracking slope reversals for
    /// the relaxed variants.
    fn qss_stage_1(&mut self, v: VarId, x1: f64) {
        let cfg = self.cfg.clone();
        let var = &mut self.vars[v.0];
        let x1_in = var.x1_in;
        var.note_slope_reversal(&cfg, x1, x1_in);
        var.x[1] = x1;
        var.q[1] = x1;
    }

    /// Stages 2 and 3 for a single trigger: ND probes of the first derivative
    /// around `t`, centered when the back step stays inside the simulation.
    fn qss_stages_2_3(&mut self, v: VarId, t: Time) {
        let order = self.vars[v.0].order;
        if order < 2 {
            return;
        }
        let cfg = self.cfg.clone();
        if order == 2 {
            let tp = t + cfg.dt_nd;
            self.oracle.set_time(tp);
            let p = self.c1(v, tp);
            self.oracle.set_time(t);
            let var = &mut self.vars[v.0];
            var.x[2] = var.nd2_single(&cfg, p);
        } else if self.fwd_time_nd(t) {
            let tm = t - cfg.dt_nd;
            self.oracle.set_time(tm);
            let x1m = self.c1(v, tm);
            let tp = t + cfg.dt_nd;
            self.oracle.set_time(tp);
            let x1p = self.c1(v, tp);
            self.oracle.set_time(t);
            let var = &mut self.vars[v.0];
            var.x[2] = var.nd2_centered(&cfg, x1m, x1p);
            var.x[3] = var.nd3_centered(&cfg);
        } else {
            let tp = t + cfg.dt_nd;
            self.oracle.set_time(tp);
            let x1p = self.c1(v, tp);
            let t2p = t + cfg.two_dt_nd();
            self.oracle.set_time(t2p);
            let x12p = self.c1(v, t2p);
            self.oracle.set_time(t);
            let var = &mut self.vars[v.0];
            var.x[2] = var.nd2_forward(&cfg, x1p, x12p);
            var.x[3] = var.nd3_forward(&cfg);
        }
        let var = &mut self.vars[v.0];
        var.q[2] = var.x[2]; // ND deferred
    }

    /// Stage F for state triggers: tolerances, quantized commit, next event.
    fn qss_stage_f(&mut self, v: VarId, t: Time) {
        let cfg = self.cfg.clone();
        if self.vars[v.0].is_liqss() {
            self.commit_liqss(v);
        } else {
            let var = &mut self.vars[v.0];
            var.set_qtol();
            var.apply_relaxation();
        }
        let var = &mut self.vars[v.0];
        var.set_te_aligned(&cfg);
        let t_e = var.t_e;
        self.shift_own(v, Category::Qss, t_e);
        self.vars[v.0].record(t);
    }

    /// Advance one or more state triggers at `t`.
    pub(crate) fn advance_qss_batch(&mut self, ids: &[VarId], t: Time) {
        if ids.len() == 1 {
            self.advance_qss_single(ids[0], t);
            return;
        }
        for &v in ids {
            self.qss_stage_0(v, t);
        }
        // Commit every trigger and observee value before any derivative read.
        let mut union: Vec<VarId> = ids.to_vec();
        for &v in ids {
            union.extend(self.vars[v.0].observees.iter().copied());
        }
        uniquify(&mut union);
        self.set_observee_values(&union, t);

        let der_refs: Vec<u32> = ids
            .iter()
            .map(|v| self.vars[v.0].der_ref.expect("state without derivative reference"))
            .collect();
        let mut ders = vec![0.0; ids.len()];
        self.oracle.get_reals(&der_refs, &mut ders);
        for (k, &v) in ids.iter().enumerate() {
            self.qss_stage_1(v, ders[k]);
        }

        let cfg = self.cfg.clone();
        let max_order = ids.iter().map(|v| self.vars[v.0].order).max().unwrap_or(1);
        let mut ders_m = vec![0.0; ids.len()];
        let mut ders_p = vec![0.0; ids.len()];
        if max_order >= 3 {
            let centered = self.fwd_time_nd(t);
            let (ta, tb) = if centered {
                (t - cfg.dt_nd, t + cfg.dt_nd)
            } else {
                (t + cfg.dt_nd, t + cfg.two_dt_nd())
            };
            self.oracle.set_time(ta);
            self.set_observee_values(&union, ta);
            self.oracle.get_reals(&der_refs, &mut ders_m);
            self.oracle.set_time(tb);
            self.set_observee_values(&union, tb);
            self.oracle.get_reals(&der_refs, &mut ders_p);
            self.oracle.set_time(t);
            for (k, &v) in ids.iter().enumerate() {
                let var = &mut self.vars[v.0];
                if var.order >= 2 {
                    if centered {
                        var.x[2] = var.nd2_centered(&cfg, ders_m[k], ders_p[k]);
                        if var.order >= 3 {
                            var.x[3] = var.nd3_centered(&cfg);
                        }
                    } else {
                        var.x[2] = var.nd2_forward(&cfg, ders_m[k], ders_p[k]);
                        if var.order >= 3 {
                            var.x[3] = var.nd3_forward(&cfg);
                        }
                    }
                    var.q[2] = var.x[2];
                }
            }
        } else if max_order == 2 {
            let tp = t + cfg.dt_nd;
            self.oracle.set_time(tp);
            self.set_observee_values(&union, tp);
            self.oracle.get_reals(&der_refs, &mut ders_p);
            self.oracle.set_time(t);
            for (k, &v) in ids.iter().enumerate() {
                let var = &mut self.vars[v.0];
                if var.order >= 2 {
                    var.x[2] = var.nd2_single(&cfg, ders_p[k]);
                    var.q[2] = var.x[2];
                }
            }
        }

        // LIQSS self-observers select their quantized value tentatively here
        // and commit it in stage F, so peer triggers' stages saw the center.
        for &v in ids {
            if self.vars[v.0].is_liqss() && self.vars[v.0].self_observer {
                self.vars[v.0].set_qtol();
                let forward = !self.fwd_time_nd(t);
                self.liqss_select(v, t, forward);
            }
        }
        for &v in ids {
            self.qss_stage_f(v, t);
        }
        self.advance_union_observers(ids, t);
    }

    fn advance_qss_single(&mut self, v: VarId, t: Time) {
        self.qss_stage_0(v, t);
        if self.vars[v.0].is_liqss() && self.vars[v.0].self_observer {
            self.vars[v.0].set_qtol();
            let forward = !self.fwd_time_nd(t);
            self.liqss_select(v, t, forward);
        } else {
            let x1 = self.c1(v, t);
            self.qss_stage_1(v, x1);
            self.qss_stages_2_3(v, t);
        }
        self.qss_stage_f(v, t);
        self.advance_own_observers(v, t);
    }

    /// Commit the LIQSS quantized trajectory: self-observers adopt the
    /// implicitly selected value, others offset the center toward the
    /// trajectory's pull.
    pub(crate) fn commit_liqss(&mut self, v: VarId) {
        let var = &mut self.vars[v.0];
        var.set_qtol();
        let order = var.order;
        let (x1, x2, x_top) = (var.x[1], var.x[2], var.x[order]);
        let qtol = var.qtol;
        let (q_c, l_0) = match &var.kind {
            VarKind::Liqss { q_c, l_0 } => (*q_c, *l_0),
            _ => unreachable!("LIQSS commit on a non-LIQSS variable"),
        };
        if var.self_observer {
            var.q[0] = l_0;
            var.q[1] = x1;
            var.q[2] = x2;
        } else {
            var.q[0] = q_c + (signum(x_top) as f64 * qtol);
        }
    }

    /// Implicit quantized-value selection for a self-observing LIQSS variable:
    /// probe the derivative at the quantum boundaries `center ± qTol`, pick
    /// the boundary the trajectory curls toward, or the interior balance point
    /// when the probes disagree.
    pub(crate) fn liqss_select(&mut self, v: VarId, t: Time, forward: bool) {
        let cfg = self.cfg.clone();
        let order = self.vars[v.0].order;
        let qtol = self.vars[v.0].qtol;
        let q_c = self.vars[v.0].x[0];
        let (q_l, q_u) = (q_c - qtol, q_c + qtol);
        let vref = self.vars[v.0].var_ref;
        let dref = self.vars[v.0].der_ref.expect("LIQSS without derivative reference");
        let obs: Vec<VarId> = self.vars[v.0].observees.iter().copied().collect();

        self.set_observee_values(&obs, t);
        self.oracle.set_real(vref, q_l);
        let d1_l = self.oracle.get_real(dref);
        self.oracle.set_real(vref, q_u);
        let d1_u = self.oracle.get_real(dref);

        if order == 1 {
            let sel = match (signum(d1_l), signum(d1_u)) {
                (-1, -1) => (q_l, d1_l),
                (1, 1) => (q_u, d1_u),
                (0, 0) => (q_c, 0.5 * (d1_l + d1_u)),
                _ => {
                    // The derivative vanishes inside the quantum: interpolate.
                    let q_z = q_l + ((2.0 * qtol) * (-d1_l) / (d1_u - d1_l));
                    (q_z.clamp(q_l, q_u), 0.0)
                }
            };
            let var = &mut self.vars[v.0];
            var.x[1] = sel.1;
            if let VarKind::Liqss { l_0, .. } = &mut var.kind {
                *l_0 = sel.0;
            }
            return;
        }

        // Second-derivative probes: move the boundary values along their
        // tentative trajectories and difference the derivative.
        let dn = cfg.dt_nd;
        let tn = t + dn;
        self.oracle.set_time(tn);
        self.set_observee_values(&obs, tn);
        self.oracle.set_real(vref, q_l + (d1_l * dn));
        let d1p_l = self.oracle.get_real(dref);
        let x2_l = cfg.one_over_two_dt_nd() * (d1p_l - d1_l);
        self.oracle.set_real(vref, q_u + (d1_u * dn));
        let d1p_u = self.oracle.get_real(dref);
        let x2_u = cfg.one_over_two_dt_nd() * (d1p_u - d1_u);

        if order == 2 {
            self.oracle.set_time(t);
            let sel = match (signum(x2_l), signum(x2_u)) {
                (-1, -1) => (q_l, d1_l, x2_l),
                (1, 1) => (q_u, d1_u, x2_u),
                (0, 0) => (q_c, 0.5 * (d1_l + d1_u), 0.0),
                _ => {
                    let q_z = (q_l + ((2.0 * qtol) * (-x2_l) / (x2_u - x2_l))).clamp(q_l, q_u);
                    let frac = (q_z - q_l) / (2.0 * qtol);
                    (q_z, d1_l + ((d1_u - d1_l) * frac), 0.0)
                }
            };
            let var = &mut self.vars[v.0];
            var.x[1] = sel.1;
            var.x[2] = sel.2;
            if let VarKind::Liqss { l_0, .. } = &mut var.kind {
                *l_0 = sel.0;
            }
            return;
        }

        // Third-derivative probes.
        let (x3_l, x3_u);
        if !forward {
            let tm = t - dn;
            self.oracle.set_time(tm);
            self.set_observee_values(&obs, tm);
            self.oracle.set_real(vref, q_l - ((d1_l - (x2_l * dn)) * dn));
            let d1m_l = self.oracle.get_real(dref);
            x3_l = cfg.one_over_six_dt_nd_squared() * ((d1p_l - d1_l) + (d1m_l - d1_l));
            self.oracle.set_real(vref, q_u - ((d1_u - (x2_u * dn)) * dn));
            let d1m_u = self.oracle.get_real(dref);
            x3_u = cfg.one_over_six_dt_nd_squared() * ((d1p_u - d1_u) + (d1m_u - d1_u));
        } else {
            let dn2 = cfg.two_dt_nd();
            let t2 = t + dn2;
            self.oracle.set_time(t2);
            self.set_observee_values(&obs, t2);
            self.oracle.set_real(vref, q_l + ((d1_l + (x2_l * dn2)) * dn2));
            let d12p_l = self.oracle.get_real(dref);
            x3_l = cfg.one_over_six_dt_nd_squared() * ((d12p_l - d1p_l) + (d1_l - d1p_l));
            self.oracle.set_real(vref, q_u + ((d1_u + (x2_u * dn2)) * dn2));
            let d12p_u = self.oracle.get_real(dref);
            x3_u = cfg.one_over_six_dt_nd_squared() * ((d12p_u - d1p_u) + (d1_u - d1p_u));
        }
        self.oracle.set_time(t);
        let sel = match (signum(x3_l), signum(x3_u)) {
            (-1, -1) => (q_l, d1_l, x2_l, x3_l),
            (1, 1) => (q_u, d1_u, x2_u, x3_u),
            (0, 0) => (q_c, 0.5 * (d1_l + d1_u), 0.5 * (x2_l + x2_u), 0.0),
            _ => {
                let q_z = (q_l + ((2.0 * qtol) * (-x3_l) / (x3_u - x3_l))).clamp(q_l, q_u);
                let frac = (q_z - q_l) / (2.0 * qtol);
                (
                    q_z,
                    d1_l + ((d1_u - d1_l) * frac),
                    x2_l + ((x2_u - x2_l) * frac),
                    0.0,
                )
            }
        };
        let var = &mut self.vars[v.0];
        var.x[1] = sel.1;
        var.x[2] = sel.2;
        var.x[3] = sel.3;
        if let VarKind::Liqss { l_0, .. } = &mut var.kind {
            *l_0 = sel.0;
        }
    }

    // --- Inputs ------------------------------------------------------------

    /// Refresh an input's trajectory coefficients from its source function and
    /// push the new value to the oracle.
    pub(crate) fn advance_input_coefficients(&mut self, v: VarId, t: Time) {
        let token = match &self.vars[v.0].kind {
            VarKind::Input(f) => f(t),
            _ => unreachable!("input advance on a non-input variable"),
        };
        let var = &mut self.vars[v.0];
        var.t_s = t - var.t_q;
        var.t_x = t;
        var.t_q = t;
        let order = var.order;
        let coeffs = [token.x0, token.x1, token.x2, token.x3];
        for k in 0..4 {
            var.x[k] = if k <= order { coeffs[k] } else { 0.0 };
        }
        for k in 0..3 {
            var.q[k] = var.x[k];
        }
        let (r, x0) = (var.var_ref, var.x[0]);
        self.oracle.set_real(r, x0);
    }

    /// Advance input triggers at `t`: new coefficients, new event, observers.
    pub(crate) fn advance_input_batch(&mut self, ids: &[VarId], t: Time) {
        let cfg = self.cfg.clone();
        for &v in ids {
            self.advance_input_coefficients(v, t);
            let var = &mut self.vars[v.0];
            var.set_qtol();
            var.set_te_aligned(&cfg);
            let t_e = var.t_e;
            self.shift_own(v, Category::QssInput, t_e);
            self.vars[v.0].record(t);
        }
        self.advance_union_observers(ids, t);
    }

    // --- Discrete ----------------------------------------------------------

    /// Schedule a discrete event for `v` at `t`.
    pub fn schedule_discrete(&mut self, v: VarId, t: Time) {
        assert!(self.vars[v.0].is_discrete_kind(), "discrete events target discrete variables");
        let key = self.vars[v.0].event.expect("variable has no queue entry");
        let key = self.queue.shift(Category::Discrete, t, key);
        self.vars[v.0].event = Some(key);
    }

    /// Advance discrete triggers: re-read the oracle value and, if it changed,
    /// wake the observers.
    pub(crate) fn advance_discrete_batch(&mut self, ids: &[VarId], t: Time) {
        let mut changed: Vec<VarId> = Vec::new();
        for &v in ids {
            let r = self.vars[v.0].var_ref;
            let val = self.oracle.get_real(r);
            let var = &mut self.vars[v.0];
            var.t_x = t;
            var.t_q = t;
            if val != var.x[0] {
                var.x[0] = val;
                var.q[0] = val;
                changed.push(v);
            }
            var.record(t);
            let key = self.vars[v.0].event.expect("variable has no queue entry");
            let key = self.queue.shift_to_infinity(Category::Handler, key);
            self.vars[v.0].event = Some(key);
        }
        if !changed.is_empty() {
            self.advance_union_observers(&changed, t);
        }
    }
}

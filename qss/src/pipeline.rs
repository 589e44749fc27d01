//! The batched observer and handler pipelines.
//!
//! Both pipelines walk a plan's variant ranges in stage order, issuing one
//! bulk oracle call per range and stage: write every observee value, read
//! every derivative, hand each observer its number, then move the oracle clock
//! to the ND probe offsets and repeat. The ordering guarantees are what make
//! this correct: all observee values for a probe time are committed before any
//! derivative at that time is read, and every range finishes its numeric
//! stages before the final stage re-keys queue entries.
//!
//! Handler batches differ in their stage 0, whose post-event values come
//! *from* the oracle, written by the conditional's discrete iteration; and in their
//! final-stage ordering: state ranges finalize before zero-crossing ranges so
//! event indicators see fresh trajectories.

use crate::handlers::Handlers;
use crate::observers::{uniquify, Observers};
use crate::oracle::Oracle;
use crate::sim::Sim;
use crate::time::{Category, Time};
use crate::variable::{VarId, VarKind};

impl<O: Oracle> Sim<O> {
    /// Advance the cached observer plan of `v` after its requantization.
    pub(crate) fn advance_own_observers(&mut self, v: VarId, t: Time) {
        if self.vars[v.0].plan.is_empty() {
            return;
        }
        let mut plan = std::mem::take(&mut self.vars[v.0].plan);
        self.run_observer_pipeline(&mut plan, t);
        self.vars[v.0].plan = plan;
    }

    /// Advance the union of the observers of `ids`, excluding `ids` themselves
    /// (simultaneous triggers have already rebuilt their own trajectories).
    pub(crate) fn advance_union_observers(&mut self, ids: &[VarId], t: Time) {
        let mut union: Vec<VarId> = Vec::new();
        for &v in ids {
            union.extend(self.vars[v.0].observers.iter().copied());
        }
        uniquify(&mut union);
        union.retain(|o| !ids.contains(o));
        if union.is_empty() {
            return;
        }
        let mut plan = Observers::default();
        plan.set_up(&self.vars, union);
        self.run_observer_pipeline(&mut plan, t);
    }

    /// One observer advance: stages 1..3 per range, then the final stage over
    /// the whole plan in range order.
    pub(crate) fn run_observer_pipeline(&mut self, plan: &mut Observers, t: Time) {
        debug_assert_eq!(self.oracle.time(), t);
        if plan.qss.have() {
            self.observer_qss_stages(plan, t);
        }
        if plan.r.have() {
            self.observer_r_stages(plan, t);
        }
        if plan.ox.have() {
            self.observer_ox_stage(plan, t);
        }
        if plan.zc.have() {
            self.observer_zc_stages(plan, t);
        }
        self.observer_stage_f(plan);
    }

    /// QSS state observers: continuous trajectories re-anchor at `t`, with new
    /// derivatives from one bulk read per probe time.
    fn observer_qss_stages(&mut self, plan: &mut Observers, t: Time) {
        let cfg = self.cfg.clone();
        let observees = plan.qss_observees.clone();
        self.set_observee_values(&observees, t);
        self.oracle.get_reals(&plan.qss_der_refs, &mut plan.qss_ders);
        for i in plan.qss.b..plan.qss.e {
            let var = &mut self.vars[plan.list[i].0];
            let x0 = var.x(t);
            var.t_x = t;
            var.x[0] = x0;
            var.x[1] = plan.qss_ders[i];
        }
        let max_order = plan.qss_max_order();
        if max_order >= 3 {
            let centered = self.fwd_time_nd(t);
            let (ta, tb) = if centered {
                (t - cfg.dt_nd, t + cfg.dt_nd)
            } else {
                (t + cfg.dt_nd, t + cfg.two_dt_nd())
            };
            let probe_obs =
                if plan.qss_uni_order { observees } else { plan.qss3_observees.clone() };
            let b2 = plan.qss2.b;
            self.oracle.set_time(ta);
            self.set_observee_values(&probe_obs, ta);
            self.oracle.get_reals(&plan.qss_der_refs[b2..], &mut plan.qss_ders_m[b2..]);
            self.oracle.set_time(tb);
            self.set_observee_values(&probe_obs, tb);
            self.oracle.get_reals(&plan.qss_der_refs[b2..], &mut plan.qss_ders_p[b2..]);
            self.oracle.set_time(t);
            for i in b2..plan.qss.e {
                let var = &mut self.vars[plan.list[i].0];
                if centered {
                    var.x[2] = var.nd2_centered(&cfg, plan.qss_ders_m[i], plan.qss_ders_p[i]);
                } else {
                    var.x[2] = var.nd2_forward(&cfg, plan.qss_ders_m[i], plan.qss_ders_p[i]);
                }
            }
            for i in plan.qss3.b..plan.qss.e {
                let var = &mut self.vars[plan.list[i].0];
                var.x[3] = if centered { var.nd3_centered(&cfg) } else { var.nd3_forward(&cfg) };
            }
        } else if max_order == 2 {
            let tp = t + cfg.dt_nd;
            let probe_obs =
                if plan.qss_uni_order { observees } else { plan.qss2_observees.clone() };
            let b2 = plan.qss2.b;
            self.oracle.set_time(tp);
            self.set_observee_values(&probe_obs, tp);
            self.oracle.get_reals(&plan.qss_der_refs[b2..], &mut plan.qss_ders_p[b2..]);
            self.oracle.set_time(t);
            for i in b2..plan.qss.e {
                let var = &mut self.vars[plan.list[i].0];
                var.x[2] = var.nd2_single(&cfg, plan.qss_ders_p[i]);
            }
        }
    }

    /// Algebraic-real observers: values by bulk read, first derivatives by one
    /// pooled directional-derivative call seeded with observee slopes, higher
    /// derivatives by ND probes of the same.
    fn observer_r_stages(&mut self, plan: &mut Observers, t: Time) {
        let cfg = self.cfg.clone();
        let observees = plan.r_observees.clone();
        self.set_observee_values_x(&observees, t);
        self.oracle.get_reals(&plan.r_refs, &mut plan.r_vals);
        for (j, &o) in observees.iter().enumerate() {
            plan.r_seed[j] = self.vars[o.0].x1(t);
        }
        self.oracle.directional_derivatives(
            &plan.r_observee_refs,
            &plan.r_seed,
            &plan.r_refs,
            &mut plan.r_ders,
        );
        for i in plan.r.b..plan.r.e {
            let j = i - plan.r.b;
            let var = &mut self.vars[plan.list[i].0];
            var.t_x = t;
            var.t_q = t;
            var.x[0] = plan.r_vals[j];
            var.x[1] = plan.r_ders[j];
        }

        let max_order = plan.r_max_order();
        if max_order < 2 {
            return;
        }
        let centered = (max_order >= 3) && self.fwd_time_nd(t);
        let probe_times: &[Time] = if max_order == 2 {
            &[t + cfg.dt_nd]
        } else if centered {
            &[t - cfg.dt_nd, t + cfg.dt_nd]
        } else {
            &[t + cfg.dt_nd, t + cfg.two_dt_nd()]
        };
        let probe_obs = if plan.r_uni_order { observees } else { plan.r2_observees.clone() };
        let jb2 = plan.r2.b - plan.r.b;
        for (k, &tn) in probe_times.iter().enumerate() {
            self.oracle.set_time(tn);
            self.set_observee_values_x(&probe_obs, tn);
            for (j, &o) in plan.r_observees.iter().enumerate() {
                plan.r_seed[j] = self.vars[o.0].x1(tn);
            }
            let out = if k == 0 { &mut plan.r_ders_m } else { &mut plan.r_ders_p };
            self.oracle.directional_derivatives(
                &plan.r_observee_refs,
                &plan.r_seed,
                &plan.r_refs[jb2..],
                &mut out[jb2..],
            );
        }
        self.oracle.set_time(t);
        for i in plan.r2.b..plan.r.e {
            let j = i - plan.r.b;
            let var = &mut self.vars[plan.list[i].0];
            if max_order == 2 {
                var.x[2] = var.nd2_single(&cfg, plan.r_ders_m[j]);
            } else if centered {
                var.x[2] = var.nd2_centered(&cfg, plan.r_ders_m[j], plan.r_ders_p[j]);
            } else {
                var.x[2] = var.nd2_forward(&cfg, plan.r_ders_m[j], plan.r_ders_p[j]);
            }
        }
        for i in plan.r3.b..plan.r.e {
            let var = &mut self.vars[plan.list[i].0];
            var.x[3] = if centered { var.nd3_centered(&cfg) } else { var.nd3_forward(&cfg) };
        }
    }

    /// Zero-crossing observers: like the algebraic reals, with the stage-1
    /// forced zero at a just-fired crossing and crossing re-detection in the
    /// final stage.
    fn observer_zc_stages(&mut self, plan: &mut Observers, t: Time) {
        let cfg = self.cfg.clone();
        let observees = plan.zc_observees.clone();
        self.set_observee_values_x(&observees, t);
        self.oracle.get_reals(&plan.zc_refs, &mut plan.zc_vals);
        for (j, &o) in observees.iter().enumerate() {
            plan.zc_seed[j] = self.vars[o.0].x1(t);
        }
        self.oracle.directional_derivatives(
            &plan.zc_observee_refs,
            &plan.zc_seed,
            &plan.zc_refs,
            &mut plan.zc_ders,
        );
        for i in plan.zc.b..plan.zc.e {
            let j = i - plan.zc.b;
            let v = plan.list[i];
            let (val, der) = (plan.zc_vals[j], plan.zc_ders[j]);
            self.zc_observer_stage_1(v, t, val, der);
        }

        let max_order = plan.zc_max_order();
        if max_order < 2 {
            return;
        }
        let centered = (max_order >= 3) && self.fwd_time_nd(t);
        let probe_times: &[Time] = if max_order == 2 {
            &[t + cfg.dt_nd]
        } else if centered {
            &[t - cfg.dt_nd, t + cfg.dt_nd]
        } else {
            &[t + cfg.dt_nd, t + cfg.two_dt_nd()]
        };
        let probe_obs = if plan.zc_uni_order { observees } else { plan.zc2_observees.clone() };
        let jb2 = plan.zc2.b - plan.zc.b;
        for (k, &tn) in probe_times.iter().enumerate() {
            self.oracle.set_time(tn);
            self.set_observee_values_x(&probe_obs, tn);
            for (j, &o) in plan.zc_observees.iter().enumerate() {
                plan.zc_seed[j] = self.vars[o.0].x1(tn);
            }
            let out = if k == 0 { &mut plan.zc_ders_m } else { &mut plan.zc_ders_p };
            self.oracle.directional_derivatives(
                &plan.zc_observee_refs,
                &plan.zc_seed,
                &plan.zc_refs[jb2..],
                &mut out[jb2..],
            );
        }
        self.oracle.set_time(t);
        for i in plan.zc2.b..plan.zc.e {
            let j = i - plan.zc.b;
            let var = &mut self.vars[plan.list[i].0];
            if max_order == 2 {
                var.x[2] = var.nd2_single(&cfg, plan.zc_ders_m[j]);
            } else if centered {
                var.x[2] = var.nd2_centered(&cfg, plan.zc_ders_m[j], plan.zc_ders_p[j]);
            } else {
                var.x[2] = var.nd2_forward(&cfg, plan.zc_ders_m[j], plan.zc_ders_p[j]);
            }
        }
        for i in plan.zc3.b..plan.zc.e {
            let var = &mut self.vars[plan.list[i].0];
            var.x[3] = if centered { var.nd3_centered(&cfg) } else { var.nd3_forward(&cfg) };
        }
    }

    /// Other value-only observers: re-read the value at `t`.
    fn observer_ox_stage(&mut self, plan: &mut Observers, t: Time) {
        for i in plan.ox.b..plan.ox.e {
            let v = plan.list[i];
            let ids = self.own_observees(v);
            self.set_observee_values_x(&ids, t);
            let r = self.vars[v.0].var_ref;
            let val = self.oracle.get_real(r);
            let var = &mut self.vars[v.0];
            var.t_x = t;
            var.t_q = t;
            var.x[0] = val;
            var.q[0] = val;
        }
    }

    /// Final stage: new event times and queue shifts, in range order.
    fn observer_stage_f(&mut self, plan: &mut Observers) {
        let cfg = self.cfg.clone();
        for i in 0..plan.list.len() {
            let v = plan.list[i];
            match &self.vars[v.0].kind {
                VarKind::Qss { .. } | VarKind::Liqss { .. } => {
                    let var = &mut self.vars[v.0];
                    var.set_te_unaligned(&cfg);
                    let t_e = var.t_e;
                    self.shift_own(v, Category::Qss, t_e);
                }
                VarKind::Real => {
                    self.vars[v.0].sync_zc_q();
                }
                VarKind::ZeroCrossing(_) => {
                    self.zc_observer_stage_f(v);
                }
                _ => {}
            }
        }
    }

    // --- Handlers ----------------------------------------------------------

    /// Advance a batch of handler variables at a crossing time `t`: stage 0
    /// adopts the post-event values the oracle's discrete iteration produced,
    /// the remaining stages rebuild derivatives and reschedule.
    pub(crate) fn advance_handler_batch(&mut self, ids: &[VarId], t: Time) {
        let cfg = self.cfg.clone();
        let mut hs = Handlers::default();
        hs.set_up(&self.vars, ids.to_vec());

        // Stage 0: bulk-read the post-event values; anchors move to t.
        if hs.plan.qss.have() {
            self.oracle.get_reals(&hs.qss_val_refs, &mut hs.qss_vals);
            for i in hs.plan.qss.b..hs.plan.qss.e {
                let v = hs.plan.list[i];
                let val = hs.qss_vals[i - hs.plan.qss.b];
                let var = &mut self.vars[v.0];
                var.t_s = t - var.t_q;
                var.t_x = t;
                var.t_q = t;
                var.x[0] = val;
                var.q[0] = val;
                if let VarKind::Liqss { q_c, l_0 } = &mut var.kind {
                    *q_c = val;
                    *l_0 = val;
                }
                var.clear_relaxation();
            }
        }
        if hs.plan.r.have() {
            self.oracle.get_reals(&hs.plan.r_refs, &mut hs.plan.r_vals);
            for i in hs.plan.r.b..hs.plan.r.e {
                let v = hs.plan.list[i];
                let val = hs.plan.r_vals[i - hs.plan.r.b];
                let var = &mut self.vars[v.0];
                var.t_x = t;
                var.t_q = t;
                var.x[0] = val;
            }
        }
        if hs.plan.ox.have() {
            self.oracle.get_reals(&hs.ox_refs, &mut hs.ox_vals);
            for i in hs.plan.ox.b..hs.plan.ox.e {
                let v = hs.plan.list[i];
                let val = hs.ox_vals[i - hs.plan.ox.b];
                let var = &mut self.vars[v.0];
                var.t_x = t;
                var.t_q = t;
                var.x[0] = val;
                var.q[0] = val;
            }
        }

        // Stages 1..3 for the state range: the same probe schedule as a
        // requantization, against the fresh stage-0 anchors.
        if hs.plan.qss.have() {
            let observees = hs.plan.qss_observees.clone();
            self.set_observee_values(&observees, t);
            self.oracle.get_reals(&hs.plan.qss_der_refs, &mut hs.plan.qss_ders);
            for i in hs.plan.qss.b..hs.plan.qss.e {
                let der = hs.plan.qss_ders[i];
                let var = &mut self.vars[hs.plan.list[i].0];
                var.x[1] = der;
                var.q[1] = der;
            }
            if hs.plan.qss3.have() {
                let centered = self.fwd_time_nd(t);
                let (ta, tb) = if centered {
                    (t - cfg.dt_nd, t + cfg.dt_nd)
                } else {
                    (t + cfg.dt_nd, t + cfg.two_dt_nd())
                };
                let b2 = hs.plan.qss2.b;
                self.oracle.set_time(ta);
                self.set_observee_values(&observees, ta);
                self.oracle
                    .get_reals(&hs.plan.qss_der_refs[b2..], &mut hs.plan.qss_ders_m[b2..]);
                self.oracle.set_time(tb);
                self.set_observee_values(&observees, tb);
                self.oracle
                    .get_reals(&hs.plan.qss_der_refs[b2..], &mut hs.plan.qss_ders_p[b2..]);
                self.oracle.set_time(t);
                for i in b2..hs.plan.qss.e {
                    let var = &mut self.vars[hs.plan.list[i].0];
                    if centered {
                        var.x[2] =
                            var.nd2_centered(&cfg, hs.plan.qss_ders_m[i], hs.plan.qss_ders_p[i]);
                        if var.order >= 3 {
                            var.x[3] = var.nd3_centered(&cfg);
                        }
                    } else {
                        var.x[2] =
                            var.nd2_forward(&cfg, hs.plan.qss_ders_m[i], hs.plan.qss_ders_p[i]);
                        if var.order >= 3 {
                            var.x[3] = var.nd3_forward(&cfg);
                        }
                    }
                    var.q[2] = var.x[2];
                }
            } else if hs.plan.qss2.have() {
                let tp = t + cfg.dt_nd;
                let b2 = hs.plan.qss2.b;
                self.oracle.set_time(tp);
                self.set_observee_values(&observees, tp);
                self.oracle
                    .get_reals(&hs.plan.qss_der_refs[b2..], &mut hs.plan.qss_ders_p[b2..]);
                self.oracle.set_time(t);
                for i in b2..hs.plan.qss.e {
                    let var = &mut self.vars[hs.plan.list[i].0];
                    var.x[2] = var.nd2_single(&cfg, hs.plan.qss_ders_p[i]);
                    var.q[2] = var.x[2];
                }
            }
        }
        if hs.plan.r.have() {
            // The R range rebuilds its derivatives exactly as in the observer
            // pipeline; stage 0 already placed the values.
            self.observer_r_stages(&mut hs.plan, t);
        }

        // Stage F for states and values, then the zero-crossing range, so
        // event indicators rebuild against the post-handler trajectories.
        for i in 0..hs.plan.list.len() {
            let v = hs.plan.list[i];
            match &self.vars[v.0].kind {
                VarKind::Qss { .. } | VarKind::Liqss { .. } => {
                    let var = &mut self.vars[v.0];
                    var.set_qtol();
                    var.set_te_aligned(&cfg);
                    let t_e = var.t_e;
                    self.shift_own(v, Category::Qss, t_e);
                    self.vars[v.0].record(t);
                }
                VarKind::Real => {
                    self.vars[v.0].sync_zc_q();
                    let key = self.vars[v.0].event.expect("variable has no queue entry");
                    let key = self.queue.shift_to_infinity(Category::Handler, key);
                    self.vars[v.0].event = Some(key);
                }
                VarKind::Discrete | VarKind::Boolean | VarKind::Integer => {
                    let key = self.vars[v.0].event.expect("variable has no queue entry");
                    let key = self.queue.shift_to_infinity(Category::Handler, key);
                    self.vars[v.0].event = Some(key);
                    self.vars[v.0].record(t);
                }
                _ => {}
            }
        }
        let zc_ids: Vec<VarId> = if hs.plan.zc.have() {
            (hs.plan.zc.b..hs.plan.zc.e).map(|i| hs.plan.list[i]).collect()
        } else {
            Vec::new()
        };
        for v in zc_ids {
            self.advance_zc_handler(v, t);
        }

        // Observers of the reassigned variables.
        self.advance_union_observers(ids, t);
    }

    /// Initialize a passive algebraic real from oracle probes.
    pub(crate) fn init_real(&mut self, v: VarId, t0: Time) {
        let cfg = self.cfg.clone();
        let ids = self.own_observees(v);
        self.set_observee_values_x(&ids, t0);
        let r = self.vars[v.0].var_ref;
        let x0 = self.oracle.get_real(r);
        self.vars[v.0].x[0] = x0;
        let x1 = self.x1_dd(v, t0);
        self.vars[v.0].x[1] = x1;
        let order = self.vars[v.0].order;
        if order >= 2 {
            let tp = t0 + cfg.dt_nd;
            self.oracle.set_time(tp);
            let x1p = self.x1_dd(v, tp);
            if order >= 3 {
                let t2p = t0 + cfg.two_dt_nd();
                self.oracle.set_time(t2p);
                let x12p = self.x1_dd(v, t2p);
                self.oracle.set_time(t0);
                let var = &mut self.vars[v.0];
                var.x[2] = var.nd2_forward(&cfg, x1p, x12p);
                var.x[3] = var.nd3_forward(&cfg);
            } else {
                self.oracle.set_time(t0);
                let var = &mut self.vars[v.0];
                var.x[2] = var.nd2_single(&cfg, x1p);
            }
        }
        self.vars[v.0].sync_zc_q();
        self.vars[v.0].set_qtol();
    }
}

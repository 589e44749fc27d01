//! The simulation driver: variable construction, dependency wiring, staged
//! initialization, and the outer event loop.
//!
//! A [`Sim`] owns the variable arena, the event queue, and the oracle adapter,
//! and is the single thread of control: it pops the earliest superdense-time
//! batch, runs the staged advance protocol on the triggers, propagates the
//! change through the observer pipeline, and reschedules everyone whose next
//! event time moved. Within a batch all stage-0 work completes before any
//! stage-1 work, because the oracle's derivatives depend on the trigger values
//! stage 0 just committed.
//!
//! The advance implementations live in sibling modules: `advance` for
//! QSS/LIQSS/input triggers, `zc` for zero crossings and conditionals,
//! `pipeline` for the observer and handler pipelines.

use crate::config::Config;
use crate::oracle::{Adapter, Oracle, ValueRef};
use crate::observers::{uniquify, Observers};
use crate::queue::{EventQueue, Target};
use crate::time::{Category, Time};
use crate::variable::{
    CrossingSet, InputFn, Relax, Sample, SmoothToken, VarId, VarKind, Variable, ZcState,
};
use serde::Serialize;
use thiserror::Error;

/// Index of a conditional in the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CondId(pub usize);

/// A conditional: the coupling from one zero-crossing variable to the handler
/// variables it reassigns. The expression deciding *whether* to fire is the
/// oracle's business; the solver only sees which crossing classes are of
/// interest and which variables to rebuild afterwards.
pub(crate) struct Conditional {
    pub zc: VarId,
    pub handlers: Vec<VarId>,
    pub event: Option<crate::queue::EventKey>,
}

/// Processed-event counts by category.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Stats {
    /// QSS state requantizations.
    pub qss: u64,
    /// Zero-crossing variable requantizations.
    pub qss_zc: u64,
    /// Input requantizations.
    pub input: u64,
    /// Crossings fired.
    pub zc: u64,
    /// Conditional activations.
    pub conditional: u64,
    /// Handler reassignments.
    pub handler: u64,
    /// Discrete updates.
    pub discrete: u64,
    /// Times the pass limit forced a `dt_min` relaxation.
    pub dt_min_relaxations: u64,
}

/// Simulation failure.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SimError {
    /// An oracle call errored; the batch at `t` was aborted.
    #[error("oracle failure aborted the batch at t = {t}")]
    Oracle {
        /// Batch time.
        t: Time,
    },
    /// Events kept stacking at one superdense time and `dt_min` relaxation ran
    /// out of room.
    #[error("superdense pass limit exceeded at t = {t} with dt_min relaxation exhausted")]
    PassLoop {
        /// Stuck time.
        t: Time,
    },
}

/// A quantized-state simulation over one oracle.
pub struct Sim<O: Oracle> {
    pub(crate) cfg: Config,
    pub(crate) oracle: Adapter<O>,
    pub(crate) vars: Vec<Variable>,
    pub(crate) conditionals: Vec<Conditional>,
    pub(crate) queue: EventQueue,
    pub(crate) t0: Time,
    pub(crate) t: Time,
    pub(crate) stats: Stats,
    pub(crate) terminate: bool,
    /// States in declaration order, matching the oracle's derivative vector.
    states: Vec<VarId>,
    initialized: bool,
}

impl<O: Oracle> Sim<O> {
    /// A simulation over `oracle` with the given settings.
    pub fn new(oracle: O, cfg: Config) -> Self {
        Sim {
            cfg: cfg.validated(),
            oracle: Adapter::new(oracle),
            vars: Vec::new(),
            conditionals: Vec::new(),
            queue: EventQueue::new(),
            t0: 0.0,
            t: 0.0,
            stats: Stats::default(),
            terminate: false,
            states: Vec::new(),
            initialized: false,
        }
    }

    // --- Construction ------------------------------------------------------

    fn push(&mut self, name: &str, order: usize, kind: VarKind) -> VarId {
        assert!(!self.initialized, "variables must be added before initialize");
        let id = VarId(self.vars.len());
        self.vars.push(Variable::new(name.to_string(), order, kind, &self.cfg));
        id
    }

    fn push_state(&mut self, name: &str, order: usize, x_ini: f64, refs: (ValueRef, ValueRef), kind: VarKind) -> VarId {
        assert!((1..=3).contains(&order), "QSS orders are 1..=3");
        let id = self.push(name, order, kind);
        let v = &mut self.vars[id.0];
        v.x_ini = x_ini;
        v.var_ref = refs.0;
        v.der_ref = Some(refs.1);
        self.states.push(id);
        id
    }

    /// Add an explicit QSS state variable.
    ///
    /// `refs` are the oracle's `(value, derivative)` references. States must be
    /// added in the oracle's state declaration order.
    pub fn add_qss(&mut self, name: &str, order: usize, x_ini: f64, refs: (ValueRef, ValueRef)) -> VarId {
        self.push_state(name, order, x_ini, refs, VarKind::Qss { relax: None })
    }

    /// Add a relaxed (rQSS) state variable: explicit QSS with yo-yo damping.
    pub fn add_relaxed_qss(&mut self, name: &str, order: usize, x_ini: f64, refs: (ValueRef, ValueRef)) -> VarId {
        self.push_state(name, order, x_ini, refs, VarKind::Qss { relax: Some(Relax::default()) })
    }

    /// Add a linearly-implicit (LIQSS) state variable, for states that appear
    /// in their own derivative.
    pub fn add_liqss(&mut self, name: &str, order: usize, x_ini: f64, refs: (ValueRef, ValueRef)) -> VarId {
        self.push_state(name, order, x_ini, refs, VarKind::Liqss { q_c: x_ini, l_0: x_ini })
    }

    /// Add a zero-crossing variable over the oracle expression at `var_ref`.
    pub fn add_zc(&mut self, name: &str, order: usize, var_ref: ValueRef) -> VarId {
        assert!((1..=3).contains(&order), "QSS orders are 1..=3");
        let id = self.push(name, order, VarKind::ZeroCrossing(Box::new(ZcState::default())));
        self.vars[id.0].var_ref = var_ref;
        id
    }

    /// Add an input variable driven by a smooth function of time.
    pub fn add_input(
        &mut self,
        name: &str,
        order: usize,
        var_ref: ValueRef,
        f: impl Fn(Time) -> SmoothToken + 'static,
    ) -> VarId {
        assert!(order <= 3);
        let id = self.push(name, order, VarKind::Input(Box::new(f) as InputFn));
        self.vars[id.0].var_ref = var_ref;
        id
    }

    /// Add a passive algebraic real, maintained through observer updates.
    pub fn add_real(&mut self, name: &str, order: usize, var_ref: ValueRef) -> VarId {
        assert!((1..=3).contains(&order));
        let id = self.push(name, order, VarKind::Real);
        self.vars[id.0].var_ref = var_ref;
        id
    }

    /// Add a discrete real variable.
    pub fn add_discrete(&mut self, name: &str, var_ref: ValueRef) -> VarId {
        let id = self.push(name, 0, VarKind::Discrete);
        self.vars[id.0].var_ref = var_ref;
        id
    }

    /// Add a boolean variable.
    pub fn add_boolean(&mut self, name: &str, var_ref: ValueRef) -> VarId {
        let id = self.push(name, 0, VarKind::Boolean);
        self.vars[id.0].var_ref = var_ref;
        id
    }

    /// Add an integer variable.
    pub fn add_integer(&mut self, name: &str, var_ref: ValueRef) -> VarId {
        let id = self.push(name, 0, VarKind::Integer);
        self.vars[id.0].var_ref = var_ref;
        id
    }

    /// Override a variable's quantization tolerances.
    pub fn set_tolerances(&mut self, v: VarId, rtol: f64, atol: f64) {
        let var = &mut self.vars[v.0];
        var.rtol = rtol.max(0.0);
        var.atol = atol.max(f64::MIN_POSITIVE);
    }

    /// Override a variable's zero-crossing tolerance.
    pub fn set_ztol(&mut self, v: VarId, ztol: f64) {
        self.vars[v.0].ztol = ztol.max(0.0);
    }

    /// Declare that `observer`'s trajectory depends on `observee`.
    ///
    /// Observing oneself marks the variable a self-observer; LIQSS variants
    /// integrate those implicitly. The relation is symmetric by construction:
    /// the observee's observer list gains `observer` and vice versa.
    pub fn observe(&mut self, observer: VarId, observee: VarId) {
        assert!(!self.initialized, "dependencies must be wired before initialize");
        if observer == observee {
            self.vars[observer.0].self_observer = true;
        } else {
            self.vars[observer.0].observees.push(observee);
            self.vars[observee.0].observers.push(observer);
        }
    }

    /// Couple a zero-crossing variable to the handler variables its crossings
    /// reassign. Only crossings in `interest` activate the conditional.
    pub fn add_conditional(&mut self, zc: VarId, interest: CrossingSet, handlers: Vec<VarId>) -> CondId {
        assert!(!self.initialized);
        let id = CondId(self.conditionals.len());
        match &mut self.vars[zc.0].kind {
            VarKind::ZeroCrossing(zs) => {
                zs.interest = interest;
                zs.conditional = Some(id);
            }
            _ => panic!("conditional on a non-zero-crossing variable"),
        }
        self.conditionals.push(Conditional { zc, handlers, event: None });
        id
    }

    /// Record `(t, x, q)` samples for `v` at each of its requantizations.
    pub fn enable_output(&mut self, v: VarId) {
        self.vars[v.0].output = Some(Vec::new());
    }

    /// Samples recorded for `v`.
    pub fn output(&self, v: VarId) -> &[Sample] {
        self.vars[v.0].output.as_deref().unwrap_or(&[])
    }

    // --- Accessors ---------------------------------------------------------

    /// The variable at `v`.
    pub fn var(&self, v: VarId) -> &Variable {
        &self.vars[v.0]
    }

    /// Continuous value of `v` at `t`.
    pub fn value(&self, v: VarId, t: Time) -> f64 {
        self.vars[v.0].x(t)
    }

    /// Quantized value of `v` at `t`.
    pub fn quantized(&self, v: VarId, t: Time) -> f64 {
        self.vars[v.0].q(t)
    }

    /// Current simulation time.
    pub fn time(&self) -> Time {
        self.t
    }

    /// The underlying oracle.
    pub fn oracle(&self) -> &O {
        &self.oracle.oracle
    }

    /// Mutable access to the underlying oracle, e.g. to feed external values
    /// ahead of a scheduled discrete event.
    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle.oracle
    }

    /// Event counts so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    // --- Helpers shared by the advance modules -----------------------------

    /// True iff a centered ND probe at `t` would stay inside the simulation.
    pub(crate) fn fwd_time_nd(&self, t: Time) -> bool {
        t - self.cfg.dt_nd >= self.t0
    }

    /// Bulk-write the values of `ids` into the oracle at `t`, quantized for
    /// states (continuous under the xQSS policy), continuous for everything
    /// else.
    pub(crate) fn set_observee_values(&mut self, ids: &[VarId], t: Time) {
        let mut refs = Vec::with_capacity(ids.len());
        let mut vals = Vec::with_capacity(ids.len());
        for id in ids {
            let v = &self.vars[id.0];
            refs.push(v.var_ref);
            vals.push(v.propagated(t, &self.cfg));
        }
        self.oracle.set_reals(&refs, &vals);
    }

    /// Bulk-write the continuous values of `ids` into the oracle at `t`.
    pub(crate) fn set_observee_values_x(&mut self, ids: &[VarId], t: Time) {
        let mut refs = Vec::with_capacity(ids.len());
        let mut vals = Vec::with_capacity(ids.len());
        for id in ids {
            let v = &self.vars[id.0];
            refs.push(v.var_ref);
            vals.push(v.x(t));
        }
        self.oracle.set_reals(&refs, &vals);
    }

    /// The observee pool of a single variable: its observees, plus itself for
    /// self-observers.
    pub(crate) fn own_observees(&self, v: VarId) -> Vec<VarId> {
        let var = &self.vars[v.0];
        let mut ids = Vec::with_capacity(var.observees.len() + 1);
        if var.self_observer {
            ids.push(v);
        }
        ids.extend(var.observees.iter().copied());
        ids
    }

    /// First derivative of state `v` at `t`: write its observee values, read
    /// its derivative reference.
    pub(crate) fn c1(&mut self, v: VarId, t: Time) -> f64 {
        let ids = self.own_observees(v);
        self.set_observee_values(&ids, t);
        let der = self.vars[v.0].der_ref.expect("state without derivative reference");
        self.oracle.get_real(der)
    }

    /// First derivative of an R or ZC variable at `t`, via the oracle's
    /// directional derivative with observee slopes as the seed.
    pub(crate) fn x1_dd(&mut self, v: VarId, t: Time) -> f64 {
        let ids = self.own_observees(v);
        self.set_observee_values_x(&ids, t);
        let mut refs = Vec::with_capacity(ids.len());
        let mut seed = Vec::with_capacity(ids.len());
        for id in &ids {
            let o = &self.vars[id.0];
            refs.push(o.var_ref);
            seed.push(o.x1(t));
        }
        let z = self.vars[v.0].var_ref;
        self.oracle.directional_derivative(&refs, &seed, z)
    }

    /// Shift the own event of `v` to `t` in its own category, storing the new
    /// handle.
    pub(crate) fn shift_own(&mut self, v: VarId, o: Category, t: Time) {
        let key = self.vars[v.0].event.expect("variable has no queue entry");
        let key = self.queue.shift(o, t, key);
        self.vars[v.0].event = Some(key);
    }

    // --- Initialization ----------------------------------------------------

    /// Wire dependencies, run the multi-stage initialization of every
    /// variable, and schedule the initial events.
    pub fn initialize(&mut self, t0: Time) {
        assert!(!self.initialized, "initialize runs once");
        self.t0 = t0;
        self.t = t0;
        self.oracle.set_time(t0);

        // Finalize dependency lists: uniquify, and drop discrete observees.
        // They never change between their own events, so their stored oracle
        // value is always current.
        for i in 0..self.vars.len() {
            let mut observees = std::mem::take(&mut self.vars[i].observees);
            let mut list: Vec<VarId> = observees.drain(..).collect();
            uniquify(&mut list);
            list.retain(|o| !self.vars[o.0].is_discrete_kind());
            self.vars[i].observees.extend(list);
        }
        let mut plans = Vec::with_capacity(self.vars.len());
        for i in 0..self.vars.len() {
            let mut plan = Observers::default();
            let list: Vec<VarId> = self.vars[i].observers.iter().copied().collect();
            plan.set_up(&self.vars, list);
            plans.push(plan);
        }
        for (i, plan) in plans.into_iter().enumerate() {
            self.vars[i].observers = plan.list.iter().copied().collect();
            self.vars[i].plan = plan;
        }

        for v in &mut self.vars {
            v.t_x = t0;
            v.t_q = t0;
            v.t_e = t0;
        }

        let all: Vec<VarId> = (0..self.vars.len()).map(VarId).collect();
        let states: Vec<VarId> = self.states.clone();
        let inputs: Vec<VarId> = all.iter().copied().filter(|v| self.vars[v.0].is_input()).collect();
        let reals: Vec<VarId> = all.iter().copied().filter(|v| self.vars[v.0].is_real()).collect();
        let zcs: Vec<VarId> = all.iter().copied().filter(|v| self.vars[v.0].is_zc()).collect();
        let others: Vec<VarId> =
            all.iter().copied().filter(|v| self.vars[v.0].is_discrete_kind()).collect();

        // Stage 0: values.
        for &s in &states {
            let v = &mut self.vars[s.0];
            let x0 = v.x_ini;
            v.x[0] = x0;
            v.q[0] = x0;
            if let VarKind::Liqss { q_c, l_0 } = &mut v.kind {
                *q_c = x0;
                *l_0 = x0;
            }
            let r = v.var_ref;
            self.oracle.set_real(r, x0);
        }
        for &i in &inputs {
            self.advance_input_coefficients(i, t0);
        }

        // Stage 1: all state first derivatives in one bulk read.
        let mut ders = vec![0.0; states.len()];
        self.oracle.derivatives(&mut ders);
        for (k, &s) in states.iter().enumerate() {
            let v = &mut self.vars[s.0];
            v.x[1] = ders[k];
            v.q[1] = ders[k];
        }

        // Stage 2: second derivatives by a forward probe at t0 + dtND.
        let t_p = t0 + self.cfg.dt_nd;
        for &s in &states {
            if self.vars[s.0].order >= 2 {
                self.oracle.set_time(t_p);
                let p = self.c1(s, t_p);
                let cfg = self.cfg.clone();
                let v = &mut self.vars[s.0];
                v.x[2] = v.nd2_single(&cfg, p);
            }
        }
        // Stage 2.1: deferred quantized second derivatives.
        for &s in &states {
            let v = &mut self.vars[s.0];
            v.q[2] = v.x[2];
        }
        // Stage 3: third derivatives from fresh forward probes. The stage-2
        // samples predate the quantized second derivative and would miss its
        // contribution. LIQSS self-observers run the implicit selection
        // instead.
        let t_2p = t0 + self.cfg.two_dt_nd();
        for &s in &states {
            let v = &self.vars[s.0];
            if v.order >= 3 {
                if v.is_liqss() && v.self_observer {
                    continue;
                }
                self.oracle.set_time(t_p);
                let p1 = self.c1(s, t_p);
                self.oracle.set_time(t_2p);
                let p2 = self.c1(s, t_2p);
                let cfg = self.cfg.clone();
                let v = &mut self.vars[s.0];
                v.x1p = p1;
                v.x12p = p2;
                v.x[3] = v.nd3_forward(&cfg);
            }
        }
        self.oracle.set_time(t0);
        for &s in &states {
            if self.vars[s.0].is_liqss() && self.vars[s.0].self_observer {
                self.vars[s.0].set_qtol();
                self.liqss_select(s, t0, true);
            }
        }

        // Stage F: tolerances, first event times, queue entries.
        self.oracle.set_time(t0);
        for &s in &states {
            let cfg = self.cfg.clone();
            if self.vars[s.0].is_liqss() {
                self.commit_liqss(s);
            } else {
                self.vars[s.0].set_qtol();
            }
            let v = &mut self.vars[s.0];
            v.set_te_aligned(&cfg);
            let t_e = v.t_e;
            let key = self.queue.add(Category::Qss, t_e, Target::Var(s));
            self.vars[s.0].event = Some(key);
        }
        for &i in &inputs {
            let cfg = self.cfg.clone();
            let v = &mut self.vars[i.0];
            v.set_qtol();
            v.set_te_aligned(&cfg);
            let t_e = v.t_e;
            let key = self.queue.add(Category::QssInput, t_e, Target::Var(i));
            self.vars[i.0].event = Some(key);
        }

        // Algebraic reals: value and derivatives from the oracle.
        for &r in &reals {
            self.init_real(r, t0);
            let key = self.queue.add_at_infinity(Category::Handler, Target::Var(r));
            self.vars[r.0].event = Some(key);
        }

        // Zero-crossing variables: after states, so their expressions see the
        // initialized values.
        for &z in &zcs {
            self.init_zc(z, t0);
        }

        // Discrete-valued variables park a handler event at infinity.
        for &d in &others {
            let r = self.vars[d.0].var_ref;
            let val = self.oracle.get_real(r);
            self.vars[d.0].x[0] = val;
            self.vars[d.0].q[0] = val;
            let key = self.queue.add_at_infinity(Category::Handler, Target::Var(d));
            self.vars[d.0].event = Some(key);
        }

        // Conditionals park at infinity until a crossing activates them.
        for c in 0..self.conditionals.len() {
            let key = self.queue.add_at_infinity(Category::Conditional, Target::Conditional(CondId(c)));
            self.conditionals[c].event = Some(key);
        }

        // Leave the oracle at t0 with current values.
        self.oracle.set_time(t0);
        let ids = all;
        self.set_observee_values_x(&ids, t0);
        for v in &mut self.vars {
            v.record(t0);
        }
        self.initialized = true;
    }

    // --- The outer loop ----------------------------------------------------

    /// Run the simulation until `t_stop`, the queue drains, or the oracle
    /// requests termination. Returns the processed-event counts.
    pub fn simulate(&mut self, t_stop: Time) -> Result<Stats, SimError> {
        assert!(self.initialized, "initialize before simulate");
        let mut tops: Vec<Target> = Vec::new();
        let mut trigger_vars: Vec<VarId> = Vec::new();
        while !self.queue.is_empty() {
            let s = self.queue.top_superdense_time();
            if (s.t > t_stop) || (s.t == f64::INFINITY) {
                self.t = t_stop;
                break;
            }
            self.t = s.t;
            if s.i > self.cfg.pass_limit {
                self.relax_dt_min(s.t)?;
            }
            self.queue.set_active_time();
            self.oracle.set_time(s.t);
            self.queue.top_targets(&mut tops);
            trigger_vars.clear();
            for target in &tops {
                if let Target::Var(v) = target {
                    trigger_vars.push(*v);
                }
            }
            match s.o {
                Category::Qss => {
                    self.stats.qss += trigger_vars.len() as u64;
                    self.advance_qss_batch(&trigger_vars, s.t);
                }
                Category::QssInput => {
                    self.stats.input += trigger_vars.len() as u64;
                    self.advance_input_batch(&trigger_vars, s.t);
                }
                Category::QssZc => {
                    self.stats.qss_zc += trigger_vars.len() as u64;
                    self.advance_zc_requant_batch(&trigger_vars, s.t);
                }
                Category::ZeroCrossing => {
                    self.stats.zc += trigger_vars.len() as u64;
                    self.advance_zc_crossing_batch(&trigger_vars, s.t);
                }
                Category::Conditional => {
                    for target in &tops {
                        if let Target::Conditional(c) = target {
                            self.stats.conditional += 1;
                            self.advance_conditional(*c, s.t);
                        }
                    }
                }
                Category::Handler => {
                    self.stats.handler += trigger_vars.len() as u64;
                    self.advance_handler_batch(&trigger_vars, s.t);
                }
                Category::Discrete => {
                    self.stats.discrete += trigger_vars.len() as u64;
                    self.advance_discrete_batch(&trigger_vars, s.t);
                }
            }
            if self.oracle.take_failed() {
                return Err(SimError::Oracle { t: s.t });
            }
            if self.terminate {
                break;
            }
        }
        Ok(self.stats)
    }

    /// Pass-limit defense: double every variable's `dt_min` so stacked events
    /// spread out in real time; give up when `dt_min` would pass half of
    /// `dt_max`.
    fn relax_dt_min(&mut self, t: Time) -> Result<(), SimError> {
        let mut worst: f64 = 0.0;
        for v in &mut self.vars {
            let bumped = if v.dt_min > 0.0 {
                2.0 * v.dt_min
            } else {
                f64::EPSILON * t.abs().max(1.0)
            };
            v.dt_min = bumped;
            worst = worst.max(bumped / v.dt_max.min(f64::MAX));
        }
        self.stats.dt_min_relaxations += 1;
        tracing::warn!(t, "pass limit exceeded; relaxing dt_min");
        if worst > 0.5 {
            return Err(SimError::PassLoop { t });
        }
        Ok(())
    }
}

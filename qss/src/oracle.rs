//! The host model-exchange interface.
//!
//! The solver never inspects the model it integrates. It sees the model
//! through the [`Oracle`] trait: set the clock, write observee values, read
//! values and derivatives back, and run the discrete-event iteration when a
//! handler fires. Values and derivatives are opaque floating-point tokens
//! addressed by [`ValueRef`].
//!
//! [`FnOracle`] is a closure-backed oracle for programmatic models and the
//! test suite: states with derivative functions, stored slots for inputs and
//! discrete values, computed slots for event-indicator expressions, and an
//! event-mode callback.

use crate::time::Time;
use thiserror::Error;

/// Opaque handle to a model value.
pub type ValueRef = u32;

/// Failure of an oracle call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OracleError {
    /// The oracle flagged the call but its result is usable.
    #[error("oracle warning in {call}: {message}")]
    Warning {
        /// Operation that produced the status.
        call: &'static str,
        /// Oracle-provided detail.
        message: String,
    },
    /// The call failed; results of the active batch cannot be trusted.
    #[error("oracle error in {call}: {message}")]
    Error {
        /// Operation that failed.
        call: &'static str,
        /// Oracle-provided detail.
        message: String,
    },
    /// A value reference does not name a model value.
    #[error("unknown value reference {0}")]
    UnknownRef(ValueRef),
}

impl OracleError {
    /// True iff the result of the failing call is still usable.
    pub fn is_warning(&self) -> bool {
        matches!(self, OracleError::Warning { .. })
    }
}

/// Outcome of the oracle's discrete-event iteration.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventInfo {
    /// Discrete states changed value during the iteration.
    pub values_changed: bool,
    /// The oracle requests a time event.
    pub next_event_defined: bool,
    /// Time of the requested event, when defined.
    pub next_event_time: Time,
    /// The oracle requests termination.
    pub terminate: bool,
}

/// A host model-exchange library, reduced to what the solver consumes.
pub trait Oracle {
    /// Current oracle clock.
    fn time(&self) -> Time;

    /// Set the oracle clock for subsequent evaluations.
    fn set_time(&mut self, t: Time);

    /// Read one value.
    fn get_real(&mut self, r: ValueRef) -> Result<f64, OracleError>;

    /// Write one value.
    fn set_real(&mut self, r: ValueRef, v: f64) -> Result<(), OracleError>;

    /// Bulk read. `vals` must be as long as `refs`.
    fn get_reals(&mut self, refs: &[ValueRef], vals: &mut [f64]) -> Result<(), OracleError> {
        for (r, v) in refs.iter().zip(vals.iter_mut()) {
            *v = self.get_real(*r)?;
        }
        Ok(())
    }

    /// Bulk write. `vals` must be as long as `refs`.
    fn set_reals(&mut self, refs: &[ValueRef], vals: &[f64]) -> Result<(), OracleError> {
        for (r, v) in refs.iter().zip(vals.iter()) {
            self.set_real(*r, *v)?;
        }
        Ok(())
    }

    /// All state derivatives, in state declaration order, at the current clock
    /// and currently written values.
    fn derivatives(&mut self, ders: &mut [f64]) -> Result<(), OracleError>;

    /// Derivative of the value at `z_ref` along the seed: given observee
    /// derivative seeds `seed[j]` for values `v_refs[j]`, returns
    /// `Σ_j ∂z/∂v_j · seed[j]`.
    fn directional_derivative(
        &mut self,
        v_refs: &[ValueRef],
        seed: &[f64],
        z_ref: ValueRef,
    ) -> Result<f64, OracleError>;

    /// Pooled form of [`Oracle::directional_derivative`] over several targets
    /// with one shared seed.
    fn directional_derivatives(
        &mut self,
        v_refs: &[ValueRef],
        seed: &[f64],
        z_refs: &[ValueRef],
        ders: &mut [f64],
    ) -> Result<(), OracleError> {
        for (z, d) in z_refs.iter().zip(ders.iter_mut()) {
            *d = self.directional_derivative(v_refs, seed, *z)?;
        }
        Ok(())
    }

    /// Run the discrete-event iteration. Called when a conditional activates.
    fn new_discrete_states(&mut self) -> Result<EventInfo, OracleError>;
}

/// Serialization point for all oracle traffic.
///
/// Applies the error policy: warnings are logged and the call's result is
/// used; errors are logged, a sticky failure flag is raised, and a fallback
/// value flows until the driver aborts the batch at its boundary.
pub(crate) struct Adapter<O: Oracle> {
    pub oracle: O,
    failed: bool,
}

impl<O: Oracle> Adapter<O> {
    pub fn new(oracle: O) -> Self {
        Adapter { oracle, failed: false }
    }

    /// True once any call since the last check errored.
    pub fn take_failed(&mut self) -> bool {
        std::mem::replace(&mut self.failed, false)
    }

    fn note(&mut self, e: OracleError) {
        if e.is_warning() {
            tracing::warn!(error = %e, "oracle warning");
        } else {
            tracing::error!(error = %e, "oracle call failed");
            self.failed = true;
        }
    }

    pub fn time(&self) -> Time {
        self.oracle.time()
    }

    pub fn set_time(&mut self, t: Time) {
        self.oracle.set_time(t);
    }

    pub fn get_real(&mut self, r: ValueRef) -> f64 {
        match self.oracle.get_real(r) {
            Ok(v) => v,
            Err(e) => {
                self.note(e);
                0.0
            }
        }
    }

    pub fn set_real(&mut self, r: ValueRef, v: f64) {
        if let Err(e) = self.oracle.set_real(r, v) {
            self.note(e);
        }
    }

    pub fn get_reals(&mut self, refs: &[ValueRef], vals: &mut [f64]) {
        if let Err(e) = self.oracle.get_reals(refs, vals) {
            self.note(e);
        }
    }

    pub fn set_reals(&mut self, refs: &[ValueRef], vals: &[f64]) {
        if let Err(e) = self.oracle.set_reals(refs, vals) {
            self.note(e);
        }
    }

    pub fn derivatives(&mut self, ders: &mut [f64]) {
        if let Err(e) = self.oracle.derivatives(ders) {
            self.note(e);
        }
    }

    pub fn directional_derivative(
        &mut self,
        v_refs: &[ValueRef],
        seed: &[f64],
        z_ref: ValueRef,
    ) -> f64 {
        match self.oracle.directional_derivative(v_refs, seed, z_ref) {
            Ok(v) => v,
            Err(e) => {
                self.note(e);
                0.0
            }
        }
    }

    pub fn directional_derivatives(
        &mut self,
        v_refs: &[ValueRef],
        seed: &[f64],
        z_refs: &[ValueRef],
        ders: &mut [f64],
    ) {
        if let Err(e) = self.oracle.directional_derivatives(v_refs, seed, z_refs, ders) {
            self.note(e);
        }
    }

    pub fn new_discrete_states(&mut self) -> EventInfo {
        match self.oracle.new_discrete_states() {
            Ok(info) => info,
            Err(e) => {
                self.note(e);
                EventInfo::default()
            }
        }
    }
}

/// Read-only view of a [`FnOracle`]'s stored values, passed to model closures.
pub struct Frame<'a> {
    /// Current oracle clock.
    pub t: Time,
    vals: &'a [f64],
}

impl Frame<'_> {
    /// Stored value at `r`.
    #[inline]
    pub fn val(&self, r: ValueRef) -> f64 {
        self.vals[r as usize]
    }
}

type ValueFn = Box<dyn Fn(&Frame) -> f64>;
type EventFn = Box<dyn FnMut(Time, &mut [f64])>;

enum Slot {
    Stored,
    Computed(ValueFn),
}

/// A model defined by closures: the oracle used by the programmatic API and
/// the test suite.
///
/// States are declared with [`FnOracle::add_state`] and given a derivative
/// with [`FnOracle::define_derivative`]; inputs and discrete values are plain
/// stored slots; event indicators and algebraic variables are computed slots.
/// Closures observe stored values only, through [`Frame`].
#[derive(Default)]
pub struct FnOracle {
    t: Time,
    vals: Vec<f64>,
    slots: Vec<Slot>,
    state_ders: Vec<ValueRef>,
    events: Vec<EventFn>,
}

impl FnOracle {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, v: f64, slot: Slot) -> ValueRef {
        let r = self.vals.len() as ValueRef;
        self.vals.push(v);
        self.slots.push(slot);
        r
    }

    /// Declare a state with initial value `x0`; returns `(value, derivative)`
    /// references. The derivative must be defined before simulation.
    pub fn add_state(&mut self, x0: f64) -> (ValueRef, ValueRef) {
        let v = self.push(x0, Slot::Stored);
        let d = self.push(0.0, Slot::Stored);
        self.state_ders.push(d);
        (v, d)
    }

    /// Define the derivative of a previously declared state.
    pub fn define_derivative(&mut self, der: ValueRef, f: impl Fn(&Frame) -> f64 + 'static) {
        self.slots[der as usize] = Slot::Computed(Box::new(f));
    }

    /// Declare a stored value (input or discrete variable).
    pub fn add_var(&mut self, v: f64) -> ValueRef {
        self.push(v, Slot::Stored)
    }

    /// Declare a computed value (event indicator or algebraic variable).
    pub fn add_expression(&mut self, f: impl Fn(&Frame) -> f64 + 'static) -> ValueRef {
        self.push(0.0, Slot::Computed(Box::new(f)))
    }

    /// Register an event-mode callback run by the discrete-event iteration.
    pub fn on_event(&mut self, f: impl FnMut(Time, &mut [f64]) + 'static) {
        self.events.push(Box::new(f));
    }

    fn check(&self, r: ValueRef) -> Result<usize, OracleError> {
        let i = r as usize;
        if i < self.vals.len() {
            Ok(i)
        } else {
            Err(OracleError::UnknownRef(r))
        }
    }

    fn eval(&self, i: usize) -> f64 {
        match &self.slots[i] {
            Slot::Stored => self.vals[i],
            Slot::Computed(f) => f(&Frame { t: self.t, vals: &self.vals }),
        }
    }
}

impl Oracle for FnOracle {
    fn time(&self) -> Time {
        self.t
    }

    fn set_time(&mut self, t: Time) {
        self.t = t;
    }

    fn get_real(&mut self, r: ValueRef) -> Result<f64, OracleError> {
        let i = self.check(r)?;
        Ok(self.eval(i))
    }

    fn set_real(&mut self, r: ValueRef, v: f64) -> Result<(), OracleError> {
        let i = self.check(r)?;
        self.vals[i] = v;
        Ok(())
    }

    fn derivatives(&mut self, ders: &mut [f64]) -> Result<(), OracleError> {
        for (k, d) in self.state_ders.iter().enumerate() {
            ders[k] = self.eval(*d as usize);
        }
        Ok(())
    }

    fn directional_derivative(
        &mut self,
        v_refs: &[ValueRef],
        seed: &[f64],
        z_ref: ValueRef,
    ) -> Result<f64, OracleError> {
        let z = self.check(z_ref)?;
        let h = 1.0e-6;
        let saved: Vec<f64> = v_refs.iter().map(|r| self.vals[*r as usize]).collect();
        for (r, s) in v_refs.iter().zip(seed.iter()) {
            self.vals[*r as usize] += h * s;
        }
        let plus = self.eval(z);
        for ((r, s), v) in v_refs.iter().zip(seed.iter()).zip(saved.iter()) {
            self.vals[*r as usize] = *v - (h * s);
        }
        let minus = self.eval(z);
        for (r, v) in v_refs.iter().zip(saved.iter()) {
            self.vals[*r as usize] = *v;
        }
        Ok((plus - minus) / (2.0 * h))
    }

    fn new_discrete_states(&mut self) -> Result<EventInfo, OracleError> {
        let t = self.t;
        for f in self.events.iter_mut() {
            f(t, &mut self.vals);
        }
        Ok(EventInfo { values_changed: !self.events.is_empty(), ..EventInfo::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_oracle_states_and_derivatives() {
        let mut m = FnOracle::new();
        let (x, dx) = m.add_state(1.0);
        m.define_derivative(dx, move |f| -f.val(x));
        let (y, dy) = m.add_state(0.0);
        m.define_derivative(dy, move |f| f.val(x) - f.val(y));

        assert_eq!(m.get_real(x).unwrap(), 1.0);
        assert_eq!(m.get_real(dx).unwrap(), -1.0);

        let mut ders = [0.0; 2];
        m.derivatives(&mut ders).unwrap();
        assert_eq!(ders, [-1.0, 1.0]);

        m.set_real(x, 3.0).unwrap();
        assert_eq!(m.get_real(dx).unwrap(), -3.0);
    }

    #[test]
    fn test_fn_oracle_directional_derivative() {
        let mut m = FnOracle::new();
        let (x, _) = m.add_state(2.0);
        let (y, _) = m.add_state(3.0);
        let z = m.add_expression(move |f| f.val(x) * f.val(x) + 4.0 * f.val(y));

        // dz = 2x·dx + 4·dy with dx = 1, dy = 0.5 at x = 2: 4 + 2 = 6.
        let dz = m.directional_derivative(&[x, y], &[1.0, 0.5], z).unwrap();
        assert!((dz - 6.0).abs() < 1.0e-6);
        // The probe restores the stored values.
        assert_eq!(m.get_real(x).unwrap(), 2.0);
        assert_eq!(m.get_real(y).unwrap(), 3.0);
    }

    #[test]
    fn test_fn_oracle_event_iteration() {
        let mut m = FnOracle::new();
        let (v, _) = m.add_state(-4.0);
        m.on_event(move |_, vals| {
            let i = v as usize;
            vals[i] = -0.8 * vals[i];
        });
        let info = m.new_discrete_states().unwrap();
        assert!(info.values_changed);
        assert_eq!(m.get_real(v).unwrap(), 3.2);
    }

    #[test]
    fn test_unknown_ref_errors() {
        let mut m = FnOracle::new();
        assert_eq!(m.get_real(7), Err(OracleError::UnknownRef(7)));
        assert!(!OracleError::UnknownRef(7).is_warning());
    }
}

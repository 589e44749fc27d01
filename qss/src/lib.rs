//! A quantized state system (QSS) solver for hybrid ordinary differential
//! equation models.
//!
//! Unlike time-stepped integrators, a QSS solver advances each state variable
//! asynchronously: a variable keeps a *continuous* polynomial trajectory and a
//! *quantized* one, and schedules its own next requantization for the moment
//! the two drift apart by its tolerance. Events live in a queue ordered by
//! superdense time `(t, pass, category)`, which makes the cascades of one real
//! instant (requantization, observer updates, zero crossings, handlers)
//! finitely and deterministically ordered.
//!
//! The model being integrated is reached only through the [`Oracle`] trait, an
//! abstraction of a model-exchange host library: the solver writes observee
//! values, reads derivatives (directly, or as directional derivatives for
//! event indicators), and runs the oracle's discrete-event iteration when a
//! handler fires. [`FnOracle`] provides a closure-backed oracle for
//! programmatic models.
//!
//! ```
//! use qss::{Config, FnOracle, Sim};
//!
//! // dx/dt = -x, x(0) = 1.
//! let mut model = FnOracle::new();
//! let (x, dx) = model.add_state(1.0);
//! model.define_derivative(dx, move |f| -f.val(x));
//!
//! let mut sim = Sim::new(model, Config::default());
//! let x = sim.add_qss("x", 3, 1.0, (x, dx));
//! sim.observe(x, x); // x appears in its own derivative
//! sim.initialize(0.0);
//! sim.simulate(1.0).unwrap();
//! let value = sim.value(x, 1.0);
//! assert!((value - (-1.0_f64).exp()).abs() < 1.0e-4);
//! ```

pub mod config;
pub mod math;
pub mod observers;
pub mod oracle;
pub mod queue;
pub mod sim;
pub mod time;
pub mod variable;

mod advance;
mod handlers;
mod pipeline;
mod zc;

pub use config::Config;
pub use oracle::{EventInfo, FnOracle, Frame, Oracle, OracleError, ValueRef};
pub use sim::{CondId, Sim, SimError, Stats};
pub use time::{Category, SuperdenseTime, Time};
pub use variable::{Crossing, CrossingSet, Sample, SmoothToken, VarId, Variable};

//! Stiff scalar equation: LIQSS keeps the event count civilized where
//! explicit QSS falls into a quantum-sized limit cycle.

use qss::{Config, FnOracle, Sim, SmoothToken, VarId};

// ẋ = -1000·x + 3000 - 2000·e⁻ᵗ, x(0) = 0, with the forcing term fed in as an
// input variable. Closed form: 3 - 0.998·e^(-1000t) - 2.002·e^(-t).
fn stiff_sim(liqss: bool) -> (Sim<FnOracle>, VarId) {
    let mut model = FnOracle::new();
    let (x, dx) = model.add_state(0.0);
    let u = model.add_var(2000.0);
    model.define_derivative(dx, move |f| (-1000.0 * f.val(x)) + 3000.0 - f.val(u));

    let cfg = Config { rtol: 1.0e-3, atol: 1.0e-6, ..Config::default() };
    let mut sim = Sim::new(model, cfg);
    let xs = if liqss {
        sim.add_liqss("x", 2, 0.0, (x, dx))
    } else {
        sim.add_qss("x", 2, 0.0, (x, dx))
    };
    let us = sim.add_input("u", 2, u, |t| {
        let e = (-t).exp();
        SmoothToken::order_2(2000.0 * e, -2000.0 * e, 1000.0 * e)
    });
    sim.set_tolerances(us, 1.0e-3, 1.0e-6);
    sim.observe(xs, xs);
    sim.observe(xs, us);
    (sim, xs)
}

fn exact(t: f64) -> f64 {
    3.0 - 0.998 * (-1000.0 * t).exp() - 2.002 * (-t).exp()
}

#[test]
fn liqss_2_integrates_stiff_scalar() {
    let (mut sim, xs) = stiff_sim(true);
    sim.initialize(0.0);
    let stats = sim.simulate(0.5).unwrap();

    let value = sim.value(xs, 0.5);
    assert!(
        (value - exact(0.5)).abs() < 1.0e-3,
        "x(0.5) = {value}, exact {}",
        exact(0.5)
    );
    assert!(
        stats.qss <= 100,
        "{} requantizations for a stiff scalar under LIQSS",
        stats.qss
    );
}

#[test]
fn liqss_beats_explicit_qss_on_stiffness() {
    let (mut implicit, _) = stiff_sim(true);
    implicit.initialize(0.0);
    let implicit_stats = implicit.simulate(0.25).unwrap();

    let (mut explicit, xs) = stiff_sim(false);
    explicit.initialize(0.0);
    let explicit_stats = explicit.simulate(0.25).unwrap();

    // Both get the value right; the explicit variant burns far more events
    // chattering across the quantum.
    assert!((explicit.value(xs, 0.25) - exact(0.25)).abs() < 2.0e-2);
    assert!(
        implicit_stats.qss * 3 < explicit_stats.qss,
        "implicit {} vs explicit {}",
        implicit_stats.qss,
        explicit_stats.qss
    );
}

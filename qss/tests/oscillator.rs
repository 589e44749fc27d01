//! Harmonic oscillator: a two-state feedback loop with a zero-crossing
//! observer riding along.

use qss::{Config, FnOracle, Sim};

#[test]
fn oscillator_order_2_returns_home() {
    let mut model = FnOracle::new();
    let (x, dx) = model.add_state(1.0);
    let (v, dv) = model.add_state(0.0);
    model.define_derivative(dx, move |f| f.val(v));
    model.define_derivative(dv, move |f| -f.val(x));
    let zx = model.add_expression(move |f| f.val(x));

    let cfg = Config { rtol: 1.0e-5, atol: 1.0e-7, ..Config::default() };
    let mut sim = Sim::new(model, cfg);
    let xs = sim.add_qss("x", 2, 1.0, (x, dx));
    let vs = sim.add_qss("v", 2, 0.0, (v, dv));
    sim.observe(xs, vs);
    sim.observe(vs, xs);
    let zs = sim.add_zc("x_zero", 2, zx);
    sim.observe(zs, xs);

    sim.initialize(0.0);
    let period = 2.0 * std::f64::consts::PI;
    let stats = sim.simulate(period).unwrap();

    // One full period returns the state to its start.
    let x_end = sim.value(xs, period);
    let v_end = sim.value(vs, period);
    assert!((x_end - 1.0).abs() < 1.0e-4, "x(2π) = {x_end}");
    assert!(v_end.abs() < 1.0e-3, "v(2π) = {v_end}");

    // cos crosses zero twice per period; mispredictions may re-detect a
    // crossing but never more than once each.
    assert!(
        (2..=4).contains(&stats.zc),
        "{} zero-crossing events in one period",
        stats.zc
    );
}

#[test]
fn oscillator_cross_observation_is_symmetric() {
    let mut model = FnOracle::new();
    let (x, dx) = model.add_state(1.0);
    let (v, dv) = model.add_state(0.0);
    model.define_derivative(dx, move |f| f.val(v));
    model.define_derivative(dv, move |f| -f.val(x));

    let mut sim = Sim::new(model, Config::default());
    let xs = sim.add_qss("x", 2, 1.0, (x, dx));
    let vs = sim.add_qss("v", 2, 0.0, (v, dv));
    sim.observe(xs, vs);
    sim.observe(vs, xs);
    sim.initialize(0.0);

    // a ∈ observees(b) ⇔ b ∈ observers(a).
    assert_eq!(sim.var(xs).observees(), &[vs]);
    assert_eq!(sim.var(vs).observees(), &[xs]);
    assert_eq!(sim.var(xs).observers(), &[vs]);
    assert_eq!(sim.var(vs).observers(), &[xs]);
    assert!(!sim.var(xs).self_observer());
}

//! Dependency wiring, discrete events, and handler-value merging.

use qss::{Config, CrossingSet, FnOracle, Oracle, Sim};

#[test]
fn discrete_observees_are_dropped_from_pooling() {
    let mut model = FnOracle::new();
    let (x, dx) = model.add_state(1.0);
    let d = model.add_var(1.0);
    model.define_derivative(dx, move |f| -f.val(d) * f.val(x));

    let mut sim = Sim::new(model, Config::default());
    let xs = sim.add_qss("x", 2, 1.0, (x, dx));
    let dv = sim.add_discrete("d", d);
    sim.observe(xs, xs);
    sim.observe(xs, dv);
    sim.initialize(0.0);

    // The discrete observee never changes between its own events, so it is
    // discarded from the observee pool; the reverse edge stays for wakeups.
    assert!(sim.var(xs).observees().is_empty());
    assert_eq!(sim.var(dv).observers(), &[xs]);
    assert!(sim.var(xs).self_observer());
}

#[test]
fn discrete_event_wakes_observers() {
    let mut model = FnOracle::new();
    let (x, dx) = model.add_state(1.0);
    let d = model.add_var(1.0);
    model.define_derivative(dx, move |f| -f.val(d) * f.val(x));

    let mut sim = Sim::new(model, Config::default());
    let xs = sim.add_qss("x", 2, 1.0, (x, dx));
    let dv = sim.add_discrete("d", d);
    sim.observe(xs, xs);
    sim.observe(xs, dv);
    sim.initialize(0.0);

    sim.simulate(0.5).unwrap();
    // The decay rate doubles at t = 0.5.
    sim.oracle_mut().set_real(d, 2.0).unwrap();
    sim.schedule_discrete(dv, 0.5);
    let stats = sim.simulate(1.0).unwrap();

    assert_eq!(stats.discrete, 1);
    let exact = (-0.5_f64).exp() * (-1.0_f64).exp();
    let value = sim.value(xs, 1.0);
    assert!((value - exact).abs() < 1.0e-3, "x(1) = {value}, exact {exact}");
}

#[test]
fn concurrent_handlers_merge_last_writer_wins() {
    // Two conditionals reassign the same variable in one pass. The queue
    // merges them into a single handler event and keeps the last value.
    let mut model = FnOracle::new();
    let (x, dx) = model.add_state(-1.0);
    model.define_derivative(dx, move |_| 1.0);
    let z1e = model.add_expression(move |f| f.val(x));
    let z2e = model.add_expression(move |f| f.val(x));
    let d = model.add_var(0.0);
    model.on_event(move |_, vals| {
        if vals[x as usize] >= -1.0e-3 {
            vals[d as usize] += 1.0;
        }
    });

    let mut sim = Sim::new(model, Config::default());
    let xs = sim.add_qss("x", 2, -1.0, (x, dx));
    let z1 = sim.add_zc("z1", 2, z1e);
    let z2 = sim.add_zc("z2", 2, z2e);
    sim.observe(z1, xs);
    sim.observe(z2, xs);
    let dv = sim.add_discrete("d", d);
    sim.add_conditional(z1, CrossingSet::ups(), vec![dv]);
    sim.add_conditional(z2, CrossingSet::ups(), vec![dv]);

    sim.initialize(0.0);
    let stats = sim.simulate(2.0).unwrap();

    assert_eq!(stats.conditional, 2);
    // One merged handler event, carrying the second conditional's value.
    assert_eq!(stats.handler, 1);
    assert_eq!(sim.value(dv, 2.0), 2.0);
}

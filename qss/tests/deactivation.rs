//! Deactivation control: a flat trajectory is revisited on the relaxation
//! schedule: first after `dtInf`, then at doubling intervals up to `dtInfMax`.

use qss::{Config, FnOracle, Sim, SmoothToken};

#[test]
fn flat_input_revisits_on_doubling_schedule() {
    let mut model = FnOracle::new();
    let u = model.add_var(5.0);

    let cfg = Config { dt_inf: 10.0, dt_inf_max: 100.0, ..Config::default() };
    let mut sim = Sim::new(model, cfg);
    let us = sim.add_input("u", 1, u, |_| SmoothToken::order_1(5.0, 0.0));
    sim.enable_output(us);

    sim.initialize(0.0);
    let stats = sim.simulate(300.0).unwrap();

    let times: Vec<f64> = sim.output(us).iter().map(|s| s.t).collect();
    // First visit after dtInf, then gaps of 20, 40, 80, and 100 (capped).
    assert_eq!(times, vec![0.0, 10.0, 30.0, 70.0, 150.0, 250.0]);
    assert_eq!(stats.input, 5);

    // The value never moves.
    for s in sim.output(us) {
        assert_eq!(s.x, 5.0);
    }
}

#[test]
fn deactivation_disabled_by_default() {
    let mut model = FnOracle::new();
    let u = model.add_var(5.0);
    let mut sim = Sim::new(model, Config::default());
    let us = sim.add_input("u", 1, u, |_| SmoothToken::order_1(5.0, 0.0));
    sim.enable_output(us);
    sim.initialize(0.0);
    let stats = sim.simulate(1000.0).unwrap();
    // With dtInf at infinity a flat trajectory is simply never revisited.
    assert_eq!(stats.input, 0);
    assert_eq!(sim.output(us).len(), 1);
}

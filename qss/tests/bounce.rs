//! Bouncing ball: gravity, a downward zero crossing on the height, and a
//! handler that flips the velocity with a restitution coefficient.

use qss::{Config, CrossingSet, FnOracle, Sim};

const G: f64 = 9.81;
const RESTITUTION: f64 = 0.8;

#[test]
fn bouncing_ball_ten_bounces() {
    let mut model = FnOracle::new();
    let (h, dh) = model.add_state(10.0);
    let (v, dv) = model.add_state(0.0);
    model.define_derivative(dh, move |f| f.val(v));
    model.define_derivative(dv, move |_| -G);
    let zh = model.add_expression(move |f| f.val(h));
    model.on_event(move |_, vals| {
        // The bump time puts the ball at (or numerically through) the floor.
        if (vals[h as usize] <= 1.0e-6) && (vals[v as usize] < 0.0) {
            vals[h as usize] = 0.0;
            vals[v as usize] = -RESTITUTION * vals[v as usize];
        }
    });

    let cfg = Config { rtol: 1.0e-4, atol: 1.0e-6, ..Config::default() };
    let mut sim = Sim::new(model, cfg);
    let hs = sim.add_qss("h", 2, 10.0, (h, dh));
    let vs = sim.add_qss("v", 2, 0.0, (v, dv));
    sim.observe(hs, vs);
    let zs = sim.add_zc("h_zero", 2, zh);
    sim.observe(zs, hs);
    sim.add_conditional(zs, CrossingSet::downs(), vec![hs, vs]);
    sim.enable_output(vs);

    sim.initialize(0.0);
    let stats = sim.simulate(11.5).unwrap();

    // Bounce times are the handler reassignments of the velocity.
    let bounces: Vec<f64> = sim.output(vs).iter().skip(1).map(|s| s.t).collect();
    assert_eq!(bounces.len(), 10, "bounces: {bounces:?}");

    let t1_exact = (2.0 * 10.0 / G).sqrt();
    assert!(
        (bounces[0] - t1_exact).abs() < 5.0e-4,
        "first bounce at {} vs {t1_exact}",
        bounces[0]
    );

    // The velocity right after the first bounce.
    let v1 = sim.output(vs)[1].x;
    assert!(
        (v1 - RESTITUTION * G * t1_exact).abs() < 2.0e-2,
        "post-bounce velocity {v1}"
    );

    // Flight times contract geometrically.
    let gap1 = bounces[1] - bounces[0];
    let gap2 = bounces[2] - bounces[1];
    assert!((gap2 / gap1 - RESTITUTION).abs() < 1.0e-2);

    // Peak height after the tenth bounce: 10·0.8²⁰.
    let t10 = bounces[9];
    let mut peak: f64 = 0.0;
    for k in 0..=300 {
        let t = t10 + (11.5 - t10) * (k as f64 / 300.0);
        peak = peak.max(sim.value(hs, t));
    }
    let peak_exact = 10.0 * RESTITUTION.powi(20);
    assert!(
        (peak - peak_exact).abs() < 5.0e-3,
        "peak after ten bounces {peak} vs {peak_exact}"
    );

    assert_eq!(stats.conditional, 10);
    assert_eq!(stats.handler, 20); // two variables reassigned per bounce
}

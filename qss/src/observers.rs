//! Observer plans: who to update after an advance, pre-sorted and pooled.
//!
//! When a variable requantizes, every variable whose derivative depends on it
//! must refresh its continuous trajectory. Oracle derivative reads dominate
//! that cost, so the observer list is organized once, at wiring time, into
//! disjoint ranges by variant (QSS states, algebraic reals, other value-only
//! variables, zero crossings), each with pooled value-reference and scratch
//! buffers so the staged pipeline can issue one bulk oracle call per range and
//! stage instead of one call per observer.
//!
//! The plan here is pure structure; the staged advance that consumes it lives
//! in the simulation driver, which owns both the arena and the oracle.

use crate::oracle::ValueRef;
use crate::variable::{VarId, Variable};
use fnv::FnvHashSet;

/// Half-open index range into a sorted observer list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Span {
    pub b: usize,
    pub e: usize,
}

impl Default for Span {
    fn default() -> Self {
        Span { b: usize::MAX, e: 0 }
    }
}

impl Span {
    /// True iff the span holds at least one observer.
    #[inline]
    pub fn have(&self) -> bool {
        self.b < self.e
    }

    /// Number of observers in the span.
    #[inline]
    pub fn n(&self) -> usize {
        if self.have() {
            self.e - self.b
        } else {
            0
        }
    }

    fn begin(&mut self, i: usize) {
        self.b = self.b.min(i);
    }

    fn close(&mut self, i: usize) {
        if self.b != usize::MAX {
            self.e = i;
        }
    }
}

/// A sorted observer list with its range indexes and pooled oracle buffers.
#[derive(Default)]
pub struct Observers {
    pub(crate) list: Vec<VarId>,

    pub(crate) qss: Span,
    pub(crate) qss2: Span,
    pub(crate) qss3: Span,
    pub(crate) r: Span,
    pub(crate) r2: Span,
    pub(crate) r3: Span,
    pub(crate) ox: Span,
    pub(crate) zc: Span,
    pub(crate) zc2: Span,
    pub(crate) zc3: Span,

    /// All QSS observers share one order (one ND probe schedule).
    pub(crate) qss_uni_order: bool,
    pub(crate) r_uni_order: bool,
    pub(crate) zc_uni_order: bool,

    // Pooled oracle call data, parallel to the spans.
    pub(crate) qss_der_refs: Vec<ValueRef>,
    pub(crate) qss_ders: Vec<f64>,
    pub(crate) qss_ders_m: Vec<f64>,
    pub(crate) qss_ders_p: Vec<f64>,

    pub(crate) r_refs: Vec<ValueRef>,
    pub(crate) r_vals: Vec<f64>,
    pub(crate) r_ders: Vec<f64>,
    pub(crate) r_ders_m: Vec<f64>,
    pub(crate) r_ders_p: Vec<f64>,

    pub(crate) zc_refs: Vec<ValueRef>,
    pub(crate) zc_vals: Vec<f64>,
    pub(crate) zc_ders: Vec<f64>,
    pub(crate) zc_ders_m: Vec<f64>,
    pub(crate) zc_ders_p: Vec<f64>,

    // Pooled observee unions per range; the 2+/3+ subsets are kept separately
    // only when observer orders are mixed, to skip probe writes that no
    // higher-order observer needs.
    pub(crate) qss_observees: Vec<VarId>,
    pub(crate) qss2_observees: Vec<VarId>,
    pub(crate) qss3_observees: Vec<VarId>,
    pub(crate) r_observees: Vec<VarId>,
    pub(crate) r2_observees: Vec<VarId>,
    pub(crate) zc_observees: Vec<VarId>,
    pub(crate) zc2_observees: Vec<VarId>,

    // Directional-derivative seed pools.
    pub(crate) r_observee_refs: Vec<ValueRef>,
    pub(crate) r_seed: Vec<f64>,
    pub(crate) zc_observee_refs: Vec<ValueRef>,
    pub(crate) zc_seed: Vec<f64>,
}

/// Remove duplicates from `ids`, preserving first-seen order.
pub(crate) fn uniquify(ids: &mut Vec<VarId>) {
    let mut seen = FnvHashSet::default();
    ids.retain(|id| seen.insert(*id));
}

fn observee_union(vars: &[Variable], observers: &[VarId], include_self: bool) -> Vec<VarId> {
    let mut union = Vec::new();
    for &o in observers {
        let v = &vars[o.0];
        if include_self && v.self_observer {
            union.push(o);
        }
        union.extend(v.observees.iter().copied());
    }
    uniquify(&mut union);
    union
}

impl Observers {
    /// True iff the plan holds no observers.
    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Highest method order among QSS-range observers (0 when the range is empty).
    pub(crate) fn qss_max_order(&self) -> usize {
        if self.qss3.have() {
            3
        } else if self.qss2.have() {
            2
        } else if self.qss.have() {
            1
        } else {
            0
        }
    }

    pub(crate) fn r_max_order(&self) -> usize {
        if self.r3.have() {
            3
        } else if self.r2.have() {
            2
        } else if self.r.have() {
            1
        } else {
            0
        }
    }

    pub(crate) fn zc_max_order(&self) -> usize {
        if self.zc3.have() {
            3
        } else if self.zc2.have() {
            2
        } else if self.zc.have() {
            1
        } else {
            0
        }
    }

    /// Build the plan for `list`: uniquify, sort by variant then order, set the
    /// range indexes, and pool the oracle buffers and observee unions.
    pub(crate) fn set_up(&mut self, vars: &[Variable], mut list: Vec<VarId>) {
        *self = Observers::default();
        uniquify(&mut list);
        list.sort_by_key(|id| (vars[id.0].sort_index(), vars[id.0].order()));
        self.list = list;
        if self.list.is_empty() {
            return;
        }

        // Range indexes over the sorted list.
        for (i, id) in self.list.iter().enumerate() {
            let v = &vars[id.0];
            let (span, span2, span3) = match v.sort_index() {
                0 => (&mut self.qss, &mut self.qss2, &mut self.qss3),
                1 => (&mut self.r, &mut self.r2, &mut self.r3),
                3 => (&mut self.zc, &mut self.zc2, &mut self.zc3),
                _ => {
                    self.ox.begin(i);
                    self.ox.close(i + 1);
                    continue;
                }
            };
            span.begin(i);
            span.close(i + 1);
            if v.order() >= 2 {
                span2.begin(i);
                span2.close(i + 1);
                if v.order() >= 3 {
                    span3.begin(i);
                    span3.close(i + 1);
                }
            }
        }
        self.qss_uni_order = (!self.qss2.have() || self.qss2.n() == self.qss.n())
            && (!self.qss3.have() || self.qss3.n() == self.qss.n());
        self.r_uni_order = (!self.r2.have() || self.r2.n() == self.r.n())
            && (!self.r3.have() || self.r3.n() == self.r.n());
        self.zc_uni_order = (!self.zc2.have() || self.zc2.n() == self.zc.n())
            && (!self.zc3.have() || self.zc3.n() == self.zc.n());

        // Pooled reference and scratch buffers.
        if self.qss.have() {
            for i in self.qss.b..self.qss.e {
                let v = &vars[self.list[i].0];
                self.qss_der_refs.push(v.der_ref.expect("state observer without a derivative"));
            }
            self.qss_ders = vec![0.0; self.qss.n()];
            self.qss_ders_m = vec![0.0; self.qss.n()];
            self.qss_ders_p = vec![0.0; self.qss.n()];
        }
        if self.r.have() {
            for i in self.r.b..self.r.e {
                self.r_refs.push(vars[self.list[i].0].var_ref);
            }
            self.r_vals = vec![0.0; self.r.n()];
            self.r_ders = vec![0.0; self.r.n()];
            self.r_ders_m = vec![0.0; self.r.n()];
            self.r_ders_p = vec![0.0; self.r.n()];
        }
        if self.zc.have() {
            for i in self.zc.b..self.zc.e {
                self.zc_refs.push(vars[self.list[i].0].var_ref);
            }
            self.zc_vals = vec![0.0; self.zc.n()];
            self.zc_ders = vec![0.0; self.zc.n()];
            self.zc_ders_m = vec![0.0; self.zc.n()];
            self.zc_ders_p = vec![0.0; self.zc.n()];
        }

        // Observee unions.
        if self.qss.have() {
            self.qss_observees = observee_union(vars, &self.list[self.qss.b..self.qss.e], true);
            if !self.qss_uni_order {
                if self.qss2.have() {
                    self.qss2_observees =
                        observee_union(vars, &self.list[self.qss2.b..self.qss.e], true);
                }
                if self.qss3.have() {
                    self.qss3_observees =
                        observee_union(vars, &self.list[self.qss3.b..self.qss.e], true);
                }
            }
        }
        if self.r.have() {
            self.r_observees = observee_union(vars, &self.list[self.r.b..self.r.e], false);
            if !self.r_uni_order && self.r2.have() {
                self.r2_observees = observee_union(vars, &self.list[self.r2.b..self.r.e], false);
            }
            for &o in &self.r_observees {
                self.r_observee_refs.push(vars[o.0].var_ref);
            }
            self.r_seed = vec![0.0; self.r_observees.len()];
        }
        if self.zc.have() {
            self.zc_observees = observee_union(vars, &self.list[self.zc.b..self.zc.e], false);
            if !self.zc_uni_order && self.zc2.have() {
                self.zc2_observees = observee_union(vars, &self.list[self.zc2.b..self.zc.e], false);
            }
            for &o in &self.zc_observees {
                self.zc_observee_refs.push(vars[o.0].var_ref);
            }
            self.zc_seed = vec![0.0; self.zc_observees.len()];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::variable::{VarKind, ZcState};

    fn arena() -> Vec<Variable> {
        let cfg = Config::default();
        let mut vars = Vec::new();
        let mut push = |name: &str, order: usize, kind: VarKind| {
            let mut v = Variable::new(name.to_string(), order, kind, &cfg);
            v.var_ref = vars.len() as u32;
            v.der_ref = Some(1000 + vars.len() as u32);
            vars.push(v);
        };
        push("zc", 2, VarKind::ZeroCrossing(Box::new(ZcState::default())));
        push("s3", 3, VarKind::Qss { relax: None });
        push("s2", 2, VarKind::Qss { relax: None });
        push("d", 0, VarKind::Discrete);
        push("r2", 2, VarKind::Real);
        vars
    }

    #[test]
    fn test_uniquify_preserves_first_seen_order() {
        let mut ids = vec![VarId(3), VarId(1), VarId(3), VarId(2), VarId(1)];
        uniquify(&mut ids);
        assert_eq!(ids, vec![VarId(3), VarId(1), VarId(2)]);
    }

    #[test]
    fn test_set_up_sorts_and_spans() {
        let vars = arena();
        let mut plan = Observers::default();
        plan.set_up(&vars, vec![VarId(0), VarId(1), VarId(2), VarId(3), VarId(4), VarId(1)]);

        // States first (by ascending order), then reals, then other
        // value-only variables, then zero crossings.
        assert_eq!(plan.list, vec![VarId(2), VarId(1), VarId(4), VarId(3), VarId(0)]);
        assert_eq!((plan.qss.b, plan.qss.e), (0, 2));
        assert_eq!((plan.qss2.b, plan.qss2.e), (0, 2));
        assert_eq!((plan.qss3.b, plan.qss3.e), (1, 2));
        assert_eq!((plan.r.b, plan.r.e), (2, 3));
        assert_eq!((plan.ox.b, plan.ox.e), (3, 4));
        assert_eq!((plan.zc.b, plan.zc.e), (4, 5));
        assert!(!plan.qss_uni_order);
        assert!(plan.r_uni_order);
        assert!(plan.zc_uni_order);
        assert_eq!(plan.qss_max_order(), 3);
        assert_eq!(plan.r_max_order(), 2);
        assert_eq!(plan.zc_max_order(), 2);

        assert_eq!(plan.qss_der_refs, vec![1002, 1001]);
        assert_eq!(plan.r_refs, vec![4]);
        assert_eq!(plan.zc_refs, vec![0]);
    }

    #[test]
    fn test_observee_union_includes_self_observers() {
        let mut vars = arena();
        vars[1].self_observer = true;
        vars[1].observees.push(VarId(2));
        vars[2].observees.push(VarId(2));
        let mut plan = Observers::default();
        plan.set_up(&vars, vec![VarId(1), VarId(2)]);
        // Self-observers appear in their own observee pool, uniquified.
        assert_eq!(plan.qss_observees, vec![VarId(2), VarId(1)]);
    }

    #[test]
    fn test_empty_plan() {
        let vars = arena();
        let mut plan = Observers::default();
        plan.set_up(&vars, vec![]);
        assert!(plan.is_empty());
        assert!(!plan.qss.have());
        assert_eq!(plan.qss_max_order(), 0);
    }
}

//! Handler plans: the variables a conditional reassigns when a crossing fires.
//!
//! A handler batch reuses the observer-plan structure (the same
//! variant-then-order sorting and pooled oracle buffers) plus value-reference
//! pools for stage 0, which reads the post-event values the oracle's discrete
//! iteration wrote. Unlike observer plans, handler sets change from firing to
//! firing, so a plan is built transiently for each batch.

use crate::observers::Observers;
use crate::oracle::ValueRef;
use crate::variable::{VarId, Variable};

/// A sorted handler list with stage-0 value pools layered over the observer
/// plan structure.
#[derive(Default)]
pub(crate) struct Handlers {
    pub plan: Observers,
    /// Value references of the state-range handlers, for the stage-0 bulk read.
    pub qss_val_refs: Vec<ValueRef>,
    pub qss_vals: Vec<f64>,
    /// Value references of the other-value-only range.
    pub ox_refs: Vec<ValueRef>,
    pub ox_vals: Vec<f64>,
}

impl Handlers {
    /// Build the plan for one batch of handler variables.
    pub fn set_up(&mut self, vars: &[Variable], list: Vec<VarId>) {
        self.plan.set_up(vars, list);
        self.qss_val_refs.clear();
        self.ox_refs.clear();
        if self.plan.qss.have() {
            for i in self.plan.qss.b..self.plan.qss.e {
                self.qss_val_refs.push(vars[self.plan.list[i].0].var_ref);
            }
            self.qss_vals = vec![0.0; self.plan.qss.n()];
        }
        if self.plan.ox.have() {
            for i in self.plan.ox.b..self.plan.ox.e {
                self.ox_refs.push(vars[self.plan.list[i].0].var_ref);
            }
            self.ox_vals = vec![0.0; self.plan.ox.n()];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::variable::VarKind;

    #[test]
    fn test_set_up_pools_value_refs() {
        let cfg = Config::default();
        let mut vars = Vec::new();
        for (i, (order, kind)) in [
            (2, VarKind::Qss { relax: None }),
            (0, VarKind::Discrete),
            (3, VarKind::Qss { relax: None }),
        ]
        .into_iter()
        .enumerate()
        {
            let mut v = Variable::new(format!("v{i}"), order, kind, &cfg);
            v.var_ref = 10 + i as u32;
            v.der_ref = Some(20 + i as u32);
            vars.push(v);
        }
        let mut handlers = Handlers::default();
        handlers.set_up(&vars, vec![VarId(2), VarId(1), VarId(0)]);
        // States sorted by ascending order, then the discrete variable.
        assert_eq!(handlers.plan.list, vec![VarId(0), VarId(2), VarId(1)]);
        assert_eq!(handlers.qss_val_refs, vec![10, 12]);
        assert_eq!(handlers.ox_refs, vec![11]);
    }
}

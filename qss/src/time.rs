//! Superdense time: the `(t, i, o)` keys ordering the event queue.
//!
//! Real time alone cannot order the cascades a discrete-event integrator
//! produces: a requantization at time `t` wakes observers at the same `t`,
//! which may fire zero crossings at the same `t`, whose handlers again run at
//! the same `t`. The pass index `i` sequences those cascades, and the category
//! offset `o` fixes the order of event classes within one pass. Ordering is
//! lexicographic over `(t, i, o)`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Simulation time.
pub type Time = f64;

/// Pass index within one real time.
pub type Index = u32;

/// Event category, ordered by its superdense-time offset.
///
/// Within one `(t, i)` pass, discrete events run first, then zero crossings,
/// then the conditionals they activate, then the handlers those schedule, and
/// only then the requantizations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Discrete variable update.
    Discrete,
    /// Zero-crossing firing.
    ZeroCrossing,
    /// Conditional activation following a crossing.
    Conditional,
    /// Handler reassignment scheduled by a conditional.
    Handler,
    /// QSS state requantization.
    Qss,
    /// Zero-crossing variable requantization.
    QssZc,
    /// Input variable requantization.
    QssInput,
}

/// A superdense time `(t, i, o)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SuperdenseTime {
    /// Real time.
    pub t: Time,
    /// Pass index.
    pub i: Index,
    /// Category offset.
    pub o: Category,
}

impl SuperdenseTime {
    /// The superdense time `(t, i, o)`.
    #[inline]
    pub fn new(t: Time, i: Index, o: Category) -> Self {
        SuperdenseTime { t, i, o }
    }
}

impl PartialEq for SuperdenseTime {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SuperdenseTime {}

impl PartialOrd for SuperdenseTime {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SuperdenseTime {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        // Queue keys are never NaN; total_cmp gives the ordering Ord requires.
        self.t
            .total_cmp(&other.t)
            .then_with(|| self.i.cmp(&other.i))
            .then_with(|| self.o.cmp(&other.o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_order() {
        let order = [
            Category::Discrete,
            Category::ZeroCrossing,
            Category::Conditional,
            Category::Handler,
            Category::Qss,
            Category::QssZc,
            Category::QssInput,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_lexicographic_order() {
        let a = SuperdenseTime::new(1.0, 0, Category::Qss);
        let b = SuperdenseTime::new(1.0, 0, Category::QssZc);
        let c = SuperdenseTime::new(1.0, 1, Category::Discrete);
        let d = SuperdenseTime::new(2.0, 0, Category::Discrete);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert_eq!(a, SuperdenseTime::new(1.0, 0, Category::Qss));
    }

    #[test]
    fn test_infinity_sorts_last() {
        let far = SuperdenseTime::new(f64::INFINITY, 0, Category::Handler);
        let near = SuperdenseTime::new(1.0e300, u32::MAX, Category::QssInput);
        assert!(near < far);
    }
}

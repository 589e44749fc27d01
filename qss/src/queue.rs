//! The event queue: an ordered multimap from superdense time to events.
//!
//! Each variable owns at most one pending event; scheduling returns a handle
//! (the map key) that later `shift` calls consume to re-key the entry in
//! O(log n). Duplicate superdense times are expected, since simultaneous
//! triggers form a batch, so entries carry a sequence number to keep map keys unique
//! while preserving insertion order within a batch.
//!
//! The queue also tracks the *active* superdense time: the key of the batch
//! being processed. Events scheduled while a batch runs land in the same pass
//! when their category comes later in the pass than the active one, and in the
//! next pass otherwise, which is what makes cascades at one real time finitely
//! ordered instead of ambiguous.

use crate::sim::CondId;
use crate::time::{Category, Index, SuperdenseTime, Time};
use crate::variable::VarId;
use std::collections::BTreeMap;

/// Handle to a queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    s: SuperdenseTime,
    seq: u64,
}

impl EventKey {
    /// The superdense time of the entry this handle refers to.
    #[inline]
    pub fn superdense_time(&self) -> SuperdenseTime {
        self.s
    }
}

/// What an event acts on when it reaches the front of the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// A variable advance (requantization, crossing, handler, discrete).
    Var(VarId),
    /// A conditional activation.
    Conditional(CondId),
}

#[derive(Clone, Copy, Debug)]
struct Event {
    target: Target,
    val: Option<f64>,
}

/// Ordered multimap of pending events with active-time tracking.
#[derive(Default)]
pub struct EventQueue {
    map: BTreeMap<EventKey, Event>,
    seq: u64,
    active: Option<SuperdenseTime>,
}

impl EventQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff no events are pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of pending events.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Superdense time of the earliest event. Panics when empty.
    pub fn top_superdense_time(&self) -> SuperdenseTime {
        self.map.keys().next().expect("event queue is empty").s
    }

    /// True iff at least two events share the earliest superdense time.
    pub fn simultaneous(&self) -> bool {
        let mut keys = self.map.keys();
        match (keys.next(), keys.next()) {
            (Some(a), Some(b)) => a.s == b.s,
            _ => false,
        }
    }

    /// Targets of all events at the earliest superdense time, front to back.
    pub fn top_targets(&self, out: &mut Vec<Target>) {
        out.clear();
        let mut iter = self.map.iter();
        if let Some((first, event)) = iter.next() {
            let s = first.s;
            out.push(event.target);
            for (key, event) in iter {
                if key.s != s {
                    break;
                }
                out.push(event.target);
            }
        }
    }

    /// Handler value carried by the entry at `key`, if any.
    pub fn event_val(&self, key: EventKey) -> Option<f64> {
        self.map.get(&key).and_then(|e| e.val)
    }

    /// Record the earliest key as the active superdense time.
    ///
    /// Must be called before a batch is processed so that `shift` calls made
    /// during the batch compute pass indexes against it.
    pub fn set_active_time(&mut self) {
        self.active = self.map.keys().next().map(|k| k.s);
    }

    /// The active superdense time, if a batch has begun.
    #[inline]
    pub fn active_superdense_time(&self) -> Option<SuperdenseTime> {
        self.active
    }

    /// Pass index for an event of category `o` scheduled at time `t`.
    fn pass_index(&self, t: Time, o: Category) -> Index {
        match self.active {
            Some(s) if t == s.t => {
                if s.o < o {
                    s.i
                } else {
                    s.i + 1
                }
            }
            _ => 0,
        }
    }

    fn insert(&mut self, s: SuperdenseTime, event: Event) -> EventKey {
        self.seq += 1;
        let key = EventKey { s, seq: self.seq };
        self.map.insert(key, event);
        key
    }

    /// Add an event at time `t` in pass 0. Used only during initialization.
    pub fn add(&mut self, o: Category, t: Time, target: Target) -> EventKey {
        self.insert(
            SuperdenseTime::new(t, 0, o),
            Event { target, val: None },
        )
    }

    /// Add an event parked at time infinity (conditionals and handlers idle there).
    pub fn add_at_infinity(&mut self, o: Category, target: Target) -> EventKey {
        self.add(o, f64::INFINITY, target)
    }

    /// Re-key the entry at `key` to time `t`, computing the pass index from the
    /// active superdense time. Returns the new handle.
    pub fn shift(&mut self, o: Category, t: Time, key: EventKey) -> EventKey {
        let event = self.map.remove(&key).expect("shift of a stale event handle");
        let i = self.pass_index(t, o);
        self.insert(SuperdenseTime::new(t, i, o), Event { target: event.target, val: None })
    }

    /// Re-key a handler entry to time `t`, carrying the value the conditional
    /// assigned.
    ///
    /// When the target already has a handler event in the same pass with a
    /// different value, two conditionals disagreed about the assignment; the
    /// last writer wins and the disagreement is logged.
    pub fn shift_handler(&mut self, t: Time, val: f64, key: EventKey) -> EventKey {
        let event = self.map.remove(&key).expect("shift of a stale event handle");
        let i = self.pass_index(t, Category::Handler);
        let s = SuperdenseTime::new(t, i, Category::Handler);
        if key.s == s {
            if let Some(prior) = event.val {
                if prior != val {
                    tracing::warn!(
                        handler = ?event.target,
                        prior, val,
                        "concurrent handler events in the same pass with different values"
                    );
                }
            }
        }
        self.insert(s, Event { target: event.target, val: Some(val) })
    }

    /// Park the entry at `key` at time infinity.
    pub fn shift_to_infinity(&mut self, o: Category, key: EventKey) -> EventKey {
        let event = self.map.remove(&key).expect("shift of a stale event handle");
        self.insert(
            SuperdenseTime::new(f64::INFINITY, 0, o),
            Event { target: event.target, val: None },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(i: usize) -> Target {
        Target::Var(VarId(i))
    }

    #[test]
    fn test_orders_by_superdense_time() {
        let mut queue = EventQueue::new();
        queue.add(Category::Qss, 2.0, var(0));
        queue.add(Category::ZeroCrossing, 1.0, var(1));
        queue.add(Category::Qss, 1.0, var(2));
        let s = queue.top_superdense_time();
        assert_eq!(s.t, 1.0);
        assert_eq!(s.o, Category::ZeroCrossing);
    }

    #[test]
    fn test_tops_batch() {
        let mut queue = EventQueue::new();
        queue.add(Category::Qss, 1.0, var(0));
        queue.add(Category::Qss, 1.0, var(1));
        queue.add(Category::Qss, 2.0, var(2));
        assert!(queue.simultaneous());
        let mut tops = Vec::new();
        queue.top_targets(&mut tops);
        assert_eq!(tops, vec![var(0), var(1)]);
    }

    #[test]
    fn test_shift_rekeys_handle() {
        let mut queue = EventQueue::new();
        let key = queue.add(Category::Qss, 1.0, var(0));
        queue.add(Category::Qss, 3.0, var(1));
        queue.set_active_time();
        let key = queue.shift(Category::Qss, 2.0, key);
        assert_eq!(key.superdense_time().t, 2.0);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.top_superdense_time().t, 2.0);
    }

    #[test]
    fn test_pass_index_within_active_time() {
        let mut queue = EventQueue::new();
        let qss = queue.add(Category::Qss, 1.0, var(0));
        let zc = queue.add(Category::ZeroCrossing, 2.0, var(1));
        queue.set_active_time(); // Active: (1.0, 0, Qss).

        // A later category at the active time stays in the same pass.
        let zc = queue.shift(Category::QssZc, 1.0, zc);
        assert_eq!(zc.superdense_time().i, 0);

        // An earlier-or-equal category at the active time moves to the next pass.
        let qss = queue.shift(Category::Qss, 1.0, qss);
        assert_eq!(qss.superdense_time().i, 1);
        let zc = queue.shift(Category::ZeroCrossing, 1.0, zc);
        assert_eq!(zc.superdense_time().i, 1);

        // A later real time resets the pass index.
        let qss = queue.shift(Category::Qss, 5.0, qss);
        assert_eq!(qss.superdense_time().i, 0);
        let _ = (qss, zc);
    }

    #[test]
    fn test_handler_value_last_writer_wins() {
        let mut queue = EventQueue::new();
        queue.add(Category::Qss, 1.0, var(9));
        let h = queue.add_at_infinity(Category::Handler, var(0));
        queue.set_active_time();
        let h = queue.shift_handler(1.0, 2.5, h);
        assert_eq!(queue.event_val(h), Some(2.5));
        let h = queue.shift_handler(1.0, 3.5, h);
        assert_eq!(queue.event_val(h), Some(3.5));
    }

    #[test]
    fn test_random_inserts_pop_monotonically() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut queue = EventQueue::new();
        for i in 0..1000 {
            let t = rng.gen_range(0.0..100.0);
            let o = match i % 3 {
                0 => Category::Qss,
                1 => Category::ZeroCrossing,
                _ => Category::QssInput,
            };
            queue.add(o, t, var(i));
        }
        let mut last = SuperdenseTime::new(f64::NEG_INFINITY, 0, Category::Discrete);
        let mut tops = Vec::new();
        while !queue.is_empty() {
            let s = queue.top_superdense_time();
            assert!(last <= s);
            last = s;
            queue.set_active_time();
            queue.top_targets(&mut tops);
            for _ in 0..tops.len() {
                let key = *queue.map.keys().next().unwrap();
                queue.map.remove(&key);
            }
        }
    }
}

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::{Rc, Weak},
};

use eddy_timing::{Duration, Instant};

/// Smallest allowed recurrence interval; shorter nonzero intervals clamp up.
pub const MIN_INTERVAL: Duration = Duration::from_micros(1);

pub(crate) type TimerAction = Box<dyn FnMut(Instant)>;

pub(crate) struct TimerState {
    id: u64,
    deadline: Cell<Instant>,
    interval: Cell<Duration>,
    catchup: Cell<bool>,
    canceled: Cell<bool>,
    firing: Cell<bool>,
    rescheduled: Cell<bool>,
    action: RefCell<Option<TimerAction>>,
}

/// Timers ordered by `(deadline, insertion id)`: same-deadline timers fire
/// in the order they were scheduled.
pub(crate) struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Rc<TimerState>>,
    next_id: u64,
}

fn clamp_interval(interval: Duration) -> Duration {
    if interval <= Duration::ZERO {
        Duration::ZERO
    } else {
        interval.max(MIN_INTERVAL)
    }
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self { entries: BTreeMap::new(), next_id: 0 }
    }

    pub(crate) fn schedule(
        &mut self,
        deadline: Instant,
        interval: Duration,
        catchup: bool,
        action: TimerAction,
    ) -> Rc<TimerState> {
        let id = self.next_id;
        self.next_id += 1;
        let state = Rc::new(TimerState {
            id,
            deadline: Cell::new(deadline),
            interval: Cell::new(clamp_interval(interval)),
            catchup: Cell::new(catchup),
            canceled: Cell::new(false),
            firing: Cell::new(false),
            rescheduled: Cell::new(false),
            action: RefCell::new(Some(action)),
        });
        self.entries.insert((deadline, id), state.clone());
        state
    }

    fn insert(&mut self, state: &Rc<TimerState>) {
        self.entries.insert((state.deadline.get(), state.id), state.clone());
    }

    fn remove(&mut self, state: &TimerState) {
        self.entries.remove(&(state.deadline.get(), state.id));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Rc<TimerState>> {
        let (&(deadline, _), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries.pop_first().map(|(_, state)| state)
    }
}

/// Fire every timer due at `now`, in key order.
///
/// The queue borrow is dropped around each action so actions can cancel,
/// reschedule, or create timers (a new timer already due joins this drain).
pub(crate) fn fire_due(queue: &Rc<RefCell<TimerQueue>>, now: Instant) {
    loop {
        let timer = queue.borrow_mut().pop_due(now);
        let Some(timer) = timer else { break };

        timer.firing.set(true);
        timer.rescheduled.set(false);
        let mut action = timer.action.borrow_mut().take();
        if let Some(f) = action.as_mut() {
            f(now);
        }
        if let Some(f) = action {
            let mut slot = timer.action.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
        timer.firing.set(false);

        if timer.canceled.get() {
            continue;
        }
        if timer.rescheduled.get() {
            queue.borrow_mut().insert(&timer);
            continue;
        }

        let interval = timer.interval.get();
        if interval > Duration::ZERO {
            let deadline = timer.deadline.get();
            let late = now - deadline;
            let next = if timer.catchup.get() && late > interval {
                // Skip the missed phases; lands strictly in the future even
                // when the lateness is an exact interval multiple.
                let steps = late.as_nanos() / interval.as_nanos() + 1;
                deadline + interval * steps
            } else {
                deadline + interval
            };
            timer.deadline.set(next);
            queue.borrow_mut().insert(&timer);
        } else {
            // One-shot: done.
            timer.canceled.set(true);
        }
    }
}

/// Handle to a scheduled timer. Usable only on the reactor's thread.
///
/// Mutations during the timer's own firing take effect when the next
/// deadline is computed; canceling during the firing prevents reinsertion.
/// A canceled or completed one-shot timer stays dead.
pub struct TimerHandle {
    state: Rc<TimerState>,
    queue: Weak<RefCell<TimerQueue>>,
}

impl TimerHandle {
    pub(crate) fn new(state: Rc<TimerState>, queue: Weak<RefCell<TimerQueue>>) -> Self {
        Self { state, queue }
    }

    pub fn cancel(&self) {
        if self.state.canceled.get() {
            return;
        }
        self.state.canceled.set(true);
        if !self.state.firing.get()
            && let Some(queue) = self.queue.upgrade()
        {
            queue.borrow_mut().remove(&self.state);
        }
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.get()
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.state.deadline.get()
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.state.interval.get()
    }

    /// Move the next fire time. From inside the timer's own action this
    /// overrides the recurrence computation for this firing.
    pub fn set_deadline(&self, deadline: Instant) {
        if self.state.canceled.get() {
            return;
        }
        if self.state.firing.get() {
            self.state.deadline.set(deadline);
            self.state.rescheduled.set(true);
        } else if let Some(queue) = self.queue.upgrade() {
            let mut queue = queue.borrow_mut();
            queue.remove(&self.state);
            self.state.deadline.set(deadline);
            queue.insert(&self.state);
        }
    }

    /// Takes effect when the next deadline is computed.
    pub fn set_interval(&self, interval: Duration) {
        self.state.interval.set(clamp_interval(interval));
    }

    pub fn set_catchup(&self, catchup: bool) {
        self.state.catchup.set(catchup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Instant {
        Instant(v * 1_000_000)
    }

    fn new_queue() -> Rc<RefCell<TimerQueue>> {
        Rc::new(RefCell::new(TimerQueue::new()))
    }

    fn handle(queue: &Rc<RefCell<TimerQueue>>, state: Rc<TimerState>) -> TimerHandle {
        TimerHandle::new(state, Rc::downgrade(queue))
    }

    #[test]
    fn one_shot_fires_once_when_due() {
        let queue = new_queue();
        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();
        let state = queue.borrow_mut().schedule(
            ms(100),
            Duration::ZERO,
            false,
            Box::new(move |_| observed.set(observed.get() + 1)),
        );
        let handle = handle(&queue, state);

        fire_due(&queue, ms(99));
        assert_eq!(fired.get(), 0);
        fire_due(&queue, ms(100));
        assert_eq!(fired.get(), 1);
        assert!(handle.is_canceled());
        fire_due(&queue, ms(500));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn fired_deadline_is_never_in_the_future() {
        let queue = new_queue();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for offset in [30u64, 10, 20] {
            let seen = seen.clone();
            queue.borrow_mut().schedule(
                ms(offset),
                Duration::ZERO,
                false,
                Box::new(move |now| seen.borrow_mut().push((offset, now))),
            );
        }
        fire_due(&queue, ms(25));
        let seen = seen.borrow();
        assert_eq!(seen.iter().map(|&(o, _)| o).collect::<Vec<_>>(), vec![10, 20]);
        for &(offset, now) in seen.iter() {
            assert!(ms(offset) <= now);
        }
    }

    #[test]
    fn same_deadline_fires_in_insertion_order() {
        let queue = new_queue();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..4u32 {
            let order = order.clone();
            queue.borrow_mut().schedule(
                ms(50),
                Duration::ZERO,
                false,
                Box::new(move |_| order.borrow_mut().push(tag)),
            );
        }
        fire_due(&queue, ms(50));
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn non_catchup_recurrence_keeps_the_phase_chain() {
        let queue = new_queue();
        let state = queue.borrow_mut().schedule(
            ms(50),
            Duration::from_millis(50),
            false,
            Box::new(|_| {}),
        );
        let handle = handle(&queue, state);

        // Late by several intervals: each firing advances by exactly one
        // interval, so the drain bursts through the backlog.
        let fired_deadlines = {
            let mut out = Vec::new();
            let mut guard = 0;
            while queue.borrow().next_deadline().is_some_and(|d| d <= ms(235)) {
                out.push(handle.deadline());
                fire_due_once(&queue, ms(235));
                guard += 1;
                assert!(guard < 10);
            }
            out
        };
        assert_eq!(fired_deadlines, vec![ms(50), ms(100), ms(150), ms(200)]);
        assert_eq!(handle.deadline(), ms(250));
    }

    // Single-step variant so tests can observe each recurrence.
    fn fire_due_once(queue: &Rc<RefCell<TimerQueue>>, now: Instant) {
        let timer = queue.borrow_mut().pop_due(now);
        let Some(timer) = timer else { return };
        timer.firing.set(true);
        timer.rescheduled.set(false);
        let mut action = timer.action.borrow_mut().take();
        if let Some(f) = action.as_mut() {
            f(now);
        }
        *timer.action.borrow_mut() = action;
        timer.firing.set(false);
        if timer.canceled.get() || timer.rescheduled.get() {
            return;
        }
        let interval = timer.interval.get();
        if interval > Duration::ZERO {
            let deadline = timer.deadline.get();
            let late = now - deadline;
            let next = if timer.catchup.get() && late > interval {
                deadline + interval * (late.as_nanos() / interval.as_nanos() + 1)
            } else {
                deadline + interval
            };
            timer.deadline.set(next);
            queue.borrow_mut().insert(&timer);
        }
    }

    #[test]
    fn catchup_realigns_to_the_next_future_phase() {
        let queue = new_queue();
        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();
        let state = queue.borrow_mut().schedule(
            ms(50),
            Duration::from_millis(50),
            true,
            Box::new(move |_| observed.set(observed.get() + 1)),
        );
        let handle = handle(&queue, state);

        // Stalled until t=235ms: one delayed firing, then realignment.
        fire_due(&queue, ms(235));
        assert_eq!(fired.get(), 1);
        assert_eq!(handle.deadline(), ms(250));

        fire_due(&queue, ms(250));
        assert_eq!(fired.get(), 2);
        assert_eq!(handle.deadline(), ms(300));

        fire_due(&queue, ms(300));
        assert_eq!(handle.deadline(), ms(350));
    }

    #[test]
    fn catchup_exact_multiple_still_lands_in_the_future() {
        let queue = new_queue();
        let state =
            queue.borrow_mut().schedule(ms(50), Duration::from_millis(50), true, Box::new(|_| {}));
        let handle = handle(&queue, state);

        // late = 150ms = 3 intervals exactly; one plain step would land on
        // `now` and refire in the same drain.
        fire_due_once(&queue, ms(200));
        assert_eq!(handle.deadline(), ms(250));
    }

    #[test]
    fn cancel_during_firing_prevents_reinsertion() {
        let queue = new_queue();
        let handle_cell: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let inner = handle_cell.clone();
        let state = queue.borrow_mut().schedule(
            ms(10),
            Duration::from_millis(10),
            false,
            Box::new(move |_| {
                if let Some(handle) = inner.borrow().as_ref() {
                    handle.cancel();
                }
            }),
        );
        *handle_cell.borrow_mut() = Some(handle(&queue, state));

        fire_due(&queue, ms(10));
        assert!(handle_cell.borrow().as_ref().unwrap().is_canceled());
        assert!(queue.borrow().next_deadline().is_none());
    }

    #[test]
    fn reschedule_during_firing_overrides_recurrence() {
        let queue = new_queue();
        let handle_cell: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let inner = handle_cell.clone();
        let state = queue.borrow_mut().schedule(
            ms(10),
            Duration::from_millis(10),
            false,
            Box::new(move |_| {
                if let Some(handle) = inner.borrow().as_ref() {
                    handle.set_deadline(ms(500));
                }
            }),
        );
        *handle_cell.borrow_mut() = Some(handle(&queue, state));

        fire_due(&queue, ms(10));
        assert_eq!(handle_cell.borrow().as_ref().unwrap().deadline(), ms(500));
        assert_eq!(queue.borrow().next_deadline(), Some(ms(500)));
    }

    #[test]
    fn timer_scheduled_by_an_action_can_join_the_same_drain() {
        let queue = new_queue();
        let order = Rc::new(RefCell::new(Vec::new()));
        let outer_q = queue.clone();
        let outer_order = order.clone();
        queue.borrow_mut().schedule(
            ms(10),
            Duration::ZERO,
            false,
            Box::new(move |_| {
                outer_order.borrow_mut().push("outer");
                let inner_order = outer_order.clone();
                outer_q.borrow_mut().schedule(
                    ms(15),
                    Duration::ZERO,
                    false,
                    Box::new(move |_| inner_order.borrow_mut().push("inner")),
                );
            }),
        );

        fire_due(&queue, ms(20));
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn cancel_removes_a_queued_timer() {
        let queue = new_queue();
        let state =
            queue.borrow_mut().schedule(ms(10), Duration::ZERO, false, Box::new(|_| panic!()));
        let handle = handle(&queue, state);
        handle.cancel();
        assert!(queue.borrow().next_deadline().is_none());
        fire_due(&queue, ms(100));
    }

    #[test]
    fn interval_clamps_to_one_microsecond() {
        let queue = new_queue();
        let state =
            queue.borrow_mut().schedule(ms(1), Duration::from_nanos(5), false, Box::new(|_| {}));
        let handle = handle(&queue, state);
        assert_eq!(handle.interval(), MIN_INTERVAL);
        handle.set_interval(Duration::from_nanos(-3));
        assert_eq!(handle.interval(), Duration::ZERO);
    }
}

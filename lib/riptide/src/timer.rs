use keel::logging;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// Timer behavior flags. `ONCE` and `REPEAT` are mutually exclusive.
pub const TIMER_ONCE: u8 = 0b0000_0001;
pub const TIMER_REPEAT: u8 = 0b0000_0010;
pub const TIMER_RUN_NOW: u8 = 0b0000_0100;
pub const TIMER_CALLED: u8 = 0b0000_1000;
pub const TIMER_AUTODELETE: u8 = 0b0001_0000;

struct Timer {
    id: TimerId,
    period: Duration,
    deadline: Instant,
    flags: u8,
    callback: Box<dyn FnMut()>,
}

/// Insertion-ordered timer list serviced once per poll cycle. Due timers
/// fire in the order they were added; callbacks run synchronously on the
/// loop thread with panics trapped at the boundary.
pub struct TimerWheel {
    timers: Vec<Timer>,
    next_id: TimerId,
    log: logging::Logger,
}

impl TimerWheel {
    pub fn new(log: logging::Logger) -> TimerWheel {
        TimerWheel {
            timers: Vec::new(),
            next_id: 1,
            log,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Adds a timer firing every `period_ms` (REPEAT) or once after
    /// `period_ms` (ONCE). With RUN_NOW the callback is invoked within this
    /// call before the first scheduled firing.
    pub fn add<F: FnMut() + 'static>(
        &mut self,
        period_ms: u64,
        flags: u8,
        callback: F,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let period = Duration::from_millis(period_ms);
        let mut timer = Timer {
            id,
            period,
            deadline: Instant::now() + period,
            flags,
            callback: Box::new(callback),
        };

        if timer.flags & TIMER_RUN_NOW != 0 {
            Self::fire(&mut timer, &self.log);

            if timer.flags & TIMER_REPEAT != 0 {
                timer.flags &= !TIMER_CALLED;
            }
        }

        // A fired RUN_NOW|ONCE|AUTODELETE timer is already spent.
        if timer.flags & TIMER_CALLED != 0 && timer.flags & TIMER_AUTODELETE != 0 {
            return id;
        }

        self.timers.push(timer);
        id
    }

    /// Unlinks a timer. Unknown ids are ignored.
    pub fn del(&mut self, id: TimerId) {
        self.timers.retain(|timer| timer.id != id);
    }

    /// Fires every due timer. `now` is computed once by the caller per poll
    /// cycle so all timers in a cycle agree on the current time.
    pub fn tick(&mut self, now: Instant) {
        let log = &self.log;

        for timer in self.timers.iter_mut() {
            if timer.flags & TIMER_CALLED != 0 || timer.deadline > now {
                continue;
            }

            Self::fire(timer, log);

            if timer.flags & TIMER_REPEAT != 0 {
                // Keep the cadence anchored to the original schedule.
                while timer.deadline <= now {
                    timer.deadline += timer.period;
                }
                timer.flags &= !TIMER_CALLED;
            }
        }

        self.timers.retain(|timer| {
            timer.flags & TIMER_CALLED == 0 || timer.flags & TIMER_AUTODELETE == 0
        });
    }

    fn fire(timer: &mut Timer, log: &logging::Logger) {
        timer.flags |= TIMER_CALLED;

        let callback = &mut timer.callback;
        if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            logging::error!(log, "timer callback panicked"; "timer_id" => timer.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn wheel() -> TimerWheel {
        TimerWheel::new(keel::logging::discard())
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnMut()) {
        let count = Rc::new(Cell::new(0));
        let inner = count.clone();
        (count, move || inner.set(inner.get() + 1))
    }

    #[test]
    fn test_run_now_fires_within_add() {
        let mut wheel = wheel();
        let (count, bump) = counter();

        wheel.add(10_000, TIMER_ONCE | TIMER_RUN_NOW | TIMER_AUTODELETE, bump);

        assert_eq!(count.get(), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_once_fires_once_then_autodeletes() {
        let mut wheel = wheel();
        let (count, bump) = counter();

        wheel.add(5, TIMER_ONCE | TIMER_AUTODELETE, bump);
        let later = Instant::now() + Duration::from_millis(50);

        wheel.tick(later);
        wheel.tick(later + Duration::from_millis(50));

        assert_eq!(count.get(), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_repeat_advances_by_period() {
        let mut wheel = wheel();
        let (count, bump) = counter();

        wheel.add(10, TIMER_REPEAT, bump);

        let start = Instant::now();
        for tick in 1..=5 {
            wheel.tick(start + Duration::from_millis(10 * tick));
        }

        assert_eq!(count.get(), 5);
        assert!(!wheel.is_empty());
    }

    #[test]
    fn test_insertion_order_within_cycle() {
        let mut wheel = wheel();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            wheel.add(1, TIMER_ONCE | TIMER_AUTODELETE, move || {
                order.borrow_mut().push(tag)
            });
        }

        wheel.tick(Instant::now() + Duration::from_millis(10));

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_del_unlinks() {
        let mut wheel = wheel();
        let (count, bump) = counter();

        let id = wheel.add(1, TIMER_REPEAT, bump);
        wheel.del(id);
        wheel.tick(Instant::now() + Duration::from_millis(10));

        assert_eq!(count.get(), 0);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_panicking_callback_is_trapped() {
        let mut wheel = wheel();
        let (count, bump) = counter();

        wheel.add(1, TIMER_ONCE | TIMER_AUTODELETE, || panic!("boom"));
        wheel.add(1, TIMER_ONCE | TIMER_AUTODELETE, bump);

        wheel.tick(Instant::now() + Duration::from_millis(10));

        // The panic did not prevent the later timer from firing.
        assert_eq!(count.get(), 1);
        assert!(wheel.is_empty());
    }
}

//! Cooperative waiting
//!
//! The foreground loop never blocks outright. Everywhere the core has to wait, for planner
//! space, for motion to finish, or for a dwell to elapse, it goes through [`wait_until`], which
//! keeps heaters, inactivity timeouts and status reporting serviced in the meantime.

use crate::planner::Planner;

/// Background duties that must keep running while the core waits
pub trait Housekeeping {
    fn manage_heater(&mut self) {}

    fn manage_inactivity(&mut self) {}

    fn refresh_status(&mut self) {}

    /// Milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;

    /// Runs one round of every duty
    fn idle(&mut self) {
        self.manage_heater();
        self.manage_inactivity();
        self.refresh_status();
    }
}

/// Runs housekeeping until `done` returns true
pub fn wait_until<H: Housekeeping + ?Sized>(housekeeping: &mut H, mut done: impl FnMut(&mut H) -> bool) {
    while !done(housekeeping) {
        housekeeping.idle();
    }
}

/// Waits for all buffered motion to complete
pub fn synchronize<P: Planner, H: Housekeeping>(planner: &P, housekeeping: &mut H) {
    wait_until(housekeeping, |_| planner.is_idle());
}

/// Waits for room in the planner
pub fn wait_for_space<P: Planner, H: Housekeeping>(planner: &P, housekeeping: &mut H) {
    wait_until(housekeeping, |_| planner.has_space());
}

/// Waits for `ms` milliseconds after the planner drains
pub fn dwell<P: Planner, H: Housekeeping>(planner: &P, housekeeping: &mut H, ms: u64) {
    synchronize(planner, housekeeping);
    let until = housekeeping.now_ms().saturating_add(ms);
    wait_until(housekeeping, |h| h.now_ms() >= until);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock {
        now: u64,
        idles: u32,
    }

    impl Housekeeping for Clock {
        fn now_ms(&self) -> u64 {
            self.now
        }

        fn manage_heater(&mut self) {
            self.idles += 1;
            self.now += 10;
        }
    }

    struct Drain(core::cell::Cell<u32>);

    impl Planner for Drain {
        fn has_space(&self) -> bool {
            true
        }
        fn buffer_line(&mut self, _: [f64; 3], _: f64, _: f64) {}
        fn set_position(&mut self, _: [f64; 3], _: f64) {}
        fn is_idle(&self) -> bool {
            let left = self.0.get();
            self.0.set(left.saturating_sub(1));
            left == 0
        }
        fn position_steps(&self, _: usize) -> i64 {
            0
        }
        fn enable_endstops(&mut self, _: bool) {}
        fn endstops_hit_on_purpose(&mut self) {}
    }

    #[test]
    fn dwell_services_housekeeping_until_elapsed() {
        let mut clock = Clock { now: 0, idles: 0 };
        let planner = Drain(core::cell::Cell::new(3));
        dwell(&planner, &mut clock, 100);
        // three rounds waiting for motion, ten for the dwell itself
        assert_eq!(clock.idles, 13);
        assert_eq!(clock.now, 130);
    }

    #[test]
    fn satisfied_wait_does_not_idle() {
        let mut clock = Clock { now: 0, idles: 0 };
        wait_until(&mut clock, |_| true);
        assert_eq!(clock.idles, 0);
    }
}

use crate::Millis;

/// Millisecond interval between steps at the given tempo.
pub fn step_interval_ms(bpm: u32) -> Millis {
    (60_000.0 / f64::from(bpm.max(1))).round() as Millis
}

/// Deadline-based replacement for interval/timeout timers. The sequencer
/// polls it once per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepClock {
    /// No timer armed (stopped, paused or beat-synchronised).
    #[default]
    Idle,
    /// Regular grid: fire at `next_due`, then every `interval`.
    Periodic { next_due: Millis, interval: Millis },
    /// One-shot wait left over from a tempo change. After it fires the clock
    /// resumes a periodic grid anchored at `due`.
    Retime { due: Millis, interval: Millis },
}

impl StepClock {
    pub fn periodic(anchor: Millis, interval: Millis) -> Self {
        Self::Periodic {
            next_due: anchor + interval,
            interval,
        }
    }

    /// Re-arms for a new interval without resetting the beat grid.
    ///
    /// `elapsed` is the time since the last step. Returns `true` when the new
    /// interval has already passed and the caller must step immediately; the
    /// clock is then anchored at `now`.
    pub fn retimed(now: Millis, elapsed: Millis, interval: Millis) -> (Self, bool) {
        if elapsed >= interval {
            (Self::periodic(now, interval), true)
        } else {
            (
                Self::Retime {
                    due: now + (interval - elapsed),
                    interval,
                },
                false,
            )
        }
    }

    pub fn next_due(&self) -> Option<Millis> {
        match *self {
            Self::Idle => None,
            Self::Periodic { next_due, .. } => Some(next_due),
            Self::Retime { due, .. } => Some(due),
        }
    }

    /// Checks the deadline. On expiry moves the clock to its next deadline
    /// and reports which deadline fired and where the grid is now anchored.
    /// At most one step fires per poll; if the host fell a whole interval
    /// behind, the grid re-anchors at `now` instead of bursting.
    pub fn poll(&mut self, now: Millis) -> Option<ClockFire> {
        let (due, interval) = match *self {
            Self::Idle => return None,
            Self::Periodic { next_due, interval } => (next_due, interval),
            Self::Retime { due, interval } => (due, interval),
        };
        if now < due {
            return None;
        }

        let mut anchor = due;
        if due + interval <= now {
            anchor = now;
        }
        *self = Self::Periodic {
            next_due: anchor + interval,
            interval,
        };
        Some(ClockFire { due, anchor })
    }
}

/// A fired deadline. `anchor` is the time the next deadline is measured
/// from: `due` normally, `now` after a re-anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockFire {
    pub due: Millis,
    pub anchor: Millis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_bpm_to_interval() {
        assert_eq!(step_interval_ms(120), 500);
        assert_eq!(step_interval_ms(60), 1000);
        assert_eq!(step_interval_ms(128), 469);
    }

    #[test]
    fn periodic_clock_fires_on_grid() {
        let mut clock = StepClock::periodic(0, 500);
        assert_eq!(clock.poll(499), None);
        assert_eq!(clock.poll(510), Some(ClockFire { due: 500, anchor: 500 }));
        assert_eq!(clock.next_due(), Some(1000));
        assert_eq!(clock.poll(1000), Some(ClockFire { due: 1000, anchor: 1000 }));
    }

    #[test]
    fn late_poll_reanchors_instead_of_bursting() {
        let mut clock = StepClock::periodic(0, 100);
        assert_eq!(clock.poll(350), Some(ClockFire { due: 100, anchor: 350 }));
        assert_eq!(clock.next_due(), Some(450));
        assert_eq!(clock.poll(360), None);
    }

    #[test]
    fn retime_waits_for_remaining_interval() {
        let (mut clock, immediate) = StepClock::retimed(700, 200, 1000);
        assert!(!immediate);
        assert_eq!(clock.next_due(), Some(1500));
        assert_eq!(clock.poll(1499), None);
        assert_eq!(clock.poll(1500), Some(ClockFire { due: 1500, anchor: 1500 }));
        assert_eq!(clock, StepClock::Periodic { next_due: 2500, interval: 1000 });
    }

    #[test]
    fn retime_past_interval_steps_immediately() {
        let (clock, immediate) = StepClock::retimed(700, 400, 250);
        assert!(immediate);
        assert_eq!(clock.next_due(), Some(950));
    }

    #[test]
    fn idle_clock_never_fires() {
        let mut clock = StepClock::Idle;
        assert_eq!(clock.poll(u64::MAX), None);
        assert_eq!(clock.next_due(), None);
    }
}

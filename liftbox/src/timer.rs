use lift_common::{
    events::{BreakKind, ClockKind, Event},
    scheduler::{CancelHandle, Scheduler},
    snapshot::ClockSnapshot,
};
use log::*;
use tokio::time::{Duration, Instant};

/// Posted back to the owner when a countdown reaches zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    pub kind: ClockKind,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum ClockState {
    Stopped {
        clock_time: Duration,
    },
    CountingDown {
        start_time: Instant,
        time_remaining_at_start: Duration,
    },
}

impl ClockState {
    fn is_running(&self) -> bool {
        matches!(self, ClockState::CountingDown { .. })
    }

    /// Never negative. Returns the full time if `now` is before the start.
    fn clock_time(&self, now: Instant) -> Duration {
        match self {
            ClockState::CountingDown {
                start_time,
                time_remaining_at_start,
            } => time_remaining_at_start
                .saturating_sub(now.saturating_duration_since(*start_time)),
            ClockState::Stopped { clock_time } => *clock_time,
        }
    }
}

fn as_ms(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

/// The attempt and break clocks of one platform. Only one of them runs at a time.
///
/// Every start, stop and reset bumps the generation and cancels the pending
/// expiry, so an expiry message that was already in flight is ignored by
/// `on_expired()`.
#[derive(Debug)]
pub struct TimerCoordinator<M> {
    scheduler: Scheduler<M>,
    wrap: fn(TimerExpired) -> M,
    attempt: ClockState,
    break_clock: ClockState,
    attempt_duration: Duration,
    break_duration: Duration,
    active: ClockKind,
    break_kind: BreakKind,
    generation: u64,
    pending: Option<CancelHandle>,
}

impl<M: Send + 'static> TimerCoordinator<M> {
    pub fn new(
        scheduler: Scheduler<M>,
        wrap: fn(TimerExpired) -> M,
        attempt_duration: Duration,
        break_duration: Duration,
    ) -> Self {
        Self {
            scheduler,
            wrap,
            attempt: ClockState::Stopped {
                clock_time: attempt_duration,
            },
            break_clock: ClockState::Stopped {
                clock_time: break_duration,
            },
            attempt_duration,
            break_duration,
            active: ClockKind::Attempt,
            break_kind: BreakKind::default(),
            generation: 0,
            pending: None,
        }
    }

    fn clock(&self, kind: ClockKind) -> &ClockState {
        match kind {
            ClockKind::Attempt => &self.attempt,
            ClockKind::Break => &self.break_clock,
        }
    }

    fn clock_mut(&mut self, kind: ClockKind) -> &mut ClockState {
        match kind {
            ClockKind::Attempt => &mut self.attempt,
            ClockKind::Break => &mut self.break_clock,
        }
    }

    /// Where a start without an explicit duration counts down from. A clock
    /// that already ran out starts over from its configured duration.
    fn resume_from(&self, kind: ClockKind, now: Instant) -> Duration {
        match self.remaining(kind, now) {
            Duration::ZERO => match kind {
                ClockKind::Attempt => self.attempt_duration,
                ClockKind::Break => self.break_duration,
            },
            remaining => remaining,
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.cancel();
        }
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active(&self) -> ClockKind {
        self.active
    }

    pub fn is_running(&self, kind: ClockKind) -> bool {
        self.clock(kind).is_running()
    }

    pub fn running_kind(&self) -> Option<ClockKind> {
        [ClockKind::Attempt, ClockKind::Break]
            .into_iter()
            .find(|k| self.is_running(*k))
    }

    pub fn remaining(&self, kind: ClockKind, now: Instant) -> Duration {
        self.clock(kind).clock_time(now)
    }

    pub fn snapshot(&self, now: Instant) -> ClockSnapshot {
        ClockSnapshot {
            kind: self.active,
            remaining_ms: as_ms(self.remaining(self.active, now)),
            running: self.is_running(self.active),
        }
    }

    /// Starts `kind` counting down from `duration`, or from where it was stopped
    /// when `duration` is `None`. A running clock of the other kind is stopped first.
    pub fn start(
        &mut self,
        kind: ClockKind,
        duration: Option<Duration>,
        break_kind: Option<BreakKind>,
        now: Instant,
    ) -> Vec<Event> {
        let mut events = vec![];
        if let Some(other) = self.running_kind().filter(|k| *k != kind) {
            events.extend(self.stop(now));
            debug!("Stopped the {other} clock to start the {kind} clock");
        }

        self.cancel_pending();
        let remaining = duration.unwrap_or_else(|| self.resume_from(kind, now));
        *self.clock_mut(kind) = ClockState::CountingDown {
            start_time: now,
            time_remaining_at_start: remaining,
        };
        self.active = kind;
        if let Some(bk) = break_kind {
            self.break_kind = bk;
        }

        let msg = (self.wrap)(TimerExpired {
            kind,
            generation: self.generation,
        });
        self.pending = Some(self.scheduler.schedule_at(now + remaining, msg));

        let remaining_ms = as_ms(remaining);
        events.push(match kind {
            ClockKind::Attempt => Event::StartTime { remaining_ms },
            ClockKind::Break => Event::BreakStarted {
                kind: self.break_kind,
                remaining_ms,
            },
        });
        events
    }

    /// Stops whichever clock is running. Does nothing if neither is.
    pub fn stop(&mut self, now: Instant) -> Option<Event> {
        let kind = self.running_kind()?;
        self.cancel_pending();
        let remaining = self.remaining(kind, now);
        *self.clock_mut(kind) = ClockState::Stopped {
            clock_time: remaining,
        };
        Some(Event::StopTime {
            kind,
            remaining_ms: as_ms(remaining),
        })
    }

    /// Stops the active clock and sets it to `duration`
    pub fn reset(&mut self, duration: Duration) -> Event {
        if self.clock(self.active).is_running() {
            self.cancel_pending();
        }
        let kind = self.active;
        *self.clock_mut(kind) = ClockState::Stopped {
            clock_time: duration,
        };
        Event::SetTime {
            kind,
            remaining_ms: as_ms(duration),
        }
    }

    /// Returns the kind that ran out, or `None` if this expiry is stale
    pub fn on_expired(&mut self, expired: TimerExpired) -> Option<ClockKind> {
        if expired.generation != self.generation || !self.is_running(expired.kind) {
            trace!(
                "Ignoring stale {} expiry (generation {}, current {})",
                expired.kind, expired.generation, self.generation
            );
            return None;
        }
        self.pending = None;
        *self.clock_mut(expired.kind) = ClockState::Stopped {
            clock_time: Duration::ZERO,
        };
        Some(expired.kind)
    }
}

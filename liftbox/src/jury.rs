use lift_common::{
    events::{Event, SummonPhase},
    scheduler::{CancelHandle, Scheduler},
};
use log::*;
use thiserror::Error;
use tokio::time::{Duration, Instant};

const SECOND_TONE_DELAY: Duration = Duration::from_secs(1);
const CLEARED_DELAY: Duration = Duration::from_secs(10);

/// The next stage of a summons, posted back to the owner by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JuryStep {
    pub referee: u8,
    pub phase: SummonPhase,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct SummonSlot {
    active: bool,
    generation: u64,
    pending: Vec<CancelHandle>,
}

impl SummonSlot {
    fn cancel(&mut self) {
        for handle in self.pending.drain(..) {
            handle.cancel();
        }
        self.generation += 1;
    }
}

/// Signals from the jury to individual referees. Nothing here touches the votes.
#[derive(Debug)]
pub struct JuryChannel<M> {
    scheduler: Scheduler<M>,
    wrap: fn(JuryStep) -> M,
    summons: Vec<SummonSlot>,
    wake_up: Vec<bool>,
}

impl<M: Send + 'static> JuryChannel<M> {
    pub fn new(scheduler: Scheduler<M>, wrap: fn(JuryStep) -> M, referees: u8) -> Self {
        Self {
            scheduler,
            wrap,
            summons: (0..referees).map(|_| SummonSlot::default()).collect(),
            wake_up: vec![false; referees.into()],
        }
    }

    fn index(&self, referee: u8) -> Result<usize> {
        let count = self.wake_up.len();
        if referee == 0 || usize::from(referee) > count {
            return Err(JuryError::InvalidReferee(referee, count as u8));
        }
        Ok(usize::from(referee - 1))
    }

    pub fn is_summoned(&self, referee: u8) -> bool {
        self.index(referee)
            .map(|i| self.summons[i].active)
            .unwrap_or(false)
    }

    pub fn wake_up_on(&self, referee: u8) -> bool {
        self.index(referee)
            .map(|i| self.wake_up[i])
            .unwrap_or(false)
    }

    /// Alerts the referee now, sounds a second tone a second later and clears
    /// the alert after the full window. Summoning again restarts the sequence.
    pub fn summon(&mut self, referee: u8, now: Instant) -> Result<Event> {
        let i = self.index(referee)?;
        let slot = &mut self.summons[i];
        if slot.active {
            debug!("Referee {referee} was already summoned, restarting");
        }
        slot.cancel();
        slot.active = true;

        let generation = slot.generation;
        for (delay, phase) in [
            (SECOND_TONE_DELAY, SummonPhase::SecondTone),
            (CLEARED_DELAY, SummonPhase::Cleared),
        ] {
            let msg = (self.wrap)(JuryStep {
                referee,
                phase,
                generation,
            });
            slot.pending.push(self.scheduler.schedule_at(now + delay, msg));
        }

        info!("Summoning referee {referee}");
        Ok(Event::SummonRef {
            referee,
            phase: SummonPhase::Alert,
        })
    }

    /// Clears a summons early. Returns `None` if the referee was not summoned.
    pub fn dismiss(&mut self, referee: u8) -> Result<Option<Event>> {
        let i = self.index(referee)?;
        let slot = &mut self.summons[i];
        if !slot.active {
            return Ok(None);
        }
        slot.cancel();
        slot.active = false;
        info!("Dismissed summons of referee {referee}");
        Ok(Some(Event::SummonRef {
            referee,
            phase: SummonPhase::Cleared,
        }))
    }

    /// Turns a scheduled step into its event, unless the summons it belongs to
    /// was dismissed or restarted
    pub fn on_step(&mut self, step: JuryStep) -> Option<Event> {
        let i = self.index(step.referee).ok()?;
        let slot = &mut self.summons[i];
        if !slot.active || slot.generation != step.generation {
            trace!("Ignoring stale jury step {step:?}");
            return None;
        }
        if step.phase == SummonPhase::Cleared {
            slot.active = false;
            slot.pending.clear();
        }
        Some(Event::SummonRef {
            referee: step.referee,
            phase: step.phase,
        })
    }

    pub fn wake_up(&mut self, referee: u8, on: bool) -> Result<Event> {
        let i = self.index(referee)?;
        self.wake_up[i] = on;
        debug!("Wake-up reminder for referee {referee} {}", if on { "on" } else { "off" });
        Ok(Event::WakeUpRef { referee, on })
    }

    /// Turns the reminder off if it was on
    pub fn clear_wake_up(&mut self, referee: u8) -> Option<Event> {
        let i = self.index(referee).ok()?;
        if !self.wake_up[i] {
            return None;
        }
        self.wake_up[i] = false;
        Some(Event::WakeUpRef { referee, on: false })
    }

    pub fn clear_all_wake_ups(&mut self) -> Vec<Event> {
        (1..=self.wake_up.len() as u8)
            .filter_map(|r| self.clear_wake_up(r))
            .collect()
    }
}

impl<M> Drop for JuryChannel<M> {
    fn drop(&mut self) {
        for slot in self.summons.iter_mut() {
            slot.cancel();
        }
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum JuryError {
    #[error("Referee {0} is out of range, this platform has {1} referees")]
    InvalidReferee(u8, u8),
}

pub type Result<T> = std::result::Result<T, JuryError>;

use crate::{
    competition::{CompetitionError, CompetitionProvider, Translator},
    config::{Display, FieldOfPlay as FopConfig},
    decision::{AggregatorState, DecisionAggregator, DecisionError, DecisionUpdate},
    jury::{JuryChannel, JuryError, JuryStep},
    snapshot_builder::{PlatformState, SnapshotBuilder},
    timer::{TimerCoordinator, TimerExpired},
};
use lift_common::{
    event_bus::EventBus,
    events::{BreakKind, ClockKind, Event, Ruling},
    scheduler::{CancelHandle, Scheduler},
    snapshot::{ClockSnapshot, StateSnapshot},
};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Operator and referee actions for one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FopCommand {
    SubmitVote {
        referee: u8,
        ruling: Ruling,
    },
    Summon {
        referee: u8,
    },
    Dismiss {
        referee: u8,
    },
    WakeUp {
        referee: u8,
        on: bool,
    },
    /// Without a duration the clock resumes from where it was stopped
    StartClock {
        kind: ClockKind,
        #[serde(default)]
        duration_secs: Option<u32>,
        #[serde(default)]
        break_kind: Option<BreakKind>,
    },
    StopClock,
    ResetClock {
        duration_secs: u32,
    },
    ResetDecision,
    UpdateLiftingOrder,
    SwitchGroup {
        group: String,
    },
    GroupDone,
    StartLifting,
}

/// Returned for every accepted command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FopStatus {
    pub fop_name: String,
    pub lift: u32,
    pub state: AggregatorState,
    pub clock: ClockSnapshot,
}

#[derive(Debug)]
pub enum FopMessage {
    Command(FopCommand, oneshot::Sender<Result<FopStatus>>),
    Snapshot(oneshot::Sender<StateSnapshot>),
    TimerExpired(TimerExpired),
    Jury(JuryStep),
    CheckSilence { lift: u32 },
    DecisionDisplayDone { lift: u32 },
    Stop,
}

/// Cheap to clone. All handles to a platform talk to the same task.
#[derive(Debug, Clone)]
pub struct FopHandle {
    name: String,
    tx: UnboundedSender<FopMessage>,
    bus: EventBus,
}

impl FopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn stopped(&self) -> FieldOfPlayError {
        FieldOfPlayError::Stopped(self.name.clone())
    }

    pub async fn command(&self, command: FopCommand) -> Result<FopStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FopMessage::Command(command, tx))
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())?
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FopMessage::Snapshot(tx))
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    pub fn stop(&self) {
        if self.tx.send(FopMessage::Stop).is_err() {
            debug!("Field of play {} already stopped", self.name);
        }
    }
}

/// Owns all decision, clock and jury state for one platform. Every change runs on
/// this task, in the order the messages arrive.
pub struct FieldOfPlay {
    config: FopConfig,
    display: Display,
    bus: EventBus,
    aggregator: DecisionAggregator,
    timers: TimerCoordinator<FopMessage>,
    jury: JuryChannel<FopMessage>,
    scheduler: Scheduler<FopMessage>,
    competition: Arc<dyn CompetitionProvider>,
    translator: Arc<dyn Translator>,
    sequence: u64,
    silence_check: Option<CancelHandle>,
    decision_reset: Option<CancelHandle>,
    rx: UnboundedReceiver<FopMessage>,
}

impl FieldOfPlay {
    pub fn spawn(
        config: FopConfig,
        display: Display,
        competition: Arc<dyn CompetitionProvider>,
        translator: Arc<dyn Translator>,
    ) -> (FopHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(&config.name);
        let scheduler = Scheduler::new(tx.clone());

        let fop = Self {
            aggregator: DecisionAggregator::new(
                config.referee_mode,
                config.timing.silence_threshold(),
            ),
            timers: TimerCoordinator::new(
                scheduler.clone(),
                FopMessage::TimerExpired,
                config.timing.attempt(),
                config.timing.break_duration(),
            ),
            jury: JuryChannel::new(
                scheduler.clone(),
                FopMessage::Jury,
                config.referee_mode.count(),
            ),
            scheduler,
            bus: bus.clone(),
            display,
            competition,
            translator,
            sequence: 0,
            silence_check: None,
            decision_reset: None,
            rx,
            config,
        };

        let handle = FopHandle {
            name: fop.config.name.clone(),
            tx,
            bus,
        };
        info!("Starting field of play {}", handle.name);
        let join = task::spawn(fop.run_loop());
        (handle, join)
    }

    fn status_string(&self, now: Instant) -> String {
        let remaining = self.timers.remaining(self.timers.active(), now).as_secs();
        format!(
            "[fop {} lift {} {} {}{:02}:{:02}]",
            self.config.name,
            self.aggregator.lift(),
            self.aggregator.state(),
            if self.timers.running_kind().is_some() { "" } else { "*" },
            remaining / 60,
            remaining % 60,
        )
    }

    fn status(&self, now: Instant) -> FopStatus {
        FopStatus {
            fop_name: self.config.name.clone(),
            lift: self.aggregator.lift(),
            state: self.aggregator.state(),
            clock: self.timers.snapshot(now),
        }
    }

    fn publish(&self, event: Event) {
        let topic = event.topic();
        let delivered = self.bus.publish(event);
        trace!("{:?} delivered to {delivered} sessions", topic);
    }

    fn publish_all<I: IntoIterator<Item = Event>>(&self, events: I) {
        for event in events {
            self.publish(event);
        }
    }

    fn current_athlete_name(&self) -> Option<String> {
        self.competition
            .model(&self.config.name)
            .current_athlete()
            .map(|a| a.full_name())
    }

    /// Clears votes and any reminders. `DecisionReset` is only sent when votes
    /// were discarded, unless `always_announce` is set.
    fn reset_decision(&mut self, always_announce: bool) {
        for handle in [self.silence_check.take(), self.decision_reset.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
        let dirty = self.aggregator.reset();
        let cleared = self.jury.clear_all_wake_ups();
        if dirty || always_announce {
            self.publish(Event::DecisionReset);
        }
        self.publish_all(cleared);
    }

    fn handle_command(&mut self, command: FopCommand, now: Instant) -> Result<FopStatus> {
        match command {
            FopCommand::SubmitVote { referee, ruling } => {
                let updates = self.aggregator.submit_vote(referee, ruling, now)?;
                if let Some(event) = self.jury.clear_wake_up(referee) {
                    self.publish(event);
                }

                if self.silence_check.is_none()
                    && self.aggregator.state() != AggregatorState::Finalized
                {
                    if let Some(deadline) = self.aggregator.silence_deadline() {
                        self.silence_check = Some(self.scheduler.schedule_at(
                            deadline,
                            FopMessage::CheckSilence {
                                lift: self.aggregator.lift(),
                            },
                        ));
                    }
                }

                for update in updates {
                    match update {
                        DecisionUpdate::DownSignal => self.publish(Event::DownSignal),
                        DecisionUpdate::Decision(summary) => {
                            if let Some(handle) = self.silence_check.take() {
                                handle.cancel();
                            }
                            let decided_at = self.aggregator.finalized_at().unwrap_or(now);
                            self.decision_reset = Some(self.scheduler.schedule_at(
                                decided_at + self.config.timing.decision_display(),
                                FopMessage::DecisionDisplayDone { lift: summary.lift },
                            ));
                            self.publish(Event::Decision(summary));
                            self.publish(Event::GlobalRankingUpdated);
                        }
                    }
                }
            }
            FopCommand::Summon { referee } => {
                let event = self.jury.summon(referee, now)?;
                self.publish(event);
            }
            FopCommand::Dismiss { referee } => {
                if let Some(event) = self.jury.dismiss(referee)? {
                    self.publish(event);
                }
            }
            FopCommand::WakeUp { referee, on } => {
                let event = self.jury.wake_up(referee, on)?;
                self.publish(event);
            }
            FopCommand::StartClock {
                kind,
                duration_secs,
                break_kind,
            } => {
                if kind == ClockKind::Attempt {
                    self.reset_decision(false);
                }
                let duration = duration_secs.map(|s| Duration::from_secs(s.into()));
                let events = self.timers.start(kind, duration, break_kind, now);
                self.publish_all(events);
            }
            FopCommand::StopClock => {
                if let Some(event) = self.timers.stop(now) {
                    self.publish(event);
                }
            }
            FopCommand::ResetClock { duration_secs } => {
                let event = self
                    .timers
                    .reset(Duration::from_secs(duration_secs.into()));
                self.publish(event);
            }
            FopCommand::ResetDecision => self.reset_decision(true),
            FopCommand::UpdateLiftingOrder => {
                self.competition.refresh()?;
                let model = self.competition.model(&self.config.name);
                let order = model
                    .ordered_athletes()
                    .iter()
                    .map(|a| a.id.clone())
                    .collect();
                let athlete = model.current_athlete().map(|a| a.full_name());
                self.publish(Event::LiftingOrderUpdated { order, athlete });
                self.publish(Event::GlobalRankingUpdated);
            }
            FopCommand::SwitchGroup { group } => {
                self.competition.refresh()?;
                self.reset_decision(false);
                self.publish(Event::SwitchGroup { group });
                self.publish(Event::GlobalRankingUpdated);
            }
            FopCommand::GroupDone => {
                let group = self
                    .competition
                    .model(&self.config.name)
                    .group
                    .unwrap_or_default();
                self.publish(Event::GroupDone { group });
                self.publish(Event::GlobalRankingUpdated);
            }
            FopCommand::StartLifting => self.publish(Event::StartLifting),
        }

        Ok(self.status(now))
    }

    fn build_snapshot(&mut self, now: Instant) -> StateSnapshot {
        self.sequence += 1;
        let model = self.competition.model(&self.config.name);
        SnapshotBuilder::new(self.translator.as_ref(), &self.display).build(
            PlatformState {
                fop_name: self.config.name.clone(),
                sequence: self.sequence,
                clock: self.timers.snapshot(now),
                decision: self.aggregator.displayed_decision().cloned(),
            },
            &model,
        )
    }

    pub async fn run_loop(mut self) {
        while let Some(msg) = self.rx.recv().await {
            let now = Instant::now();
            match msg {
                FopMessage::Command(command, reply) => {
                    info!("{} Received {command:?}", self.status_string(now));
                    let result = self.handle_command(command, now);
                    if let Err(e) = &result {
                        warn!("{} Rejected: {e}", self.status_string(now));
                    }
                    if reply.send(result).is_err() {
                        debug!("Command sender went away before the reply");
                    }
                }
                FopMessage::Snapshot(reply) => {
                    let snapshot = self.build_snapshot(now);
                    if reply.send(snapshot).is_err() {
                        debug!("Snapshot requester went away before the reply");
                    }
                }
                FopMessage::TimerExpired(expired) => match self.timers.on_expired(expired) {
                    Some(ClockKind::Attempt) => {
                        info!("{} Attempt time is up", self.status_string(now));
                        self.publish(Event::TimeElapsed {
                            kind: ClockKind::Attempt,
                        });
                    }
                    Some(ClockKind::Break) => {
                        info!("{} Break is over", self.status_string(now));
                        let athlete = self.current_athlete_name();
                        self.publish(Event::BreakDone { athlete });
                    }
                    None => {}
                },
                FopMessage::Jury(step) => {
                    if let Some(event) = self.jury.on_step(step) {
                        self.publish(event);
                    }
                }
                FopMessage::CheckSilence { lift } => {
                    if lift != self.aggregator.lift() {
                        continue;
                    }
                    self.silence_check = None;
                    if let Some(missing) = self.aggregator.check_silence(now) {
                        warn!("{} Waiting on referees {missing:?}", self.status_string(now));
                        self.publish(Event::RefereeSilent {
                            referees: missing.clone(),
                        });
                        if self.config.auto_wake_up {
                            for referee in missing {
                                match self.jury.wake_up(referee, true) {
                                    Ok(event) => self.publish(event),
                                    Err(e) => error!("Could not wake up referee {referee}: {e}"),
                                }
                            }
                        }
                    }
                }
                FopMessage::DecisionDisplayDone { lift } => {
                    if lift == self.aggregator.lift()
                        && self.aggregator.state() == AggregatorState::Finalized
                    {
                        self.decision_reset = None;
                        self.reset_decision(false);
                    }
                }
                FopMessage::Stop => break,
            }
        }
        info!("Field of play {} stopped", self.config.name);
    }
}

impl Drop for FieldOfPlay {
    fn drop(&mut self) {
        for handle in [self.silence_check.take(), self.decision_reset.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum FieldOfPlayError {
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Jury(#[from] JuryError),
    #[error(transparent)]
    Competition(#[from] CompetitionError),
    #[error("Field of play {0} has stopped")]
    Stopped(String),
}

pub type Result<T> = std::result::Result<T, FieldOfPlayError>;

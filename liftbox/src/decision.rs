use lift_common::{
    config::RefereeMode,
    events::{DecisionSummary, Ruling},
};
use log::*;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregatorState {
    WaitingVotes,
    PartialMajority,
    Finalized,
}

impl Display for AggregatorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitingVotes => write!(f, "WAITING"),
            Self::PartialMajority => write!(f, "PARTIAL"),
            Self::Finalized => write!(f, "FINAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefereeVote {
    pub referee: u8,
    pub ruling: Ruling,
    pub received_at: Instant,
}

/// What a vote caused, in the order it must be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionUpdate {
    DownSignal,
    Decision(DecisionSummary),
}

/// Collects referee votes for the lift in progress on one platform.
///
/// The down signal is raised the first time enough referees agree, and the
/// decision is final once every referee has voted. A referee that never votes
/// leaves the lift open; `check_silence()` reports who is missing.
#[derive(Debug)]
pub struct DecisionAggregator {
    mode: RefereeMode,
    silence_threshold: Duration,
    lift: u32,
    state: AggregatorState,
    votes: Vec<Option<RefereeVote>>,
    first_vote_at: Option<Instant>,
    silence_reported: bool,
    last_decision: Option<DecisionSummary>,
    finalized_at: Option<Instant>,
}

impl DecisionAggregator {
    pub fn new(mode: RefereeMode, silence_threshold: Duration) -> Self {
        Self {
            mode,
            silence_threshold,
            lift: 1,
            state: AggregatorState::WaitingVotes,
            votes: vec![None; mode.count().into()],
            first_vote_at: None,
            silence_reported: false,
            last_decision: None,
            finalized_at: None,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn lift(&self) -> u32 {
        self.lift
    }

    pub fn votes(&self) -> impl Iterator<Item = &RefereeVote> {
        self.votes.iter().flatten()
    }

    pub fn last_decision(&self) -> Option<&DecisionSummary> {
        self.last_decision.as_ref()
    }

    /// When the last decision was reached
    pub fn finalized_at(&self) -> Option<Instant> {
        self.finalized_at
    }

    /// The decision for the current lift, if it has been finalized
    pub fn displayed_decision(&self) -> Option<&DecisionSummary> {
        if self.state == AggregatorState::Finalized {
            self.last_decision.as_ref()
        } else {
            None
        }
    }

    pub fn missing_referees(&self) -> Vec<u8> {
        self.votes
            .iter()
            .enumerate()
            .filter(|(_, vote)| vote.is_none())
            .map(|(i, _)| i as u8 + 1)
            .collect()
    }

    fn count(&self, ruling: Ruling) -> u8 {
        self.votes().filter(|v| v.ruling == ruling).count() as u8
    }

    fn majority(&self) -> Option<Ruling> {
        let quorum = self.mode.quorum();
        if self.count(Ruling::Good) >= quorum {
            Some(Ruling::Good)
        } else if self.count(Ruling::Bad) >= quorum {
            Some(Ruling::Bad)
        } else {
            None
        }
    }

    pub fn check_referee(&self, referee: u8) -> Result<usize> {
        if referee == 0 || referee > self.mode.count() {
            return Err(DecisionError::InvalidReferee(referee, self.mode.count()));
        }
        Ok(usize::from(referee - 1))
    }

    pub fn submit_vote(
        &mut self,
        referee: u8,
        ruling: Ruling,
        now: Instant,
    ) -> Result<Vec<DecisionUpdate>> {
        let index = self.check_referee(referee)?;
        if self.state == AggregatorState::Finalized {
            return Err(DecisionError::AlreadyFinalized(self.lift));
        }

        if let Some(prev) = self.votes[index] {
            debug!(
                "Lift {}: referee {referee} changed vote from {} to {ruling}",
                self.lift, prev.ruling
            );
        }
        self.votes[index] = Some(RefereeVote {
            referee,
            ruling,
            received_at: now,
        });
        self.first_vote_at.get_or_insert(now);

        let mut updates = vec![];

        if self.state == AggregatorState::WaitingVotes && self.majority().is_some() {
            self.state = AggregatorState::PartialMajority;
            updates.push(DecisionUpdate::DownSignal);
        }

        if self.votes.iter().all(Option::is_some) {
            let result = self.majority().unwrap_or(Ruling::Bad);
            let summary = DecisionSummary {
                lift: self.lift,
                breakdown: self.votes.iter().map(|v| v.map(|v| v.ruling)).collect(),
                result,
            };
            info!("Lift {} decided: {summary}", self.lift);
            self.state = AggregatorState::Finalized;
            self.last_decision = Some(summary.clone());
            self.finalized_at = Some(now);
            updates.push(DecisionUpdate::Decision(summary));
        }

        Ok(updates)
    }

    /// When the silence check should run for this lift, once any vote is in
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.first_vote_at.map(|t| t + self.silence_threshold)
    }

    /// Reports the referees that still have not voted once the silence threshold
    /// has passed since the first vote. Each lift is reported at most once.
    pub fn check_silence(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.state == AggregatorState::Finalized || self.silence_reported {
            return None;
        }
        let deadline = self.silence_deadline()?;
        if now < deadline {
            return None;
        }
        self.silence_reported = true;
        let missing = self.missing_referees();
        warn!("Lift {}: referees {missing:?} have not voted", self.lift);
        Some(missing)
    }

    /// Discards all votes and starts the next lift. Returns `false` if there was
    /// nothing to discard, in which case the lift number is unchanged.
    pub fn reset(&mut self) -> bool {
        let dirty = self.state != AggregatorState::WaitingVotes || self.first_vote_at.is_some();
        if dirty {
            debug!("Lift {}: resetting decision", self.lift);
            self.votes.iter_mut().for_each(|v| *v = None);
            self.state = AggregatorState::WaitingVotes;
            self.first_vote_at = None;
            self.silence_reported = false;
            self.lift += 1;
        }
        dirty
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("Referee {0} is out of range, this platform has {1} referees")]
    InvalidReferee(u8, u8),
    #[error("Lift {0} is already decided")]
    AlreadyFinalized(u32),
}

pub type Result<T> = std::result::Result<T, DecisionError>;

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn initialize() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    const SILENCE: Duration = Duration::from_secs(10);

    fn three() -> DecisionAggregator {
        DecisionAggregator::new(RefereeMode::Three, SILENCE)
    }

    #[test]
    fn test_majority_then_decision() {
        initialize();
        let mut agg = three();
        let now = Instant::now();

        assert_eq!(agg.submit_vote(1, Ruling::Good, now), Ok(vec![]));
        assert_eq!(agg.state(), AggregatorState::WaitingVotes);

        assert_eq!(
            agg.submit_vote(2, Ruling::Good, now),
            Ok(vec![DecisionUpdate::DownSignal])
        );
        assert_eq!(agg.state(), AggregatorState::PartialMajority);

        assert_eq!(agg.finalized_at(), None);
        let decided_at = now + Duration::from_secs(2);
        let updates = agg.submit_vote(3, Ruling::Bad, decided_at).unwrap();
        let expected = DecisionSummary {
            lift: 1,
            breakdown: vec![Some(Ruling::Good), Some(Ruling::Good), Some(Ruling::Bad)],
            result: Ruling::Good,
        };
        assert_eq!(updates, vec![DecisionUpdate::Decision(expected.clone())]);
        assert_eq!(expected.count(Ruling::Good), 2);
        assert_eq!(expected.count(Ruling::Bad), 1);
        assert_eq!(agg.state(), AggregatorState::Finalized);
        assert_eq!(agg.displayed_decision(), Some(&expected));
        assert_eq!(agg.finalized_at(), Some(decided_at));
    }

    #[test]
    fn test_vote_after_final_rejected() {
        initialize();
        let mut agg = three();
        let now = Instant::now();
        for r in 1..=3 {
            agg.submit_vote(r, Ruling::Bad, now).unwrap();
        }
        let before = agg.last_decision().cloned();

        assert_eq!(
            agg.submit_vote(2, Ruling::Good, now),
            Err(DecisionError::AlreadyFinalized(1))
        );
        assert_eq!(agg.last_decision().cloned(), before);
        assert_eq!(agg.state(), AggregatorState::Finalized);
    }

    #[test]
    fn test_out_of_range_referee() {
        initialize();
        let mut agg = three();
        let now = Instant::now();
        assert_eq!(
            agg.submit_vote(0, Ruling::Good, now),
            Err(DecisionError::InvalidReferee(0, 3))
        );
        assert_eq!(
            agg.submit_vote(4, Ruling::Good, now),
            Err(DecisionError::InvalidReferee(4, 3))
        );
        assert_eq!(agg.votes().count(), 0);
        assert_eq!(agg.silence_deadline(), None);
    }

    #[test]
    fn test_same_referee_counts_once() {
        initialize();
        let mut agg = three();
        let now = Instant::now();

        agg.submit_vote(1, Ruling::Good, now).unwrap();
        assert_eq!(agg.submit_vote(1, Ruling::Good, now), Ok(vec![]));
        assert_eq!(agg.votes().count(), 1);
        assert_eq!(agg.state(), AggregatorState::WaitingVotes);

        agg.submit_vote(1, Ruling::Bad, now).unwrap();
        assert_eq!(agg.submit_vote(2, Ruling::Good, now), Ok(vec![]));
        assert_eq!(agg.missing_referees(), vec![3]);
    }

    #[test]
    fn test_down_signal_only_once() {
        initialize();
        let mut agg = three();
        let now = Instant::now();

        agg.submit_vote(1, Ruling::Good, now).unwrap();
        assert_eq!(
            agg.submit_vote(2, Ruling::Good, now),
            Ok(vec![DecisionUpdate::DownSignal])
        );
        // The majority is lost and regained, the signal does not repeat
        assert_eq!(agg.submit_vote(2, Ruling::Bad, now), Ok(vec![]));
        assert_eq!(agg.submit_vote(2, Ruling::Good, now), Ok(vec![]));
    }

    #[test]
    fn test_reset_discards_votes() {
        initialize();
        let mut agg = three();
        let now = Instant::now();

        agg.submit_vote(1, Ruling::Good, now).unwrap();
        agg.submit_vote(2, Ruling::Good, now).unwrap();
        assert!(agg.reset());
        assert_eq!(agg.state(), AggregatorState::WaitingVotes);
        assert_eq!(agg.votes().count(), 0);
        assert_eq!(agg.lift(), 2);

        assert!(!agg.reset());
        assert_eq!(agg.lift(), 2);

        // A fresh quorum is needed
        assert_eq!(agg.submit_vote(3, Ruling::Bad, now), Ok(vec![]));
        assert_eq!(
            agg.submit_vote(2, Ruling::Bad, now),
            Ok(vec![DecisionUpdate::DownSignal])
        );
    }

    #[test]
    fn test_single_referee() {
        initialize();
        let mut agg = DecisionAggregator::new(RefereeMode::Single, SILENCE);
        let now = Instant::now();

        assert_eq!(
            agg.submit_vote(2, Ruling::Good, now),
            Err(DecisionError::InvalidReferee(2, 1))
        );
        let updates = agg.submit_vote(1, Ruling::Bad, now).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], DecisionUpdate::DownSignal);
        assert_eq!(
            updates[1],
            DecisionUpdate::Decision(DecisionSummary {
                lift: 1,
                breakdown: vec![Some(Ruling::Bad)],
                result: Ruling::Bad,
            })
        );
    }

    #[test]
    fn test_silence_reported_once() {
        initialize();
        let mut agg = three();
        let start = Instant::now();

        assert_eq!(agg.check_silence(start + SILENCE * 2), None);

        agg.submit_vote(2, Ruling::Good, start).unwrap();
        agg.submit_vote(3, Ruling::Good, start + Duration::from_secs(1))
            .unwrap();
        assert_eq!(agg.silence_deadline(), Some(start + SILENCE));
        assert_eq!(agg.check_silence(start + Duration::from_secs(9)), None);
        assert_eq!(agg.check_silence(start + SILENCE), Some(vec![1]));
        assert_eq!(agg.check_silence(start + SILENCE * 2), None);

        // Still open, nothing was guessed
        assert_eq!(agg.state(), AggregatorState::PartialMajority);
        assert_eq!(agg.last_decision(), None);
    }

    #[test]
    fn test_all_vote_orders() {
        initialize();
        let rulings = [Ruling::Good, Ruling::Bad];
        let orders = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];

        for a in rulings {
            for b in rulings {
                for c in rulings {
                    let votes = [a, b, c];
                    let goods = votes.iter().filter(|r| r.is_good()).count();
                    let expected = if goods >= 2 { Ruling::Good } else { Ruling::Bad };

                    for order in orders {
                        let mut agg = three();
                        let now = Instant::now();
                        let mut seen = vec![];
                        for r in order {
                            let ruling = votes[usize::from(r - 1)];
                            seen.extend(agg.submit_vote(r, ruling, now).unwrap());
                        }

                        assert_eq!(seen.len(), 2, "{votes:?} in order {order:?}");
                        assert_eq!(seen[0], DecisionUpdate::DownSignal);
                        match &seen[1] {
                            DecisionUpdate::Decision(summary) => {
                                assert_eq!(summary.result, expected);
                                assert_eq!(
                                    summary.breakdown,
                                    votes.iter().map(|r| Some(*r)).collect::<Vec<_>>()
                                );
                            }
                            other => panic!("Expected a decision, got {other:?}"),
                        }
                    }
                }
            }
        }
    }
}

use crate::snapshot::StateSnapshot;
use derivative::Derivative;
use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Ruling {
    Good,
    Bad,
}

impl Ruling {
    pub fn is_good(self) -> bool {
        self == Self::Good
    }
}

impl Display for Ruling {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Good => write!(f, "Good"),
            Self::Bad => write!(f, "Bad"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum ClockKind {
    Attempt,
    Break,
}

impl Display for ClockKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attempt => write!(f, "Attempt"),
            Self::Break => write!(f, "Break"),
        }
    }
}

#[derive(Derivative, Serialize, Deserialize)]
#[derivative(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum BreakKind {
    BeforeIntroduction,
    #[derivative(Default)]
    FirstSnatch,
    FirstCleanJerk,
    Technical,
    Jury,
    Marshal,
}

impl Display for BreakKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeIntroduction => write!(f, "Before Introduction"),
            Self::FirstSnatch => write!(f, "First Snatch"),
            Self::FirstCleanJerk => write!(f, "First Clean & Jerk"),
            Self::Technical => write!(f, "Technical Break"),
            Self::Jury => write!(f, "Jury Deliberation"),
            Self::Marshal => write!(f, "Marshal Break"),
        }
    }
}

/// The stages of a jury summons as seen by the summoned referee's panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SummonPhase {
    Alert,
    SecondTone,
    Cleared,
}

/// A finalized ruling for one lift. `breakdown[i]` is the vote of referee `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSummary {
    pub lift: u32,
    pub breakdown: Vec<Option<Ruling>>,
    pub result: Ruling,
}

impl DecisionSummary {
    pub fn count(&self, ruling: Ruling) -> usize {
        self.breakdown
            .iter()
            .filter(|vote| **vote == Some(ruling))
            .count()
    }
}

impl Display for DecisionSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (good: {}, bad: {})",
            self.result,
            self.count(Ruling::Good),
            self.count(Ruling::Bad)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    Decision(DecisionSummary),
    DownSignal,
    DecisionReset,
    BreakStarted {
        kind: BreakKind,
        remaining_ms: u64,
    },
    BreakDone {
        athlete: Option<String>,
    },
    LiftingOrderUpdated {
        order: Vec<String>,
        athlete: Option<String>,
    },
    GroupDone {
        group: String,
    },
    SwitchGroup {
        group: String,
    },
    SummonRef {
        referee: u8,
        phase: SummonPhase,
    },
    WakeUpRef {
        referee: u8,
        on: bool,
    },
    StartLifting,
    StartTime {
        remaining_ms: u64,
    },
    StopTime {
        kind: ClockKind,
        remaining_ms: u64,
    },
    SetTime {
        kind: ClockKind,
        remaining_ms: u64,
    },
    TimeElapsed {
        kind: ClockKind,
    },
    RefereeSilent {
        referees: Vec<u8>,
    },
    GlobalRankingUpdated,
    Snapshot {
        snapshot: Box<StateSnapshot>,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Decision(_) => Topic::Decision,
            Self::DownSignal => Topic::DownSignal,
            Self::DecisionReset => Topic::DecisionReset,
            Self::BreakStarted { .. } => Topic::BreakStarted,
            Self::BreakDone { .. } => Topic::BreakDone,
            Self::LiftingOrderUpdated { .. } => Topic::LiftingOrderUpdated,
            Self::GroupDone { .. } => Topic::GroupDone,
            Self::SwitchGroup { .. } => Topic::SwitchGroup,
            Self::SummonRef { .. } => Topic::SummonRef,
            Self::WakeUpRef { .. } => Topic::WakeUpRef,
            Self::StartLifting => Topic::StartLifting,
            Self::StartTime { .. } => Topic::StartTime,
            Self::StopTime { .. } => Topic::StopTime,
            Self::SetTime { .. } => Topic::SetTime,
            Self::TimeElapsed { .. } => Topic::TimeElapsed,
            Self::RefereeSilent { .. } => Topic::RefereeSilent,
            Self::GlobalRankingUpdated => Topic::GlobalRankingUpdated,
            Self::Snapshot { .. } => Topic::Snapshot,
        }
    }

    /// Events that must only reach the panel of one referee
    pub fn target_referee(&self) -> Option<u8> {
        match self {
            Self::SummonRef { referee, .. } | Self::WakeUpRef { referee, .. } => Some(*referee),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Sequence,
)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    Decision,
    DownSignal,
    DecisionReset,
    BreakStarted,
    BreakDone,
    LiftingOrderUpdated,
    GroupDone,
    SwitchGroup,
    SummonRef,
    WakeUpRef,
    StartLifting,
    StartTime,
    StopTime,
    SetTime,
    TimeElapsed,
    RefereeSilent,
    GlobalRankingUpdated,
    Snapshot,
}

impl Topic {
    pub fn all() -> impl Iterator<Item = Topic> {
        enum_iterator::all::<Topic>()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_every_topic_reachable() {
        assert_eq!(Topic::all().count(), enum_iterator::cardinality::<Topic>());
        assert_eq!(Event::DownSignal.topic(), Topic::DownSignal);
        assert_eq!(
            Event::SummonRef {
                referee: 2,
                phase: SummonPhase::Alert
            }
            .topic(),
            Topic::SummonRef
        );
    }

    #[test]
    fn test_target_referee() {
        assert_eq!(
            Event::WakeUpRef {
                referee: 3,
                on: true
            }
            .target_referee(),
            Some(3)
        );
        assert_eq!(Event::DecisionReset.target_referee(), None);
        assert_eq!(Event::GlobalRankingUpdated.target_referee(), None);
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::Decision(DecisionSummary {
            lift: 4,
            breakdown: vec![Some(Ruling::Good), Some(Ruling::Good), Some(Ruling::Bad)],
            result: Ruling::Good,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "decision");
        assert_eq!(json["result"], "good");
        assert_eq!(json["breakdown"][2], "bad");

        let json = serde_json::to_value(Event::StopTime {
            kind: ClockKind::Attempt,
            remaining_ms: 42_000,
        })
        .unwrap();
        assert_eq!(json["type"], "stopTime");
        assert_eq!(json["remainingMs"], 42_000);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(
            back,
            Event::StopTime {
                kind: ClockKind::Attempt,
                remaining_ms: 42_000
            }
        );
    }

    #[test]
    fn test_decision_summary_counts() {
        let summary = DecisionSummary {
            lift: 1,
            breakdown: vec![Some(Ruling::Bad), None, Some(Ruling::Bad)],
            result: Ruling::Bad,
        };
        assert_eq!(summary.count(Ruling::Bad), 2);
        assert_eq!(summary.count(Ruling::Good), 0);
        assert_eq!(format!("{summary}"), "Bad (good: 0, bad: 2)");
    }
}

use crate::events::{ClockKind, DecisionSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Path on the relay tier that accepts pushed snapshots
pub const RELAY_UPDATE_PATH: &str = "/update";

/// A flattened, display-ready projection of one field of play. Every string in
/// here is already translated, so the relay tier never needs a translation table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub fop_name: String,
    pub sequence: u64,
    pub attempt: String,
    pub category_name: String,
    pub full_name: String,
    pub group_name: String,
    pub hidden: bool,
    pub start_number: Option<u32>,
    pub team_name: String,
    pub weight: Option<u32>,
    pub wide_team_names: bool,
    pub group_athletes: Vec<RowSnapshot>,
    pub leaders: Vec<RowSnapshot>,
    pub lifts_done: u32,
    pub translation_map: BTreeMap<String, String>,
    pub clock: ClockSnapshot,
    pub decision: Option<DecisionSummary>,
}

impl StateSnapshot {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSnapshot {
    pub kind: ClockKind,
    pub remaining_ms: u64,
    pub running: bool,
}

impl Default for ClockSnapshot {
    fn default() -> Self {
        Self {
            kind: ClockKind::Attempt,
            remaining_ms: 0,
            running: false,
        }
    }
}

/// One line of a ranked or ordered list. Spacers mark a category boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RowSnapshot {
    Spacer { category: String },
    Athlete(Box<AthleteRow>),
}

impl RowSnapshot {
    pub fn is_spacer(&self) -> bool {
        matches!(self, Self::Spacer { .. })
    }

    pub fn athlete(&self) -> Option<&AthleteRow> {
        match self {
            Self::Athlete(row) => Some(row),
            Self::Spacer { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AthleteRow {
    pub full_name: String,
    pub team_name: String,
    pub year_of_birth: String,
    pub category: String,
    pub start_number: Option<u32>,
    pub snatch: Vec<AttemptCell>,
    pub clean_jerk: Vec<AttemptCell>,
    pub best_snatch: String,
    pub best_clean_jerk: String,
    pub total: String,
    pub snatch_rank: String,
    pub clean_jerk_rank: String,
    pub total_rank: String,
    pub highlight: Highlight,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptCell {
    pub value: String,
    pub status: CellStatus,
    pub highlight: Highlight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CellStatus {
    #[default]
    Empty,
    Request,
    Good,
    Bad,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Highlight {
    Current,
    Next,
    #[default]
    None,
}

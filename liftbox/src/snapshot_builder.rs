use crate::{
    competition::{Athlete, Attempt, CompetitionModel, LiftType, Translator, rank_order},
    config::Display,
};
use lift_common::{
    drawing_support::{EMPTY_CELL, INVITED_LABEL_KEY},
    events::DecisionSummary,
    snapshot::{
        AthleteRow, AttemptCell, CellStatus, ClockSnapshot, Highlight, RowSnapshot, StateSnapshot,
    },
};
use std::collections::BTreeMap;

/// Labels the display pages need, resolved once per snapshot
const LABEL_KEYS: &[&str] = &[
    "Snatch",
    "Clean_and_Jerk",
    "Total",
    "Rank",
    "Name",
    "Team",
    "Category",
    "Birth",
    "Start",
    "Leaders",
    INVITED_LABEL_KEY,
];

/// Renders a lifted weight: blank or zero as a dash, a failed lift in parentheses
pub fn format_weight(weight: Option<i32>) -> String {
    match weight {
        None | Some(0) => EMPTY_CELL.to_string(),
        Some(w) if w < 0 => format!("({})", w.unsigned_abs()),
        Some(w) => w.to_string(),
    }
}

fn format_rank(rank: Option<u32>) -> String {
    match rank {
        None | Some(0) => EMPTY_CELL.to_string(),
        Some(r) => r.to_string(),
    }
}

/// Everything the builder needs to know about the platform besides the competition data
#[derive(Debug, Clone, Default)]
pub struct PlatformState {
    pub fop_name: String,
    pub sequence: u64,
    pub clock: ClockSnapshot,
    pub decision: Option<DecisionSummary>,
}

pub struct SnapshotBuilder<'a> {
    translator: &'a dyn Translator,
    settings: &'a Display,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(translator: &'a dyn Translator, settings: &'a Display) -> Self {
        Self {
            translator,
            settings,
        }
    }

    fn tr(&self, key: &str) -> String {
        self.translator.translate(key, &self.settings.locale)
    }

    pub fn build(&self, platform: PlatformState, model: &CompetitionModel) -> StateSnapshot {
        let order = model.ordered_athletes();
        let current = order.first().copied();
        let next = order.get(1).copied();

        let highlight_of = |athlete: &Athlete| -> Highlight {
            if !athlete.has_attempts_remaining() {
                Highlight::None
            } else if current.is_some_and(|c| c.id == athlete.id) {
                Highlight::Current
            } else if next.is_some_and(|n| n.id == athlete.id) {
                Highlight::Next
            } else {
                Highlight::None
            }
        };

        let mut group_athletes = vec![];
        let mut by_category: Vec<&Athlete> = model.athletes.iter().collect();
        by_category.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(a.start_number.cmp(&b.start_number))
        });
        let mut prev_category: Option<&str> = None;
        for athlete in by_category {
            if prev_category.is_some_and(|c| c != athlete.category) {
                group_athletes.push(RowSnapshot::Spacer {
                    category: athlete.category.clone(),
                });
            }
            prev_category = Some(&athlete.category);
            group_athletes.push(RowSnapshot::Athlete(Box::new(
                self.athlete_row(athlete, highlight_of(athlete)),
            )));
        }

        let leaders: Vec<RowSnapshot> = current
            .map(|c| {
                let mut ranked: Vec<&Athlete> = model
                    .athletes
                    .iter()
                    .filter(|a| a.category == c.category && a.total() > 0)
                    .collect();
                ranked.sort_by(|a, b| rank_order(a, b));
                ranked
                    .into_iter()
                    .take(self.settings.leaders_per_category)
                    .map(|a| RowSnapshot::Athlete(Box::new(self.athlete_row(a, Highlight::None))))
                    .collect()
            })
            .unwrap_or_default();

        let wide_team_names = group_athletes
            .iter()
            .chain(leaders.iter())
            .filter_map(RowSnapshot::athlete)
            .map(|row| row.team_name.as_str())
            .chain(current.map(|c| c.team.as_str()))
            .any(|team| team.chars().count() > self.settings.wide_team_name_len);

        let translation_map: BTreeMap<String, String> = LABEL_KEYS
            .iter()
            .map(|key| (key.to_string(), self.tr(key)))
            .collect();

        let mut snapshot = StateSnapshot {
            fop_name: platform.fop_name,
            sequence: platform.sequence,
            group_name: model.group.clone().unwrap_or_default(),
            hidden: current.is_none(),
            wide_team_names,
            group_athletes,
            leaders,
            lifts_done: model.lifts_done(),
            translation_map,
            clock: platform.clock,
            decision: platform.decision,
            ..Default::default()
        };

        if let Some(athlete) = current {
            snapshot.full_name = athlete.full_name();
            snapshot.team_name = athlete.team.clone();
            snapshot.category_name = athlete.category.clone();
            snapshot.start_number = athlete.start_number;
            snapshot.weight = athlete.next_weight();
            if let Some((lift, i)) = athlete.next_attempt() {
                snapshot.attempt = format!("{} #{}", self.tr(lift.label_key()), i + 1);
            }
        }

        snapshot
    }

    fn attempt_cells(
        &self,
        athlete: &Athlete,
        lift: LiftType,
        attempts: &[Attempt; 3],
        highlight: Highlight,
    ) -> Vec<AttemptCell> {
        let upcoming = athlete.next_attempt();
        attempts
            .iter()
            .enumerate()
            .map(|(i, attempt)| {
                let (value, status) = match (attempt.actual, attempt.declared) {
                    (Some(w), _) if w > 0 => (format_weight(Some(w)), CellStatus::Good),
                    (Some(w), _) if w < 0 => (format_weight(Some(w)), CellStatus::Bad),
                    (Some(_), _) => (format_weight(None), CellStatus::Empty),
                    (None, Some(d)) if d > 0 => (d.to_string(), CellStatus::Request),
                    (None, _) => (format_weight(None), CellStatus::Empty),
                };
                let highlight = if upcoming == Some((lift, i)) {
                    highlight
                } else {
                    Highlight::None
                };
                AttemptCell {
                    value,
                    status,
                    highlight,
                }
            })
            .collect()
    }

    fn athlete_row(&self, athlete: &Athlete, highlight: Highlight) -> AthleteRow {
        let total = if athlete.eligible {
            format_weight(Some(athlete.total() as i32))
        } else {
            self.tr(INVITED_LABEL_KEY)
        };

        AthleteRow {
            full_name: athlete.full_name(),
            team_name: athlete.team.clone(),
            year_of_birth: athlete
                .year_of_birth
                .map(|y| y.to_string())
                .unwrap_or_default(),
            category: athlete.category.clone(),
            start_number: athlete.start_number,
            snatch: self.attempt_cells(athlete, LiftType::Snatch, &athlete.snatch, highlight),
            clean_jerk: self.attempt_cells(
                athlete,
                LiftType::CleanJerk,
                &athlete.clean_jerk,
                highlight,
            ),
            best_snatch: format_weight(Some(athlete.best_snatch() as i32)),
            best_clean_jerk: format_weight(Some(athlete.best_clean_jerk() as i32)),
            total,
            snatch_rank: format_rank(athlete.snatch_rank),
            clean_jerk_rank: format_rank(athlete.clean_jerk_rank),
            total_rank: format_rank(athlete.total_rank),
            highlight,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::competition::{
        TranslationTable,
        test::{athlete, declared, lifted},
    };
    use lift_common::events::{ClockKind, Ruling};

    fn translations() -> TranslationTable {
        let mut table = TranslationTable::default();
        table.insert("en", "Snatch", "Snatch");
        table.insert("en", "Clean_and_Jerk", "Clean & Jerk");
        table.insert("en", INVITED_LABEL_KEY, "Extra/Invited");
        table.insert("fr", "Snatch", "Arraché");
        table
    }

    fn model() -> CompetitionModel {
        let mut a1 = athlete("1", "M73", 1, [lifted(100), lifted(-105), declared(105)]);
        a1.team = "A very long club name".to_string();
        a1.year_of_birth = Some(1999);
        let mut a2 = athlete("2", "M73", 2, [lifted(98), lifted(102), lifted(-106)]);
        a2.clean_jerk = [lifted(120), declared(125), Attempt::default()];
        a2.total_rank = Some(1);
        let mut a3 = athlete("3", "M81", 3, [lifted(110), lifted(115), lifted(118)]);
        a3.clean_jerk = [lifted(140), declared(145), Attempt::default()];
        a3.eligible = false;

        CompetitionModel {
            group: Some("M1".to_string()),
            athletes: vec![a3, a1, a2],
            lifting_order: vec!["1".to_string(), "2".to_string(), "3".to_string()],
        }
    }

    #[test]
    fn test_format_weight() {
        assert_eq!(format_weight(None), "-");
        assert_eq!(format_weight(Some(0)), "-");
        assert_eq!(format_weight(Some(-105)), "(105)");
        assert_eq!(format_weight(Some(120)), "120");
    }

    #[test]
    fn test_build() {
        let translations = translations();
        let settings = Display::default();
        let builder = SnapshotBuilder::new(&translations, &settings);
        let snapshot = builder.build(
            PlatformState {
                fop_name: "A".to_string(),
                sequence: 4,
                ..Default::default()
            },
            &model(),
        );

        assert!(!snapshot.hidden);
        assert_eq!(snapshot.full_name, "LAST1 First1");
        assert_eq!(snapshot.attempt, "Snatch #3");
        assert_eq!(snapshot.weight, Some(105));
        assert_eq!(snapshot.category_name, "M73");
        assert_eq!(snapshot.group_name, "M1");
        assert_eq!(snapshot.lifts_done, 2 + 4 + 4);
        assert!(snapshot.wide_team_names);
        assert_eq!(snapshot.translation_map["Clean_and_Jerk"], "Clean & Jerk");

        // M73 sorted first, then a spacer before M81
        let rows = &snapshot.group_athletes;
        assert_eq!(rows.len(), 4);
        assert!(rows[2].is_spacer());
        assert_eq!(
            rows[2],
            RowSnapshot::Spacer {
                category: "M81".to_string()
            }
        );

        let first = rows[0].athlete().unwrap();
        assert_eq!(first.highlight, Highlight::Current);
        assert_eq!(first.year_of_birth, "1999");
        assert_eq!(first.snatch[1].value, "(105)");
        assert_eq!(first.snatch[1].status, CellStatus::Bad);
        assert_eq!(first.snatch[2].status, CellStatus::Request);
        assert_eq!(first.snatch[2].highlight, Highlight::Current);
        assert_eq!(first.clean_jerk[0].value, "-");
        assert_eq!(first.total, "-");

        let second = rows[1].athlete().unwrap();
        assert_eq!(second.highlight, Highlight::Next);
        assert_eq!(second.clean_jerk[1].highlight, Highlight::Next);
        assert_eq!(second.clean_jerk[0].highlight, Highlight::None);
        assert_eq!(second.total, "222");
        assert_eq!(second.total_rank, "1");

        let invited = rows[3].athlete().unwrap();
        assert_eq!(invited.total, "Extra/Invited");
        assert_eq!(invited.highlight, Highlight::None);

        assert_eq!(snapshot.leaders.len(), 1);
        assert_eq!(snapshot.leaders[0].athlete().unwrap().full_name, "LAST2 First2");
    }

    #[test]
    fn test_hidden_between_groups() {
        let translations = translations();
        let settings = Display {
            locale: "fr".to_string(),
            ..Default::default()
        };
        let builder = SnapshotBuilder::new(&translations, &settings);
        let snapshot = builder.build(PlatformState::default(), &CompetitionModel::default());

        assert!(snapshot.hidden);
        assert!(snapshot.group_athletes.is_empty());
        assert!(snapshot.leaders.is_empty());
        assert!(!snapshot.wide_team_names);
        assert_eq!(snapshot.full_name, "");
        assert_eq!(snapshot.translation_map["Snatch"], "Arraché");
    }

    #[test]
    fn test_wire_round_trip() {
        let translations = translations();
        let settings = Display::default();
        let builder = SnapshotBuilder::new(&translations, &settings);
        let snapshot = builder.build(
            PlatformState {
                fop_name: "A".to_string(),
                sequence: 9,
                clock: ClockSnapshot {
                    kind: ClockKind::Attempt,
                    remaining_ms: 42_000,
                    running: true,
                },
                decision: Some(DecisionSummary {
                    lift: 3,
                    breakdown: vec![Some(Ruling::Good), Some(Ruling::Bad), Some(Ruling::Good)],
                    result: Ruling::Good,
                }),
            },
            &model(),
        );

        let bytes = snapshot.encode().unwrap();
        let received = StateSnapshot::decode(&bytes).unwrap();
        assert_eq!(received, snapshot);
    }
}

use log::*;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fs::read_to_string,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, PoisonError},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiftType {
    Snatch,
    CleanJerk,
}

impl LiftType {
    pub fn label_key(self) -> &'static str {
        match self {
            Self::Snatch => "Snatch",
            Self::CleanJerk => "Clean_and_Jerk",
        }
    }
}

/// A declared weight and, once lifted, the result. A negative result is a
/// failed lift, zero is a declined one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub declared: Option<u32>,
    pub actual: Option<i32>,
}

impl Attempt {
    pub fn is_done(&self) -> bool {
        self.actual.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Athlete {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub team: String,
    pub body_weight: Option<f64>,
    pub year_of_birth: Option<u16>,
    pub lot_number: u32,
    pub start_number: Option<u32>,
    pub category: String,
    pub eligible: bool,
    pub snatch: [Attempt; 3],
    pub clean_jerk: [Attempt; 3],
    pub snatch_rank: Option<u32>,
    pub clean_jerk_rank: Option<u32>,
    pub total_rank: Option<u32>,
}

impl Default for Athlete {
    fn default() -> Self {
        Self {
            id: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            team: String::new(),
            body_weight: None,
            year_of_birth: None,
            lot_number: 0,
            start_number: None,
            category: String::new(),
            eligible: true,
            snatch: Default::default(),
            clean_jerk: Default::default(),
            snatch_rank: None,
            clean_jerk_rank: None,
            total_rank: None,
        }
    }
}

impl Athlete {
    pub fn full_name(&self) -> String {
        match (self.last_name.is_empty(), self.first_name.is_empty()) {
            (false, false) => format!("{} {}", self.last_name.to_uppercase(), self.first_name),
            (false, true) => self.last_name.to_uppercase(),
            (true, _) => self.first_name.clone(),
        }
    }

    pub fn attempts_done(&self) -> u32 {
        self.snatch
            .iter()
            .chain(self.clean_jerk.iter())
            .filter(|a| a.is_done())
            .count() as u32
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_done() < 6
    }

    /// The lift and zero-based attempt index this athlete takes next
    pub fn next_attempt(&self) -> Option<(LiftType, usize)> {
        if let Some(i) = self.snatch.iter().position(|a| !a.is_done()) {
            return Some((LiftType::Snatch, i));
        }
        self.clean_jerk
            .iter()
            .position(|a| !a.is_done())
            .map(|i| (LiftType::CleanJerk, i))
    }

    pub fn next_weight(&self) -> Option<u32> {
        let (lift, i) = self.next_attempt()?;
        match lift {
            LiftType::Snatch => self.snatch[i].declared,
            LiftType::CleanJerk => self.clean_jerk[i].declared,
        }
    }

    fn best(attempts: &[Attempt; 3]) -> u32 {
        attempts
            .iter()
            .filter_map(|a| a.actual)
            .filter(|w| *w > 0)
            .max()
            .unwrap_or(0) as u32
    }

    pub fn best_snatch(&self) -> u32 {
        Self::best(&self.snatch)
    }

    pub fn best_clean_jerk(&self) -> u32 {
        Self::best(&self.clean_jerk)
    }

    /// Zero unless both lifts have a successful attempt
    pub fn total(&self) -> u32 {
        let (snatch, cj) = (self.best_snatch(), self.best_clean_jerk());
        if snatch == 0 || cj == 0 { 0 } else { snatch + cj }
    }
}

/// The current group on one platform, as maintained by the competition secretary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompetitionModel {
    pub group: Option<String>,
    /// Athletes of the group in start order
    pub athletes: Vec<Athlete>,
    /// Athlete ids in lifting order. When empty, the order is derived from declarations.
    pub lifting_order: Vec<String>,
}

impl CompetitionModel {
    pub fn athlete(&self, id: &str) -> Option<&Athlete> {
        self.athletes.iter().find(|a| a.id == id)
    }

    /// Athletes still to lift, in order. Athletes with no attempts remaining are skipped.
    pub fn ordered_athletes(&self) -> Vec<&Athlete> {
        if self.lifting_order.is_empty() {
            compute_lifting_order(&self.athletes)
        } else {
            self.lifting_order
                .iter()
                .filter_map(|id| self.athlete(id))
                .filter(|a| a.has_attempts_remaining())
                .collect()
        }
    }

    pub fn current_athlete(&self) -> Option<&Athlete> {
        self.ordered_athletes().into_iter().next()
    }

    pub fn lifts_done(&self) -> u32 {
        self.athletes.iter().map(|a| a.attempts_done()).sum()
    }
}

/// Snatches before clean & jerks, then lightest declared weight, then fewest
/// attempts taken, then lot number
pub fn compute_lifting_order(athletes: &[Athlete]) -> Vec<&Athlete> {
    let mut order: Vec<&Athlete> = athletes
        .iter()
        .filter(|a| a.has_attempts_remaining())
        .collect();

    let key = |a: &Athlete| {
        let lift = match a.next_attempt() {
            Some((LiftType::Snatch, _)) => 0,
            _ => 1,
        };
        (lift, a.next_weight().unwrap_or(u32::MAX), a.attempts_done(), a.lot_number)
    };
    order.sort_by(|a, b| key(a).cmp(&key(b)));
    order
}

/// Orders athletes of one category by total rank, unranked last
pub fn rank_order(a: &Athlete, b: &Athlete) -> Ordering {
    match (a.total_rank, b.total_rank) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.total().cmp(&a.total()),
    }
}

/// Read-only access to athlete, group and ranking data for each field of play
pub trait CompetitionProvider: Send + Sync {
    fn model(&self, fop_name: &str) -> CompetitionModel;

    /// Picks up changes made by the secretary. The default does nothing.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Competition data read from a TOML file, one table per field of play
#[derive(Debug)]
pub struct FileCompetition {
    path: Option<PathBuf>,
    models: RwLock<BTreeMap<String, CompetitionModel>>,
}

impl FileCompetition {
    pub fn empty() -> Self {
        Self {
            path: None,
            models: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_models(models: BTreeMap<String, CompetitionModel>) -> Self {
        Self {
            path: None,
            models: RwLock::new(models),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let models = read_models(path.as_ref())?;
        Ok(Self {
            path: Some(path.as_ref().to_path_buf()),
            models: RwLock::new(models),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, CompetitionModel>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_models(path: &Path) -> Result<BTreeMap<String, CompetitionModel>> {
    let contents = read_to_string(path).map_err(|e| {
        error!("Failed to read competition file {path:?}: {e}");
        CompetitionError::Io(e.to_string())
    })?;
    toml::from_str(&contents).map_err(|e| {
        error!("Failed to parse competition file {path:?}: {e}");
        CompetitionError::Parse(e.to_string())
    })
}

impl CompetitionProvider for FileCompetition {
    fn model(&self, fop_name: &str) -> CompetitionModel {
        self.read().get(fop_name).cloned().unwrap_or_default()
    }

    fn refresh(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let models = read_models(path)?;
            info!("Reloaded competition data for {} platforms", models.len());
            *self.models.write().unwrap_or_else(PoisonError::into_inner) = models;
        }
        Ok(())
    }
}

pub trait Translator: Send + Sync {
    fn translate(&self, key: &str, locale: &str) -> String;
}

/// Labels keyed by locale, then by key. Unknown keys fall back to English and
/// then to the key itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TranslationTable {
    locales: BTreeMap<String, BTreeMap<String, String>>,
}

const FALLBACK_LOCALE: &str = "en";

impl TranslationTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = read_to_string(path).map_err(|e| {
            error!("Failed to read translations {path:?}: {e}");
            CompetitionError::Io(e.to_string())
        })?;
        toml::from_str(&contents).map_err(|e| CompetitionError::Parse(e.to_string()))
    }

    pub fn insert(&mut self, locale: &str, key: &str, text: &str) {
        self.locales
            .entry(locale.to_string())
            .or_default()
            .insert(key.to_string(), text.to_string());
    }
}

impl Translator for TranslationTable {
    fn translate(&self, key: &str, locale: &str) -> String {
        self.locales
            .get(locale)
            .and_then(|t| t.get(key))
            .or_else(|| self.locales.get(FALLBACK_LOCALE).and_then(|t| t.get(key)))
            .cloned()
            .unwrap_or_else(|| {
                trace!("No translation for {key:?} in {locale}");
                key.to_string()
            })
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum CompetitionError {
    #[error("Could not read competition data: {0}")]
    Io(String),
    #[error("Could not parse competition data: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, CompetitionError>;

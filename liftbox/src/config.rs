use derivative::Derivative;
pub use lift_common::config::{ConfigError, FieldOfPlay, RefereeMode, SessionSettings, Timing};
use lift_common::drawing_support::DEFAULT_WIDE_TEAM_NAME_LEN;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::PathBuf, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct Relay {
    /// Base URL of the relay tier, e.g. `http://scoreboard.local:8090`. No
    /// snapshots are pushed when empty.
    pub url: String,
    #[derivative(Default(value = "2000"))]
    pub timeout_ms: u64,
}

impl Relay {
    pub fn enabled(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct Display {
    #[derivative(Default(value = "\"en\".to_string()"))]
    pub locale: String,
    #[derivative(Default(value = "3"))]
    pub leaders_per_category: usize,
    #[derivative(Default(value = "DEFAULT_WIDE_TEAM_NAME_LEN"))]
    pub wide_team_name_len: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFiles {
    pub competition: Option<PathBuf>,
    pub translations: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct Config {
    #[derivative(Default(value = "vec![FieldOfPlay::default()]"))]
    pub fields_of_play: Vec<FieldOfPlay>,
    pub sessions: SessionSettings,
    pub relay: Relay,
    pub display: Display,
    pub data: DataFiles,
}

impl Config {
    /// Checks what serde can't: at least one platform, and no two with the same name
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fields_of_play.is_empty() {
            return Err(ConfigError::NoFieldsOfPlay);
        }
        let mut seen = BTreeSet::new();
        for fop in self.fields_of_play.iter() {
            if !seen.insert(fop.name.as_str()) {
                return Err(ConfigError::DuplicateFieldOfPlay(fop.name.clone()));
            }
        }
        Ok(())
    }
}

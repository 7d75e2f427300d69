use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Number of referees ruling on each lift. Only one or three are supported.
#[derive(Debug, Clone, Copy, Derivative, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum RefereeMode {
    Single,
    #[derivative(Default)]
    Three,
}

impl RefereeMode {
    pub fn count(self) -> u8 {
        match self {
            Self::Single => 1,
            Self::Three => 3,
        }
    }

    pub fn quorum(self) -> u8 {
        self.count() / 2 + 1
    }
}

impl TryFrom<u8> for RefereeMode {
    type Error = ConfigError;

    fn try_from(count: u8) -> Result<Self, Self::Error> {
        match count {
            1 => Ok(Self::Single),
            3 => Ok(Self::Three),
            n => Err(ConfigError::UnsupportedRefereeCount(n)),
        }
    }
}

impl From<RefereeMode> for u8 {
    fn from(mode: RefereeMode) -> Self {
        mode.count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct Timing {
    #[derivative(Default(value = "60"))]
    pub attempt_secs: u16,
    #[derivative(Default(value = "600"))]
    pub break_secs: u16,
    #[derivative(Default(value = "3"))]
    pub decision_display_secs: u16,
    #[derivative(Default(value = "10"))]
    pub silence_threshold_secs: u16,
}

impl Timing {
    pub fn attempt(&self) -> Duration {
        Duration::from_secs(self.attempt_secs.into())
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_secs.into())
    }

    pub fn decision_display(&self) -> Duration {
        Duration::from_secs(self.decision_display_secs.into())
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs(self.silence_threshold_secs.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct FieldOfPlay {
    #[derivative(Default(value = "\"A\".to_string()"))]
    pub name: String,
    pub referee_mode: RefereeMode,
    #[derivative(Default(value = "true"))]
    pub auto_wake_up: bool,
    pub timing: Timing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct SessionSettings {
    #[derivative(Default(value = "5"))]
    pub grace_secs: u16,
    #[derivative(Default(value = "300"))]
    pub idle_timeout_secs: u16,
}

impl SessionSettings {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs.into())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.into())
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Only 1 or 3 referees are supported, got {0}")]
    UnsupportedRefereeCount(u8),
    #[error("Two fields of play are both named {0:?}")]
    DuplicateFieldOfPlay(String),
    #[error("At least one field of play must be configured")]
    NoFieldsOfPlay,
}

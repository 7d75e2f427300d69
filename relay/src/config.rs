use derivative::Derivative;
use lift_common::config::SessionSettings;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
#[serde(default)]
pub struct Config {
    #[derivative(Default(value = "8090"))]
    pub port: u16,
    /// Ignore snapshots older than the one already stored for that platform
    pub reject_stale: bool,
    pub sessions: SessionSettings,
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_ser_config() {
        let config: Config = Default::default();
        let serialized = toml::to_string(&config).unwrap();
        let deser = toml::from_str(&serialized);
        assert_eq!(deser, Ok(config));
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(indoc!(
            r#"reject_stale = true

               [sessions]
               grace_secs = 10
               idle_timeout_secs = 60"#
        ))
        .unwrap();
        assert_eq!(config.port, 8090);
        assert!(config.reject_stale);
        assert_eq!(config.sessions.grace_secs, 10);
    }
}

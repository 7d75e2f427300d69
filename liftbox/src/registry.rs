use crate::{
    competition::{CompetitionProvider, Translator},
    config::Config,
    field_of_play::{FieldOfPlay, FopHandle},
};
use lift_common::config::ConfigError;
use log::*;
use std::{collections::BTreeMap, sync::Arc};
use tokio::task::JoinHandle;

/// Every field of play in this process, by name. Built once at startup and
/// handed to whatever needs to reach a platform.
#[derive(Debug, Default)]
pub struct Registry {
    fops: BTreeMap<String, FopHandle>,
    joins: Vec<JoinHandle<()>>,
}

impl Registry {
    pub fn start(
        config: &Config,
        competition: Arc<dyn CompetitionProvider>,
        translator: Arc<dyn Translator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut registry = Self::default();
        for fop_config in config.fields_of_play.iter() {
            let (handle, join) = FieldOfPlay::spawn(
                fop_config.clone(),
                config.display.clone(),
                competition.clone(),
                translator.clone(),
            );
            registry.insert(handle)?;
            registry.joins.push(join);
        }
        info!("Started {} fields of play", registry.len());
        Ok(registry)
    }

    pub fn insert(&mut self, handle: FopHandle) -> Result<(), ConfigError> {
        let name = handle.name().to_string();
        if self.fops.contains_key(&name) {
            return Err(ConfigError::DuplicateFieldOfPlay(name));
        }
        self.fops.insert(name, handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FopHandle> {
        self.fops.get(name)
    }

    pub fn handles(&self) -> impl Iterator<Item = &FopHandle> {
        self.fops.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fops.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fops.is_empty()
    }

    pub fn stop_all(&self) {
        for handle in self.fops.values() {
            handle.stop();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop_all();
        for join in self.joins.iter() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        competition::{FileCompetition, TranslationTable},
        config::FieldOfPlay as FopConfig,
        decision::AggregatorState,
        field_of_play::FopCommand,
    };
    use lift_common::events::Ruling;

    fn config(names: &[&str]) -> Config {
        Config {
            fields_of_play: names
                .iter()
                .map(|name| FopConfig {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn start(config: &Config) -> Result<Registry, ConfigError> {
        Registry::start(
            config,
            Arc::new(FileCompetition::empty()),
            Arc::new(TranslationTable::default()),
        )
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let registry = start(&config(&["A", "B"])).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["A", "B"]);

        let status = registry
            .get("B")
            .unwrap()
            .command(FopCommand::StartLifting)
            .await
            .unwrap();
        assert_eq!(status.fop_name, "B");
        assert!(registry.get("C").is_none());
    }

    #[tokio::test]
    async fn test_platforms_are_independent() {
        let registry = start(&config(&["A", "B"])).unwrap();
        let a = registry.get("A").unwrap();
        let b = registry.get("B").unwrap();

        a.command(FopCommand::SubmitVote {
            referee: 1,
            ruling: Ruling::Good,
        })
        .await
        .unwrap();
        a.command(FopCommand::SubmitVote {
            referee: 2,
            ruling: Ruling::Good,
        })
        .await
        .unwrap();
        let b_status = b.command(FopCommand::StartLifting).await.unwrap();
        assert_eq!(b_status.state, AggregatorState::WaitingVotes);
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        assert_eq!(
            start(&config(&["A", "A"])).unwrap_err(),
            ConfigError::DuplicateFieldOfPlay("A".to_string())
        );
        assert_eq!(start(&config(&[])).unwrap_err(), ConfigError::NoFieldsOfPlay);
    }
}

//! Training configuration supplied by the host.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Configuration error types.
#[derive(Debug, Fail, PartialEq)]
pub enum ConfigError {
    /// A setting that must be positive is zero or negative.
    #[fail(display = "Configuration value `{}` must be positive.", name)]
    NonPositive {
        /// Name of the offending setting.
        name: &'static str,
    },
}

/// Host-facing training settings.
///
/// Missing fields take their default values, so `{}` is a valid
/// configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Width of user and item embeddings.
    pub embedding_dim: usize,
    /// Number of interactions per training step.
    pub batch_size: usize,
    /// Passes over the interactions per `fit` call.
    pub epochs: usize,
    /// Optimizer learning rate.
    pub learning_rate: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            embedding_dim: 32,
            batch_size: 64,
            epochs: 5,
            learning_rate: 0.001,
        }
    }
}

impl TrainingConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, failure::Error> {
        let config: TrainingConfig = serde_json::from_str(json)?;
        config.validate()?;

        Ok(config)
    }

    /// Read and validate a JSON configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let reader = BufReader::new(File::open(path)?);
        let config: TrainingConfig = serde_json::from_reader(reader)?;
        config.validate()?;

        Ok(config)
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::NonPositive {
                name: "embedding_dim",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" });
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "learning_rate",
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        assert_eq!(
            TrainingConfig::from_json("{}").unwrap(),
            TrainingConfig::default()
        );
    }

    #[test]
    fn partial_json_overrides() {
        let config = TrainingConfig::from_json(r#"{"embedding_dim": 8, "epochs": 2}"#).unwrap();

        assert_eq!(config.embedding_dim, 8);
        assert_eq!(config.epochs, 2);
        assert_eq!(config.batch_size, 64);
    }

    #[test]
    fn rejects_zero_batch_size() {
        assert_eq!(
            TrainingConfig {
                batch_size: 0,
                ..TrainingConfig::default()
            }
            .validate(),
            Err(ConfigError::NonPositive { name: "batch_size" })
        );
        assert!(TrainingConfig::from_json(r#"{"learning_rate": 0.0}"#).is_err());
        assert!(TrainingConfig::from_json("not json").is_err());
    }
}

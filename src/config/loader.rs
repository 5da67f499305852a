use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use super::migrate::{self, MigrateError};
use super::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config `{0}`: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("error parsing config `{0}`: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),

    #[error("error migrating legacy config: {0}")]
    Migrate(#[from] MigrateError),
}

pub trait ConfigLoader {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Loads the nested YAML configuration from disk. A file in the legacy
/// flat-key format is migrated in place (the old file is kept as a
/// timestamped backup) and the migrated result is returned.
pub struct ConfigLoaderFile {
    file_path: PathBuf,
}

impl ConfigLoaderFile {
    pub fn new(file_path: &Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
        }
    }
}

impl ConfigLoader for ConfigLoaderFile {
    fn load(&self) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(&self.file_path)
            .map_err(|e| ConfigError::Io(self.file_path.clone(), e))?;

        match serde_yaml::from_str::<Config>(&contents) {
            Ok(config) => Ok(config),
            Err(_) if migrate::looks_legacy(&contents) => {
                info!(
                    config = %self.file_path.display(),
                    "legacy flat-key config detected, migrating"
                );
                Ok(migrate::migrate_file(&self.file_path, &contents)?)
            }
            Err(err) => Err(ConfigError::Parse(self.file_path.clone(), err)),
        }
    }
}

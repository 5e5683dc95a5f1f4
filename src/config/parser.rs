//! Configuration parser for loading the desired-state file.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{ConvergeConfig, LaunchTemplateSpec, ObjectStoreBackend, ObjectStoreConfig};

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["infra-converge.yaml", "infra-converge.yml"];

/// Configuration parser for loading the desired state.
#[derive(Debug, Clone, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ConvergeConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ConvergeConfig> {
        debug!("Parsing YAML configuration");

        let config: ConvergeConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Parsed configuration for cluster: {}", config.cluster.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognised variables: `INFRA_CONVERGE_CLUSTER`,
    /// `INFRA_CONVERGE_REGION`, `INFRA_CONVERGE_SNAPSHOT` and
    /// `INFRA_CONVERGE_BUCKET`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ConvergeConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    fn apply_env_overrides(config: &mut ConvergeConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("INFRA_CONVERGE_CLUSTER") {
            debug!("Overriding cluster.name from environment");
            config.cluster.name = name;
        }

        if let Some(region) = lookup("INFRA_CONVERGE_REGION") {
            debug!("Overriding cluster.region from environment");
            config.cluster.region = Some(region);
        }

        if let Some(snapshot) = lookup("INFRA_CONVERGE_SNAPSHOT") {
            debug!("Overriding provider.snapshot from environment");
            config.provider.snapshot = PathBuf::from(snapshot);
        }

        if let Some(bucket) = lookup("INFRA_CONVERGE_BUCKET") {
            debug!("Overriding object_store.bucket from environment");
            match &mut config.object_store {
                Some(store) => store.bucket = bucket,
                None => {
                    config.object_store = Some(ObjectStoreConfig {
                        backend: ObjectStoreBackend::default(),
                        bucket,
                        prefix: None,
                        region: None,
                    });
                }
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Returns the user data payload of a launch template.
    ///
    /// Inline user data wins over `user_data_file`; a relative file path is
    /// resolved against the base path. No user data yields an empty payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the user data file cannot be read.
    pub fn read_user_data(&self, spec: &LaunchTemplateSpec) -> Result<Vec<u8>> {
        if let Some(inline) = &spec.user_data {
            return Ok(inline.as_bytes().to_vec());
        }

        let Some(file) = &spec.user_data_file else {
            return Ok(Vec::new());
        };

        let path = match &self.base_path {
            Some(base) if file.is_relative() => base.join(file),
            _ => file.clone(),
        };

        std::fs::read(&path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read user data for '{}': {e}", spec.name),
                location: Some(path.display().to_string()),
            })
        })
    }
}

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

//! Engine configuration
//!
//! ```yaml
//! settings_dir: settings
//! templates_dir: templates
//! samconfig_dir: samconfig
//! tag_namespace: atlantis
//! retry:
//!   max_attempts: 6
//!   initial_backoff_ms: 500
//! ```
//!
//! Every field is optional. The value is passed explicitly to whatever needs it.
use crate::snapshot::RetryPolicy;
use crate::tags::TagNames;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub settings_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub samconfig_dir: PathBuf,
    pub tag_namespace: String,
    pub generator: String,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settings_dir: "settings".into(),
            templates_dir: "templates".into(),
            samconfig_dir: "samconfig".into(),
            tag_namespace: "atlantis".into(),
            generator: env!("CARGO_PKG_NAME").into(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!(path=%path.display(), "loading config");
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|e| e.at(path))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Yaml {
            path: None,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                path: None,
                message: message.to_string(),
            })
        };

        if self.retry.max_attempts < 1 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be at least 1.0");
        }
        if self.generator.trim().is_empty() {
            return invalid("generator must not be empty");
        }
        if self.tag_namespace.trim().is_empty() {
            return invalid("tag_namespace must not be empty");
        }
        Ok(())
    }

    /// Directory of local templates for one infra type
    pub fn template_dir(&self, infra_type: crate::identifier::InfraType) -> PathBuf {
        self.templates_dir.join(infra_type.as_str())
    }

    pub fn tag_names(&self) -> TagNames {
        TagNames::new(self.tag_namespace.clone())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config{}", at(.path))]
    Yaml {
        path: Option<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config{}: {message}", at(.path))]
    Invalid {
        path: Option<PathBuf>,
        message: String,
    },
}

fn at(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|path| format!(" {}", path.display()))
        .unwrap_or_default()
}

impl ConfigError {
    fn at(mut self, file: &Path) -> Self {
        match &mut self {
            ConfigError::Yaml { path, .. } | ConfigError::Invalid { path, .. } => {
                *path = Some(file.to_path_buf())
            }
            ConfigError::Io { .. } => {}
        }
        self
    }
}

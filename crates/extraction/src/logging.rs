use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{ExtractionError, Result};

const PROGRESS_TEMPLATE: &str =
    "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} images ({per_sec}, eta {eta})";

/// `[logging]` table of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_progress")]
    pub progress: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            progress: default_progress(),
        }
    }
}

impl LoggingConfig {
    pub(crate) fn validation_errors(&self) -> Vec<String> {
        match EnvFilter::try_new(&self.level) {
            Ok(_) => Vec::new(),
            Err(err) => vec![format!(
                "logging.level '{}' is not a valid filter: {}",
                self.level, err
            )],
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub show_progress: bool,
}

impl LoggingSettings {
    /// Only the primary rank draws a progress bar.
    pub fn from_config(config: &LoggingConfig, is_primary: bool) -> Self {
        Self {
            level: config.level.clone(),
            json: config.json,
            show_progress: config.progress && is_primary,
        }
    }
}

/// Installs the global subscriber. A second call is an error.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|err| {
            ExtractionError::initialization(format!("invalid log filter: {err}"))
        })?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| {
        ExtractionError::initialization(format!("failed to install log subscriber: {err}"))
    })
}

pub fn progress_bar(total: usize, settings: &LoggingSettings) -> ProgressBar {
    if !settings.show_progress {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

fn default_level() -> String {
    "info".to_string()
}

fn default_progress() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_primary_only() {
        let config = LoggingConfig::default();
        assert!(LoggingSettings::from_config(&config, true).show_progress);
        assert!(!LoggingSettings::from_config(&config, false).show_progress);
        assert!(progress_bar(10, &LoggingSettings::from_config(&config, false)).is_hidden());
    }

    #[test]
    fn invalid_level_is_reported() {
        let config = LoggingConfig {
            level: "extraction=notalevel".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(config.validation_errors().len(), 1);
        assert!(LoggingConfig::default().validation_errors().is_empty());
    }
}

//! Application configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::{
    default_packages, TemplateParams, DEFAULT_ARCH, DEFAULT_AUTH_KEY, DEFAULT_RELEASE,
    DEFAULT_TEMPLATE,
};

/// Top-level configuration, loaded from TOML plus `LXFORGE__`-prefixed
/// environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub container: ContainerSettings,
    pub venv: VenvSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level when no CLI flag overrides it.
    pub level: String,
    /// Optional log file path.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Container bring-up configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Directory holding the LXC tools; resolved via PATH if unset.
    pub bin_dir: Option<String>,
    /// Base container name; a random suffix is appended per container.
    pub base_name: String,
    /// LXC template name.
    pub template: String,
    /// OS release for the template.
    pub release: String,
    /// Architecture for the template.
    pub arch: String,
    /// Host path of the public key handed to the template ("" disables).
    pub auth_key: String,
    /// Packages installed by the template.
    pub packages: Vec<String>,
    /// Readiness poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Overall readiness deadline in seconds.
    pub poll_timeout_secs: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            bin_dir: None,
            base_name: "lxforge".to_string(),
            template: DEFAULT_TEMPLATE.to_string(),
            release: DEFAULT_RELEASE.to_string(),
            arch: DEFAULT_ARCH.to_string(),
            auth_key: DEFAULT_AUTH_KEY.to_string(),
            packages: default_packages(),
            poll_interval_ms: 1000,
            poll_timeout_secs: 120,
        }
    }
}

impl ContainerSettings {
    /// Template parameters derived from this configuration.
    ///
    /// The in-container user is filled in by the manager.
    pub fn template_params(&self) -> TemplateParams {
        TemplateParams::default()
            .release(self.release.clone())
            .arch(self.arch.clone())
            .auth_key(self.auth_key.clone())
            .packages(self.packages.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Virtual environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VenvSettings {
    /// Base directory for environments; defaults to `~/.virtualenvs`.
    pub base_dir: Option<String>,
    /// Interpreter used to bootstrap environments.
    pub python: String,
}

impl Default for VenvSettings {
    fn default() -> Self {
        Self {
            base_dir: None,
            python: lxforge_venv::DEFAULT_PYTHON.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.container.base_name, "lxforge");
        assert_eq!(config.container.release, DEFAULT_RELEASE);
        assert_eq!(config.container.poll_interval_ms, 1000);
        assert_eq!(config.venv.python, "/usr/bin/python3");
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: AppConfig = toml::from_str(
            "[container]\nrelease = \"focal\"\npoll_timeout_secs = 30\n",
        )
        .unwrap();
        assert_eq!(config.container.release, "focal");
        assert_eq!(config.container.poll_timeout_secs, 30);
        assert_eq!(config.container.arch, DEFAULT_ARCH);
    }

    #[test]
    fn template_params_carry_settings() {
        let settings = ContainerSettings {
            release: "focal".to_string(),
            packages: vec!["git".to_string()],
            ..Default::default()
        };
        let params = settings.template_params();
        assert_eq!(params.release, "focal");
        assert_eq!(params.packages, vec!["git".to_string()]);
        assert!(params.user.is_empty());
    }

    #[test]
    fn poll_durations_convert_units() {
        let settings = ContainerSettings::default();
        assert_eq!(settings.poll_interval(), Duration::from_millis(1000));
        assert_eq!(settings.poll_timeout(), Duration::from_secs(120));
    }
}

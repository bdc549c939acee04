//! Container template parameters and input validation.

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Default LXC template name.
pub const DEFAULT_TEMPLATE: &str = "ubuntu";

/// Default OS release for the template.
pub const DEFAULT_RELEASE: &str = "jammy";

/// Default architecture for the template.
pub const DEFAULT_ARCH: &str = "amd64";

/// Default host path of the public key injected into the container.
pub const DEFAULT_AUTH_KEY: &str = "~/.ssh/id_rsa.pub";

/// Packages installed into a fresh container.
pub fn default_packages() -> Vec<String> {
    ["openssh-server", "sudo", "python3", "python3-venv"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Parameters handed to the LXC template when instantiating a container.
///
/// Caller overrides are merged over these defaults via the builder
/// methods; everything ends up as `--key value` pairs after the `--`
/// separator of `lxc-create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateParams {
    /// Template name (e.g. "ubuntu", "debian", "download").
    pub template: String,
    /// OS release the template should install.
    pub release: String,
    /// Target architecture.
    pub arch: String,
    /// User account created inside the container.
    pub user: String,
    /// Host path of an authorized public key ("" disables injection).
    pub auth_key: String,
    /// Initial package list installed by the template.
    pub packages: Vec<String>,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            release: DEFAULT_RELEASE.to_string(),
            arch: DEFAULT_ARCH.to_string(),
            user: String::new(),
            auth_key: DEFAULT_AUTH_KEY.to_string(),
            packages: default_packages(),
        }
    }
}

impl TemplateParams {
    /// Set the OS release.
    pub fn release(mut self, release: impl Into<String>) -> Self {
        self.release = release.into();
        self
    }

    /// Set the architecture.
    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    /// Set the in-container user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the authorized-keys source path.
    pub fn auth_key(mut self, auth_key: impl Into<String>) -> Self {
        self.auth_key = auth_key.into();
        self
    }

    /// Replace the initial package list.
    pub fn packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    /// Validate every field before it reaches a tool invocation.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_template_field("template", &self.template)?;
        validate_template_field("release", &self.release)?;
        validate_template_field("arch", &self.arch)?;
        validate_username(&self.user)?;
        for package in &self.packages {
            validate_package_name(package)?;
        }
        Ok(())
    }

    /// Lower to the argument vector passed after `--` to `lxc-create`.
    ///
    /// `auth_key` should already be expanded to an absolute host path.
    pub fn to_template_args(&self, password: &str) -> Vec<String> {
        let mut args = vec![
            "--release".to_string(),
            self.release.clone(),
            "--arch".to_string(),
            self.arch.clone(),
            "--user".to_string(),
            self.user.clone(),
            "--password".to_string(),
            password.to_string(),
        ];
        if !self.auth_key.is_empty() {
            args.push("--auth-key".to_string());
            args.push(self.auth_key.clone());
        }
        if !self.packages.is_empty() {
            args.push("--packages".to_string());
            args.push(self.packages.join(","));
        }
        args
    }
}

/// Build a unique container name by suffixing random hex.
///
/// Uniqueness is enforced by the suffix alone, not by external
/// coordination; two concurrent creations with the same base collide only
/// at the birthday bound of four random bytes.
pub fn unique_name(base: &str) -> String {
    let suffix: [u8; 4] = rand::random();
    format!("{base}-{}", hex::encode(suffix))
}

/// Validate a container name (base or suffixed).
///
/// Must start with an alphanumeric character or underscore; only
/// alphanumerics, hyphens and underscores are allowed.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 64 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 64 characters".to_string(),
        ));
    }

    let mut chars = name.chars();
    let first = chars.next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{name}' contains invalid characters; only alphanumeric, '-', '_' are allowed"
        )));
    }

    Ok(())
}

/// Validate a Linux username before it reaches useradd-adjacent places
/// (template arguments, sudoers drop-ins, chown owners).
///
/// Rules:
/// - Max 32 characters (Linux limit)
/// - Starts with a lowercase letter or underscore
/// - Only lowercase ascii, digits, underscore, hyphen
pub fn validate_username(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "username cannot be empty".to_string(),
        ));
    }
    if name.len() > 32 {
        return Err(ContainerError::InvalidInput(format!(
            "username too long ({} > 32)",
            name.len()
        )));
    }
    let first = name.chars().next().unwrap_or('-');
    if !first.is_ascii_lowercase() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "username '{name}' must start with a lowercase letter or underscore"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(ContainerError::InvalidInput(format!(
            "username '{name}' contains invalid characters (allowed: a-z, 0-9, _, -)"
        )));
    }
    Ok(())
}

fn validate_template_field(field: &str, value: &str) -> ContainerResult<()> {
    if value.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "template {field} cannot be empty"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "template {field} '{value}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_package_name(package: &str) -> ContainerResult<()> {
    if package.is_empty() {
        return Err(ContainerError::InvalidInput(
            "package name cannot be empty".to_string(),
        ));
    }
    if !package
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '+')
    {
        return Err(ContainerError::InvalidInput(format!(
            "package name '{package}' contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn unique_name_appends_hex_suffix() {
        let name = unique_name("worker");
        assert_eq!(name.len(), "worker".len() + 9);
        let suffix = name.strip_prefix("worker-").unwrap();
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unique_name_is_distinct_across_trials() {
        let names: HashSet<String> = (0..100).map(|_| unique_name("worker")).collect();
        assert_eq!(names.len(), 100);
    }

    #[test]
    fn unique_name_stays_valid() {
        for _ in 0..20 {
            validate_container_name(&unique_name("box")).unwrap();
        }
    }

    #[test]
    fn container_name_valid() {
        assert!(validate_container_name("mybox").is_ok());
        assert!(validate_container_name("my-box_1").is_ok());
        assert!(validate_container_name("_private").is_ok());
    }

    #[test]
    fn container_name_invalid() {
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-leading-dash").is_err());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name("box;rm").is_err());
        assert!(validate_container_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn username_valid() {
        assert!(validate_username("bmoar").is_ok());
        assert!(validate_username("_svc").is_ok());
        assert!(validate_username("user-123").is_ok());
    }

    #[test]
    fn username_invalid() {
        assert!(validate_username("").is_err());
        assert!(validate_username("Root").is_err());
        assert!(validate_username("1user").is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_username("evil\nALL=(ALL)").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn template_args_include_overrides() {
        let params = TemplateParams::default()
            .release("focal")
            .arch("arm64")
            .user("bmoar")
            .auth_key("/home/bmoar/.ssh/id_rsa.pub")
            .packages(vec!["git".to_string(), "curl".to_string()]);

        let args = params.to_template_args("hunter2");
        assert_eq!(
            args,
            vec![
                "--release",
                "focal",
                "--arch",
                "arm64",
                "--user",
                "bmoar",
                "--password",
                "hunter2",
                "--auth-key",
                "/home/bmoar/.ssh/id_rsa.pub",
                "--packages",
                "git,curl",
            ]
        );
    }

    #[test]
    fn template_args_skip_empty_sections() {
        let params = TemplateParams::default()
            .user("bmoar")
            .auth_key("")
            .packages(vec![]);
        let args = params.to_template_args("bmoar");
        assert!(!args.contains(&"--auth-key".to_string()));
        assert!(!args.contains(&"--packages".to_string()));
    }

    #[test]
    fn params_validate_rejects_bad_fields() {
        let params = TemplateParams::default().user("bmoar").release("jammy; rm");
        assert!(params.validate().is_err());

        let params = TemplateParams::default().user("Not Valid");
        assert!(params.validate().is_err());

        let params = TemplateParams::default()
            .user("bmoar")
            .packages(vec!["ok".to_string(), "bad pkg".to_string()]);
        assert!(params.validate().is_err());
    }

    #[test]
    fn params_validate_accepts_defaults_with_user() {
        assert!(TemplateParams::default().user("bmoar").validate().is_ok());
    }
}

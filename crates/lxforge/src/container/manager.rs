//! Container lifecycle and in-container provisioning.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rustix::process::geteuid;

use super::action::ContainerAction;
use super::config::{self, TemplateParams};
use super::error::{ContainerError, ContainerResult};
use super::runtime::ContainerBackend;

/// PATH handed to attached processes; `lxc-attach --clear-env` wipes the
/// inherited one.
const ATTACH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Options for constructing a [`ContainerManager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Base container name; a random hex suffix is appended at creation.
    pub base_name: String,
    /// Acting user. Defaults to `$SUDO_USER`, then the current user.
    pub user: Option<String>,
    /// Password for the in-container account; defaults to the username.
    pub password: Option<String>,
    /// Template parameters merged over defaults.
    pub params: TemplateParams,
    /// Adopt an existing container instead of creating a new one.
    pub existing: Option<String>,
}

impl ManagerOptions {
    /// Options for a new container with the given base name.
    pub fn with_base(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            ..Default::default()
        }
    }

    /// Options adopting an existing container.
    pub fn adopt(name: impl Into<String>) -> Self {
        Self {
            existing: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Manages one container: creation, readiness, and provisioning.
///
/// Construction creates and starts the container only when the process is
/// privileged; otherwise the handle stays unset and every operation that
/// needs a live container fails with [`ContainerError::NotCreated`].
pub struct ContainerManager {
    name: String,
    user: String,
    password: String,
    params: TemplateParams,
    backend: Arc<dyn ContainerBackend>,
    created: bool,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password)
            .field("params", &self.params)
            .field("backend", &"<dyn ContainerBackend>")
            .field("created", &self.created)
            .finish()
    }
}

impl ContainerManager {
    /// Construct a manager, creating the container when running as root.
    pub async fn new(
        backend: Arc<dyn ContainerBackend>,
        opts: ManagerOptions,
    ) -> ContainerResult<Self> {
        Self::with_privilege(backend, opts, geteuid().is_root()).await
    }

    /// Construct with an explicit privilege decision (tests, dry runs).
    pub async fn with_privilege(
        backend: Arc<dyn ContainerBackend>,
        opts: ManagerOptions,
        privileged: bool,
    ) -> ContainerResult<Self> {
        let user = resolve_user(opts.user)?;
        config::validate_username(&user)?;
        let password = opts.password.unwrap_or_else(|| user.clone());

        let mut params = opts.params;
        if params.user.is_empty() {
            params.user = user.clone();
        }
        params.validate()?;

        if let Some(existing) = opts.existing {
            config::validate_container_name(&existing)?;
            if !backend.exists(&existing).await? {
                return Err(ContainerError::NotFound(existing));
            }
            debug!("adopting existing container {existing}");
            return Ok(Self {
                name: existing,
                user,
                password,
                params,
                backend,
                created: true,
            });
        }

        config::validate_container_name(&opts.base_name)?;
        let name = config::unique_name(&opts.base_name);

        let mut manager = Self {
            name,
            user,
            password,
            params,
            backend,
            created: false,
        };

        if privileged {
            manager.create_and_start().await?;
        } else {
            warn!(
                "not running as root; container '{}' left uncreated",
                manager.name
            );
        }

        Ok(manager)
    }

    /// Container name (base plus random suffix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acting user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether a live container backs this manager.
    pub fn is_created(&self) -> bool {
        self.created
    }

    async fn create_and_start(&mut self) -> ContainerResult<()> {
        let mut params = self.params.clone();
        if !params.auth_key.is_empty() {
            params.auth_key = shellexpand::tilde(&params.auth_key).to_string();
        }
        let template_args = params.to_template_args(&self.password);

        info!(
            "creating container {} from template {}",
            self.name, self.params.template
        );
        self.backend
            .create(&self.name, &self.params.template, &template_args)
            .await?;
        self.backend.start(&self.name).await?;
        self.created = true;
        Ok(())
    }

    /// Block until the container is running and has a network address.
    ///
    /// Fixed-interval poll with an overall deadline; an unreachable
    /// container surfaces as [`ContainerError::Timeout`].
    pub async fn wait_ready(
        &self,
        interval: Duration,
        timeout: Duration,
    ) -> ContainerResult<IpAddr> {
        self.ensure_created()?;

        let start = tokio::time::Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let state = self.backend.state(&self.name).await?;
            if state.as_deref() == Some("RUNNING") {
                if let Some(address) = self.backend.address(&self.name).await? {
                    debug!(
                        "container {} ready at {address} after {attempts} attempt(s)",
                        self.name
                    );
                    return Ok(address);
                }
            }

            if start.elapsed() >= timeout {
                return Err(ContainerError::Timeout {
                    waited: start.elapsed(),
                    attempts,
                });
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Current state and address, for status reporting.
    pub async fn status(&self) -> ContainerResult<(Option<String>, Option<IpAddr>)> {
        self.ensure_created()?;
        let state = self.backend.state(&self.name).await?;
        let address = self.backend.address(&self.name).await?;
        Ok((state, address))
    }

    /// Execute an action inside the container, blocking until it completes.
    ///
    /// Returns the stdout of the action's final step.
    pub async fn run(
        &self,
        action: &ContainerAction,
        env: &[(String, String)],
    ) -> ContainerResult<String> {
        self.ensure_created()?;
        let env = with_default_path(env);

        info!("container {}: {}", self.name, action.describe());
        let mut stdout = String::new();
        for step in action.steps() {
            stdout = self
                .backend
                .attach(&self.name, &step.argv, &env, step.stdin.as_deref())
                .await?;
        }
        Ok(stdout)
    }

    /// Copy host public keys into the container.
    ///
    /// Every key file is read before the first write, so one unreadable
    /// path aborts the whole operation with nothing provisioned. Keys in
    /// the blacklist are skipped. The destination defaults to the acting
    /// user's `.ssh` directory; each key is written mode 600 and owned by
    /// the acting user.
    pub async fn ssh_key_add(
        &self,
        key_paths: &[PathBuf],
        blacklist: &[PathBuf],
        destination: Option<&str>,
    ) -> ContainerResult<()> {
        self.ensure_created()?;
        let destination = destination
            .map(str::to_string)
            .unwrap_or_else(|| format!("/home/{}/.ssh", self.user));

        let mut keys = Vec::new();
        for path in key_paths {
            if blacklist.contains(path) {
                debug!("skipping blacklisted key {}", path.display());
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    ContainerError::InvalidInput(format!(
                        "key path {} has no file name",
                        path.display()
                    ))
                })?;
            keys.push((file_name.to_string(), content));
        }

        if keys.is_empty() {
            return Ok(());
        }

        let owner = format!("{0}:{0}", self.user);
        self.run(
            &ContainerAction::RunCommand {
                argv: vec![
                    "/usr/bin/mkdir".to_string(),
                    "-p".to_string(),
                    destination.clone(),
                ],
            },
            &[],
        )
        .await?;
        self.run(
            &ContainerAction::RunCommand {
                argv: vec![
                    "/usr/bin/chown".to_string(),
                    owner.clone(),
                    destination.clone(),
                ],
            },
            &[],
        )
        .await?;

        for (file_name, content) in keys {
            self.run(
                &ContainerAction::WriteFile {
                    path: format!("{destination}/{file_name}"),
                    content,
                    mode: Some("600".to_string()),
                    owner: Some(owner.clone()),
                },
                &[],
            )
            .await?;
        }

        Ok(())
    }

    /// Grant passwordless sudo via a drop-in under `/etc/sudoers.d`.
    ///
    /// The target defaults to the acting user. The username is validated
    /// before anything reaches the sudoers directory.
    pub async fn sudo_nopasswd(&self, target_user: Option<&str>) -> ContainerResult<()> {
        self.ensure_created()?;
        let user = target_user.unwrap_or(&self.user);
        config::validate_username(user)?;

        let action = ContainerAction::WriteFile {
            path: format!("/etc/sudoers.d/{user}"),
            content: format!("{user} ALL=(ALL) NOPASSWD:ALL\n"),
            mode: Some("0440".to_string()),
            owner: None,
        };
        self.run(&action, &[]).await.map(|_| ())
    }

    fn ensure_created(&self) -> ContainerResult<()> {
        if self.created {
            Ok(())
        } else {
            Err(ContainerError::NotCreated)
        }
    }
}

fn with_default_path(env: &[(String, String)]) -> Vec<(String, String)> {
    let mut env = env.to_vec();
    if !env.iter().any(|(key, _)| key == "PATH") {
        env.push(("PATH".to_string(), ATTACH_PATH.to_string()));
    }
    env
}

fn resolve_user(explicit: Option<String>) -> ContainerResult<String> {
    if let Some(user) = explicit {
        return Ok(user);
    }
    for var in ["SUDO_USER", "USER", "LOGNAME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    Err(ContainerError::InvalidInput(
        "cannot determine acting user (set SUDO_USER or USER)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Attach {
        argv: Vec<String>,
        env: Vec<(String, String)>,
        stdin: Option<Vec<u8>>,
    }

    #[derive(Default)]
    struct RecordingBackend {
        lifecycle: Mutex<Vec<String>>,
        attaches: Mutex<Vec<Attach>>,
        addresses: Mutex<VecDeque<Option<IpAddr>>>,
        state: Mutex<Option<String>>,
        existing: Mutex<bool>,
    }

    impl RecordingBackend {
        fn running() -> Self {
            Self {
                state: Mutex::new(Some("RUNNING".to_string())),
                ..Default::default()
            }
        }

        fn script_addresses(&self, answers: Vec<Option<IpAddr>>) {
            *self.addresses.lock().unwrap() = answers.into();
        }

        fn attaches(&self) -> Vec<Attach> {
            self.attaches.lock().unwrap().clone()
        }

        fn lifecycle(&self) -> Vec<String> {
            self.lifecycle.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerBackend for RecordingBackend {
        async fn create(
            &self,
            name: &str,
            template: &str,
            _template_args: &[String],
        ) -> ContainerResult<()> {
            self.lifecycle
                .lock()
                .unwrap()
                .push(format!("create {name} {template}"));
            Ok(())
        }

        async fn start(&self, name: &str) -> ContainerResult<()> {
            self.lifecycle.lock().unwrap().push(format!("start {name}"));
            Ok(())
        }

        async fn state(&self, _name: &str) -> ContainerResult<Option<String>> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn address(&self, _name: &str) -> ContainerResult<Option<IpAddr>> {
            Ok(self.addresses.lock().unwrap().pop_front().unwrap_or(None))
        }

        async fn attach(
            &self,
            _name: &str,
            argv: &[String],
            env: &[(String, String)],
            stdin: Option<&[u8]>,
        ) -> ContainerResult<String> {
            self.attaches.lock().unwrap().push(Attach {
                argv: argv.to_vec(),
                env: env.to_vec(),
                stdin: stdin.map(<[u8]>::to_vec),
            });
            Ok(String::new())
        }

        async fn exists(&self, _name: &str) -> ContainerResult<bool> {
            Ok(*self.existing.lock().unwrap())
        }
    }

    fn opts() -> ManagerOptions {
        ManagerOptions {
            user: Some("bmoar".to_string()),
            ..ManagerOptions::with_base("testbox")
        }
    }

    async fn unprivileged(backend: &Arc<RecordingBackend>) -> ContainerManager {
        ContainerManager::with_privilege(backend.clone(), opts(), false)
            .await
            .unwrap()
    }

    async fn privileged(backend: &Arc<RecordingBackend>) -> ContainerManager {
        ContainerManager::with_privilege(backend.clone(), opts(), true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unprivileged_construction_leaves_container_unset() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = unprivileged(&backend).await;

        assert!(!manager.is_created());
        assert!(backend.lifecycle().is_empty());

        let err = manager
            .run(
                &ContainerAction::RunCommand {
                    argv: vec!["/usr/bin/id".to_string()],
                },
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotCreated));

        let err = manager.sudo_nopasswd(None).await.unwrap_err();
        assert!(matches!(err, ContainerError::NotCreated));
    }

    #[tokio::test]
    async fn privileged_construction_creates_and_starts() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;

        assert!(manager.is_created());
        assert!(manager.name().starts_with("testbox-"));
        let lifecycle = backend.lifecycle();
        assert_eq!(lifecycle.len(), 2);
        assert!(lifecycle[0].starts_with("create testbox-"));
        assert!(lifecycle[0].ends_with(" ubuntu"));
        assert!(lifecycle[1].starts_with("start testbox-"));
    }

    #[tokio::test]
    async fn constructions_with_same_base_get_distinct_names() {
        let backend = Arc::new(RecordingBackend::default());
        let first = unprivileged(&backend).await;
        let second = unprivileged(&backend).await;
        assert_ne!(first.name(), second.name());
    }

    #[tokio::test]
    async fn password_defaults_to_username() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = unprivileged(&backend).await;
        assert_eq!(manager.password, "bmoar");
        assert_eq!(manager.params.user, "bmoar");
    }

    #[tokio::test]
    async fn adopting_missing_container_fails() {
        let backend = Arc::new(RecordingBackend::default());
        let err = ContainerManager::with_privilege(
            backend,
            ManagerOptions {
                user: Some("bmoar".to_string()),
                ..ManagerOptions::adopt("gone")
            },
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(name) if name == "gone"));
    }

    #[tokio::test]
    async fn adopting_existing_container_skips_creation() {
        let backend = Arc::new(RecordingBackend::default());
        *backend.existing.lock().unwrap() = true;

        let manager = ContainerManager::with_privilege(
            backend.clone(),
            ManagerOptions {
                user: Some("bmoar".to_string()),
                ..ManagerOptions::adopt("testbox-cafe0123")
            },
            false,
        )
        .await
        .unwrap();

        assert!(manager.is_created());
        assert_eq!(manager.name(), "testbox-cafe0123");
        assert!(backend.lifecycle().is_empty());
    }

    #[tokio::test]
    async fn run_injects_default_path() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;
        manager
            .run(
                &ContainerAction::RunCommand {
                    argv: vec!["/usr/bin/id".to_string()],
                },
                &[],
            )
            .await
            .unwrap();

        let attaches = backend.attaches();
        assert_eq!(attaches.len(), 1);
        assert!(attaches[0]
            .env
            .iter()
            .any(|(key, value)| key == "PATH" && value == ATTACH_PATH));
    }

    #[tokio::test]
    async fn ssh_key_add_with_empty_list_performs_no_writes() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;
        manager.ssh_key_add(&[], &[], None).await.unwrap();
        assert!(backend.attaches().is_empty());
    }

    #[tokio::test]
    async fn ssh_key_add_skips_blacklisted_keys() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;
        let key = PathBuf::from("/nonexistent/id_rsa.pub");
        // Blacklisted before it would be read, so the missing file is fine.
        manager
            .ssh_key_add(&[key.clone()], &[key], None)
            .await
            .unwrap();
        assert!(backend.attaches().is_empty());
    }

    #[tokio::test]
    async fn ssh_key_add_aborts_on_unreadable_key() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;

        let tmp = tempfile::TempDir::new().unwrap();
        let good = tmp.path().join("id_ed25519.pub");
        std::fs::write(&good, "ssh-ed25519 AAAA\n").unwrap();
        let missing = tmp.path().join("absent.pub");

        let err = manager
            .ssh_key_add(&[good, missing], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Io(_)));
        // Nothing was written: all keys are read before the first write.
        assert!(backend.attaches().is_empty());
    }

    #[tokio::test]
    async fn ssh_key_add_writes_each_key_into_user_ssh_dir() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;

        let tmp = tempfile::TempDir::new().unwrap();
        let key = tmp.path().join("id_rsa.pub");
        std::fs::write(&key, "ssh-rsa AAAA bmoar@host\n").unwrap();

        manager.ssh_key_add(&[key], &[], None).await.unwrap();

        let attaches = backend.attaches();
        // mkdir -p, chown of the dir, then tee + chmod + chown per key.
        assert_eq!(attaches.len(), 5);
        assert_eq!(
            attaches[0].argv,
            vec!["/usr/bin/mkdir", "-p", "/home/bmoar/.ssh"]
        );
        assert_eq!(
            attaches[2].argv,
            vec!["/usr/bin/tee", "/home/bmoar/.ssh/id_rsa.pub"]
        );
        assert_eq!(
            attaches[2].stdin.as_deref(),
            Some("ssh-rsa AAAA bmoar@host\n".as_bytes())
        );
        assert_eq!(
            attaches[3].argv,
            vec!["/usr/bin/chmod", "600", "/home/bmoar/.ssh/id_rsa.pub"]
        );
        assert_eq!(
            attaches[4].argv,
            vec![
                "/usr/bin/chown",
                "bmoar:bmoar",
                "/home/bmoar/.ssh/id_rsa.pub"
            ]
        );
    }

    #[tokio::test]
    async fn sudo_nopasswd_defaults_to_acting_user() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;
        manager.sudo_nopasswd(None).await.unwrap();

        let attaches = backend.attaches();
        assert_eq!(attaches.len(), 2);
        assert_eq!(attaches[0].argv, vec!["/usr/bin/tee", "/etc/sudoers.d/bmoar"]);
        assert_eq!(
            attaches[0].stdin.as_deref(),
            Some("bmoar ALL=(ALL) NOPASSWD:ALL\n".as_bytes())
        );
        assert_eq!(
            attaches[1].argv,
            vec!["/usr/bin/chmod", "0440", "/etc/sudoers.d/bmoar"]
        );
    }

    #[tokio::test]
    async fn sudo_nopasswd_rejects_hostile_usernames() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = privileged(&backend).await;
        let err = manager
            .sudo_nopasswd(Some("evil\nALL=(ALL) NOPASSWD:ALL"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::InvalidInput(_)));
        assert!(backend.attaches().is_empty());
    }

    #[tokio::test]
    async fn wait_ready_polls_until_address_appears() {
        let backend = Arc::new(RecordingBackend::running());
        let manager = privileged(&backend).await;
        let ip: IpAddr = "10.0.3.17".parse().unwrap();
        backend.script_addresses(vec![None, None, Some(ip)]);

        let ready = manager
            .wait_ready(Duration::from_millis(1), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ready, ip);
    }

    #[tokio::test]
    async fn wait_ready_times_out_without_address() {
        let backend = Arc::new(RecordingBackend::running());
        let manager = privileged(&backend).await;

        let err = manager
            .wait_ready(Duration::from_millis(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Timeout { attempts, .. } if attempts > 0));
    }
}

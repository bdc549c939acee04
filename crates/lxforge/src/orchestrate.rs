//! End-to-end bring-up: container, readiness, provisioning, venv cycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::container::{ContainerAction, ContainerBackend, ContainerManager, ManagerOptions};
use crate::settings::AppConfig;

/// Options for the `up` sequence.
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Base container name.
    pub base_name: String,
    /// Acting user override.
    pub user: Option<String>,
    /// Name of the virtual environment driven inside the container.
    pub venv_name: String,
    /// Packages installed into the environment after creation.
    pub install: Vec<String>,
    /// Host public keys to inject; defaults to `~/.ssh/id_rsa.pub`.
    pub ssh_keys: Vec<PathBuf>,
}

/// Bring up a container and drive the virtualenv workflow inside it.
///
/// Sequence: construct (creates the container when privileged), wait for
/// a network address, inject SSH keys, grant passwordless sudo, then run
/// the environment through a destroy/create/freeze/install cycle.
pub async fn up(
    backend: Arc<dyn ContainerBackend>,
    config: &AppConfig,
    opts: UpOptions,
) -> Result<()> {
    let manager = ContainerManager::new(
        backend,
        ManagerOptions {
            base_name: opts.base_name,
            user: opts.user,
            password: None,
            params: config.container.template_params(),
            existing: None,
        },
    )
    .await
    .context("constructing container manager")?;

    if !manager.is_created() {
        anyhow::bail!("creating containers requires root; re-run with sudo");
    }

    let address = manager
        .wait_ready(
            config.container.poll_interval(),
            config.container.poll_timeout(),
        )
        .await
        .context("waiting for container network address")?;
    info!("container {} ready at {address}", manager.name());

    let keys = if opts.ssh_keys.is_empty() {
        default_ssh_keys()
    } else {
        opts.ssh_keys.clone()
    };
    manager
        .ssh_key_add(&keys, &[], None)
        .await
        .context("injecting ssh keys")?;
    manager
        .sudo_nopasswd(None)
        .await
        .context("granting passwordless sudo")?;

    run_venv_cycle(&manager, &opts.venv_name, &opts.install).await?;

    println!("{} ready at {address}", manager.name());
    Ok(())
}

fn default_ssh_keys() -> Vec<PathBuf> {
    let path = PathBuf::from(shellexpand::tilde("~/.ssh/id_rsa.pub").to_string());
    if path.exists() {
        vec![path]
    } else {
        vec![]
    }
}

/// Drive the environment through destroy, create, freeze, install, freeze.
async fn run_venv_cycle(
    manager: &ContainerManager,
    venv_name: &str,
    packages: &[String],
) -> Result<()> {
    let user = manager.user();
    let venv_path = format!("/home/{user}/.virtualenvs/{venv_name}");
    let pip = format!("{venv_path}/bin/pip");
    let env = vec![("VIRTUAL_ENV".to_string(), venv_path.clone())];

    for action in venv_cycle_actions(user, &venv_path, packages) {
        let stdout = manager
            .run(&action, &env)
            .await
            .with_context(|| format!("venv {venv_name}: {}", action.describe()))?;
        if is_freeze(&action, &pip) && !stdout.trim().is_empty() {
            println!("{}", stdout.trim_end());
        }
    }
    Ok(())
}

fn is_freeze(action: &ContainerAction, pip: &str) -> bool {
    matches!(
        action,
        ContainerAction::RunCommand { argv }
            if argv.first().map(String::as_str) == Some(pip)
                && argv.get(1).map(String::as_str) == Some("freeze")
    )
}

fn venv_cycle_actions(user: &str, venv_path: &str, packages: &[String]) -> Vec<ContainerAction> {
    let pip = format!("{venv_path}/bin/pip");
    let run = |argv: Vec<String>| ContainerAction::RunCommand { argv };

    let mut actions = vec![
        run(vec![
            "/usr/bin/rm".to_string(),
            "-rf".to_string(),
            venv_path.to_string(),
        ]),
        run(vec![
            "/usr/bin/python3".to_string(),
            "-m".to_string(),
            "venv".to_string(),
            venv_path.to_string(),
        ]),
        run(vec![
            "/usr/bin/chown".to_string(),
            "-R".to_string(),
            format!("{user}:{user}"),
            venv_path.to_string(),
        ]),
        run(vec![pip.clone(), "freeze".to_string()]),
    ];

    if !packages.is_empty() {
        let mut install = vec![pip.clone(), "install".to_string()];
        install.extend(packages.iter().cloned());
        actions.push(run(install));
        actions.push(run(vec![pip, "freeze".to_string()]));
    }

    actions
}

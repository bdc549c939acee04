//! Command descriptions dispatched across the host/container boundary.
//!
//! Work to be done inside a container is described by a closed set of
//! variants rather than opaque callables, so the host side can log,
//! serialize, and lower each one to plain argv vectors for `lxc-attach`.

use serde::{Deserialize, Serialize};

/// A single unit of work to execute inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerAction {
    /// Run an arbitrary argv.
    RunCommand { argv: Vec<String> },
    /// Install packages with the container's package manager.
    InstallPackages { packages: Vec<String> },
    /// Write content to a path, optionally fixing mode and owner.
    WriteFile {
        path: String,
        content: String,
        mode: Option<String>,
        owner: Option<String>,
    },
}

/// One attach invocation: an argv plus optional bytes fed to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachStep {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl AttachStep {
    fn argv(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            stdin: None,
        }
    }
}

impl ContainerAction {
    /// Lower the action to the attach invocations that realize it.
    ///
    /// File content travels via stdin into `tee`; no byte of caller data
    /// is ever interpreted by a shell.
    pub fn steps(&self) -> Vec<AttachStep> {
        match self {
            ContainerAction::RunCommand { argv } => vec![AttachStep {
                argv: argv.clone(),
                stdin: None,
            }],
            ContainerAction::InstallPackages { packages } => {
                let mut install = vec![
                    "/usr/bin/apt-get".to_string(),
                    "install".to_string(),
                    "-y".to_string(),
                ];
                install.extend(packages.iter().cloned());
                vec![
                    AttachStep::argv(&["/usr/bin/apt-get", "update"]),
                    AttachStep {
                        argv: install,
                        stdin: None,
                    },
                ]
            }
            ContainerAction::WriteFile {
                path,
                content,
                mode,
                owner,
            } => {
                let mut steps = vec![AttachStep {
                    argv: vec!["/usr/bin/tee".to_string(), path.clone()],
                    stdin: Some(content.clone().into_bytes()),
                }];
                if let Some(mode) = mode {
                    steps.push(AttachStep::argv(&["/usr/bin/chmod", mode, path]));
                }
                if let Some(owner) = owner {
                    steps.push(AttachStep::argv(&["/usr/bin/chown", owner, path]));
                }
                steps
            }
        }
    }

    /// Short label for logging.
    pub fn describe(&self) -> String {
        match self {
            ContainerAction::RunCommand { argv } => {
                format!("run {}", argv.first().map(String::as_str).unwrap_or("<empty>"))
            }
            ContainerAction::InstallPackages { packages } => {
                format!("install {} package(s)", packages.len())
            }
            ContainerAction::WriteFile { path, .. } => format!("write {path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_is_a_single_step() {
        let action = ContainerAction::RunCommand {
            argv: vec!["/usr/bin/id".to_string(), "-u".to_string()],
        };
        let steps = action.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].argv, vec!["/usr/bin/id", "-u"]);
        assert!(steps[0].stdin.is_none());
    }

    #[test]
    fn install_packages_updates_then_installs() {
        let action = ContainerAction::InstallPackages {
            packages: vec!["git".to_string(), "curl".to_string()],
        };
        let steps = action.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].argv, vec!["/usr/bin/apt-get", "update"]);
        assert_eq!(
            steps[1].argv,
            vec!["/usr/bin/apt-get", "install", "-y", "git", "curl"]
        );
    }

    #[test]
    fn write_file_pipes_content_and_fixes_metadata() {
        let action = ContainerAction::WriteFile {
            path: "/etc/sudoers.d/bmoar".to_string(),
            content: "bmoar ALL=(ALL) NOPASSWD:ALL\n".to_string(),
            mode: Some("0440".to_string()),
            owner: None,
        };
        let steps = action.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].argv, vec!["/usr/bin/tee", "/etc/sudoers.d/bmoar"]);
        assert_eq!(
            steps[0].stdin.as_deref(),
            Some("bmoar ALL=(ALL) NOPASSWD:ALL\n".as_bytes())
        );
        assert_eq!(
            steps[1].argv,
            vec!["/usr/bin/chmod", "0440", "/etc/sudoers.d/bmoar"]
        );
    }

    #[test]
    fn write_file_with_owner_appends_chown() {
        let action = ContainerAction::WriteFile {
            path: "/home/bmoar/.ssh/id_rsa.pub".to_string(),
            content: "ssh-rsa AAAA\n".to_string(),
            mode: Some("600".to_string()),
            owner: Some("bmoar:bmoar".to_string()),
        };
        let steps = action.steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[2].argv,
            vec!["/usr/bin/chown", "bmoar:bmoar", "/home/bmoar/.ssh/id_rsa.pub"]
        );
    }

    #[test]
    fn actions_serialize_with_kind_tag() {
        let action = ContainerAction::InstallPackages {
            packages: vec!["flask".to_string()],
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "install_packages");
        assert_eq!(json["packages"][0], "flask");
    }
}

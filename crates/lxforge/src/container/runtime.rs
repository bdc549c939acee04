//! LXC userspace tool wrapper.
//!
//! Every operation shells out to the LXC tools with an argument vector —
//! no shell parsing anywhere. Container isolation itself is the tools'
//! job; this module only drives them and interprets their output.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::error::{ContainerError, ContainerResult};

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create a container from a template.
    async fn create(
        &self,
        name: &str,
        template: &str,
        template_args: &[String],
    ) -> ContainerResult<()>;

    /// Start a created container in the background.
    async fn start(&self, name: &str) -> ContainerResult<()>;

    /// Current state string (e.g. "RUNNING"), or `None` if unknown.
    async fn state(&self, name: &str) -> ContainerResult<Option<String>>;

    /// First network address, or `None` while the container has none.
    async fn address(&self, name: &str) -> ContainerResult<Option<IpAddr>>;

    /// Execute an argv inside the container and return its stdout.
    ///
    /// Blocks until the nested execution completes. `stdin` bytes, when
    /// given, are fed to the child before waiting.
    async fn attach(
        &self,
        name: &str,
        argv: &[String],
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<String>;

    /// Whether a container with this name exists.
    async fn exists(&self, name: &str) -> ContainerResult<bool>;
}

/// Driver for the classic LXC userspace tools
/// (`lxc-create`, `lxc-start`, `lxc-info`, `lxc-attach`).
#[derive(Debug, Clone, Default)]
pub struct LxcRuntime {
    /// Directory holding the tools; bare names resolved via PATH if unset.
    bin_dir: Option<PathBuf>,
}

impl LxcRuntime {
    /// Create a runtime resolving tools via PATH.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runtime with an explicit tool directory.
    pub fn with_bin_dir(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: Some(bin_dir.into()),
        }
    }

    /// Check that the LXC tools are installed and report their version.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = Command::new(self.tool("lxc-create"))
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|_| ContainerError::NoRuntimeAvailable)?;

        if !output.status.success() {
            return Err(ContainerError::NoRuntimeAvailable);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn tool(&self, name: &str) -> String {
        match &self.bin_dir {
            Some(dir) => dir.join(name).display().to_string(),
            None => name.to_string(),
        }
    }

    async fn run_tool(
        &self,
        tool: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<Output> {
        debug!("{tool} {args:?}");

        let mut cmd = Command::new(self.tool(tool));
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ContainerError::CommandFailed {
            command: tool.to_string(),
            message: e.to_string(),
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes).await?;
                // Dropping the pipe closes the child's stdin.
            }
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: tool.to_string(),
                message: e.to_string(),
            })
    }

    async fn run_tool_checked(
        &self,
        tool: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<Output> {
        let output = self.run_tool(tool, args, stdin).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                "{tool} failed (exit {}): {}",
                output
                    .status
                    .code()
                    .map_or("signal".to_string(), |c| c.to_string()),
                stderr.trim()
            );
            return Err(ContainerError::CommandFailed {
                command: tool.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerBackend for LxcRuntime {
    async fn create(
        &self,
        name: &str,
        template: &str,
        template_args: &[String],
    ) -> ContainerResult<()> {
        let args = create_args(name, template, template_args);
        self.run_tool_checked("lxc-create", &args, None).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        let args = vec!["-n".to_string(), name.to_string(), "-d".to_string()];
        self.run_tool_checked("lxc-start", &args, None).await?;
        Ok(())
    }

    async fn state(&self, name: &str) -> ContainerResult<Option<String>> {
        let args = vec!["-n".to_string(), name.to_string(), "-sH".to_string()];
        let output = self.run_tool("lxc-info", &args, None).await?;
        if !output.status.success() {
            // Missing container is not an error; callers treat it as absent.
            return Ok(None);
        }

        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if state.is_empty() {
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn address(&self, name: &str) -> ContainerResult<Option<IpAddr>> {
        let args = vec!["-n".to_string(), name.to_string(), "-iH".to_string()];
        let output = self.run_tool("lxc-info", &args, None).await?;
        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(first) = stdout.lines().next().map(str::trim).filter(|l| !l.is_empty())
        else {
            return Ok(None);
        };

        first
            .parse::<IpAddr>()
            .map(Some)
            .map_err(|e| ContainerError::ParseError(format!("address '{first}': {e}")))
    }

    async fn attach(
        &self,
        name: &str,
        argv: &[String],
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<String> {
        if argv.is_empty() {
            return Err(ContainerError::InvalidInput(
                "attach argv cannot be empty".to_string(),
            ));
        }

        let args = attach_args(name, env, argv);
        let output = self.run_tool_checked("lxc-attach", &args, stdin).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn exists(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.state(name).await?.is_some())
    }
}

fn create_args(name: &str, template: &str, template_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "-n".to_string(),
        name.to_string(),
        "-t".to_string(),
        template.to_string(),
        "--".to_string(),
    ];
    args.extend(template_args.iter().cloned());
    args
}

fn attach_args(name: &str, env: &[(String, String)], argv: &[String]) -> Vec<String> {
    let mut args = vec![
        "-n".to_string(),
        name.to_string(),
        "--clear-env".to_string(),
    ];
    for (key, value) in env {
        args.push("--set-var".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("--".to_string());
    args.extend(argv.iter().cloned());
    args
}

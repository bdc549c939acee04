//! Per-user Python virtual environment lifecycle.
//!
//! A [`VirtualEnv`] owns a directory under the user's `~/.virtualenvs` and
//! knows how to bootstrap it, destroy it, and execute commands inside it.
//! Activation is expressed as a scoped child environment; the calling
//! process is never mutated.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use log::{debug, info};
use rustix::process::geteuid;
use thiserror::Error;

/// Interpreter used for the default bootstrap command.
pub const DEFAULT_PYTHON: &str = "/usr/bin/python3";

/// Directory component that marks a path as managed by this crate.
const MANAGED_DIR: &str = ".virtualenvs";

/// Result type for virtual environment operations.
pub type VenvResult<T> = Result<T, VenvError>;

/// Errors that can occur during virtual environment operations.
#[derive(Debug, Error)]
pub enum VenvError {
    /// An external command exited nonzero.
    #[error("venv {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The owning user's home directory could not be resolved.
    #[error("cannot resolve home directory for user '{0}'")]
    UnknownUser(String),

    /// Refused to remove a path that is not a managed virtualenv directory.
    #[error("refusing to remove {}: not under a {MANAGED_DIR} directory", path.display())]
    UnsafePath { path: PathBuf },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`VirtualEnv::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// The directory was created and the bootstrap command ran.
    Fresh,
    /// The path already existed; nothing was run.
    AlreadyExists,
}

/// A directory-backed Python virtual environment owned by a single user.
///
/// The path is unique per (name, user) pair. Operations are not safe to
/// call concurrently for the same path; a single orchestrating process is
/// assumed.
#[derive(Debug, Clone)]
pub struct VirtualEnv {
    name: String,
    user: String,
    path: PathBuf,
    init_cmd: Vec<String>,
}

impl VirtualEnv {
    /// Create a handle with the default path layout.
    ///
    /// When running as root the environment lives under the owning user's
    /// home directory (resolved via `getent passwd`), otherwise under the
    /// invoking user's `$HOME`.
    pub fn new(name: impl Into<String>, user: impl Into<String>) -> VenvResult<Self> {
        let name = name.into();
        let user = user.into();
        let path = default_path(&name, &user)?;
        Ok(Self::with_path(name, user, path))
    }

    /// Create a handle with an explicit environment path.
    pub fn with_path(
        name: impl Into<String>,
        user: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        let path = path.into();
        let init_cmd = default_init_cmd(DEFAULT_PYTHON, &path);
        Self {
            name: name.into(),
            user: user.into(),
            path,
            init_cmd,
        }
    }

    /// Override the bootstrap command (argv vector, run as-is).
    pub fn init_cmd(mut self, argv: Vec<String>) -> Self {
        self.init_cmd = argv;
        self
    }

    /// Environment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Filesystem path of the environment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the environment if its path does not exist.
    ///
    /// Creates the directory tree with mode 0755, assigns ownership to the
    /// configured user (only meaningful when running as root), then runs
    /// the bootstrap command. Returns [`Created::AlreadyExists`] without
    /// running anything when the path is already present.
    pub fn create(&self) -> VenvResult<Created> {
        if self.path.exists() {
            debug!("venv {} already exists at {}", self.name, self.path.display());
            return Ok(Created::AlreadyExists);
        }

        fs::create_dir_all(&self.path)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o755))?;

        if geteuid().is_root() {
            self.chown_to_owner()?;
        }

        info!("bootstrapping venv {} at {}", self.name, self.path.display());
        self.run_init()?;
        Ok(Created::Fresh)
    }

    /// Remove the environment directory recursively.
    ///
    /// A missing path is a success. Paths whose final components are not
    /// `.virtualenvs/<name>` are refused with [`VenvError::UnsafePath`];
    /// unscoped recursive deletion is an operator job, not ours.
    pub fn destroy(&self) -> VenvResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if !is_managed_path(&self.path, &self.name) {
            return Err(VenvError::UnsafePath {
                path: self.path.clone(),
            });
        }
        info!("removing venv {} at {}", self.name, self.path.display());
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    /// Run an argv with the environment activated for the child only.
    ///
    /// Sets `VIRTUAL_ENV`, prepends `<path>/bin` to `PATH`, and drops
    /// `PYTHONHOME`. Returns the captured output; a nonzero exit is an
    /// error carrying the command's stderr.
    pub fn run(&self, program: &str, args: &[String]) -> VenvResult<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in self.scoped_env() {
            cmd.env(key, value);
        }
        cmd.env_remove("PYTHONHOME");

        debug!("venv {}: running {} {:?}", self.name, program, args);
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(VenvError::CommandFailed {
                command: program.to_string(),
                message: stderr_excerpt(&output),
            });
        }
        Ok(output)
    }

    /// Install packages with the environment's own pip.
    ///
    /// An empty package set is a no-op.
    pub fn install(&self, packages: &[String]) -> VenvResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let pip = self.path.join("bin").join("pip");
        let mut args = vec!["install".to_string()];
        args.extend(packages.iter().cloned());
        self.run(&pip.to_string_lossy(), &args).map(|_| ())
    }

    /// Environment overrides equivalent to sourcing the activate script.
    pub fn scoped_env(&self) -> Vec<(String, String)> {
        self.scoped_env_with(std::env::var("PATH").ok().as_deref())
    }

    fn scoped_env_with(&self, current_path: Option<&str>) -> Vec<(String, String)> {
        let bin = self.path.join("bin");
        let path_value = match current_path {
            Some(existing) if !existing.is_empty() => {
                format!("{}:{existing}", bin.display())
            }
            _ => bin.display().to_string(),
        };
        vec![
            ("VIRTUAL_ENV".to_string(), self.path.display().to_string()),
            ("PATH".to_string(), path_value),
        ]
    }

    fn run_init(&self) -> VenvResult<()> {
        let Some((program, args)) = self.init_cmd.split_first() else {
            return Ok(());
        };
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(VenvError::CommandFailed {
                command: program.clone(),
                message: stderr_excerpt(&output),
            });
        }
        Ok(())
    }

    fn chown_to_owner(&self) -> VenvResult<()> {
        let owner = format!("{0}:{0}", self.user);
        let output = Command::new("/usr/bin/chown")
            .arg(&owner)
            .arg(&self.path)
            .output()?;
        if !output.status.success() {
            return Err(VenvError::CommandFailed {
                command: "chown".to_string(),
                message: stderr_excerpt(&output),
            });
        }
        Ok(())
    }
}

/// Default bootstrap command: the system interpreter's venv module.
pub fn default_init_cmd(python: &str, path: &Path) -> Vec<String> {
    vec![
        python.to_string(),
        "-m".to_string(),
        "venv".to_string(),
        path.display().to_string(),
    ]
}

fn default_path(name: &str, user: &str) -> VenvResult<PathBuf> {
    let home = if geteuid().is_root() {
        lookup_home(user)?
    } else {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| VenvError::UnknownUser(user.to_string()))?
    };
    Ok(home.join(MANAGED_DIR).join(name))
}

/// Resolve a user's home directory from the passwd database.
fn lookup_home(user: &str) -> VenvResult<PathBuf> {
    let output = Command::new("getent").args(["passwd", user]).output()?;
    if !output.status.success() {
        return Err(VenvError::UnknownUser(user.to_string()));
    }

    let line = String::from_utf8_lossy(&output.stdout);
    // passwd format: name:password:uid:gid:gecos:home:shell
    line.trim()
        .split(':')
        .nth(5)
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| VenvError::UnknownUser(user.to_string()))
}

fn is_managed_path(path: &Path, name: &str) -> bool {
    let mut components = path.components().rev();
    let leaf_matches = components
        .next()
        .is_some_and(|c| c.as_os_str() == OsStr::new(name));
    let parent_matches = components
        .next()
        .is_some_and(|c| c.as_os_str() == OsStr::new(MANAGED_DIR));
    leaf_matches && parent_matches
}

fn stderr_excerpt(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

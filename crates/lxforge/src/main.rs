use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{info, LevelFilter};
use serde::Serialize;

use lxforge::container::{
    ContainerAction, ContainerBackend, ContainerManager, LxcRuntime, ManagerOptions,
};
use lxforge::orchestrate::{self, UpOptions};
use lxforge::settings::AppConfig;
use lxforge_venv::{default_init_cmd, Created, VirtualEnv};

const APP_NAME: &str = "lxforge";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_up(ctx: RuntimeContext, cmd: UpCommand) -> Result<()> {
    handle_up(&ctx, cmd).await
}

#[tokio::main]
async fn async_container(ctx: RuntimeContext, cmd: ContainerCommand) -> Result<()> {
    handle_container(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;

    match cli.command {
        Command::Up(cmd) => async_up(ctx, cmd),
        Command::Venv { command } => handle_venv(&ctx, command),
        Command::Container { command } => async_container(ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "lxforge - provision LXC containers with per-user Python virtualenvs.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring up a container and run the virtualenv workflow inside it
    Up(UpCommand),
    /// Manage host-side virtual environments
    Venv {
        #[command(subcommand)]
        command: VenvCommand,
    },
    /// Manage containers
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct UpCommand {
    /// Base container name (random suffix appended)
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
    /// Acting user (defaults to $SUDO_USER, then the current user)
    #[arg(long)]
    user: Option<String>,
    /// Virtual environment driven inside the container
    #[arg(long, default_value = "test")]
    venv: String,
    /// Package installed into the environment (repeatable)
    #[arg(long = "install", value_name = "PACKAGE")]
    install: Vec<String>,
    /// Host public key to inject (repeatable; default ~/.ssh/id_rsa.pub)
    #[arg(long = "key", value_name = "PATH")]
    keys: Vec<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct VenvTarget {
    /// Environment name
    name: String,
    /// Owning user (defaults to $SUDO_USER, then the current user)
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Subcommand)]
enum VenvCommand {
    /// Create the environment if it does not exist
    Create(VenvTarget),
    /// Remove the environment directory
    Destroy(VenvTarget),
    /// Run a command with the environment activated
    Run {
        #[command(flatten)]
        target: VenvTarget,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Install packages with the environment's pip
    Install {
        #[command(flatten)]
        target: VenvTarget,
        #[arg(required = true)]
        packages: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ContainerCommand {
    /// Create and start a container, waiting for its network address
    Create {
        /// Base container name (random suffix appended)
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
        /// Acting user
        #[arg(long)]
        user: Option<String>,
    },
    /// Report state and address of a container
    Status {
        /// Container name
        name: String,
    },
    /// Execute a command inside a container
    Exec {
        /// Container name
        name: String,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Copy host public keys into a container
    AddKeys {
        /// Container name
        name: String,
        /// Key file to inject (repeatable)
        #[arg(long = "key", value_name = "PATH", required = true)]
        keys: Vec<PathBuf>,
        /// Key file to skip (repeatable)
        #[arg(long = "skip", value_name = "PATH")]
        blacklist: Vec<PathBuf>,
        /// Destination directory inside the container
        #[arg(long)]
        dest: Option<String>,
        /// Acting user
        #[arg(long)]
        user: Option<String>,
    },
    /// Grant passwordless sudo inside a container
    GrantSudo {
        /// Container name
        name: String,
        /// Target user (defaults to the acting user)
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn runtime(&self) -> LxcRuntime {
        match &self.config.container.bin_dir {
            Some(dir) => LxcRuntime::with_bin_dir(dir),
            None => LxcRuntime::new(),
        }
    }

    fn backend(&self) -> Arc<dyn ContainerBackend> {
        Arc::new(self.runtime())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

async fn handle_up(ctx: &RuntimeContext, cmd: UpCommand) -> Result<()> {
    let base_name = cmd
        .name
        .unwrap_or_else(|| ctx.config.container.base_name.clone());

    if ctx.common.dry_run {
        info!("dry-run: would bring up container '{base_name}'");
        return Ok(());
    }

    let runtime = ctx.runtime();
    let version = runtime
        .health_check()
        .await
        .context("checking for the lxc userspace tools")?;
    info!("using {version}");

    orchestrate::up(
        Arc::new(runtime),
        &ctx.config,
        UpOptions {
            base_name,
            user: cmd.user,
            venv_name: cmd.venv,
            install: cmd.install,
            ssh_keys: cmd.keys,
        },
    )
    .await
}

async fn handle_container(ctx: &RuntimeContext, command: ContainerCommand) -> Result<()> {
    match command {
        ContainerCommand::Create { name, user } => {
            let base_name = name.unwrap_or_else(|| ctx.config.container.base_name.clone());
            if ctx.common.dry_run {
                info!("dry-run: would create container '{base_name}'");
                return Ok(());
            }

            let runtime = ctx.runtime();
            runtime
                .health_check()
                .await
                .context("checking for the lxc userspace tools")?;

            let manager = ContainerManager::new(
                Arc::new(runtime),
                ManagerOptions {
                    base_name,
                    user,
                    password: None,
                    params: ctx.config.container.template_params(),
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
                    ctx.config.container.poll_interval(),
                    ctx.config.container.poll_timeout(),
                )
                .await
                .context("waiting for container network address")?;

            print_report(
                ctx,
                &StatusReport {
                    name: manager.name().to_string(),
                    state: Some("RUNNING".to_string()),
                    address: Some(address),
                },
            )
        }
        ContainerCommand::Status { name } => {
            let manager = adopt(ctx, name, None).await?;
            let (state, address) = manager.status().await?;
            print_report(
                ctx,
                &StatusReport {
                    name: manager.name().to_string(),
                    state,
                    address,
                },
            )
        }
        ContainerCommand::Exec { name, argv } => {
            let manager = adopt(ctx, name, None).await?;
            let stdout = manager
                .run(&ContainerAction::RunCommand { argv }, &[])
                .await?;
            print!("{stdout}");
            Ok(())
        }
        ContainerCommand::AddKeys {
            name,
            keys,
            blacklist,
            dest,
            user,
        } => {
            if ctx.common.dry_run {
                info!("dry-run: would inject {} key(s) into '{name}'", keys.len());
                return Ok(());
            }
            let manager = adopt(ctx, name, user).await?;
            manager
                .ssh_key_add(&keys, &blacklist, dest.as_deref())
                .await?;
            info!("injected keys into {}", manager.name());
            Ok(())
        }
        ContainerCommand::GrantSudo { name, user } => {
            if ctx.common.dry_run {
                info!("dry-run: would grant passwordless sudo in '{name}'");
                return Ok(());
            }
            let manager = adopt(ctx, name, None).await?;
            manager.sudo_nopasswd(user.as_deref()).await?;
            info!("granted passwordless sudo in {}", manager.name());
            Ok(())
        }
    }
}

async fn adopt(
    ctx: &RuntimeContext,
    name: String,
    user: Option<String>,
) -> Result<ContainerManager> {
    ContainerManager::new(
        ctx.backend(),
        ManagerOptions {
            user,
            params: ctx.config.container.template_params(),
            ..ManagerOptions::adopt(name)
        },
    )
    .await
    .context("adopting container")
}

#[derive(Debug, Serialize)]
struct StatusReport {
    name: String,
    state: Option<String>,
    address: Option<IpAddr>,
}

fn print_report(ctx: &RuntimeContext, report: &StatusReport) -> Result<()> {
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serializing status to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(report).context("serializing status to YAML")?
        );
    } else {
        let state = report.state.as_deref().unwrap_or("UNKNOWN");
        match report.address {
            Some(address) => println!("{} {state} {address}", report.name),
            None => println!("{} {state} -", report.name),
        }
    }
    Ok(())
}

fn handle_venv(ctx: &RuntimeContext, command: VenvCommand) -> Result<()> {
    match command {
        VenvCommand::Create(target) => {
            let venv = build_venv(ctx, &target)?;
            if ctx.common.dry_run {
                info!("dry-run: would create venv at {}", venv.path().display());
                return Ok(());
            }
            match venv.create()? {
                Created::Fresh => println!("created {}", venv.path().display()),
                Created::AlreadyExists => {
                    println!("already exists {}", venv.path().display())
                }
            }
            Ok(())
        }
        VenvCommand::Destroy(target) => {
            let venv = build_venv(ctx, &target)?;
            if ctx.common.dry_run {
                info!("dry-run: would remove {}", venv.path().display());
                return Ok(());
            }
            venv.destroy()?;
            println!("removed {}", venv.path().display());
            Ok(())
        }
        VenvCommand::Run { target, argv } => {
            let venv = build_venv(ctx, &target)?;
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| anyhow!("missing command"))?;
            let output = venv.run(program, args)?;
            io::stdout().write_all(&output.stdout)?;
            io::stderr().write_all(&output.stderr)?;
            Ok(())
        }
        VenvCommand::Install { target, packages } => {
            let venv = build_venv(ctx, &target)?;
            if ctx.common.dry_run {
                info!(
                    "dry-run: would install {} package(s) into {}",
                    packages.len(),
                    venv.path().display()
                );
                return Ok(());
            }
            venv.install(&packages)?;
            Ok(())
        }
    }
}

fn build_venv(ctx: &RuntimeContext, target: &VenvTarget) -> Result<VirtualEnv> {
    let user = resolve_user(target.user.clone())?;
    let venv = match &ctx.config.venv.base_dir {
        Some(base) => {
            let base = expand_str_path(base)?;
            VirtualEnv::with_path(&target.name, &user, base.join(&target.name))
        }
        None => VirtualEnv::new(&target.name, &user)?,
    };
    let init = default_init_cmd(&ctx.config.venv.python, venv.path());
    Ok(venv.init_cmd(init))
}

fn resolve_user(explicit: Option<String>) -> Result<String> {
    if let Some(user) = explicit {
        return Ok(user);
    }
    for var in ["SUDO_USER", "USER", "LOGNAME"] {
        if let Ok(value) = env::var(var) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    Err(anyhow!("cannot determine acting user (pass --user or set USER)"))
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("LXFORGE").separator("__"))
        .build()
        .context("building configuration")?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

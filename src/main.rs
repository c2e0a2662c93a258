//! virgo command-line interface.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use virgo::config::Config;
use virgo::logging;
use virgo::package::{PackageService, PackageSource};
use virgo::paths::{VirgoPaths, expand_home};
use virgo::registry::Registry;
use virgo::runner::{ExecRunner, InertRunner, Runner};
use virgo::runtime::StoreMode;
use virgo::vm::lifecycle::{KillOutcome, Lifecycle, render_projects, render_ps};
use virgo::vm::{EnvironmentChecker, HostEnvironment, LaunchSettings};

/// Run unikernels locally
#[derive(Parser, Debug)]
#[command(name = "virgo", version, about = "Pull, run and tear down unikernel projects")]
struct Args {
    /// Print the commands that would run instead of running them; the
    /// runtime ledger is left untouched
    #[arg(short = 'n', long, global = true)]
    dry: bool,

    /// Registry root (default: $VIRGO_ROOT, then `root` in config.toml, then ~/.virgo)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file (default: $VIRGO_CONFIG, then ~/.config/virgo/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a project's manifest, boot image and volumes
    Pull { name: String },
    /// Launch a new instance of a pulled project
    Run { name: String },
    /// Show running instances
    Ps,
    /// Show every known project and its state
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop every instance of a project
    Kill { name: String },
    /// Stop a project and delete its files
    Rm { name: String },
    /// Print a project's hypervisor logs
    Log { name: String },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let paths = VirgoPaths::resolve().context("unable to resolve home directory (is $HOME set?)")?;
    let _log_guard = logging::init(&paths.logs);

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var_os("VIRGO_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| paths.config_file());
    let config = Config::load(&expand_home(&config_path))?;

    let root = args
        .root
        .clone()
        .or_else(|| std::env::var_os("VIRGO_ROOT").map(PathBuf::from))
        .or_else(|| config.root.clone())
        .map(|root| expand_home(&root))
        .unwrap_or_else(|| paths.registry.clone());
    debug!(root = %root.display(), config = %config_path.display(), dry = args.dry, "starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(dispatch(args, config, root))
}

/// Pick the runner for this invocation and hand off to [`execute`].
async fn dispatch(args: Args, config: Config, root: PathBuf) -> Result<ExitCode> {
    let registry = Registry::open(&root)
        .with_context(|| format!("unable to open registry at {}", root.display()))?;
    let packages = PackageSource::from_config(&config.package)?;
    let settings = LaunchSettings::from_config(&config);

    if args.dry {
        let environment = HostEnvironment::new(InertRunner::echoing(), settings.clone());
        let lifecycle = Lifecycle::new(
            registry,
            InertRunner::echoing(),
            packages,
            environment,
            settings,
        )
        .with_store_mode(StoreMode::ReadOnly);
        execute(lifecycle, args.command).await
    } else {
        let timeouts = &config.timeouts;
        let environment = HostEnvironment::new(
            ExecRunner::new(timeouts.command(), timeouts.stop()),
            settings.clone(),
        );
        let lifecycle = Lifecycle::new(
            registry,
            ExecRunner::new(timeouts.command(), timeouts.stop()),
            packages,
            environment,
            settings,
        );
        execute(lifecycle, args.command).await
    }
}

async fn execute<R, P, E>(mut lifecycle: Lifecycle<R, P, E>, command: Command) -> Result<ExitCode>
where
    R: Runner,
    P: PackageService,
    E: EnvironmentChecker,
{
    match command {
        Command::Pull { name } => {
            let project = lifecycle.pull(&name).await?;
            if lifecycle.store_mode() == StoreMode::ReadOnly {
                println!("{name} fetched, nothing written (dry run)");
            } else {
                println!("{name} pulled into {}", project.root().display());
            }
        }

        Command::Run { name } => {
            let launch = lifecycle.run(&name).await?;
            if let Some(handle) = launch.handle {
                println!(
                    "{} started (pid {}, ip {})",
                    launch.project, handle.pid, launch.network.ip
                );
            }
            println!("open up {}", launch.url());
        }

        Command::Ps => {
            print!("{}", render_ps(&lifecycle.ps()?));
        }

        Command::List { json } => {
            let projects = lifecycle.projects()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else {
                print!("{}", render_projects(&projects));
            }
        }

        Command::Kill { name } => {
            let outcome = lifecycle.kill(&name).await?;
            if matches!(outcome, KillOutcome::NotRunning) {
                println!("Project '{name}' isn't running");
                return Ok(ExitCode::FAILURE);
            }
            return Ok(report_kill(&name, &outcome));
        }

        Command::Rm { name } => {
            let outcome = lifecycle.remove(&name).await?;
            let code = report_kill(&name, &outcome);
            println!("{name} removed");
            return Ok(code);
        }

        Command::Log { name } => {
            for (path, contents) in lifecycle.logs(&name)? {
                println!("==> {} <==", path.display());
                print!("{contents}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn report_kill(name: &str, outcome: &KillOutcome) -> ExitCode {
    match outcome {
        KillOutcome::NotRunning => ExitCode::SUCCESS,
        KillOutcome::Stopped { stopped, failures } => {
            for pid in stopped {
                println!("{name}: stopped pid {pid}");
            }
            for (pid, error) in failures {
                eprintln!("{name}: unable to stop pid {pid}: {error}");
            }
            if failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

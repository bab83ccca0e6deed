use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use bollard::Docker;
use chrono::Utc;
use clap::{Parser, Subcommand};

use mjsuite::{
    config::Config,
    engines::{self, Engine},
    results,
    runs::Benchmark,
    runtime::DockerRuntime,
    source::GitHub,
    workloads::{self, Workload},
    Services,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Root directory of the suite
    #[arg(long, env = "MJSUITE_ROOT", default_value = ".")]
    root: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workloads on engines and record the results
    Benchmark {
        /// Workloads to run, `!id` excludes one [default: all]
        #[arg(short, long, num_args = 1..)]
        workloads: Option<Vec<String>>,

        /// Engines to run on, `!id` excludes one [default: all]
        #[arg(short, long, num_args = 1..)]
        engines: Option<Vec<String>>,

        /// Result file [default: results/{timestamp}.json]
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch and build an engine
    Setup {
        /// Engine to set up
        engine: String,
    },
    /// Run an engine, optionally on a single workload
    Run {
        /// Engine to run
        engine: String,

        /// Workload to run on it
        workload: Option<String>,
    },
    /// List engines
    Engines,
    /// List workloads
    Workloads,
    /// Print a saved result file as tables
    Show {
        /// Result file to print
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("LOG_LEVEL", "info")
            .write_style("LOG_STYLE"),
    );
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

async fn connect() -> anyhow::Result<DockerRuntime> {
    log::debug!("attempting to connect to Docker daemon...");
    let docker = Docker::connect_with_local_defaults().context("could not connect to Docker daemon")?;
    let docker_version = docker
        .version()
        .await
        .context("could not connect to Docker daemon")?;
    log::debug!(
        "connected to Docker daemon with version {} (api: {}, os/arch: {}/{})",
        docker_version.version.as_deref().unwrap_or("unknown"),
        docker_version.api_version.as_deref().unwrap_or("unknown"),
        docker_version.os.as_deref().unwrap_or("unknown"),
        docker_version.arch.as_deref().unwrap_or("unknown"),
    );
    Ok(DockerRuntime::new(docker))
}

async fn dispatch(command: Command, config: &Config) -> anyhow::Result<()> {
    match command {
        Command::Workloads => {
            for summary in workloads::list_all(&config.workloads_dir())? {
                println!("{:<24} {:>6} lines", summary.identifier, summary.lines);
            }
        }
        Command::Show { file } => {
            let stats = results::read(&file)
                .with_context(|| format!("could not read result file {}", file.display()))?;
            println!("{}", results::render(&stats));
        }
        command => {
            let runtime = connect().await?;
            let host =
                GitHub::new(config.github_token()).context("could not create GitHub client")?;
            dispatch_with_docker(command, Services::new(config, &runtime, &host)).await?;
        }
    }
    Ok(())
}

async fn dispatch_with_docker(command: Command, services: Services<'_>) -> anyhow::Result<()> {
    let config = services.config;
    match command {
        Command::Benchmark {
            workloads,
            engines,
            output,
        } => {
            let start_time = Utc::now();
            let mut benchmark =
                Benchmark::load(config, workloads.as_deref(), engines.as_deref())?;
            let stats = benchmark.run(services).await?;

            let output = output.unwrap_or_else(|| results::default_path(config, start_time));
            results::write(&output, &stats)
                .with_context(|| format!("could not write to output file {}", output.display()))?;
            println!("{}", results::render(&stats));
        }
        Command::Setup { engine } => {
            Engine::load(config, &engine)?.setup(services).await?;
        }
        Command::Run { engine, workload } => {
            let workload = workload
                .map(|id| Workload::load(&config.workloads_dir(), &id))
                .transpose()?;
            Engine::load(config, &engine)?
                .run(workload.as_ref(), services)
                .await?;
        }
        Command::Engines => {
            for status in engines::list_all(services).await? {
                println!(
                    "{:<24} {:<24} {}",
                    status.identifier,
                    status.version,
                    if status.ready { "ready" } else { "not built" }
                );
            }
        }
        Command::Workloads | Command::Show { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    human_panic::setup_panic!();

    let args = Args::parse();
    init_logging(args.verbose);

    let root = match args.root.canonicalize().with_context(|| {
        format!("could not resolve root directory {}", args.root.display())
    }) {
        Ok(root) => root,
        Err(err) => {
            log::error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    let config = Config::new(root)
        .with_mount_source(std::env::var_os("MOUNT_SRC").map(PathBuf::from))
        .with_github_token(std::env::var("GITHUB_TOKEN").ok());
    log::trace!("configuration: {config:#?}");

    match dispatch(args.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            log::debug!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

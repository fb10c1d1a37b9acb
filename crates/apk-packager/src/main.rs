use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use apk_packager::config::{self, Settings};
use apk_packager::logging::{self, LogFormat};
use apk_packager::queue::SqliteQueue;
use apk_packager::runner::{BuildAppEnv, run_build_app};
use apk_packager::scheduler::{
    BuildService, Poll, Worker, WorkerContext, check_worker_count, run_workers,
};
use apk_packager::store::open_store;
use apk_packager::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a packager config TOML (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Claim and build queued requests until interrupted
    Worker {
        /// Number of worker threads (0 = use [worker].count)
        #[arg(long, default_value_t = 0)]
        count: usize,
        /// Build at most one request and exit
        #[arg(long)]
        once: bool,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        cmd: ProjectCommand,
    },
    /// Queue a build for a project
    Submit {
        #[arg(long)]
        project: String,
    },
    /// Print the build history of a project as JSON lines
    Builds {
        #[arg(long)]
        project: String,
    },
    /// Run one build from environment variables (APP_ID, APP_NAME, FILES_URL, ...)
    BuildApp,
    /// Print the fully-resolved config (after imports/extends)
    ResolveConfig,
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Upload a project and generate its signing keystore
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        /// Path to the .sb3 project file
        #[arg(long)]
        source: PathBuf,
        /// Optional PNG launcher icon
        #[arg(long)]
        icon: Option<PathBuf>,
    },
    /// Remove a project, its build history and its stored files
    Delete {
        #[arg(long)]
        id: String,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logging::init(args.log_format);

    let doc = config::load_or_default(args.config.as_deref())?;
    if let Command::ResolveConfig = args.cmd {
        return cmd_resolve_config(&doc);
    }
    let settings = doc.settings()?;

    match args.cmd {
        Command::Worker { count, once } => cmd_worker(&settings, count, once),
        Command::Project { cmd } => match cmd {
            ProjectCommand::Create {
                owner,
                name,
                source,
                icon,
            } => cmd_project_create(&settings, &owner, &name, &source, icon.as_deref()),
            ProjectCommand::Delete { id } => open_service(&settings)?.delete_project(&id),
        },
        Command::Submit { project } => {
            let req = open_service(&settings)?.submit(&project)?;
            println!("{}", req.id);
            Ok(())
        }
        Command::Builds { project } => cmd_builds(&settings, &project),
        Command::BuildApp => run_build_app(&BuildAppEnv::from_env()?, &settings),
        Command::ResolveConfig => Ok(()),
    }
}

fn open_service(settings: &Settings) -> Result<BuildService<SqliteQueue>> {
    let queue = SqliteQueue::open(&settings.queue.database)?;
    let store = open_store(&settings.store)?;
    Ok(BuildService::new(queue, Arc::from(store)))
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))
}

fn cmd_project_create(
    settings: &Settings,
    owner: &str,
    name: &str,
    source: &Path,
    icon: Option<&Path>,
) -> Result<()> {
    let source = read_input(source)?;
    let icon = icon.map(read_input).transpose()?;
    let project = open_service(settings)?.create_project(owner, name, source, icon)?;
    println!("{}", project.id);
    Ok(())
}

fn cmd_builds(settings: &Settings, project: &str) -> Result<()> {
    for req in open_service(settings)?.builds(project)? {
        let line = serde_json::to_string(&req)
            .map_err(|e| Error::msg(format!("failed to encode build request {}: {e}", req.id)))?;
        println!("{line}");
    }
    Ok(())
}

fn cmd_worker(settings: &Settings, count: usize, once: bool) -> Result<()> {
    let ctx = WorkerContext::from_settings(settings)?;
    if once {
        let queue = SqliteQueue::open(&settings.queue.database)?;
        return match Worker::new(queue, ctx).run_once()? {
            Poll::Idle => {
                tracing::info!("queue is empty");
                Ok(())
            }
            Poll::Built { request_id, status } => {
                println!("{request_id} {status}");
                Ok(())
            }
        };
    }

    let count = if count == 0 {
        settings.worker.effective_count()
    } else {
        count
    };
    check_worker_count(&settings.backend, count)?;
    tracing::info!(
        workers = count,
        database = %settings.queue.database.display(),
        "starting workers"
    );
    run_workers(
        count,
        settings.queue.database.clone(),
        ctx,
        Arc::new(AtomicBool::new(false)),
    )
}

fn cmd_resolve_config(doc: &config::ConfigDoc) -> Result<()> {
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

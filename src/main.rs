use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use livedebug::channel::{ControlChannel, RpcHandler};
use livedebug::config::{self, Config};
use livedebug::fork::ProcessLauncher;
use livedebug::inspector::InspectorAttacher;
use livedebug::orchestrator::Orchestrator;
use livedebug::ports::PortAllocator;
use livedebug::callback::ChildAgent;
use livedebug::{logging, remap};

#[derive(Parser, Debug)]
#[command(name = "livedebug")]
#[command(version = env!("LIVEDEBUG_VERSION"))]
#[command(about = "Debug a live server through a forked, port-remapped copy")]
struct Args {
    /// Working directory
    #[arg(short = 'C', long, global = true)]
    cwd: Option<String>,

    /// Write debug lines to the log
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the controller and serve debugging sessions (default)
    Serve,

    /// Write a commented default config file
    InitConfig,

    /// Print the effective configuration
    Config,

    /// Reserve free ports from the configured range and print them
    Ports {
        /// How many ports to reserve
        #[arg(default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.trace);
    logging::cleanup_old_logs();

    if let Some(cwd) = &args.cwd {
        std::env::set_current_dir(cwd)?;
        logging::info(&format!("Changed working directory to: {}", cwd));
    }

    if let Err(e) = run_main(args).await {
        logging::error(&format!("{:?}", e));
        return Err(e);
    }
    Ok(())
}

async fn run_main(args: Args) -> Result<()> {
    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::InitConfig => {
            let path = Config::create_default_config_file()?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Config => {
            println!("{}", config::config().display_string());
            if let Some(path) = logging::current_log_path() {
                println!("Log file: {}", path.display());
            }
            Ok(())
        }
        Command::Ports { count } => {
            let allocator = PortAllocator::from_config(&config::config().ports);
            let ports = allocator.reserve(count).await?;
            let list: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            println!("{}", list.join(" "));
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    if remap::is_forked() {
        return serve_forked().await;
    }

    let config = config::config();
    logging::info(&format!(
        "livedebug {} starting (debugging {})",
        env!("LIVEDEBUG_VERSION"),
        if config.debugger.enabled { "enabled" } else { "disabled" }
    ));

    let (channel, handle) = ControlChannel::new(config.controller.clone());
    let launcher = ProcessLauncher::new(config.fork.clone()).with_working_dir(config.working_dir());
    let attacher = InspectorAttacher::new(&config.bridge);
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Arc::new(launcher),
        Arc::new(attacher),
        Arc::new(handle),
    ));

    let background = orchestrator.spawn_background();
    let handler: Arc<dyn RpcHandler> = orchestrator.clone();

    let outcome = tokio::select! {
        result = channel.run(handler) => result,
        _ = tokio::signal::ctrl_c() => {
            logging::info("Interrupted, shutting down");
            Ok(())
        }
    };

    orchestrator.stop_all().await;
    for task in background {
        task.abort();
    }
    outcome
}

/// Running as the forked copy: remap ports, report ready, take session
/// pushes until the parent kills us.
async fn serve_forked() -> Result<()> {
    let table = remap::install()?;
    logging::info(&format!(
        "Running as forked copy ({} remapped ports)",
        table.len()
    ));

    let Some(agent) = ChildAgent::connect().await? else {
        return Ok(());
    };
    let serving = agent.serve(|data| {
        logging::debug(&format!("Session state pushed: {}", logging::truncate(&data.to_string(), 200)));
    });
    let _ = serving.await;
    logging::info("Parent closed the callback channel");
    Ok(())
}

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use converse::{
    config::{ConfigManager, EnvConfigManager, RuntimeConfig},
    flow_commands::{deploy_flow_file, list_flow_files, validate_flow_file},
    logger::init_tracing,
    runtime::Runtime,
    schema::write_schema,
};
use std::{env, path::PathBuf, process};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "converse",
    about = "Event pipeline and dialog engine for conversational bots",
    version = "0.1.0"
)]
struct Cli {
    /// Root directory (config, flows, logs). Defaults to $CONVERSE_ROOT or ./converse
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an instance
    Run(RunArgs),

    /// Emit JSON‐Schema for flows and events into `<root>/schemas`
    Schema,

    /// Manage flows
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    Validate { file: PathBuf },
    Deploy {
        file: PathBuf,
        #[arg(long)]
        bot: String,
    },
    List {
        #[arg(long)]
        bot: String,
    },
}

/// Resolve the converse root directory from the flag, the environment or use default.
fn resolve_root_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(root) = flag {
        root
    } else if let Ok(path) = env::var("CONVERSE_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./converse")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir(cli.root);
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        log_level: "info".to_string(),
        otel_endpoint: None,
    })) {
        Commands::Run(args) => run(root, args.log_level, args.otel_endpoint).await,
        Commands::Schema => {
            let out_dir = root.join("schemas");
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                let flow = validate_flow_file(&file)?;
                println!("✅ Flow `{}` is valid.", flow.name);
                Ok(())
            }
            FlowCommands::Deploy { file, bot } => {
                deploy_flow_file(&file, &root.join("flows"), &bot)?;
                println!("✅ Flow deployed for bot `{bot}`. A running instance reloads it automatically.");
                Ok(())
            }
            FlowCommands::List { bot } => {
                for name in list_flow_files(&root.join("flows"), &bot)? {
                    println!("{name}");
                }
                Ok(())
            }
        },
    }
}

async fn run(root: PathBuf, log_level: String, otel_endpoint: Option<String>) -> anyhow::Result<()> {
    if !root.exists() {
        let err = format!(
            "Root directory `{}` does not exist. Create it or pass --root <dir>.",
            root.display()
        );
        eprintln!("{err}");
        bail!(err);
    }

    let telemetry = init_tracing(
        root.clone(),
        "logs/converse.log".to_string(),
        "logs/converse_events.log".to_string(),
        log_level,
        otel_endpoint,
    )?;

    info!("converse runtime starting up…");

    let config_mgr = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let mut config = RuntimeConfig::from_manager(&config_mgr).await?;
    if config.flows_dir.is_none() {
        let default_flows = root.join("flows");
        if default_flows.is_dir() {
            config.flows_dir = Some(default_flows);
        }
    }

    let runtime = match Runtime::new(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to bootstrap converse runtime: {e:#}");
            telemetry.shutdown();
            process::exit(1);
        }
    };

    info!(instance_id = %runtime.config().instance_id, "converse runtime running; press Ctrl‐C to exit");
    println!("converse running; press Ctrl‐C to exit");

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("converse runtime shutting down");
    runtime.shutdown().await;
    telemetry.shutdown();

    println!("Goodbye!");
    Ok(())
}

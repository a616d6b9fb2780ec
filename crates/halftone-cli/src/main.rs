use clap::{Parser, Subcommand};
use halftone::{
    commands::{
        config::{self, ConfigAction},
        doctor, provision,
        worker::{self, WorkerAction},
    },
    common::init_tracing,
    logger, GlobalOpts,
};

#[derive(Parser)]
#[command(name = "halftone")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Halftone Studio worker bridge",
    long_about = "Sets up the Python image worker and drives it from the command line."
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change configuration
    #[command(subcommand_required = false, arg_required_else_help = false)]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Report the runtime, package manager and worker script this host would use
    Doctor,
    /// Install the worker's Python packages and native library
    Provision {
        /// Answer yes to install prompts
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Run a command against the image worker
    Worker {
        /// Answer yes to install prompts during startup
        #[arg(short = 'y', long)]
        yes: bool,
        #[command(subcommand)]
        action: WorkerAction,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logger::init_with_verbosity(cli.global.verbosity_level(), cli.global.log_worker) {
        eprintln!("Warning: Failed to initialize logger: {}", e);
    }
    init_tracing(&cli.global);

    let result = match cli.command {
        Commands::Config { action } => config::handle_config(action, &cli.global),
        Commands::Doctor => doctor::handle_doctor(&cli.global),
        Commands::Provision { yes } => provision::handle_provision(yes, &cli.global),
        Commands::Worker { yes, action } => worker::handle_worker(action, yes, &cli.global),
    };

    if let Err(e) = result {
        logger::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

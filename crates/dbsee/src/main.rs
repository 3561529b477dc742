use clap::{Parser, Subcommand};
use colored::Colorize;
use env_logger::Env;

use dbsee_api::{AuthArgs, HealthArgs, SearchArgs, TablesArgs};

#[derive(Parser)]
#[command(name = "dbsee")]
#[command(about = "Browse and search the DBSee procurement database", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage authentication
    Auth(AuthArgs),

    /// Browse database tables
    #[command(alias = "t")]
    Tables(TablesArgs),

    /// Search by CIG or company name
    #[command(alias = "s")]
    Search(SearchArgs),

    /// Check backend health
    Health(HealthArgs),
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {e}", "Error:".red());
        for cause in e.chain().skip(1) {
            eprintln!("  {cause}");
        }
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG still wins over the --debug default.
    let env = if cli.debug {
        Env::default().default_filter_or("debug")
    } else {
        Env::default().default_filter_or("error")
    };
    env_logger::Builder::from_env(env).init();
    log::debug!("dbsee {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Auth(args) => dbsee_api::execute_auth(args),
        Commands::Tables(args) => dbsee_api::execute_tables(args),
        Commands::Search(args) => dbsee_api::execute_search(args),
        Commands::Health(args) => dbsee_api::execute_health(args),
    }
}

mod commands;
mod config;
mod remote;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    Planner, cmd_add, cmd_clear, cmd_login, cmd_logout, cmd_order, cmd_remote, cmd_remove,
    cmd_servings, cmd_shell, cmd_show, cmd_sync,
};
use crate::config::Config;
use menuplan_core::db::Database;

#[derive(Parser)]
#[command(
    name = "menuplan",
    version,
    about = "A local-first week-menu planner",
    long_about = "Plan this week's recipes. Edits are saved locally first and synced \
                  to the backend in the background, so the planner keeps working offline."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this week's menu
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a recipe to the menu
    Add {
        /// Recipe ID
        recipe: String,
        /// Servings (default: the subscription's household size)
        #[arg(short, long, allow_negative_numbers = true)]
        servings: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a recipe from the menu
    Remove {
        /// Recipe ID
        recipe: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change the servings of a recipe on the menu (minimum 1)
    Servings {
        /// Recipe ID
        recipe: String,
        /// New number of servings
        #[arg(allow_negative_numbers = true)]
        servings: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start a new, empty menu
    Clear {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save the menu to the backend now
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print recipes in this week's seeded order
    Order {
        /// Recipe IDs to order
        #[arg(required = true)]
        recipes: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign in as a user, optionally with a subscription
    Login {
        /// User ID
        #[arg(long)]
        user: String,
        /// Subscription ID; menus only sync once one is set
        #[arg(long)]
        subscription: Option<String>,
        /// Household size used when adding recipes
        #[arg(long, default_value = "4")]
        default_servings: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign out (the local menu is kept)
    Logout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configure the backend to sync with
    Remote {
        /// Backend URL, e.g. http://127.0.0.1:8080
        #[arg(required_unless_present = "local")]
        url: Option<String>,
        /// API key printed by `menuplan serve`
        #[arg(long)]
        api_key: Option<String>,
        /// Stop syncing with a backend and store menus locally
        #[arg(long, conflicts_with_all = ["url", "api_key"])]
        local: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session with background syncing
    Shell {
        /// Seconds between backend connectivity checks
        #[arg(long, default_value = "5")]
        probe_interval: u64,
    },
    /// Start the backend server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Login {
            user,
            subscription,
            default_servings,
            json,
        } => return cmd_login(&config, user, subscription, default_servings, json),
        Commands::Logout { json } => return cmd_logout(&config, json),
        Commands::Remote {
            url, api_key, json, ..
        } => return cmd_remote(&config, url, api_key, json).await,
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let db = Database::open(&config.db_path)?;
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?)
            };
            return server::start_server(db, port, &bind, api_key).await;
        }
        _ => {}
    }

    let settings = config.load_settings()?;
    let planner = Planner::open(&config, &settings).await?;

    match cli.command {
        Commands::Show { json } => cmd_show(&planner, json).await,
        Commands::Add {
            recipe,
            servings,
            json,
        } => cmd_add(&planner, &recipe, servings, json).await,
        Commands::Remove { recipe, json } => cmd_remove(&planner, &recipe, json).await,
        Commands::Servings {
            recipe,
            servings,
            json,
        } => cmd_servings(&planner, &recipe, servings, json).await,
        Commands::Clear { json } => cmd_clear(&planner, json).await,
        Commands::Sync { json } => cmd_sync(&planner, json).await,
        Commands::Order { recipes, json } => cmd_order(&planner, recipes, json),
        Commands::Shell { probe_interval } => {
            cmd_shell(planner, Duration::from_secs(probe_interval.max(1))).await
        }
        Commands::Login { .. }
        | Commands::Logout { .. }
        | Commands::Remote { .. }
        | Commands::Serve { .. } => unreachable!("handled before the engine is opened"),
    }
}

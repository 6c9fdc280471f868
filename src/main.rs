//! Keyper CLI - sign in once, keep the session token persisted.
//!
//! This is the main binary entry point. See the `keyper` library for the
//! core functionality.

use anyhow::Result;
use clap::{Parser, Subcommand};
use keyper::{commands, AuthContext, Config};

#[derive(Parser)]
#[command(name = "keyper", version, about = "Persisted login sessions for the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and persist the session token
    Login {
        /// Username to sign in as
        username: String,
        /// Password; prompted on stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign out and delete the persisted session token
    Logout,
    /// Show the profile for the stored session
    Whoami,
    /// Show session state and the storage backend in use
    Status,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let ctx = AuthContext::new(&config)?;

    match cli.command {
        Command::Login { username, password } => {
            commands::login(&ctx, &username, password.as_deref())
        }
        Command::Logout => commands::logout(&ctx),
        Command::Whoami => commands::whoami(&ctx),
        Command::Status => commands::status(&ctx),
    }
}

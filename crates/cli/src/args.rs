use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Huddle hub client
#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Talk to a Huddle hub from the terminal")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Credential file (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub credentials: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store the bearer token issued at login
    Login {
        #[arg(long)]
        token: String,

        #[arg(long)]
        user_id: Option<String>,
    },

    /// Forget the stored token
    Logout,

    /// Connect and print every state change until interrupted
    Watch,

    /// Send one message
    Send {
        #[command(flatten)]
        target: Target,

        body: String,
    },

    /// Load and print a page of history
    History {
        #[command(flatten)]
        target: Target,

        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct Target {
    /// User id of a 1:1 peer
    #[arg(long)]
    pub to: Option<String>,

    /// Group id
    #[arg(long)]
    pub group: Option<String>,
}

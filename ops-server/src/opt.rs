use clap::{Parser, Subcommand};
use clio::Input;
use rtg_session::Role;

#[derive(Debug, Parser)]
#[command(name = "rtg-ops", about = "RTG operations backend service", version)]
pub struct Opt {
    /// Config file path
    #[arg(short, long, value_parser, default_value = "config.toml")]
    pub config: Input,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the HTTP service (default)
    Serve,
    /// Creates or updates users listed in the TOML file
    Seed {
        #[arg(value_parser)]
        file: Input,
    },
    /// Prints all the users with their roles
    Inspect,
    /// Assigns role to the user
    SetRole { email: String, role: Role },
}

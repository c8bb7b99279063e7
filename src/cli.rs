use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "chfunnel", about)]
pub struct Cli {
    /// Config file (json)
    #[arg(long, default_value = "config.json")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum Command {
    /// Print version and exit
    Version,
}

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sb-cli")]
#[command(about = "Run script units against a scenario runtime")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Mode,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Mode {
    Run(RunArgs),
    Units(UnitsArgs),
}

#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    #[arg(long = "root")]
    pub(crate) root: String,
    #[arg(long = "unit")]
    pub(crate) unit: String,
    #[arg(long = "config")]
    pub(crate) config: Option<String>,
    /// JSON passed to the unit as its single argument.
    #[arg(long = "arg")]
    pub(crate) arg: Option<String>,
    #[arg(long = "env")]
    pub(crate) env: Option<String>,
    #[arg(long = "tag")]
    pub(crate) tags: Vec<String>,
    /// Go through the suite's call-once cache.
    #[arg(long = "single")]
    pub(crate) single: bool,
}

#[derive(Debug, Args)]
pub(crate) struct UnitsArgs {
    #[arg(long = "root")]
    pub(crate) root: String,
}

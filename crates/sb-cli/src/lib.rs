use std::ffi::OsString;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli_args;
mod error_map;
mod runner;
mod source_loader;

pub(crate) use cli_args::{Cli, Mode, RunArgs, UnitsArgs};
pub(crate) use error_map::{emit_error, map_cli_root_path, map_cli_root_scan, CliError};

pub fn run_cli_from_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return error.exit_code();
        }
    };
    init_tracing();
    match run(cli) {
        Ok(code) => code,
        Err(error) => emit_error(error),
    }
}

/// Logs go to stderr so stdout stays line-oriented for callers.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Mode::Run(args) => runner::run_unit(args),
        Mode::Units(args) => runner::run_units(args),
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn bad_arguments_exit_with_clap_code() {
        assert_eq!(run_cli_from_args(["sb-cli", "launch"]), 2);
    }

    #[test]
    fn run_reports_errors_as_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().display().to_string();
        let code = run_cli_from_args(["sb-cli", "run", "--root", &root, "--unit", "nope.rhai"]);
        assert_eq!(code, 1);
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "gpufleetd",
    version,
    about = "Supervises GPU hosts over SSH: watches jobs and GPUs, keeps port forwards alive",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < GPUFLEET_CONFIG_PATH < command-line flags.\n\
If --config is omitted, gpufleetd tries GPUFLEET_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file with the [[hosts]] registry. When omitted, gpufleetd uses GPUFLEET_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Where to write the JSON fleet snapshot. Overrides `snapshot_path` from the config file."
    )]
    pub snapshot_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "How often watches are evaluated. Overrides `tick_interval_secs` from the config file."
    )]
    pub tick_interval_secs: Option<u64>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

fn to_parsed(matches: &clap::ArgMatches) -> Result<ParsedOpts, clap::Error> {
    // an absent flag must not override `verbose = true` from the file
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(matches)?;
    Ok(ParsedOpts {
        opts,
        verbose_override,
    })
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    to_parsed(&matches).unwrap_or_else(|err| err.exit())
}

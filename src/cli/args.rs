//! CLI argument definitions using clap derive

use crate::params::ParamValue;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// fretforge - incremental part builds for parametric instruments
///
/// Builds the standard instrument part graph with a deterministic manifest
/// kernel, reusing every part whose inputs did not change.
#[derive(Parser, Debug)]
#[command(name = "fretforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FRETFORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build instrument parts
    Build(BuildArgs),

    /// List instrument parameters and their defaults
    Params(ParamsArgs),

    /// Inspect the part dependency graph
    Graph(GraphArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Parts to build (defaults to the full assembly)
    #[arg(default_value = "assembly")]
    pub nodes: Vec<String>,

    /// Parameter file applied before building (overrides instrument.parameters)
    #[arg(short, long)]
    pub params: Option<PathBuf>,

    /// Parameter override (NAME=VALUE), applied after the parameter file
    #[arg(short, long, value_parser = parse_assignment)]
    pub set: Vec<(String, ParamValue)>,

    /// Edit applied after the first build (NAME=VALUE); the parts are then
    /// rebuilt and the report shows what was reused
    #[arg(long, value_parser = parse_assignment)]
    pub then_set: Vec<(String, ParamValue)>,

    /// Kernel worker threads (default: from config)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the params command
#[derive(Parser, Debug)]
pub struct ParamsArgs {
    /// Only parameters whose name starts with this prefix
    pub prefix: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the graph command
#[derive(Parser, Debug)]
pub struct GraphArgs {
    /// Print the build order of a part
    #[arg(long, value_name = "NODE", conflicts_with = "affected_by")]
    pub order: Option<String>,

    /// Print the parts an edit of this parameter would rebuild
    #[arg(long, value_name = "PARAM")]
    pub affected_by: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Parse a parameter assignment in NAME=VALUE format
fn parse_assignment(s: &str) -> Result<(String, ParamValue), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid NAME=VALUE format: no '=' found in '{s}'"))?;
    let name = s[..pos].trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    Ok((name.to_string(), ParamValue::parse(&s[pos + 1..])))
}

//! Command-line interface definitions for the `stratus` binary.
//!
//! This module centralises the clap parser structures so both the main
//! binary and the build script can reuse them when generating the manual
//! page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `stratus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    about = "Declare a compute stack and converge it against a provider",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Validate the stack inputs and report every failure at once.
    #[command(name = "validate", about = "Validate the stack inputs")]
    Validate,
    /// Preview the actions a run would take, without provider calls.
    #[command(name = "plan", about = "Preview the actions a run would take")]
    Plan(StateArgs),
    /// Converge every node of the stack and print the outputs.
    #[command(name = "apply", about = "Converge the stack and print outputs")]
    Apply(StateArgs),
    /// Destroy every recorded node, dependents first.
    #[command(name = "destroy", about = "Destroy every recorded node")]
    Destroy(StateArgs),
    /// Print the projected outputs of the recorded state.
    #[command(name = "outputs", about = "Print the projected stack outputs")]
    Outputs(StateArgs),
}

/// Arguments shared by every state-touching subcommand.
#[derive(Debug, Parser)]
pub(crate) struct StateArgs {
    /// Override the state file location (defaults to `.stratus/state.json`).
    #[arg(long, value_name = "PATH")]
    pub(crate) state_path: Option<Utf8PathBuf>,
}

//! Binary entry point for the Stratus CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;

use stratus::{
    ApplyError, CycleError, FileStateStore, GraphError, LocalProvider, LocalProviderError,
    NodeAction, OrderedPlan, Reconciler, ResourceGraph, StackInputs, StackSnapshot, StackState,
    StateStore, StateStoreError, ValidationErrors, plan_actions, project, resolve,
};

mod cli;

use cli::{Cli, StateArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Validation(#[from] ValidationErrors),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("{0}")]
    Cycle(#[from] CycleError),
    #[error("state error: {0}")]
    State(#[from] StateStoreError),
    #[error("run failed: {0}")]
    Run(#[from] ApplyError<LocalProviderError>),
    #[error("failed to render outputs: {0}")]
    Render(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Validate => validate_command(),
        Cli::Plan(args) => plan_command(&args),
        Cli::Apply(args) => apply_command(&args).await,
        Cli::Destroy(args) => destroy_command(&args).await,
        Cli::Outputs(args) => outputs_command(&args),
    }
}

fn validate_command() -> Result<i32, CliError> {
    let inputs = load_inputs()?;
    match inputs.validate() {
        Ok(snapshot) => {
            let mut stdout = io::stdout();
            writeln!(
                stdout,
                "configuration valid: stack '{}'",
                snapshot.inputs().name
            )
            .ok();
            Ok(0)
        }
        Err(errors) => {
            let mut stderr = io::stderr();
            for error in errors.errors() {
                writeln!(stderr, "{error}").ok();
            }
            Ok(1)
        }
    }
}

fn plan_command(args: &StateArgs) -> Result<i32, CliError> {
    let (_, plan) = evaluate()?;
    let state = state_store(args).load()?;
    let actions = plan_actions(&plan, &state);

    let mut stdout = io::stdout();
    for planned in &actions {
        writeln!(stdout, "{}: {}", planned.kind, planned.action).ok();
    }
    let changes = actions
        .iter()
        .filter(|planned| planned.action != NodeAction::NoOp)
        .count();
    writeln!(stdout, "plan: {changes} change(s)").ok();
    Ok(0)
}

async fn apply_command(args: &StateArgs) -> Result<i32, CliError> {
    let (snapshot, plan) = evaluate()?;
    let reconciler = Reconciler::new(LocalProvider::new(), state_store(args));
    let state = reconciler.apply(&plan).await?;

    let mut stdout = io::stdout();
    writeln!(stdout, "apply complete: {} node(s) recorded", state.len()).ok();
    write_outputs(&mut stdout, &snapshot, &state)?;
    Ok(0)
}

async fn destroy_command(args: &StateArgs) -> Result<i32, CliError> {
    let snapshot = load_inputs()?.validate()?;
    let graph = ResourceGraph::build(&snapshot)?;
    let reconciler = Reconciler::new(LocalProvider::new(), state_store(args));
    reconciler.teardown(&graph).await?;

    let mut stdout = io::stdout();
    writeln!(stdout, "destroy complete").ok();
    Ok(0)
}

fn outputs_command(args: &StateArgs) -> Result<i32, CliError> {
    let snapshot = load_inputs()?.validate()?;
    let state = state_store(args).load()?;

    let mut stdout = io::stdout();
    write_outputs(&mut stdout, &snapshot, &state)?;
    Ok(0)
}

fn load_inputs() -> Result<StackInputs, CliError> {
    StackInputs::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))
}

fn evaluate() -> Result<(StackSnapshot, OrderedPlan), CliError> {
    let snapshot = load_inputs()?.validate()?;
    let graph = ResourceGraph::build(&snapshot)?;
    let plan = resolve(&graph)?;
    Ok((snapshot, plan))
}

fn state_store(args: &StateArgs) -> FileStateStore {
    let path = args
        .state_path
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(FileStateStore::DEFAULT_PATH));
    FileStateStore::new(path)
}

fn write_outputs(
    target: &mut impl Write,
    snapshot: &StackSnapshot,
    state: &StackState,
) -> Result<(), CliError> {
    let outputs = project(snapshot, state);
    let rendered = serde_json::to_string_pretty(&outputs)
        .map_err(|err| CliError::Render(err.to_string()))?;
    writeln!(target, "{rendered}").ok();
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

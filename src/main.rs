use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use rustmigrator::{FileStateStore, State, StateStore, VERSION};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rustmigrator")]
#[command(about = "Operator tooling for migration plan states")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or repair recorded plan states.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Print a fresh identifier for a new plan state.
    NewState,
}

#[derive(Subcommand)]
enum StateAction {
    Get {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        plan: String,
    },
    Set {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        plan: String,
        #[arg(long)]
        state: String,
        /// Only write if the plan is currently at this state ("" for none).
        #[arg(long)]
        expect: Option<String>,
    },
    List {
        #[arg(long)]
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::State { action } => match action {
            StateAction::Get { store, plan } => get_state(store, &plan).await,
            StateAction::Set {
                store,
                plan,
                state,
                expect,
            } => set_state(store, &plan, &state, expect.as_deref()).await,
            StateAction::List { store } => list_states(store).await,
        },
        Command::NewState => {
            println!("{}", Uuid::new_v4());
            Ok(())
        }
    }
}

async fn get_state(path: PathBuf, plan: &str) -> Result<()> {
    let store = FileStateStore::new(path);
    let state = store
        .get(plan)
        .await
        .with_context(|| format!("failed to read state of plan '{}'", plan))?;
    match state {
        Some(state) => println!("{}", state),
        None => println!("<none>"),
    }
    Ok(())
}

async fn set_state(path: PathBuf, plan: &str, state: &str, expect: Option<&str>) -> Result<()> {
    if state.is_empty() {
        return Err(anyhow!("--state must not be empty"));
    }
    let store = FileStateStore::new(path);
    let state = State::from(state);

    match expect {
        Some(expected) => {
            let expected = (!expected.is_empty()).then(|| State::from(expected));
            store
                .set_guarded(plan, expected.as_ref(), &state)
                .await
                .with_context(|| format!("guarded write of plan '{}' rejected", plan))?;
        }
        None => store
            .set(plan, &state)
            .await
            .with_context(|| format!("failed to write state of plan '{}'", plan))?,
    }

    println!("{} -> {}", plan, state);
    Ok(())
}

async fn list_states(path: PathBuf) -> Result<()> {
    let store = FileStateStore::new(&path);
    let entries = store
        .entries()
        .await
        .with_context(|| format!("failed to read state file '{}'", path.display()))?;

    if entries.is_empty() {
        println!("no plans recorded in {}", path.display());
        return Ok(());
    }
    for (plan, entry) in entries {
        println!("{}\t{}\t{}", plan, entry.state, entry.updated_at.to_rfc3339());
    }
    Ok(())
}

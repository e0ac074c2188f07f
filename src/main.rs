use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ralph_orchestrator::config::Config;
use ralph_orchestrator::queue::{build_queue, next_eligible};
use ralph_orchestrator::store::item::{ItemDraft, ItemId, ItemState, Priority};
use ralph_orchestrator::store::TransitionFields;

#[derive(Parser)]
#[command(name = "ralph")]
#[command(about = "Task queue and isolated workspace orchestration")]
struct Args {
    /// Directory holding item files
    #[arg(long, default_value = "./todos")]
    items_dir: PathBuf,

    /// Git repository workspaces are created from
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Root directory for workspaces
    #[arg(long, default_value = "../workspaces")]
    workspace_root: PathBuf,

    /// Managed workspace name prefix
    #[arg(long, default_value = "ralph")]
    workspace_prefix: String,

    /// Branch workspaces are created from
    #[arg(long, default_value = "main")]
    trunk: String,

    /// Command run once inside a freshly created workspace
    #[arg(long)]
    setup_command: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files
    #[arg(long, default_value = "./.ralph/logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List items, optionally filtered by state
    List {
        #[arg(long)]
        state: Option<String>,
    },
    /// Show a single item
    Get { id: String },
    /// Create a new pending item
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "p2")]
        priority: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Mark an item completed
    Complete {
        id: String,
        #[arg(long)]
        result_ref: Option<String>,
    },
    /// Mark an item blocked with a reason
    Block { id: String, reason: String },
    /// Print the next eligible item
    Next {
        #[arg(long)]
        include_ungrouped: bool,
    },
    /// Delete an item
    Delete { id: String },
    /// Workspace operations
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    /// Create a workspace on a new branch from the trunk
    Create { name: String, branch: String },
    /// Force-remove a workspace
    Delete { name: String },
    /// List workspaces
    List {
        /// Include directories outside the managed prefix
        #[arg(long)]
        all: bool,
    },
    /// Check whether a workspace exists
    Exists { name: String },
    /// Prune stale worktree registrations
    Cleanup,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    std::fs::create_dir_all(&args.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "ralph.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config {
        items_dir: args.items_dir,
        repo: args.repo,
        workspace_root: args.workspace_root,
        workspace_prefix: args.workspace_prefix,
        trunk_branch: args.trunk,
        setup_command: args.setup_command,
    };

    match args.command {
        Command::List { state } => {
            let filter = state.as_deref().map(ItemState::parse).transpose()?;
            let items = config.item_store().list(filter).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::Get { id } => {
            let item = config.item_store().get(ItemId::parse(&id)?).await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Command::Create {
            title,
            priority,
            group,
            depends_on,
            body,
        } => {
            let dependencies = depends_on
                .iter()
                .map(|raw| ItemId::parse(raw))
                .collect::<ralph_orchestrator::error::Result<Vec<_>>>()?;
            let item = config
                .item_store()
                .create(ItemDraft {
                    title,
                    priority: Some(Priority::parse(&priority)?),
                    group,
                    dependencies,
                    body,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Command::Complete { id, result_ref } => {
            let item = config
                .item_store()
                .transition(
                    ItemId::parse(&id)?,
                    ItemState::Completed,
                    TransitionFields {
                        result_ref,
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Command::Block { id, reason } => {
            let item = config
                .item_store()
                .transition(
                    ItemId::parse(&id)?,
                    ItemState::Blocked,
                    TransitionFields {
                        blocked_reason: Some(reason),
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Command::Next { include_ungrouped } => {
            let store = config.item_store();
            let items = store.list(None).await?;
            let completed: HashSet<ItemId> = items
                .iter()
                .filter(|i| i.state == ItemState::Completed)
                .map(|i| i.id)
                .collect();
            let queue = build_queue(&items, include_ungrouped);
            match next_eligible(&queue, &completed) {
                Some(item) => println!("{}", serde_json::to_string_pretty(item)?),
                None => println!("null"),
            }
        }
        Command::Delete { id } => {
            config.item_store().delete(ItemId::parse(&id)?).await?;
            println!("{{\"deleted\": \"{id}\"}}");
        }
        Command::Workspace { command } => {
            let manager = config.workspace_manager();
            match command {
                WorkspaceCommand::Create { name, branch } => {
                    let workspace = manager.create(&name, &branch).await?;
                    println!("{}", serde_json::to_string_pretty(&workspace)?);
                }
                WorkspaceCommand::Delete { name } => {
                    manager.remove(&name).await?;
                    println!("{{\"deleted\": \"{name}\"}}");
                }
                WorkspaceCommand::List { all } => {
                    let workspaces = manager.list(all).await?;
                    println!("{}", serde_json::to_string_pretty(&workspaces)?);
                }
                WorkspaceCommand::Exists { name } => {
                    let exists = manager.exists(&name).await;
                    println!("{{\"exists\": {exists}}}");
                    if !exists {
                        // Exit 0 either way; the JSON carries the answer.
                        info!(name, "Workspace does not exist");
                    }
                }
                WorkspaceCommand::Cleanup => {
                    manager.prune().await?;
                    println!("{{\"pruned\": true}}");
                }
            }
        }
    }

    Ok(())
}

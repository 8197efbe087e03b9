//! `atelier` command line: manage apps, chats, checkpoints, and MCP servers
//! against a local database.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use atelier_core::Services;
use atelier_core::Store;
use atelier_core::models::McpServerDraft;
use atelier_core::models::McpTransport;

const DB_POOL_SIZE: u32 = 4;

#[derive(Debug, Parser)]
#[command(name = "atelier", about = "Checkpointed app workspaces with MCP tools")]
struct Cli {
    /// Path to the database file. Defaults to the platform data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an app directory.
    AppAdd(AppAddArgs),
    /// Open a chat against an app.
    ChatAdd(ChatAddArgs),
    /// Checkpoint operations.
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
    /// MCP server operations.
    #[command(subcommand)]
    Mcp(McpCommand),
}

#[derive(Debug, Parser)]
struct AppAddArgs {
    /// Display name.
    #[arg(long)]
    name: String,
    /// Project directory (absolute, or relative to the home directory).
    #[arg(long)]
    path: String,
}

#[derive(Debug, Parser)]
struct ChatAddArgs {
    /// Owning app id.
    #[arg(long)]
    app: i64,
    /// Optional title.
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    /// Snapshot a chat's app directory.
    Create {
        #[arg(long)]
        chat: i64,
        /// Commit description. Defaults to a pre-change marker.
        #[arg(long)]
        description: Option<String>,
        /// Message id to attribute the checkpoint to.
        #[arg(long)]
        message: Option<i64>,
    },
    /// Restore a chat's app to a checkpoint.
    Restore {
        #[arg(long)]
        chat: i64,
        #[arg(long)]
        hash: String,
    },
    /// Roll back the edits recorded against a message.
    Undo {
        #[arg(long)]
        message: i64,
    },
    /// List a chat's checkpoints, oldest first.
    List {
        #[arg(long)]
        chat: i64,
    },
    /// Trim old checkpoint associations for a chat.
    Cleanup {
        #[arg(long)]
        chat: i64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    Http,
}

impl From<TransportArg> for McpTransport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => McpTransport::Stdio,
            TransportArg::Http => McpTransport::Http,
        }
    }
}

#[derive(Debug, Parser)]
struct ServerConfigArgs {
    /// Display name.
    #[arg(long)]
    name: String,

    #[arg(long, value_enum)]
    transport: TransportArg,

    /// Executable for stdio servers.
    #[arg(long)]
    command: Option<String>,

    /// Arguments for stdio servers; repeatable.
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Extra environment for stdio servers, KEY=VALUE; repeatable.
    #[arg(long = "env")]
    env: Vec<String>,

    /// Endpoint for http servers.
    #[arg(long)]
    url: Option<String>,

    /// Save without connecting.
    #[arg(long)]
    disabled: bool,
}

impl ServerConfigArgs {
    fn into_draft(self) -> Result<McpServerDraft> {
        let mut env = HashMap::new();
        for entry in self.env {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--env must be in KEY=VALUE format: {entry}"))?;
            env.insert(key.to_string(), value.to_string());
        }
        Ok(McpServerDraft {
            name: self.name,
            transport: Some(self.transport.into()),
            command: self.command,
            args: self.args,
            env,
            url: self.url,
            is_enabled: !self.disabled,
        })
    }
}

#[derive(Debug, Subcommand)]
enum McpCommand {
    /// Save a server and, unless disabled, connect to it.
    Add(ServerConfigArgs),
    /// List saved servers.
    List,
    /// Disconnect and delete a server.
    Rm {
        id: i64,
    },
    /// Enable a saved server and connect to it.
    Enable {
        id: i64,
    },
    /// Disable a saved server and disconnect it.
    Disable {
        id: i64,
    },
    /// Probe a configuration without saving it.
    Test(ServerConfigArgs),
    /// List tools across connected servers.
    Tools {
        /// Restrict to one server id.
        #[arg(long)]
        server: Option<i64>,
    },
    /// Invoke a tool on a connected server.
    Call {
        /// Server id.
        id: i64,
        #[arg(long)]
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long = "args")]
        arguments: Option<String>,
    },
    /// Show which enabled servers are reachable right now.
    Connected,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Store::open(&db_path, DB_POOL_SIZE)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let services = Services::new(store);

    match cli.command {
        Command::AppAdd(args) => {
            let app = services.store.insert_app(&args.name, &args.path).await?;
            print_json(&app)?;
        }
        Command::ChatAdd(args) => {
            let chat = services
                .store
                .insert_chat(args.app, args.title.as_deref())
                .await?;
            print_json(&chat)?;
        }
        Command::Checkpoint(cmd) => run_checkpoint(&services, cmd).await?,
        Command::Mcp(cmd) => run_mcp(&services, cmd).await?,
    }

    Ok(())
}

async fn run_checkpoint(services: &Services, cmd: CheckpointCommand) -> Result<()> {
    match cmd {
        CheckpointCommand::Create {
            chat,
            description,
            message,
        } => {
            let result = match description {
                Some(description) => {
                    services.create_checkpoint(chat, &description, message).await
                }
                None => services.checkpoint_before_changes(chat).await,
            };
            print_json(&result)?;
        }
        CheckpointCommand::Restore { chat, hash } => {
            let result = services.restore_checkpoint(chat, &hash).await;
            print_json(&result)?;
        }
        CheckpointCommand::Undo { message } => {
            let result = services.undo_message(message).await;
            print_json(&result)?;
        }
        CheckpointCommand::List { chat } => {
            let checkpoints = services.list_checkpoints(chat).await?;
            print_json(&checkpoints)?;
        }
        CheckpointCommand::Cleanup { chat } => {
            services.cleanup_checkpoints(chat).await;
        }
    }
    Ok(())
}

async fn run_mcp(services: &Services, cmd: McpCommand) -> Result<()> {
    match cmd {
        McpCommand::Add(args) => {
            let saved = services.add_mcp_server(args.into_draft()?).await?;
            print_json(&saved)?;
            services.shutdown().await;
        }
        McpCommand::List => {
            let servers = services.list_mcp_servers().await?;
            print_json(&servers)?;
        }
        McpCommand::Rm { id } => {
            let existed = services.delete_mcp_server(id).await?;
            if !existed {
                return Err(anyhow!("no server with id {id}"));
            }
        }
        McpCommand::Enable { id } => {
            let saved = services.toggle_mcp_server(id, true).await?;
            print_json(&saved)?;
            services.shutdown().await;
        }
        McpCommand::Disable { id } => {
            let saved = services.toggle_mcp_server(id, false).await?;
            print_json(&saved)?;
        }
        McpCommand::Test(args) => {
            let reachable = services.test_mcp_connection(args.into_draft()?).await;
            print_json(&serde_json::json!({ "reachable": reachable }))?;
            if !reachable {
                std::process::exit(1);
            }
        }
        McpCommand::Tools { server } => {
            services.initialize_mcp_servers().await?;
            let tools = services.get_mcp_tools(server).await;
            print_json(&tools)?;
            services.shutdown().await;
        }
        McpCommand::Call {
            id,
            tool,
            arguments,
        } => {
            let arguments: Option<Value> = match arguments {
                Some(raw) => Some(
                    serde_json::from_str(&raw)
                        .with_context(|| format!("failed to parse --args JSON: {raw}"))?,
                ),
                None => None,
            };
            services.initialize_mcp_servers().await?;
            let result = services.call_mcp_tool(id, tool, arguments).await;
            services.shutdown().await;
            print_json(&result?)?;
        }
        McpCommand::Connected => {
            services.initialize_mcp_servers().await?;
            let connected = services.mcp.connected_servers().await;
            print_json(&connected)?;
            services.shutdown().await;
        }
    }
    Ok(())
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| anyhow!("no data directory on this platform"))?;
    Ok(base.join("atelier").join("atelier.db"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

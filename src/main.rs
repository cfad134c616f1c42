//! MirrorClaw CLI
//!
//! Mailbox and tool-group commands run through the same handlers the voice
//! agent uses, so their output matches what a model would see. `chat` runs an
//! interactive provider session on stdin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirrorclaw::agent::{OutputSink, ProviderSession, SessionSettings, TurnOutcome};
use mirrorclaw::config::Config;
use mirrorclaw::handlers::{MailboxHandlers, McpServer};
use mirrorclaw::mailbox::MailboxStore;
use mirrorclaw::providers::{HttpTransport, ProviderKind};
use mirrorclaw::session::{ContextUsage, ImageAttachment};
use mirrorclaw::tools::ToolGroupRegistry;

/// MirrorClaw CLI
#[derive(Parser, Debug)]
#[command(name = "mirrorclaw")]
#[command(about = "Mailbox and tool orchestration for a local voice agent")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, env = "MIRRORCLAW_LOG_JSON", global = true)]
    log_json: bool,

    /// Config file (default: ~/.config/mirrorclaw/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a message to the mailbox
    Send {
        /// Sender instance id
        instance_id: String,

        /// Message text
        message: String,

        /// Thread to post in
        #[arg(short, long)]
        thread: Option<String>,

        /// Message id being replied to
        #[arg(short, long)]
        reply_to: Option<String>,

        /// Image file to attach
        #[arg(short, long)]
        image: Option<PathBuf>,
    },

    /// Read messages addressed to an instance
    Inbox {
        /// Reader instance id
        instance_id: String,

        /// Maximum messages to show
        #[arg(short, long, default_value_t = 10)]
        limit: u64,

        /// Include messages already read
        #[arg(short, long)]
        all: bool,

        /// Mark shown messages as read
        #[arg(short, long)]
        mark_read: bool,
    },

    /// Wait for a message from a sender
    Listen {
        /// Listener instance id
        instance_id: String,

        /// Sender to wait for
        from: String,

        /// Only match messages in this thread
        #[arg(short, long)]
        thread: Option<String>,

        /// Seconds to wait
        #[arg(short = 'w', long)]
        timeout: Option<u64>,
    },

    /// Instance presence
    #[command(subcommand)]
    Status(StatusCommands),

    /// Tool groups
    #[command(subcommand)]
    Groups(GroupsCommands),

    /// Call a tool with JSON arguments and print the raw result
    Tool {
        /// Tool name
        name: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,
    },

    /// Serve the tools to an MCP client over stdio
    Serve,

    /// Interactive chat with the configured provider
    Chat {
        /// Provider override (ollama, lmstudio, jan, openai, groq, ...)
        #[arg(short, long)]
        provider: Option<String>,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum StatusCommands {
    /// Record a heartbeat
    Update {
        /// Instance id
        instance_id: String,

        /// Status label
        #[arg(short, long, default_value = "active")]
        status: String,

        /// What the instance is doing
        #[arg(short, long)]
        task: Option<String>,
    },

    /// List known instances
    List,
}

#[derive(Subcommand, Debug)]
enum GroupsCommands {
    /// List groups and their status
    List,

    /// Load a group (and its dependencies)
    Load {
        /// Group name
        group: String,
    },

    /// Unload a group
    Unload {
        /// Group name
        group: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).context("Failed to load config")?,
        None => Config::load().context("Failed to load config")?,
    };
    if cli.config.is_some() {
        config.apply_env_overrides();
    }

    let data_dir = config.data_dir();
    let mailbox = MailboxStore::open(&data_dir, config.mailbox.clone())
        .await
        .with_context(|| format!("Failed to open mailbox in {}", data_dir.display()))?;
    let registry = Arc::new(ToolGroupRegistry::from_config(&config.tools));
    let handlers = Arc::new(MailboxHandlers::new(Arc::new(mailbox), registry.clone()));

    match cli.command {
        Commands::Send {
            instance_id,
            message,
            thread,
            reply_to,
            image,
        } => {
            let mut args = json!({ "instance_id": instance_id, "message": message });
            insert_opt(&mut args, "thread_id", thread);
            insert_opt(&mut args, "reply_to", reply_to);
            insert_opt(
                &mut args,
                "image_path",
                image.map(|p| p.to_string_lossy().into_owned()),
            );
            run_tool(&handlers, "voice_send", args).await
        }
        Commands::Inbox {
            instance_id,
            limit,
            all,
            mark_read,
        } => {
            let args = json!({
                "instance_id": instance_id,
                "limit": limit,
                "include_read": all,
                "mark_as_read": mark_read,
            });
            run_tool(&handlers, "voice_inbox", args).await
        }
        Commands::Listen {
            instance_id,
            from,
            thread,
            timeout,
        } => {
            let mut args = json!({ "instance_id": &instance_id, "from_sender": from });
            insert_opt(&mut args, "thread_id", thread);
            if let Some(secs) = timeout {
                args["timeout_seconds"] = json!(secs);
            }
            tokio::select! {
                result = run_tool(&handlers, "voice_listen", args) => result,
                _ = tokio::signal::ctrl_c() => {
                    let released = handlers.mailbox().lease().release(&instance_id).await;
                    info!(instance = %instance_id, released, "Listen interrupted");
                    Ok(())
                }
            }
        }
        Commands::Status(StatusCommands::Update {
            instance_id,
            status,
            task,
        }) => {
            let mut args = json!({ "action": "update", "instance_id": instance_id, "status": status });
            insert_opt(&mut args, "current_task", task);
            run_tool(&handlers, "voice_status", args).await
        }
        Commands::Status(StatusCommands::List) => {
            run_tool(&handlers, "voice_status", json!({ "action": "list" })).await
        }
        Commands::Groups(GroupsCommands::List) => {
            run_tool(&handlers, "list_tool_groups", json!({})).await
        }
        Commands::Groups(GroupsCommands::Load { group }) => {
            run_tool(&handlers, "load_tools", json!({ "group": group })).await
        }
        Commands::Groups(GroupsCommands::Unload { group }) => {
            run_tool(&handlers, "unload_tools", json!({ "group": group })).await
        }
        Commands::Tool { name, args } => {
            let args: Value = serde_json::from_str(&args).context("Arguments must be JSON")?;
            let response = handlers.call_tool(&name, &args).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::Serve => {
            info!(groups = ?registry.loaded_groups().await, "Serving MCP tools on stdio");
            Arc::new(McpServer::new(handlers)).run_stdio().await?;
            Ok(())
        }
        Commands::Chat { provider, model } => {
            if let Some(provider) = provider {
                config.provider.kind = provider;
            }
            if model.is_some() {
                config.provider.model = model;
            }
            cmd_chat(&config, handlers, registry).await
        }
    }
}

fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn insert_opt(args: &mut Value, key: &str, value: Option<String>) {
    if let Some(value) = value {
        args[key] = Value::String(value);
    }
}

async fn run_tool(handlers: &MailboxHandlers, name: &str, args: Value) -> Result<()> {
    let response = handlers.call_tool(name, &args).await;
    let text = response.text_content();
    if response.is_error {
        anyhow::bail!(text);
    }
    println!("{}", text);
    if let Some(image) = response.first_image() {
        println!("[image: {}, {} base64 chars]", image.mime_type, image.data.len());
    }
    Ok(())
}

/// Writes streamed output to the terminal.
struct TerminalSink;

impl OutputSink for TerminalSink {
    fn on_token(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn on_tool_start(&self, name: &str, _args: &Value) {
        eprintln!("\n[tool] {}", name);
    }

    fn on_tool_end(&self, name: &str, success: bool, _summary: &str) {
        if !success {
            eprintln!("[tool] {} failed", name);
        }
    }

    fn on_context_usage(&self, usage: ContextUsage) {
        info!(used = usage.used, limit = usage.limit, "Context usage");
    }

    fn on_notice(&self, text: &str) {
        eprintln!("\n[{}]", text);
    }

    fn on_error(&self, message: &str) {
        eprintln!("\n[error] {}", message);
    }

    fn on_turn_end(&self, outcome: &TurnOutcome) {
        match outcome {
            TurnOutcome::Completed { .. } => println!(),
            TurnOutcome::Cancelled => println!("\n[interrupted]"),
            TurnOutcome::TimedOut => println!("\n[timed out]"),
            TurnOutcome::MaxIterations { .. } | TurnOutcome::Failed { .. } => println!(),
        }
    }
}

async fn cmd_chat(
    config: &Config,
    handlers: Arc<MailboxHandlers>,
    registry: Arc<ToolGroupRegistry>,
) -> Result<()> {
    let settings = SessionSettings::from_config(&config.provider)?;
    let kind: ProviderKind = settings.kind;
    if kind.requires_api_key() && config.provider.api_key.is_none() {
        warn!(provider = %kind, "No API key configured; set MIRRORCLAW_API_KEY");
    }

    let transport = HttpTransport::new(
        kind,
        config.provider.base_url.as_deref(),
        config.provider.api_key.clone(),
    )?;
    println!(
        "Chatting with {} ({}) at {}",
        kind.display_name(),
        settings.model,
        transport.url()
    );
    println!("Commands: /clear, /image <path> <text>, /quit. Ctrl-C interrupts a reply.\n");

    let session = Arc::new(ProviderSession::new(
        settings,
        Arc::new(transport),
        handlers,
        registry,
        Arc::new(TerminalSink),
    ));
    session.start().await;

    let interrupter = {
        let session = session.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                session.interrupt();
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear().await;
                println!("History cleared.");
                continue;
            }
            _ => {}
        }

        let (text, image) = match line.strip_prefix("/image ") {
            Some(rest) => {
                let (path, text) = rest.split_once(' ').unwrap_or((rest, "What is in this image?"));
                match ImageAttachment::from_path(std::path::Path::new(path)).await {
                    Ok(image) => (text.to_string(), Some(image)),
                    Err(e) => {
                        eprintln!("[error] {}", e);
                        continue;
                    }
                }
            }
            None => (line.to_string(), None),
        };

        session.send_input(&text, image).await?;
    }

    session.stop().await;
    interrupter.abort();
    Ok(())
}

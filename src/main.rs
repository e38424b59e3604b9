use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use relay_client::{ClientConfig, HttpTransport};
use relay_core::actions::ProposedAction;
use relay_core::errors::ActionError;
use relay_core::events::ChatEvent;
use relay_core::ids::ActionId;
use relay_core::request::PageContext;
use relay_engine::{ActionRegistry, ChatEngine, SessionOptions, TurnError, TurnState};
use relay_settings::{load_settings_from_path, settings_path, RelaySettings};
use relay_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "relay", version, about = "Streaming chat client for the planning assistant")]
struct Cli {
    /// Settings file (default: ~/.relay/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive conversation
    Chat(ChatArgs),
    /// Print the effective settings (token omitted)
    Config,
}

#[derive(Args)]
struct ChatArgs {
    /// Server base URL, overriding settings
    #[arg(long)]
    base_url: Option<String>,
    /// Page the conversation is grounded in, e.g. `project` or `task`
    #[arg(long)]
    page_type: Option<String>,
    #[arg(long, requires = "page_type")]
    page_id: Option<String>,
    #[arg(long, requires = "page_type")]
    project_id: Option<String>,
    #[arg(long, requires = "page_type")]
    page_name: Option<String>,
    /// Let the assistant run ad-hoc queries
    #[arg(long)]
    dynamic_queries: bool,
}

impl ChatArgs {
    fn page_context(&self) -> Option<PageContext> {
        let page_type = self.page_type.as_ref()?;
        Some(PageContext {
            page_type: page_type.clone(),
            id: self.page_id.clone(),
            project_id: self.project_id.clone(),
            name: self.page_name.clone(),
        })
    }
}

/// A REPL line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Message(String),
    Pending,
    Show(ActionId),
    Approve(ActionId),
    Reject(ActionId, Option<String>),
    New,
    Help,
    Quit,
    Unknown(String),
}

impl Input {
    fn parse(raw: &str) -> Option<Self> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Message(raw.to_string()));
        };

        let mut parts = command.splitn(3, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let id = parts.next().map(ActionId::from_raw);
        let rest = parts
            .next()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        Some(match (name, id) {
            ("pending", _) => Self::Pending,
            ("show", Some(id)) => Self::Show(id),
            ("approve", Some(id)) => Self::Approve(id),
            ("reject", Some(id)) => Self::Reject(id, rest),
            ("new", _) => Self::New,
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        })
    }
}

const HELP: &str = "\
commands:
  /pending                 list actions awaiting a decision
  /show <id>               print an action and its diff
  /approve <id>            approve and execute an action
  /reject <id> [reason]    reject an action
  /new                     start a new conversation
  /quit                    exit
anything else is sent as a message; ctrl-c cancels a streaming answer";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;

    let telemetry = TelemetryConfig::from_levels(
        &settings.logging.level,
        settings
            .logging
            .module_levels
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        settings.logging.json,
    );
    init_telemetry(&telemetry).context("initializing logging")?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Chat(args) => {
            if let Some(base_url) = &args.base_url {
                settings.server.base_url = base_url.clone();
            }
            run_chat(settings, args).await
        }
    }
}

async fn run_chat(settings: RelaySettings, args: ChatArgs) -> Result<()> {
    let server = settings.server;
    let connect_timeout = server.connect_timeout();
    let transport = Arc::new(
        HttpTransport::new(ClientConfig {
            base_url: server.base_url.clone(),
            chat_path: server.chat_path,
            actions_path: server.actions_path,
            connect_timeout,
            api_token: server.api_token,
        })
        .context("building HTTP client")?,
    );
    let registry = Arc::new(ActionRegistry::new(transport.clone()));
    let mut engine = ChatEngine::new(
        transport,
        Arc::clone(&registry),
        SessionOptions {
            history_limit: settings.chat.history_limit,
            use_dynamic_queries: (args.dynamic_queries || settings.chat.use_dynamic_queries)
                .then_some(true),
        },
    );
    engine.set_page_context(args.page_context());

    tracing::info!(base_url = %server.base_url, "chat session started");
    println!("connected to {} (/help for commands)", server.base_url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            break;
        };
        let Some(input) = Input::parse(&line) else {
            continue;
        };

        match input {
            Input::Message(text) => send(&mut engine, &text).await?,
            Input::Pending => print_pending(&registry.pending()),
            Input::Show(id) => match registry.get(&id) {
                Some(action) => println!("{}", serde_json::to_string_pretty(&action)?),
                None => println!("no action {id}"),
            },
            Input::Approve(id) => match registry.approve(&id).await {
                Ok(resolution) => println!("executed {id}: {}", resolution.message),
                Err(e) => print_action_error(&e),
            },
            Input::Reject(id, reason) => match registry.reject(&id, reason.as_deref()).await {
                Ok(Some(resolution)) => println!("rejected {id}: {}", resolution.message),
                Ok(None) => println!("rejected {id} (server was not notified)"),
                Err(e) => print_action_error(&e),
            },
            Input::New => {
                engine.session_mut().reset()?;
                registry.prune_terminal();
                println!("new conversation");
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Unknown(raw) => println!("unknown command {raw:?}, try /help"),
        }
    }
    Ok(())
}

async fn send(engine: &mut ChatEngine, text: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut thinking = false;
    let result = engine
        .send(text, &cancel, |event, _message| {
            let mut out = std::io::stdout().lock();
            let _ = match event {
                ChatEvent::Text { content } | ChatEvent::TextDelta { content } => {
                    if std::mem::take(&mut thinking) {
                        let _ = writeln!(out);
                    }
                    write!(out, "{content}")
                }
                ChatEvent::Thinking { .. } if !thinking => {
                    thinking = true;
                    write!(out, "(thinking…)")
                }
                ChatEvent::ToolCall { tool, .. } => writeln!(out, "\n  → {tool}"),
                ChatEvent::ActionPreview(action) => writeln!(
                    out,
                    "\n  ! proposed {}: {} ({} change(s)), /approve {} or /reject {}",
                    action.id,
                    action.description,
                    action.diff.len(),
                    action.id,
                    action.id
                ),
                ChatEvent::Done { .. } => writeln!(out),
                ChatEvent::Error { message, .. } => writeln!(out, "\n  error: {message}"),
                _ => Ok(()),
            };
            let _ = out.flush();
        })
        .await;
    watcher.abort();

    match result {
        Ok(report) if report.state == TurnState::Errored => {
            tracing::debug!(events = report.events, "turn ended with error event");
        }
        Ok(_) => {}
        Err(e) if e.is_cancelled() => println!("\n  (cancelled)"),
        Err(TurnError::Transport(e)) => println!("\n  request failed: {e}"),
        Err(TurnError::Session(e)) => println!("  {e}"),
    }
    Ok(())
}

fn print_pending(actions: &[ProposedAction]) {
    if actions.is_empty() {
        println!("no pending actions");
        return;
    }
    for action in actions {
        let expires = action
            .expires_at
            .map(|at| format!(", expires {}", at.format("%H:%M:%S")))
            .unwrap_or_default();
        println!(
            "  {}  {} [{}]{}",
            action.id, action.description, action.tool_name, expires
        );
    }
}

fn print_action_error(e: &ActionError) {
    match e {
        ActionError::Backend { .. } => println!("{e}; the action is still pending"),
        other => println!("{other}"),
    }
}

fn prompt() -> Result<()> {
    let mut out = std::io::stdout().lock();
    write!(out, "> ")?;
    out.flush()?;
    Ok(())
}

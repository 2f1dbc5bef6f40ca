//! A3S Code - terminal AI coding assistant
//!
//! One-shot mode (`-p`) runs a single prompt with tools auto-approved and
//! exits; without a prompt an interactive REPL starts.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use a3s_code::store::{self, SessionStore};
use a3s_code::telemetry::{self, LogConfig};
use a3s_code::todo::render_todos;
use a3s_code::{
    AgentEvent, ApprovalScope, Attachment, CodeConfig, CodeError, Message, Part, PermissionDecision,
    PermissionEvent, RunHandle, SessionManager,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Longest tool input or result excerpt shown inline
const PREVIEW_CHARS: usize = 120;

#[derive(Parser)]
#[command(name = "a3s-code")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Terminal AI coding assistant")]
struct Cli {
    /// Run one prompt non-interactively and exit
    #[arg(short, long)]
    prompt: Option<String>,

    /// Output format for one-shot mode
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Resume an existing session
    #[arg(short, long)]
    session: Option<String>,

    /// Workspace root; tools cannot reach outside it
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Configuration file path (.toml or .json)
    #[arg(short, long, env = "A3S_CODE_CONFIG")]
    config: Option<PathBuf>,

    /// Provider name from the configuration
    #[arg(long)]
    provider: Option<String>,

    /// Model override
    #[arg(short, long)]
    model: Option<String>,

    /// Attach a file to the first prompt (repeatable)
    #[arg(short = 'a', long = "attach", value_name = "FILE")]
    attach: Vec<PathBuf>,

    /// Approve every gated tool call without asking
    #[arg(long)]
    yolo: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsCommand,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List sessions, most recent first
    List,
    /// Show a session and its messages
    Show { id: String },
    /// Delete a session
    Delete { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = cli.format;
    match run_cli(cli).await {
        Ok(code) => code,
        Err(e) => {
            match format {
                OutputFormat::Json => println!("{}", json!({ "error": format!("{:#}", e) })),
                OutputFormat::Text => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to determine current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} is not accessible", workspace.display()))?;

    let config = CodeConfig::load(cli.config.as_deref(), &workspace)
        .context("failed to load configuration")?;
    let log = if cli.verbose {
        LogConfig {
            level: "debug".to_string(),
            ..config.log.clone()
        }
    } else {
        config.log.clone()
    };
    telemetry::init_tracing(&log);

    if let Some(Commands::Sessions { action }) = cli.command {
        let store = store::open_store(&config.storage)
            .await
            .context("failed to open session store")?;
        run_sessions_command(store.as_ref(), action, cli.format).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let manager = SessionManager::from_config(
        &config,
        cli.provider.as_deref(),
        cli.model.as_deref(),
        &workspace,
    )
    .await
    .context("failed to initialize agent")?;

    let attachments = load_attachments(&cli.attach).await?;
    match cli.prompt {
        Some(prompt) => {
            run_once(&manager, cli.session.as_deref(), &prompt, attachments, cli.format).await
        }
        None => {
            run_repl(&manager, cli.session.as_deref(), attachments, cli.yolo).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn load_attachments(paths: &[PathBuf]) -> Result<Vec<Attachment>> {
    let mut attachments = Vec::with_capacity(paths.len());
    for path in paths {
        attachments.push(load_attachment(path).await?);
    }
    Ok(attachments)
}

async fn load_attachment(path: &Path) -> Result<Attachment> {
    Attachment::from_path(path)
        .await
        .with_context(|| format!("cannot attach {}", path.display()))
}

async fn open_or_create(manager: &SessionManager, session: Option<&str>) -> Result<String> {
    match session {
        Some(id) => Ok(manager
            .get_session(id)
            .await
            .with_context(|| format!("cannot resume session {}", id))?
            .id),
        None => Ok(manager.create_session("").await?.id),
    }
}

// ---------------------------------------------------------------------------
// One-shot mode
// ---------------------------------------------------------------------------

async fn run_once(
    manager: &SessionManager,
    session: Option<&str>,
    prompt: &str,
    attachments: Vec<Attachment>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let session_id = open_or_create(manager, session).await?;
    // Nobody is around to answer permission prompts. Gate only: a later
    // interactive resume of this session still asks.
    manager.gate().set_auto_approve(&session_id, true).await;

    let mut handle = manager.run(&session_id, prompt, attachments).await?;
    while let Some(event) = handle.next_event().await {
        if format == OutputFormat::Text {
            render_event(&event);
        }
    }

    match handle.wait().await {
        Ok(outcome) => {
            match format {
                OutputFormat::Text => println!(),
                OutputFormat::Json => println!(
                    "{}",
                    json!({
                        "session_id": session_id,
                        "text": outcome.text,
                        "usage": outcome.usage,
                        "cost_usd": outcome.cost_usd,
                    })
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            match format {
                OutputFormat::Text => eprintln!("\nError: {}", e),
                OutputFormat::Json => println!(
                    "{}",
                    json!({ "session_id": session_id, "error": e.to_string(), "code": e.code() })
                ),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

// ---------------------------------------------------------------------------
// Interactive mode
// ---------------------------------------------------------------------------

async fn run_repl(
    manager: &SessionManager,
    session: Option<&str>,
    mut pending: Vec<Attachment>,
    yolo: bool,
) -> Result<()> {
    let mut session_id = open_or_create(manager, session).await?;
    if yolo {
        manager.gate().set_auto_approve(&session_id, true).await;
    }
    let mut permissions = manager.gate().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!(
        "a3s-code {} | model {} | workspace {}",
        env!("CARGO_PKG_VERSION"),
        manager.model(),
        manager.workspace().display()
    );
    eprintln!("session {} | /attach <file> /todos /new /exit", session_id);

    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/todos" => {
                println!("{}", render_todos(&manager.todos(&session_id).await?));
                continue;
            }
            "/new" => {
                session_id = manager.create_session("").await?.id;
                if yolo {
                    manager.gate().set_auto_approve(&session_id, true).await;
                }
                eprintln!("session {}", session_id);
                continue;
            }
            _ => {}
        }
        if let Some(path) = line.strip_prefix("/attach ") {
            match load_attachment(Path::new(path.trim())).await {
                Ok(attachment) => {
                    eprintln!("attached {} to the next prompt", attachment.name);
                    pending.push(attachment);
                }
                Err(e) => eprintln!("Error: {:#}", e),
            }
            continue;
        }

        let handle = match manager.run(&session_id, line, std::mem::take(&mut pending)).await {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("Error: {}", e);
                continue;
            }
        };
        drive_run(manager, handle, &mut permissions, &mut lines).await?;
    }
    Ok(())
}

/// Render events and answer permission requests until the run ends
async fn drive_run(
    manager: &SessionManager,
    mut handle: RunHandle,
    permissions: &mut broadcast::Receiver<PermissionEvent>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    let cancel = handle.cancel_token();
    let session_id = handle.session_id.clone();
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => render_event(&event),
                None => break,
            },
            permission = permissions.recv() => match permission {
                Ok(PermissionEvent::Requested(request)) if request.session_id == session_id => {
                    eprintln!("\nAllow {}? [y]es / [a]lways this session / [n]o", request.description);
                    let (decision, scope) = ask_permission(lines, &cancel).await?;
                    manager.gate().resolve(&request.id, decision, scope).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} permission events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("\nCancelling...");
                cancel.cancel();
            }
        }
    }

    match handle.wait().await {
        Ok(outcome) => eprintln!(
            "\n[{} rounds | {} tokens | ${:.4}]",
            outcome.rounds, outcome.usage.total_tokens, outcome.cost_usd
        ),
        Err(CodeError::Cancelled) => eprintln!("\n[cancelled]"),
        Err(e) => eprintln!("\nError: {}", e),
    }
    Ok(())
}

async fn ask_permission(
    lines: &mut Lines<BufReader<Stdin>>,
    cancel: &CancellationToken,
) -> Result<(PermissionDecision, ApprovalScope)> {
    loop {
        eprint!("permission> ");
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read input")?,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                return Ok((PermissionDecision::Deny, ApprovalScope::Once));
            }
        };
        let Some(line) = line else {
            return Ok((PermissionDecision::Deny, ApprovalScope::Once));
        };
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok((PermissionDecision::Approve, ApprovalScope::Once)),
            "a" | "always" => return Ok((PermissionDecision::Approve, ApprovalScope::Session)),
            "n" | "no" => return Ok((PermissionDecision::Deny, ApprovalScope::Once)),
            _ => eprintln!("Answer y, a or n"),
        }
    }
}

fn render_event(event: &AgentEvent) {
    match event {
        AgentEvent::TextDelta { text } => {
            print!("{}", text);
            std::io::stdout().flush().ok();
        }
        AgentEvent::ToolCallComplete {
            name, input, error, ..
        } => match error {
            Some(error) => eprintln!("\n-> {} (malformed arguments: {})", name, error),
            None => eprintln!("\n-> {} {}", name, preview(&input.to_string())),
        },
        AgentEvent::ToolResult {
            content, is_error, ..
        } => {
            if *is_error {
                eprintln!("   error: {}", preview(content));
            } else {
                eprintln!("   ok: {}", preview(content));
            }
        }
        AgentEvent::PermissionDenied { tool_name, .. } => {
            eprintln!("   {} denied", tool_name);
        }
        AgentEvent::Continuation { count, .. } => {
            eprintln!("\n[continuing with open todos ({})]", count);
        }
        AgentEvent::TodosUpdated { todos } => {
            eprintln!("{}", render_todos(todos));
        }
        _ => {}
    }
}

fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or("");
    let mut out: String = first.chars().take(PREVIEW_CHARS).collect();
    if first.chars().count() > PREVIEW_CHARS || text.lines().nth(1).is_some() {
        out.push_str(" ...");
    }
    out
}

// ---------------------------------------------------------------------------
// Session commands
// ---------------------------------------------------------------------------

async fn run_sessions_command(
    store: &dyn SessionStore,
    action: SessionsCommand,
    format: OutputFormat,
) -> Result<()> {
    match action {
        SessionsCommand::List => {
            let sessions = store.list_sessions().await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
                return Ok(());
            }
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for session in sessions {
                println!(
                    "{}  {}  {:>8} tok  {}",
                    session.id,
                    session.updated_at.format("%Y-%m-%d %H:%M"),
                    session.usage.total_tokens,
                    if session.title.is_empty() { "(untitled)" } else { &session.title }
                );
            }
        }
        SessionsCommand::Show { id } => {
            let session = store
                .get_session(&id)
                .await?
                .with_context(|| format!("session {} not found", id))?;
            let messages = store.list_messages(&id).await?;
            if format == OutputFormat::Json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "session": session, "messages": messages }))?
                );
                return Ok(());
            }
            println!("{} {}", session.id, session.title);
            println!(
                "{} tokens, ${:.4}, {} messages",
                session.usage.total_tokens,
                session.cost_usd,
                messages.len()
            );
            if !session.todos.is_empty() {
                println!("{}", render_todos(&session.todos));
            }
            for message in &messages {
                print_message(message);
            }
        }
        SessionsCommand::Delete { id } => {
            if !store.delete_session(&id).await? {
                anyhow::bail!("session {} not found", id);
            }
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!("\n[{:?}]", message.role);
    for part in &message.parts {
        match part {
            Part::Text { text } => println!("{}", text),
            Part::ToolCall { name, input, .. } => {
                println!("-> {} {}", name, preview(&input.to_string()));
            }
            Part::ToolResult {
                content, is_error, ..
            } => {
                let tag = if *is_error { "error" } else { "result" };
                println!("<- {}: {}", tag, preview(content));
            }
        }
    }
}

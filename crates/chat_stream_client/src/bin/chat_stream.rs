//! chat-stream: terminal client for a streaming chat service.
//! Reads config, connects over WebSocket, sends prompts from the command line or
//! stdin, and prints each answer as it streams in.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chat_stream_client::config;
use chat_stream_client::{
    ConnectionState, Notice, RequestOptions, Role, SessionController, SessionError,
    WebSocketConnector,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "chat-stream", version)]
#[command(about = "Chat with a streaming response service", long_about = None)]
struct Cli {
    /// Config file path (default: CHAT_STREAM_CONFIG or ~/.chat-stream/config.yaml)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Server URL, overriding server.url from the config
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Prompt to send. When omitted, each stdin line is a prompt
    /// (`/clear`, `/retry`, `/quit` are commands).
    prompt: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// `--config`, then `CHAT_STREAM_CONFIG`, then the default path (optional).
fn load_config(flag: Option<PathBuf>) -> anyhow::Result<config::Config> {
    let explicit = flag.or_else(|| std::env::var_os("CHAT_STREAM_CONFIG").map(PathBuf::from));
    if let Some(path) = explicit {
        return config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    match config::default_config_path() {
        Some(path) if path.exists() => config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        _ => Ok(config::Config::default()),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = load_config(cli.config)?;
    let url = cli.url.unwrap_or_else(|| cfg.server.url.clone());
    let connector = WebSocketConnector::new(url.clone()).with_connect_timeout(cfg.connect_timeout());
    let session = SessionController::spawn(cfg.session_config(), connector);

    if session.connect().await? != ConnectionState::Open {
        bail!("connection to {} failed", url);
    }

    match cli.prompt {
        Some(prompt) => ask(&session, &prompt).await?,
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let input = line.trim();
                match input {
                    "" => continue,
                    "/quit" | "/exit" => break,
                    "/clear" => session.clear_history().await?,
                    "/retry" => {
                        if session.reconnect_now().await? == ConnectionState::Open {
                            eprintln!("Connected.");
                        } else {
                            eprintln!("Error: still disconnected, retrying in the background");
                        }
                    }
                    prompt => ask(&session, prompt).await?,
                }
            }
        }
    }

    session.close().await?;
    Ok(())
}

/// Sends one prompt and streams the reply to stdout until it is finalized.
async fn ask(session: &SessionController, prompt: &str) -> anyhow::Result<()> {
    let mut conversation = session.conversation();
    let mut streaming = session.streaming_text();
    let mut notices = session.notices();
    let baseline = conversation.borrow_and_update().len();
    streaming.borrow_and_update();

    match session.send_prompt(prompt, RequestOptions::default()).await {
        Ok(()) => {}
        Err(e @ (SessionError::NotConnected(_) | SessionError::EmptyPrompt)) => {
            eprintln!("{}", e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let mut stdout = std::io::stdout();
    let mut shown = String::new();
    loop {
        tokio::select! {
            changed = streaming.changed() => {
                changed?;
                let text = streaming.borrow_and_update().clone();
                if let Some(rest) = text.strip_prefix(shown.as_str()) {
                    write!(stdout, "{}", rest)?;
                    stdout.flush()?;
                    shown = text;
                } else if text.is_empty() {
                    shown.clear();
                }
            }
            changed = conversation.changed() => {
                changed?;
                let log = conversation.borrow_and_update().clone();
                if let Some(reply) = log.iter().skip(baseline).find(|m| m.role != Role::User) {
                    match reply.content.strip_prefix(shown.as_str()) {
                        Some(rest) => writeln!(stdout, "{}", rest)?,
                        None => writeln!(stdout, "\n{}", reply.content)?,
                    }
                    stdout.flush()?;
                    return Ok(());
                }
            }
            notice = notices.recv() => match notice {
                Ok(Notice::ConnectionLost) => bail!("connection lost, giving up"),
                Ok(Notice::Reconnecting { attempt, delay }) => {
                    eprintln!(
                        "Disconnected; reconnect attempt {} in {:.1}s",
                        attempt,
                        delay.as_secs_f64()
                    );
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("session stopped"),
            },
        }
    }
}

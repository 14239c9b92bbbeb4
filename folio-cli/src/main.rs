// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Folio CLI
//!
//! Terminal client for the portfolio chat endpoint. Applies the local
//! session guard before every request, the same advisory limit the site
//! enforces in the browser; the server's per-IP limiter stays authoritative.

mod client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::{ChatClient, History, SendOutcome};
use folio_core::{
    BlockReason, ChatMessage, FileStorage, Page, SessionGuard, SessionLimits, SessionStorage,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Folio - chat with a portfolio assistant", long_about = None)]
struct Cli {
    /// Chat server base URL
    #[arg(short, long, env = "FOLIO_SERVER_URL", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Site page the questions are about
    #[arg(short, long, default_value = "home", value_parser = parse_page)]
    page: Page,

    /// Directory holding the local session state
    #[arg(long, env = "FOLIO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation
    Chat,

    /// Ask a single question
    Ask {
        /// The question
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Show the local message allowance and server health
    Status,

    /// Clear the local session
    Reset,
}

fn parse_page(value: &str) -> Result<Page, String> {
    value.parse().map_err(|_| {
        let pages: Vec<_> = Page::ALL.iter().map(|p| p.as_str()).collect();
        format!("expected one of: {}", pages.join(", "))
    })
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("folio"))
        .unwrap_or_else(|| PathBuf::from("./folio-data"))
}

fn block_message<S: SessionStorage>(guard: &SessionGuard<S>, reason: BlockReason) -> String {
    match reason {
        BlockReason::RateLimit => format!(
            "You've reached the message limit. Try again in {} minute(s).",
            guard.minutes_until_reset()
        ),
        BlockReason::Cooldown => "Please wait a moment before sending another message.".to_string(),
    }
}

/// Send one question, honouring the session guard. Returns false when the
/// message was not answered.
async fn ask<S: SessionStorage>(
    client: &ChatClient,
    guard: &SessionGuard<S>,
    history: &mut History,
    page: Page,
    message: &str,
) -> Result<bool> {
    let check = guard.can_send();
    if let Some(reason) = check.reason {
        println!("✗ {}", block_message(guard, reason));
        return Ok(false);
    }

    let outcome = client
        .send(message, page, history.turns())
        .await
        .context("Failed to reach the chat server")?;

    match outcome {
        SendOutcome::Reply(reply) => {
            guard.increment()?;
            history.push(ChatMessage::user(message));
            history.push(ChatMessage::assistant(reply.clone()));
            println!("{}", reply);
            debug!(remaining = guard.remaining(), "Message sent");
            Ok(true)
        }
        SendOutcome::Throttled { message, reset_in } => {
            match reset_in {
                Some(seconds) => println!(
                    "✗ {} (try again in {} minute(s))",
                    message,
                    (seconds + 59) / 60
                ),
                None => println!("✗ {}", message),
            }
            Ok(false)
        }
        SendOutcome::Rejected { status, message } => {
            println!("✗ {} ({})", message, status);
            Ok(false)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Continue,
    Quit,
}

/// Handle one REPL line. Send failures are reported and the session carries on.
async fn handle_line<S: SessionStorage>(
    client: &ChatClient,
    guard: &SessionGuard<S>,
    history: &mut History,
    page: &mut Page,
    line: &str,
) -> LineOutcome {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit" | "/exit", _) => return LineOutcome::Quit,
        ("/page", name) => match parse_page(name.trim()) {
            Ok(next) => {
                *page = next;
                println!("✓ Now asking about {}", page.label());
            }
            Err(e) => println!("✗ {}", e),
        },
        ("/status", _) => print_allowance(guard),
        ("/clear", _) => {
            history.clear();
            println!("✓ Conversation cleared");
        }
        _ => {
            if let Err(e) = ask(client, guard, history, *page, line).await {
                println!("✗ {:#}", e);
            }
        }
    }
    LineOutcome::Continue
}

async fn run_chat<S: SessionStorage>(
    client: &ChatClient,
    guard: &SessionGuard<S>,
    mut page: Page,
) -> Result<()> {
    let mut history = History::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Chatting about {} ({} messages left).", page.label(), guard.remaining());
    println!("Commands: /page <name>, /status, /clear, /quit");

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

        if handle_line(client, guard, &mut history, &mut page, line).await == LineOutcome::Quit {
            break;
        }
    }

    Ok(())
}

fn print_allowance<S: SessionStorage>(guard: &SessionGuard<S>) {
    let session = guard.session();
    let limits = guard.limits();
    println!(
        "Messages left: {}/{}",
        guard.remaining(),
        limits.max_messages
    );
    if session.count > 0 {
        let resets = chrono::DateTime::from_timestamp_millis(session.reset_at)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "Window resets in {} minute(s) (at {})",
            guard.minutes_until_reset(),
            resets
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let storage = FileStorage::new(&data_dir)
        .with_context(|| format!("Failed to open session directory {:?}", data_dir))?;
    debug!(dir = %storage.dir().display(), "Session storage opened");
    let guard = SessionGuard::new(storage, SessionLimits::default());
    let client = ChatClient::new(&cli.server, Duration::from_secs(cli.timeout))?;

    match cli.command {
        Commands::Chat => run_chat(&client, &guard, cli.page).await?,

        Commands::Ask { message } => {
            let message = message.join(" ");
            let mut history = History::default();
            if !ask(&client, &guard, &mut history, cli.page, &message).await? {
                std::process::exit(1);
            }
        }

        Commands::Status => {
            print_allowance(&guard);
            match client.health().await {
                Ok(health) => println!("Server: {} ({})", health.status, health.message),
                Err(e) => println!("Server: unreachable ({})", e),
            }
        }

        Commands::Reset => {
            guard.reset()?;
            println!("✓ Local session cleared");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::MemoryStorage;

    fn setup(url: &str) -> (ChatClient, SessionGuard<MemoryStorage>) {
        let client = ChatClient::new(url, Duration::from_secs(5)).unwrap();
        let guard = SessionGuard::new(MemoryStorage::new(), SessionLimits::default());
        (client, guard)
    }

    #[tokio::test]
    async fn test_send_failure_keeps_session_running() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let (client, guard) = setup(&server.url());
        let mut history = History::default();
        let mut page = Page::Home;

        let outcome = handle_line(&client, &guard, &mut history, &mut page, "hello").await;

        mock.assert_async().await;
        assert_eq!(outcome, LineOutcome::Continue);
        assert!(history.turns().is_empty());
        assert_eq!(guard.session().count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_session_running() {
        let (client, guard) = setup("http://127.0.0.1:9");
        let mut history = History::default();
        let mut page = Page::Home;

        let outcome = handle_line(&client, &guard, &mut history, &mut page, "hello").await;
        assert_eq!(outcome, LineOutcome::Continue);
        assert_eq!(guard.session().count, 0);
    }

    #[tokio::test]
    async fn test_commands() {
        let (client, guard) = setup("http://127.0.0.1:9");
        let mut history = History::default();
        history.push(ChatMessage::user("hi"));
        let mut page = Page::Home;

        let outcome =
            handle_line(&client, &guard, &mut history, &mut page, "/page projects").await;
        assert_eq!(outcome, LineOutcome::Continue);
        assert_eq!(page, Page::Projects);

        handle_line(&client, &guard, &mut history, &mut page, "/clear").await;
        assert!(history.turns().is_empty());

        let outcome = handle_line(&client, &guard, &mut history, &mut page, "/quit").await;
        assert_eq!(outcome, LineOutcome::Quit);
    }
}

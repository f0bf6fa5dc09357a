//! `parley chat` — Interactive or single-message chat through the gateway.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use parley_client::{
    Applied, ConversationSession, HttpStore, HttpTransport, TurnDriver, TurnReport, TurnStatus,
};
use parley_config::AppConfig;
use parley_core::message::Role;
use parley_core::store::ConversationStore;
use parley_core::stream::StreamEvent;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(
    thread: Option<String>,
    org: String,
    user: String,
    message: Option<String>,
) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let url = config.client_url();

    let store = Arc::new(HttpStore::new(&url));
    let transport = Arc::new(HttpTransport::new(&url));

    let (thread_id, history) = match thread {
        Some(id) => {
            let history = store
                .history(&id, &org)
                .await
                .with_context(|| format!("Failed to load thread {id} from {url}"))?;
            (id, history)
        }
        None => (uuid::Uuid::new_v4().to_string(), Vec::new()),
    };

    let driver = TurnDriver::new(transport, store, user).with_persist_retries(config.client.persist_retries);
    let mut session = ConversationSession::new(thread_id, org, history);

    if let Some(text) = message {
        let report = run_turn(&driver, &mut session, &text).await?;
        return match report.status {
            TurnStatus::Completed => Ok(()),
            TurnStatus::Failed(_) => anyhow::bail!("Turn failed"),
        };
    }

    println!();
    println!("  Parley — interactive chat");
    println!("  Gateway: {url}");
    println!("  Thread:  {}", session.thread_id());
    println!("  Type your message and press Enter. Type 'exit' to quit.");
    println!();

    for past in session.transcript() {
        let who = if past.role == Role::User { "You" } else { "Assistant" };
        println!("  {who} > {}", past.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        run_turn(&driver, &mut session, line).await?;
        println!();
    }

    Ok(())
}

/// Drive one turn, rendering tokens as they stream and tool blocks as they change.
async fn run_turn(driver: &TurnDriver, session: &mut ConversationSession, text: &str) -> anyhow::Result<TurnReport> {
    let notices_before = session.notices().len();
    let mut answering = false;
    let mut reported = false;

    let report = driver
        .run_turn(session, text, &[], |session, event, applied| {
            if *applied == Applied::Ignored {
                return;
            }
            match event {
                StreamEvent::Token { text } => {
                    if !answering {
                        print!("  Assistant > ");
                        answering = true;
                    }
                    print!("{text}");
                }
                StreamEvent::ToolStart { call_id, .. } | StreamEvent::ToolEnd { call_id, .. } => {
                    if answering {
                        println!();
                        answering = false;
                    }
                    if let Some(block) = session.tool_block(call_id) {
                        println!("    {}", block.render());
                    }
                }
                StreamEvent::Error { message } => {
                    if answering {
                        println!();
                    }
                    eprintln!("  [Error] {message}");
                    reported = true;
                }
                StreamEvent::Done => {
                    if answering {
                        println!();
                    }
                }
            }
            let _ = std::io::stdout().flush();
        })
        .await?;

    // In-band errors were already printed by the callback
    if let TurnStatus::Failed(reason) = &report.status
        && !reported
    {
        if answering {
            println!();
        }
        eprintln!("  [Error] {reason}");
    }
    if !report.frame_errors.is_empty() {
        tracing::warn!(count = report.frame_errors.len(), "Malformed frames skipped");
    }
    for notice in &session.notices()[notices_before..] {
        eprintln!("  [Notice] {notice}");
    }
    Ok(report)
}

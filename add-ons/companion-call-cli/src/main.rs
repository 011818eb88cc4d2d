//! Companion call console.
//!
//! Places voice calls to a companion from the terminal. Typed lines are treated as
//! recognized speech; replies are played on the default speaker.
//!
//! Commands: `/call <companion_id> [name]`, `/end`, `/quit`. Anything else is spoken.

mod console;
mod ws;

use companion_voice::{
    CallCommand, CallConfig, CallDependencies, CallSessionMachine, CallSnapshot, CallStatus,
    CompanionRef, HttpCallApi, RodioSink,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Call(Option<CompanionRef>),
    End,
    Quit,
    Say(String),
    Nothing,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Nothing;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    match parts.next() {
        Some("/call") => Input::Call(parse_companion(parts.next().unwrap_or(""))),
        Some("/end") => Input::End,
        Some("/quit") | Some("/exit") => Input::Quit,
        _ => Input::Say(line.to_string()),
    }
}

/// `<id> [name...]`; the name may contain spaces.
fn parse_companion(args: &str) -> Option<CompanionRef> {
    let mut parts = args.trim().splitn(2, char::is_whitespace);
    let id = parts.next().filter(|id| !id.is_empty())?;
    match parts.next().map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => Some(CompanionRef::named(id, name)),
        None => Some(CompanionRef::new(id)),
    }
}

/// Lines worth printing when the snapshot moves from `prev` to `next`.
/// Elapsed-second ticks alone print nothing.
fn describe(prev: &CallSnapshot, next: &CallSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    if prev.status != next.status {
        match (next.status, &next.companion) {
            (CallStatus::Active, Some(companion)) => {
                lines.push(format!("[call] Active with {}", companion.display_name()))
            }
            (status, _) => lines.push(format!("[call] {:?}", status)),
        }
    }
    if next.response_text != prev.response_text {
        if let Some(text) = &next.response_text {
            lines.push(format!("[companion] {}", text));
        }
    }
    if next.expression != prev.expression {
        lines.push(format!("[face] {:?}", next.expression));
    }
    if next.last_error != prev.last_error {
        if let Some(error) = &next.last_error {
            lines.push(format!("[error] {}", error));
        }
    }
    lines
}

async fn print_snapshots(mut snapshots: watch::Receiver<CallSnapshot>) {
    let mut prev = snapshots.borrow().clone();
    while snapshots.changed().await.is_ok() {
        let next = snapshots.borrow_and_update().clone();
        for line in describe(&prev, &next) {
            println!("{}", line);
        }
        prev = next;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[companion-call] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CallConfig::load()?;
    tracing::info!(
        api = %config.api_base_url,
        ws = %config.ws_base_url,
        language = %config.language,
        "Companion call console started"
    );

    let (recognizer, mic) = console::ConsoleRecognizer::new();
    let machine = CallSessionMachine::new(
        config.clone(),
        CallDependencies {
            api: Arc::new(HttpCallApi::new(config.api_base_url.clone())?),
            connector: Arc::new(ws::WsConnector::new(config)),
            recognizer: Box::new(recognizer),
            sink: Arc::new(RodioSink::new()),
        },
    );
    tokio::spawn(print_snapshots(machine.subscribe()));

    let (commands, rx) = mpsc::channel(16);
    let runner = tokio::spawn(machine.run(rx));

    println!("/call <companion_id> [name] to start, /end to hang up, /quit to leave");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Call(companion) => {
                let (reply, result) = oneshot::channel();
                commands.send(CallCommand::Start { companion, reply }).await?;
                if let Err(e) = result.await? {
                    println!("[error] {}", e);
                }
            }
            Input::End => commands.send(CallCommand::End).await?,
            Input::Quit => break,
            Input::Say(text) => {
                if !mic.feed(&text) {
                    println!("[call] not listening, /call a companion first");
                }
            }
            Input::Nothing => {}
        }
    }

    commands.send(CallCommand::Shutdown).await?;
    runner.await?;
    Ok(())
}

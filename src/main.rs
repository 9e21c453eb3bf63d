#![deny(dead_code)]
use anyhow::{anyhow, Result};
use clap::Parser;
use futures::StreamExt;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

mod utils;

use chatsync::auth::{load_credentials, save_credentials, Credentials, StaticAuth};
use chatsync::config::SyncConfig;
use chatsync::models::{now_millis, Conversation, ConversationUpdate, Message, MessageState};
use chatsync::store::{JsonFileStore, MemoryStore, QueueStore};
use chatsync::transport::{InboundEvent, LoopbackTransport};
use chatsync::SyncEngine;

const BOT: &str = "echo-bot";

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: offline-first conversation sync against a simulated server.",
    long_about = "Drives the sync engine against an in-process loopback server.\n\n\
    Type /help at the prompt for the list of commands."
)]
struct Args {
    /// JSON file overriding the engine timing and size settings
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where log lines go (stderr when omitted)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// User id to sign in as; saved for the next start
    #[arg(long)]
    user: Option<String>,

    /// Keep the outbound queue in memory instead of on disk
    #[arg(long)]
    memory: bool,
}

fn print_help() {
    println!(
        "Commands:\n\
         \x20 <text>              send to the open conversation\n\
         \x20 /open <id>          switch conversation\n\
         \x20 /offline, /online   cut or restore the server connection\n\
         \x20 /flaky              toggle whether the server acknowledges sends\n\
         \x20 /retry <id>         retry a failed message\n\
         \x20 /delete <id>        delete a message\n\
         \x20 /incoming <text>    have {} post into the open conversation\n\
         \x20 /deliver            have {} confirm delivery of everything sent\n\
         \x20 /read               mark the open conversation read\n\
         \x20 /typing <text>      simulate a keystroke with that input\n\
         \x20 /list               show the open conversation\n\
         \x20 /queue              show unconfirmed messages\n\
         \x20 /presence           show who is online\n\
         \x20 /quit",
        BOT, BOT
    );
}

fn format_message(message: &Message) -> String {
    let marker = match message.state {
        MessageState::Queued => "queued",
        MessageState::Sending => "sending",
        MessageState::Sent => "sent",
        MessageState::Delivered => "delivered",
        MessageState::Read => "read",
        MessageState::Failed => "FAILED",
    };
    let error = message
        .error
        .as_ref()
        .map(|e| format!(" ({})", e.detail))
        .unwrap_or_default();
    format!(
        "{} <{}> {} [{}{}]",
        message.id, message.sender_id, message.text, marker, error
    )
}

fn open_conversation(engine: &Arc<SyncEngine>, conversation_id: &str) -> tokio::task::JoinHandle<()> {
    let mut stream = engine.subscribe_to_conversation(conversation_id);
    tokio::spawn(async move {
        while let Some(update) = stream.recv().await {
            match update {
                ConversationUpdate::Message(message) => println!("  {}", format_message(&message)),
                ConversationUpdate::Replaced { temp_id, message } => {
                    println!("  {} -> {}", temp_id, format_message(&message))
                }
                ConversationUpdate::Removed { id } => println!("  {} deleted", id),
                ConversationUpdate::Typing(state) if state.is_typing => {
                    println!("  {} is typing...", state.user_id)
                }
                ConversationUpdate::Typing(state) => println!("  {} stopped typing", state.user_id),
                ConversationUpdate::Presence(record) => println!(
                    "  {} is {}",
                    record.user_id,
                    if record.is_online { "online" } else { "offline" }
                ),
            }
        }
    })
}

fn resolve_user(args: &Args) -> Result<String> {
    if let Some(user) = &args.user {
        let credentials = Credentials {
            user_id: user.clone(),
            token: Some(uuid::Uuid::new_v4().to_string()),
        };
        if let Err(e) = save_credentials(&credentials, None) {
            warn!("Failed to save credentials: {}", e);
        }
        return Ok(user.clone());
    }
    if let Some(credentials) = load_credentials(None)? {
        return Ok(credentials.user_id);
    }
    eprintln!("Enter a user id:");
    match utils::read_line()? {
        Some(user) if !user.is_empty() => Ok(user),
        _ => Err(anyhow!("no user id given")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    utils::setup_logging(args.log_file.as_deref(), LevelFilter::Info)?;
    info!("chatsync starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let config = SyncConfig::load_or_default(args.config.as_deref())?;
    let user_id = resolve_user(&args)?;

    let store: Arc<dyn QueueStore> = if args.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonFileStore::open_default()?)
    };
    let server = Arc::new(LoopbackTransport::new());
    let auth = Arc::new(StaticAuth::new(user_id.clone(), "demo-token"));
    let engine = Arc::new(SyncEngine::new(config, server.clone(), auth, store)?);

    let mut current = "general".to_string();
    engine.register_conversation(Conversation {
        id: current.clone(),
        participant_ids: vec![user_id.clone(), BOT.to_string()],
        last_activity: now_millis(),
    });
    server.set_presence(chatsync::models::PresenceRecord {
        user_id: BOT.to_string(),
        is_online: true,
        last_seen: None,
        fetched_at: now_millis(),
    });

    let states = engine.connection_states();
    tokio::spawn(async move {
        let mut states = Box::pin(states);
        while let Some(state) = states.next().await {
            println!("* connection: {:?}", state);
        }
    });

    let mut printer = open_conversation(&engine, &current);
    engine.connect().await?;
    println!("Signed in as {}, conversation '{}'. /help for commands.", user_id, current);

    let mut flaky = false;
    loop {
        let line = match tokio::task::spawn_blocking(utils::read_line).await? {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line.as_str(), ""),
        };

        match command {
            "/quit" | "/exit" => break,
            "/help" => print_help(),
            "/open" if !rest.is_empty() => {
                engine.close_conversation(&current);
                printer.abort();
                current = rest.to_string();
                engine.register_conversation(Conversation {
                    id: current.clone(),
                    participant_ids: vec![user_id.clone(), BOT.to_string()],
                    last_activity: now_millis(),
                });
                printer = open_conversation(&engine, &current);
                println!("* now in '{}'", current);
            }
            "/offline" => server.set_reachable(false),
            "/online" => server.set_reachable(true),
            "/flaky" => {
                flaky = !flaky;
                server.set_auto_ack(!flaky);
                println!("* server acks {}", if flaky { "withheld" } else { "enabled" });
            }
            "/retry" => {
                if let Err(e) = engine.retry(rest).await {
                    println!("! {}", e);
                }
            }
            "/delete" => {
                if let Err(e) = engine.delete(rest).await {
                    println!("! {}", e);
                }
            }
            "/incoming" if !rest.is_empty() => {
                let message = Message {
                    id: format!("srv-{}", uuid::Uuid::new_v4()),
                    conversation_id: current.clone(),
                    sender_id: BOT.to_string(),
                    text: rest.to_string(),
                    timestamp: now_millis(),
                    state: MessageState::Sent,
                    error: None,
                };
                if !server.push(InboundEvent::NewMessage(message)).await {
                    println!("! server is not connected");
                }
            }
            "/deliver" => {
                let ids: Vec<String> = engine
                    .messages(&current)
                    .await
                    .into_iter()
                    .filter(|m| m.sender_id == user_id && m.state == MessageState::Sent)
                    .map(|m| m.id)
                    .collect();
                let event = InboundEvent::DeliveryReceipt {
                    conversation_id: current.clone(),
                    message_ids: ids,
                };
                if !server.push(event).await {
                    println!("! server is not connected");
                }
            }
            "/read" => engine.mark_read(&current),
            "/typing" => engine.on_local_input(&current, rest),
            "/list" => {
                for message in engine.messages(&current).await {
                    println!("  {}", format_message(&message));
                }
            }
            "/queue" => {
                for entry in engine.queued().await {
                    println!(
                        "  {} in {} (attempt {}): {}",
                        entry.temp_id, entry.conversation_id, entry.attempt, entry.text
                    );
                }
            }
            "/presence" => {
                let participants = engine
                    .conversation(&current)
                    .map(|c| c.participant_ids)
                    .unwrap_or_default();
                match engine.get_online_status(&participants).await {
                    Ok(statuses) => {
                        for (user, record) in statuses {
                            println!("  {}: {}", user, if record.is_online { "online" } else { "offline" });
                        }
                    }
                    Err(e) => println!("! {}", e),
                }
            }
            _ if command.starts_with('/') => println!("! unknown command, /help lists them"),
            _ => {
                engine.on_local_input(&current, "");
                if let Err(e) = engine.send(&current, &line).await {
                    println!("! {}", e);
                }
            }
        }
    }

    engine.shutdown().await;
    printer.abort();
    info!("chatsync shut down");
    Ok(())
}

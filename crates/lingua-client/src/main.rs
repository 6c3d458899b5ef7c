mod commands;
mod config;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use lingua_api::ApiClient;
use lingua_gateway::{Channel, WsConnector};
use lingua_sync::{SyncEngine, Update};
use lingua_types::{Delivery, Message, UserId};

use crate::commands::Command;
use crate::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lingua=debug,lingua_sync=debug,lingua_gateway=info".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let api = ApiClient::new(&config.api)?;

    // Credential for both REST and the realtime channel
    let token = match &config.token {
        Some(token) => {
            api.set_token(Some(token.clone()));
            token.clone()
        }
        None => {
            let username = config
                .username
                .as_deref()
                .context("set LINGUA_TOKEN, or LINGUA_USERNAME and LINGUA_PASSWORD")?;
            let password = config.password.as_deref().unwrap_or_default();
            api.login(username, password).await?
        }
    };
    let me = api.current_user().await?;
    info!("Signed in as {} ({})", me.username, me.id());

    let lookup = api.clone();
    let channel = Channel::new(config.gateway.clone());
    let mut engine = SyncEngine::new(config.sync.clone(), api, channel, me.id());
    if me.user_id.is_some() {
        engine.add_self_alias(UserId::new(me.username.clone()));
    }
    engine.load_more_conversations();
    engine.connect(WsConnector::new(config.gateway.url.clone()), token);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match commands::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(Command::Find(query))) => find_users(&lookup, query),
                    Ok(Some(command)) => {
                        if let Err(e) = run(&mut engine, command) {
                            println!("{}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            event = engine.next_event() => {
                for update in engine.handle(event) {
                    report(&engine, &update);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.disconnect();
    info!("Disconnected");
    Ok(())
}

fn run(engine: &mut SyncEngine<ApiClient>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => print_conversations(engine),
        Command::More => {
            if !engine.load_more_conversations() {
                println!("no more conversations");
            }
        }
        Command::Open(id) => {
            engine.open_conversation(&id)?;
            print_messages(engine);
        }
        Command::Older => {
            let id = open_id(engine)?;
            if !engine.load_older_messages(&id)? {
                println!("beginning of conversation");
            }
        }
        Command::Read => {
            let id = open_id(engine)?;
            engine.mark_read(&id)?;
        }
        Command::Direct(user_id) => engine.create_direct(&user_id),
        Command::Group { name, members } => engine.create_group(&name, &members, None),
        Command::Rename(name) => {
            let id = open_id(engine)?;
            engine.rename(&id, &name)?;
        }
        Command::Locale(code) => {
            let id = open_id(engine)?;
            engine.set_locale(&id, &code)?;
        }
        Command::Add(members) => {
            let id = open_id(engine)?;
            engine.add_members(&id, &members)?;
        }
        Command::Send(draft) => {
            let id = open_id(engine)?;
            let receipt = engine.send(&id, draft)?;
            if !receipt.published {
                println!("not connected, message kept as failed");
            }
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Find(_) | Command::Quit => {}
    }
    Ok(())
}

fn find_users(api: &ApiClient, query: String) {
    let api = api.clone();
    tokio::spawn(async move {
        match api.find_users(&query).await {
            Ok(users) if users.is_empty() => println!("no user matches {}", query),
            Ok(users) => {
                for user in users {
                    println!("{:<16} {}", user.user_id.as_str(), user.display_name().unwrap_or_default());
                }
            }
            Err(e) => warn!("User lookup failed: {}", e),
        }
    });
}

fn open_id(engine: &SyncEngine<ApiClient>) -> anyhow::Result<lingua_types::ConversationId> {
    engine
        .open_conversation_id()
        .cloned()
        .context("no conversation open, use /open <id>")
}

fn report(engine: &SyncEngine<ApiClient>, update: &Update) {
    match update {
        Update::ConversationsChanged => debug!("Conversation list changed"),
        Update::MessagesChanged { conversation_id, .. } => {
            if engine.open_conversation_id() == Some(conversation_id) {
                if let Some(last) = engine.conversation(conversation_id).and_then(|c| c.messages().last()) {
                    println!("{}", format_message(engine, last));
                }
            } else if let Some(conversation) = engine.conversation(conversation_id).filter(|c| c.has_unread()) {
                let preview = conversation.preview(&engine.config().labels).unwrap_or_default();
                println!("* {}: {}", conversation.title(engine.store().self_id()), preview);
            }
        }
        Update::ConnectionChanged(state) => info!("Connection {:?}", state),
        Update::FetchFailed { conversation_id, error } => match conversation_id {
            Some(id) => warn!("Loading {} failed: {} (retry with /older or /open)", id, error),
            None => warn!("Loading conversations failed: {} (retry with /more)", error),
        },
        Update::ConversationCreated(id) => println!("conversation {} ready, /open {}", id, id),
        Update::ActionFailed { action, error } => warn!("{:?} failed: {}", action, error),
    }
}

fn print_conversations(engine: &SyncEngine<ApiClient>) {
    let labels = &engine.config().labels;
    let self_id = engine.store().self_id();
    for conversation in engine.conversations() {
        println!(
            "{} {:<12} {:<24} {}",
            if conversation.has_unread() { "*" } else { " " },
            conversation.id.as_str(),
            conversation.title(self_id),
            conversation.preview(labels).unwrap_or_default()
        );
    }
}

fn print_messages(engine: &SyncEngine<ApiClient>) {
    let Some(conversation) = engine.open_conversation_id().and_then(|id| engine.conversation(id)) else {
        return;
    };
    println!("-- {} --", conversation.title(engine.store().self_id()));
    for message in conversation.messages() {
        println!("{}", format_message(engine, message));
    }
}

fn format_message(engine: &SyncEngine<ApiClient>, message: &Message) -> String {
    let marker = match message.delivery {
        Delivery::Confirmed => "",
        Delivery::Pending => " (sending)",
        Delivery::Failed => " (failed)",
    };
    let content = match &message.attachment {
        Some(attachment) => format!(
            "{} {}",
            engine.config().labels.label(message.kind).unwrap_or_default(),
            attachment.url
        ),
        None => message.body.clone(),
    };
    let translation = match &message.translated_body {
        Some(translated) => format!(" [{}]", translated),
        None if message.translation_pending() => " [...]".to_string(),
        None => String::new(),
    };
    format!(
        "[{}] {}: {}{}{}",
        message.sent_at.format("%H:%M"),
        message.sender_id,
        content,
        translation,
        marker
    )
}

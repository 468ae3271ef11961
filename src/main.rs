use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod credentials;
mod utils;

use crate::credentials::{load_credentials, save_credentials, set_credentials_path_override, Credentials};
use studyroom::channel::events::names;
use studyroom::channel::registry::decode;
use studyroom::channel::websocket::WebSocketTransport;
use studyroom::channel::ConnectionState;
use studyroom::config::{set_config_path_override, ClientConfig};
use studyroom::records::HttpRecordClient;
use studyroom::stream::{PageOutcome, SendOutcome};
use studyroom::windows::FileWindowStore;
use studyroom::{ChatClient, ConversationRef, Message, UserRef};

/// Command line arguments for studyroom
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "studyroom: a terminal client for study-group direct messages.",
    long_about = "Connects to the messaging server, restores your open chats and lets you \
    read and send messages from the terminal. Type /help once connected."
)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Credentials file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    credentials: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

const HELP: &str = "\
/list              conversations, unread first
/open <id>         open a chat panel and focus it
/new <user id>     start (or reopen) a conversation with a user
/search <text>     find users
/min [id]          minimize a panel to a bubble
/close [id]        close a panel or bubble
/older             load older messages in the focused chat
/attach <path>     attach a file to the next message
/retry <id>        resend a failed message
/online            who is online
/quit              exit
anything else is sent to the focused chat";

/// Get credentials: prefer environment variables, then file, then prompt
fn obtain_credentials() -> Result<(Credentials, bool)> {
    if let Some(credentials) = credentials::from_env() {
        return Ok((credentials, false));
    }
    if let Some(credentials) = load_credentials()? {
        info!("Using cached credentials for {}", credentials.user_id);
        if credentials.get_token().is_some_and(|t| !t.is_empty()) {
            return Ok((credentials, false));
        }
        eprintln!("Enter session token for {}:", credentials.user_id);
        let token = utils::read_line()?;
        return Ok((Credentials::new(&credentials.user_id, &token), true));
    }

    eprintln!("Enter your user id:");
    let user_id = utils::read_line()?;
    eprintln!("Enter your session token:");
    let token = utils::read_line()?;
    Ok((Credentials::new(&user_id, &token), true))
}

fn print_page(client: &ChatClient, conversation_id: &str, outcome: Option<PageOutcome>) {
    match outcome {
        Some(PageOutcome::Failed) => println!("! could not load messages for {}", conversation_id),
        Some(PageOutcome::Exhausted) => println!("(no older messages)"),
        Some(PageOutcome::Busy) => println!("(still loading)"),
        _ => {
            for message in client.messages(conversation_id) {
                println!("{}", utils::format_message(&message, &client.local_user().id));
            }
        }
    }
}

fn print_send(outcome: Option<SendOutcome>) {
    match outcome {
        None => println!("! open a conversation first (/open <id>)"),
        Some(SendOutcome::Rejected) => println!("! nothing to send"),
        Some(SendOutcome::Failed { temp_id }) => {
            println!("! message not sent, retry with /retry {}", temp_id)
        }
        Some(SendOutcome::Sent(_)) => {}
    }
}

fn focused_ref(client: &ChatClient, id: Option<&str>) -> Option<ConversationRef> {
    let id = id.map(str::to_string).or_else(|| client.focused())?;
    let local = &client.local_user().id;
    Some(
        client
            .conversations()
            .get(&id)
            .map(|c| c.to_ref(local))
            .unwrap_or_else(|| ConversationRef::new(id.clone(), id)),
    )
}

async fn handle_command(client: &ChatClient, line: &str) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, rest)) => (command, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (line, None),
    };

    match (command, argument) {
        ("/quit", _) => return false,
        ("/help", _) => println!("{}", HELP),
        ("/list", _) => {
            let local = client.local_user().id.clone();
            if client.conversations().load_failed() {
                println!("! conversation list may be out of date");
            }
            for conversation in client.conversations().sorted() {
                let unread = conversation.unread_for(&local);
                let partner = conversation.partner(&local);
                let online = partner.is_some_and(|p| client.presence().is_online(&p.id));
                println!(
                    "{} {:<24} {}{}",
                    if online { "*" } else { " " },
                    conversation.to_ref(&local).title,
                    conversation.id,
                    if unread > 0 { format!(" ({} unread)", unread) } else { String::new() }
                );
            }
            println!("total unread: {}", client.conversations().total_unread());
        }
        ("/open", Some(id)) => {
            let outcome = client.open_conversation_by_id(id).await;
            print_page(client, id, outcome);
        }
        ("/new", Some(user_id)) => match client.start_conversation(user_id).await {
            Ok(conversation) => print_page(client, &conversation.id, None),
            Err(e) => println!("! could not start conversation: {}", e),
        },
        ("/search", Some(query)) => match client.search_users(query).await {
            Ok(users) => {
                for user in users {
                    println!("{} {}", user.id, user.display_name());
                }
            }
            Err(e) => println!("! search failed: {}", e),
        },
        ("/min", id) => match focused_ref(client, id) {
            Some(conversation) => client.minimize_conversation(conversation),
            None => println!("! nothing to minimize"),
        },
        ("/close", id) => match focused_ref(client, id) {
            Some(conversation) => client.close_conversation(&conversation.id),
            None => println!("! nothing to close"),
        },
        ("/older", _) => {
            if let Some(focused) = client.focused() {
                let outcome = client.load_older().await;
                print_page(client, &focused, outcome);
            }
        }
        ("/attach", Some(path)) => match client.attach_file(path) {
            Ok(file) => println!("attached {} ({} bytes)", file.file_name, file.size),
            Err(e) => println!("! {}", e),
        },
        ("/retry", Some(id)) => print_send(client.resend(id).await),
        ("/online", _) => println!("online: {}", client.presence().online_users().join(", ")),
        (text, _) if text.starts_with('/') => println!("unknown command, try /help"),
        _ => {
            // A line is only seen once it is complete, so typing starts here
            // and send_message ends it.
            client.keystroke();
            print_send(client.send_message(line).await)
        }
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.as_deref().and_then(|p| p.to_str()), level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(path) = args.config {
        set_config_path_override(path);
    }
    if let Some(path) = args.credentials {
        set_credentials_path_override(path);
    }

    let config = ClientConfig::load().context("loading configuration")?;
    let data_dir = config.resolve_data_dir()?;
    let (credentials, prompted) = obtain_credentials()?;
    let credential = credentials.to_credential()?;

    let records = Arc::new(HttpRecordClient::new(&config.api_url, &credential.token)?);
    let transport = Arc::new(WebSocketTransport::new(&config.channel_url));
    let window_store = Arc::new(FileWindowStore::new(data_dir.join("windows")));
    let client = ChatClient::new(
        UserRef::new(credential.user_id.clone()),
        config.clone(),
        transport,
        records,
        window_store,
    );

    let local = credential.user_id.clone();
    let conversations = client.conversations().clone();
    client.connection().register_callback(names::RECEIVE_MESSAGE, move |payload: &Value| {
        if let Some(message) = decode::<Message>(names::RECEIVE_MESSAGE, payload) {
            if message.sender_id() == local {
                return;
            }
            let title = conversations
                .get(&message.conversation_id)
                .map(|c| c.to_ref(&local).title)
                .unwrap_or_else(|| message.conversation_id.clone());
            println!("<{}> {}", title, utils::format_message(&message, &local));
        }
    });

    let mut state_rx = client.connection().watch_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => println!("-- connected"),
                ConnectionState::Failed => println!("-- connection failed, restart to retry"),
                ConnectionState::Disconnected => println!("-- disconnected, reconnecting..."),
                ConnectionState::Connecting => {}
            }
        }
    });

    let mut presence_rx = client.presence().subscribe();
    tokio::spawn(async move {
        while let Some(change) = presence_rx.recv().await {
            info!(
                "{} is now {}",
                change.user_id,
                if change.online { "online" } else { "offline" }
            );
        }
    });

    println!("Connecting to {} ...", config.channel_url);
    client.start(credential).await;
    if prompted {
        if let Err(e) = save_credentials(&credentials) {
            error!("Failed to save credentials: {}", e);
        }
    }
    if let Some(focused) = client.focused() {
        println!("== {}", focused);
        print_page(&client, &focused, None);
    }
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handle_command(&client, line).await {
            break;
        }
    }

    client.shutdown();
    info!("studyroom exiting");
    Ok(())
}

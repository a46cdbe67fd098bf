use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    config::DEFAULT_SETTINGS_FILE, load_settings_from, ClientEvent, ClientHandle, MessagingClient,
    StaticCredentials,
};
use shared::{
    domain::{ListingId, MessageCategory, ThreadId, UserId},
    protocol::NewThreadValues,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONNECT_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "messenger", about = "Direct messaging from the terminal")]
struct Cli {
    #[arg(long, env = "MESSAGING_CONFIG", default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long, env = "MESSAGING_API_URL")]
    api_url: Option<String>,
    #[arg(long, env = "MESSAGING_USER_ID")]
    user_id: String,
    #[arg(long, env = "MESSAGING_USER_NAME")]
    user_name: Option<String>,
    #[arg(long, env = "MESSAGING_TOKEN", hide_env_values = true)]
    token: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List threads, newest first.
    Threads,
    /// Show a thread's messages; marks it read when it has unread messages.
    Messages { thread_id: String },
    /// Start a thread with another user.
    Send {
        receiver_id: String,
        content: String,
        #[arg(long)]
        receiver_name: String,
        #[arg(long)]
        subject: String,
        #[arg(long, value_enum, default_value_t = Category::General)]
        category: Category,
        #[arg(long)]
        listing_id: Option<String>,
    },
    Reply {
        thread_id: String,
        content: String,
    },
    Read {
        thread_id: String,
    },
    Delete {
        thread_id: String,
    },
    /// Stream live events until interrupted.
    Watch {
        #[arg(long)]
        thread_id: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    General,
    Inquiry,
    Adoption,
    Support,
    Other,
}

impl From<Category> for MessageCategory {
    fn from(category: Category) -> Self {
        match category {
            Category::General => MessageCategory::General,
            Category::Inquiry => MessageCategory::Inquiry,
            Category::Adoption => MessageCategory::Adoption,
            Category::Support => MessageCategory::Support,
            Category::Other => MessageCategory::Other,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(&cli.config);
    if let Some(api_url) = cli.api_url {
        settings = settings.with_api_base_url(api_url);
    }
    let display_name = cli.user_name.unwrap_or_else(|| cli.user_id.clone());
    let credentials = Arc::new(StaticCredentials::new(
        cli.user_id.clone(),
        display_name,
        cli.token,
    ));

    let client = MessagingClient::from_settings(settings, credentials)
        .context("failed to build messaging client")?;
    client
        .open()
        .await
        .context("failed to open messaging session")?;
    wait_until_connected(&client).await;

    let self_id = UserId::new(cli.user_id);
    let outcome = run(client.as_ref(), &self_id, cli.command).await;
    client.close().await;
    outcome
}

/// Announcements are skipped while the channel is down, so give it a moment.
async fn wait_until_connected(client: &MessagingClient) {
    let mut status = client.channel().watch_status();
    let connected = tokio::time::timeout(
        CONNECT_WAIT,
        status.wait_for(|status| status.is_connected() || status.last_error.is_some()),
    )
    .await;
    match connected {
        Ok(Ok(status)) if status.is_connected() => {}
        Ok(Ok(status)) => warn!(
            error = status.last_error.as_deref().unwrap_or_default(),
            "push channel unavailable; writes will not be announced"
        ),
        _ => warn!("push channel not open yet; writes will not be announced"),
    }
}

async fn run(client: &dyn ClientHandle, self_id: &UserId, command: Command) -> Result<()> {
    match command {
        Command::Threads => {
            let snapshot = client.snapshot().await;
            if snapshot.threads().is_empty() {
                println!("no threads");
            }
            for thread in snapshot.threads() {
                let with = thread
                    .counterpart(self_id)
                    .map(|other| {
                        thread
                            .display_name(other)
                            .unwrap_or(other.as_str())
                            .to_string()
                    })
                    .unwrap_or_default();
                let last = thread
                    .last_message
                    .as_ref()
                    .map(|last| last.content.as_str())
                    .unwrap_or_default();
                println!(
                    "{}  {:<20} {:<30} unread={} messages={} updated={}  {}",
                    thread.id,
                    with,
                    thread.subject,
                    thread.unread_for(self_id),
                    thread.message_count,
                    thread.updated_at.format("%Y-%m-%d %H:%M"),
                    last
                );
            }
            println!("total unread: {}", snapshot.total_unread());
        }
        Command::Messages { thread_id } => {
            client.select_thread(&ThreadId::new(thread_id)).await?;
            let snapshot = client.snapshot().await;
            for message in snapshot.messages() {
                println!(
                    "[{}] {}: {}{}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.sender_name,
                    message.content,
                    if message.read { "" } else { "  (unread)" }
                );
            }
        }
        Command::Send {
            receiver_id,
            content,
            receiver_name,
            subject,
            category,
            listing_id,
        } => {
            let values = NewThreadValues {
                receiver_id: UserId::new(receiver_id),
                subject,
                content,
                category: category.into(),
                listing_id: listing_id.map(ListingId::new),
                attachments: Vec::new(),
            };
            let message = client.send_message(values, &receiver_name).await?;
            println!("sent message {} in thread {}", message.id, message.thread_id);
        }
        Command::Reply { thread_id, content } => {
            client.select_thread(&ThreadId::new(thread_id)).await?;
            let message = client.send_reply(&content).await?;
            println!("sent reply {} in thread {}", message.id, message.thread_id);
        }
        Command::Read { thread_id } => {
            client
                .mark_thread_as_read(&ThreadId::new(thread_id.clone()))
                .await?;
            println!("thread {thread_id} marked read");
        }
        Command::Delete { thread_id } => {
            client.delete_thread(&ThreadId::new(thread_id.clone())).await?;
            println!("thread {thread_id} deleted");
        }
        Command::Watch { thread_id } => {
            let mut events = client.subscribe_events();
            if let Some(thread_id) = thread_id {
                client.select_thread(&ThreadId::new(thread_id)).await?;
            }
            info!("watching for messages; press ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = events.recv() => match received {
                        Ok(event) => print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessageAppended(message) => println!(
            "[{}] {} -> {}: {}",
            message.thread_id, message.sender_name, message.receiver_name, message.content
        ),
        ClientEvent::ReadStateChanged {
            thread_id,
            unread,
            total_unread,
        } => println!("[{thread_id}] unread={unread} (total {total_unread})"),
        ClientEvent::TypingChanged { thread_id, users } if !users.is_empty() => {
            let names: Vec<&str> = users.iter().map(UserId::as_str).collect();
            println!("[{thread_id}] {} typing...", names.join(", "));
        }
        ClientEvent::ThreadRemoved(thread_id) => println!("[{thread_id}] deleted"),
        ClientEvent::ConnectionChanged(status) => {
            println!("connection: {:?} (attempts {})", status.state, status.attempts)
        }
        ClientEvent::Error(message) => eprintln!("error: {message}"),
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

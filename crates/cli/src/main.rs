mod args;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use huddle_client::ChatClient;
use huddle_core::config::{Config, project_dirs};
use huddle_core::credentials::{Credential, CredentialStore, FileCredentialStore};
use huddle_core::error::EventBusError;
use huddle_core::event::{BroadcastEventBus, EventBus, EventPayload};
use huddle_core::types::ConversationKey;
use huddle_hub::{ConnectionState, WebSocketConnector};

use crate::args::{Cli, Command, Target};

const CREDENTIALS_FILE_NAME: &str = "credentials.json";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config =
        Config::load_or_default(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging.filter);

    let credentials_path = match cli.credentials {
        Some(path) => path,
        None => default_credentials_path()?,
    };
    let credentials = Arc::new(FileCredentialStore::new(credentials_path));

    match cli.command {
        Command::Login { token, user_id } => {
            credentials.set(Credential::new(token, user_id))?;
            println!("credential saved to {}", credentials.path().display());
            Ok(())
        }
        Command::Logout => {
            credentials.clear()?;
            println!("credential removed");
            Ok(())
        }
        Command::Watch => watch(&config, credentials).await,
        Command::Send { target, body } => send(&config, credentials, target, &body).await,
        Command::History { target, page } => history(&config, credentials, target, page).await,
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn default_credentials_path() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join(CREDENTIALS_FILE_NAME))
}

struct Session {
    client: ChatClient,
    event_bus: Arc<dyn EventBus>,
}

/// Connects and waits until the hub has told us who we are.
async fn sign_in(config: &Config, credentials: Arc<FileCredentialStore>) -> Result<Session> {
    if credentials.get().is_none() {
        bail!("not logged in; run `huddle login --token <token>` first");
    }

    let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
    let mut identity = event_bus.subscribe("hub.identity.*")?;
    let client = ChatClient::new(
        config,
        WebSocketConnector,
        credentials,
        Some(event_bus.clone()),
    );

    let state = client.start().await;
    if state != ConnectionState::Connected {
        bail!("could not connect to {}: {state:?}", config.hub.url);
    }
    tokio::time::timeout(config.hub.connect_timeout(), identity.recv())
        .await
        .context("hub never confirmed our identity")??;

    if let Some(user) = client.current_user() {
        tracing::info!(user_id = %user.user_id, username = %user.username, "signed in");
    }
    Ok(Session { client, event_bus })
}

async fn watch(config: &Config, credentials: Arc<FileCredentialStore>) -> Result<()> {
    let session = sign_in(config, credentials).await?;
    let mut events = session.event_bus.subscribe("**")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{} {:?}", event.channel, event.payload),
                Err(EventBusError::Lagged(count)) => {
                    tracing::warn!(count, "watcher fell behind; events skipped");
                }
                Err(error) => {
                    tracing::error!(%error, "event stream ended");
                    break;
                }
            },
        }
    }

    session.client.shutdown().await;
    Ok(())
}

async fn send(
    config: &Config,
    credentials: Arc<FileCredentialStore>,
    target: Target,
    body: &str,
) -> Result<()> {
    let session = sign_in(config, credentials).await?;
    let result = match (&target.to, &target.group) {
        (Some(to), _) => session.client.send_private_message(to, body).await,
        (None, Some(group)) => session.client.send_group_message(group, body).await,
        (None, None) => bail!("a --to or --group target is required"),
    };
    session.client.shutdown().await;
    result.context("message was not delivered")
}

async fn history(
    config: &Config,
    credentials: Arc<FileCredentialStore>,
    target: Target,
    page: u32,
) -> Result<()> {
    let session = sign_in(config, credentials).await?;
    let mut merged = session.event_bus.subscribe("hub.history.merged")?;

    let key = match (&target.to, &target.group) {
        (Some(to), _) => {
            session.client.set_active_conversation(to.as_str());
            session.client.load_conversation_history(to, page).await?;
            ConversationKey::from(to.as_str())
        }
        (None, Some(group)) => {
            session.client.set_active_conversation(group.as_str());
            session.client.load_group_history(group, page).await?;
            ConversationKey::from(group.as_str())
        }
        (None, None) => bail!("a --to or --group target is required"),
    };

    let wait = async {
        loop {
            let event = merged.recv().await?;
            if let EventPayload::HistoryMerged {
                conversation_key, ..
            } = event.payload
            {
                if conversation_key == key {
                    return Ok::<_, EventBusError>(());
                }
            }
        }
    };
    let outcome = tokio::time::timeout(config.hub.invoke_timeout(), wait).await;

    for message in session.client.messages(&key) {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%Y-%m-%d %H:%M"),
            message.sender_username,
            message.body
        );
    }
    session.client.shutdown().await;
    outcome.context("hub did not deliver the history page")??;
    Ok(())
}

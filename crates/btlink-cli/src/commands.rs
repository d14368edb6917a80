//! Command implementations

use std::sync::Arc;
use std::time::Duration;

use btlink_ble::{BleTransport, BleTransportError};
use btlink_core::{
    ConnectionManager, LinkConfig, LinkEvent, LinkEventReceiver, LoopbackNetwork,
    LoopbackTransport, PeerAddress, Tag,
};
use tracing::{debug, info};

use crate::cli::Commands;
use crate::config::CliConfig;
use crate::error::{CliError, Result};

const BROADCAST_TAG: Tag = Tag(1);
const SEND_TAG: Tag = Tag(2);
const READ_TAG: Tag = Tag(3);

/// How long the loopback demo waits for any single event
const LOOPBACK_WAIT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(command: Commands, config: CliConfig) -> Result<()> {
        match command {
            Commands::Loopback {
                message,
                peers,
                chunk_size,
            } => {
                let received = run_loopback(&config.link, &message, peers, chunk_size).await?;
                for (peer, data) in received {
                    println!("{} received {:?}", peer, String::from_utf8_lossy(&data));
                }
                Ok(())
            }
            Commands::Search {
                message,
                read,
                wait,
            } => run_search(config, message, read, Duration::from_secs(wait)).await,
            Commands::Config => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    }
}

/// Next event or a timeout error naming what was awaited
async fn expect_event(events: &mut LinkEventReceiver, wait: Duration, what: &str) -> Result<LinkEvent> {
    match tokio::time::timeout(wait, events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(CliError::UnexpectedEvent(format!("event stream closed before {}", what))),
        Err(_) => Err(CliError::Timeout(what.to_string())),
    }
}

// ----------------------------------------------------------------------------
// Loopback Demo
// ----------------------------------------------------------------------------

/// Publish on an in-process network, connect `peers` searchers and broadcast
/// `message` to them. Returns what each searcher read.
pub async fn run_loopback(
    link: &LinkConfig,
    message: &str,
    peers: usize,
    chunk_size: usize,
) -> Result<Vec<(PeerAddress, Vec<u8>)>> {
    if message.is_empty() {
        return Err(CliError::Config("message cannot be empty".to_string()));
    }
    if peers == 0 || peers > link.max_connections {
        return Err(CliError::Config(format!(
            "peer count must be within 1..={}",
            link.max_connections
        )));
    }

    let network = LoopbackNetwork::new();
    let host_transport = Arc::new(LoopbackTransport::new(&network, "publisher", "publisher"));
    let mut host = ConnectionManager::new(link.clone(), host_transport)?;
    let mut host_events = host
        .take_event_receiver()
        .ok_or_else(|| CliError::Config("publisher events already taken".to_string()))?;

    host.start_publishing().await?;
    info!("publisher advertising as {:?}", host.get_name());

    let mut searchers = Vec::with_capacity(peers);
    for index in 0..peers {
        let address = format!("searcher-{}", index + 1);
        let transport = LoopbackTransport::new(&network, address.as_str(), address.as_str())
            .with_chunk_size(chunk_size);
        let mut manager = ConnectionManager::new(link.clone(), Arc::new(transport))?;
        let mut events = manager
            .take_event_receiver()
            .ok_or_else(|| CliError::Config("searcher events already taken".to_string()))?;

        manager.start_searching()?;
        let server = loop {
            match expect_event(&mut events, LOOPBACK_WAIT, "server connection").await? {
                LinkEvent::ConnectedToServer { peer } => break peer,
                LinkEvent::SearchFailed { error } => return Err(error.into()),
                other => debug!("searcher event: {:?}", other),
            }
        };
        loop {
            match expect_event(&mut host_events, LOOPBACK_WAIT, "inbound peer").await? {
                LinkEvent::PeerConnected { peer } if peer.as_str() == address => break,
                other => debug!("publisher event: {:?}", other),
            }
        }

        manager
            .read_data_to_length(&server, message.len(), Some(LOOPBACK_WAIT), READ_TAG)
            .await;
        searchers.push((manager, events));
    }

    let recipients = host.broadcast_message(message, BROADCAST_TAG).await;
    info!("broadcast to {} peer(s)", recipients);

    let mut received = Vec::with_capacity(searchers.len());
    for (manager, events) in searchers.iter_mut() {
        let data = loop {
            match expect_event(events, LOOPBACK_WAIT, "broadcast").await? {
                LinkEvent::ReadCompleted { data, .. } => break data,
                LinkEvent::ReadFailed { error, .. } => return Err(error.into()),
                other => debug!("searcher event: {:?}", other),
            }
        };
        let local = manager
            .get_address()
            .unwrap_or_else(|| PeerAddress::new("unknown"));
        received.push((local, data));
    }

    for (manager, _) in &searchers {
        manager.shutdown().await?;
    }
    host.shutdown().await?;
    Ok(received)
}

// ----------------------------------------------------------------------------
// BLE Search
// ----------------------------------------------------------------------------

async fn run_search(
    config: CliConfig,
    message: Option<String>,
    read: Option<usize>,
    wait: Duration,
) -> Result<()> {
    let transport = Arc::new(BleTransport::new(config.ble.clone()));
    let mut manager = ConnectionManager::new(config.link.clone(), transport)?;
    let mut events = manager
        .take_event_receiver()
        .ok_or_else(|| CliError::Config("events already taken".to_string()))?;

    if !manager.is_available().await {
        return Err(BleTransportError::AdapterNotAvailable.into());
    }

    info!("searching for session {}", config.link.session_name);
    manager.start_searching()?;
    let server = loop {
        match expect_event(&mut events, wait, "server connection").await? {
            LinkEvent::ConnectedToServer { peer } => break peer,
            LinkEvent::SearchFailed { error } => return Err(error.into()),
            other => debug!("event: {:?}", other),
        }
    };
    println!("connected to {}", server);

    if let Some(message) = message {
        manager.send_device_message(&server, &message, SEND_TAG).await;
        loop {
            match expect_event(&mut events, wait, "write completion").await? {
                LinkEvent::WriteCompleted { tag, .. } if tag == SEND_TAG => break,
                LinkEvent::WriteFailed { error, .. } => return Err(error.into()),
                other => debug!("event: {:?}", other),
            }
        }
        println!("sent {} bytes", message.len());
    }

    if let Some(length) = read {
        manager
            .read_data_to_length(&server, length, Some(wait), READ_TAG)
            .await;
        loop {
            match expect_event(&mut events, wait, "read completion").await? {
                LinkEvent::ReadCompleted { data, .. } => {
                    println!("received {}", hex::encode(&data));
                    break;
                }
                LinkEvent::ReadFailed { error, .. } => return Err(error.into()),
                other => debug!("event: {:?}", other),
            }
        }
    }

    manager.disconnect().await?;
    manager.shutdown().await?;
    Ok(())
}

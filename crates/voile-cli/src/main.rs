//! Demo driver: runs both peers of a Voile session in one process over
//! the in-memory rendezvous store and walks through the happy path of
//! handshake, chat, a file transfer, and orderly teardown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use voile_rendezvous::MemoryStore;
use voile_session::{
    spawn_session, OutgoingFile, SessionConfig, SessionEvent, SessionState, SyntheticPipeline,
    TransportConfig,
};
use voile_shared::link::MagicLink;
use voile_shared::types::RoomId;

const WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "voile", about = "Two-party encrypted session demo")]
struct Cli {
    /// Room identifier (case-insensitive).
    #[arg(long, default_value = "DEMO-1")]
    room: String,

    /// Shared passphrase.
    #[arg(long, default_value = "hunter2")]
    passphrase: String,

    /// Join the guest peer via a magic link fragment
    /// (`room=<id>&pass=<passphrase>`) instead of --room/--passphrase.
    #[arg(long)]
    link: Option<String>,

    /// Size of the demo file transfer in bytes.
    #[arg(long, default_value_t = 48 * 1024)]
    file_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("voile_session=debug,voile_rendezvous=debug,info"));
    fmt().with_env_filter(filter).with_target(true).init();

    let cli = Cli::parse();
    let store = MemoryStore::new();

    let mut host_config = SessionConfig::new(&cli.room, &cli.passphrase, "host");
    host_config.transport = TransportConfig::loopback();

    let link = match &cli.link {
        Some(raw) => MagicLink::parse(raw)?,
        None => MagicLink::new(RoomId::new(&cli.room), cli.passphrase.clone()),
    };
    let mut guest_config = SessionConfig::from_link(&link);
    guest_config.transport = TransportConfig::loopback();
    let guest_name = guest_config.display_name.clone();

    info!(room = %host_config.room, "starting host peer");
    let (host, mut host_events) = spawn_session(
        host_config,
        Arc::new(store.clone()),
        Arc::new(SyntheticPipeline::new()),
    );

    // Give the host a head start so it claims the initiator slot.
    sleep(Duration::from_millis(300)).await;

    info!(guest = %guest_name, "starting guest peer");
    let (guest, mut guest_events) = spawn_session(
        guest_config,
        Arc::new(store.clone()),
        Arc::new(SyntheticPipeline::new()),
    );

    wait_for(&mut host_events, "host connected", |event| {
        matches!(event, SessionEvent::StateChanged(SessionState::Connected))
    })
    .await?;
    wait_for(&mut guest_events, "guest connected", |event| {
        matches!(event, SessionEvent::StateChanged(SessionState::Connected))
    })
    .await?;
    info!("both peers connected");

    host.send_chat("bonjour from the host").await?;
    let chat = wait_for(&mut guest_events, "chat delivery", |event| {
        matches!(event, SessionEvent::ChatReceived(_))
    })
    .await?;
    if let SessionEvent::ChatReceived(text) = chat {
        info!(text = %text, "guest received chat");
    }

    let payload: Vec<u8> = (0..cli.file_size).map(|i| (i % 251) as u8).collect();
    guest
        .send_file(OutgoingFile {
            name: "demo.bin".into(),
            mime_type: "application/octet-stream".into(),
            bytes: Bytes::from(payload.clone()),
        })
        .await?;
    let received = wait_for(&mut host_events, "file delivery", |event| {
        matches!(event, SessionEvent::FileReceived(_))
    })
    .await?;
    if let SessionEvent::FileReceived(file) = received {
        if file.bytes.as_ref() != payload.as_slice() {
            return Err("received file does not match the sent bytes".into());
        }
        info!(name = %file.name, size = file.bytes.len(), "host received file intact");
    }

    host.exit().await?;
    wait_for(&mut guest_events, "guest teardown", |event| {
        matches!(event, SessionEvent::Terminated)
    })
    .await?;
    info!("session ended cleanly");
    Ok(())
}

async fn wait_for<F>(
    events: &mut mpsc::Receiver<SessionEvent>,
    what: &str,
    mut pred: F,
) -> Result<SessionEvent, Box<dyn std::error::Error>>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let found = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(format!("event stream ended while waiting for {what}").into()),
        Err(_) => Err(format!("timed out waiting for {what}").into()),
    }
}

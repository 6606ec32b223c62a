// End-to-end session scenarios: two (or three) full sessions in one
// process, meeting through the in-memory rendezvous store and talking
// over real loopback WebRTC data channels.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use voile_rendezvous::{MemoryStore, SignalStore};
use voile_session::{
    spawn_session, OutgoingFile, SessionConfig, SessionEvent, SessionHandle, SessionState,
    SyntheticPipeline, TransferDirection, TransportConfig,
};
use voile_shared::error::SessionFault;
use voile_shared::types::RoomId;

const WAIT: Duration = Duration::from_secs(30);

fn config(room: &str, name: &str) -> SessionConfig {
    let mut config = SessionConfig::new(room, "hunter2", name);
    config.transport = TransportConfig::loopback();
    config
}

fn pipeline() -> Arc<SyntheticPipeline> {
    Arc::new(SyntheticPipeline::new())
}

async fn wait_for<F>(
    events: &mut mpsc::Receiver<SessionEvent>,
    what: &str,
    mut pred: F,
) -> SessionEvent
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
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream ended while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Spawn the first peer and wait for its offer to land in the room
/// record, so the second peer deterministically joins as receiver.
async fn spawn_initiator(
    store: &MemoryStore,
    room: &str,
    name: &str,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (handle, events) = spawn_session(
        config(room, name),
        Arc::new(store.clone()),
        pipeline(),
    );
    let room_id = RoomId::new(room);
    for _ in 0..200 {
        if let Some(row) = store.fetch(&room_id).await.unwrap() {
            if row.real_offer().is_some() {
                return (handle, events);
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("initiator never published an offer");
}

async fn connect_pair(
    store: &MemoryStore,
    room: &str,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
) {
    let (a, mut ea) = spawn_initiator(store, room, "alice").await;
    let (b, mut eb) = spawn_session(config(room, "bob"), Arc::new(store.clone()), pipeline());

    wait_for(&mut ea, "peer A connected", |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::Connected))
    })
    .await;
    wait_for(&mut eb, "peer B connected", |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::Connected))
    })
    .await;
    (a, ea, b, eb)
}

fn remote_named(event: &SessionEvent, name: &str) -> bool {
    matches!(event, SessionEvent::ParticipantsChanged(view)
        if view.remote.as_ref().is_some_and(|r| r.display_name == name))
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_handshake_names_and_chat_round_trip() {
    let store = MemoryStore::new();
    let (a, mut ea, _b, mut eb) = connect_pair(&store, "ALPHA-1").await;

    // Each side sees exactly one remote participant with the other's
    // display name.
    wait_for(&mut eb, "alice's name on B", |e| remote_named(e, "alice")).await;
    wait_for(&mut ea, "bob's name on A", |e| remote_named(e, "bob")).await;

    a.send_chat("hello 你好").await.unwrap();
    let event = wait_for(&mut eb, "chat delivery", |e| {
        matches!(e, SessionEvent::ChatReceived(_))
    })
    .await;
    match event {
        SessionEvent::ChatReceived(text) => assert_eq!(text, "hello 你好"),
        _ => unreachable!(),
    }

    // Orderly termination propagates to the peer, which tears down
    // without entering a reconnect loop.
    a.exit().await.unwrap();
    wait_for(&mut eb, "peer teardown", |e| {
        matches!(e, SessionEvent::Terminated)
    })
    .await;

    let stayed_down = timeout(Duration::from_secs(2), async {
        loop {
            match eb.recv().await {
                None => break true,
                Some(SessionEvent::StateChanged(SessionState::Preparing)) => break false,
                Some(_) => {}
            }
        }
    })
    .await
    .unwrap_or(true);
    assert!(stayed_down, "peer re-entered signaling after terminate");
}

#[tokio::test(flavor = "multi_thread")]
async fn file_transfer_delivers_identical_bytes() {
    let store = MemoryStore::new();
    let (a, mut ea, _b, mut eb) = connect_pair(&store, "GAMMA-3").await;

    // Names exchanged means the data channel is open on both sides.
    wait_for(&mut eb, "alice's name on B", |e| remote_named(e, "alice")).await;
    wait_for(&mut ea, "bob's name on A", |e| remote_named(e, "bob")).await;

    let payload: Vec<u8> = (0..60_000usize).map(|i| (i * 31 % 251) as u8).collect();
    a.send_file(OutgoingFile {
        name: "blob.bin".into(),
        mime_type: "application/octet-stream".into(),
        bytes: Bytes::from(payload.clone()),
    })
    .await
    .unwrap();

    wait_for(&mut ea, "sender completion", |e| {
        matches!(e, SessionEvent::FileSent { .. })
    })
    .await;

    // Inbound progress is monotone and ends at 100 %.
    let mut last_progress = 0u64;
    let received = timeout(WAIT, async {
        loop {
            match eb.recv().await.expect("event stream ended") {
                SessionEvent::FileProgress {
                    direction: TransferDirection::Inbound,
                    transferred,
                    ..
                } => {
                    assert!(transferred >= last_progress, "progress went backwards");
                    last_progress = transferred;
                }
                SessionEvent::FileReceived(file) => break file,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for the file");

    assert_eq!(last_progress, payload.len() as u64);
    assert_eq!(received.name, "blob.bin");
    assert_eq!(received.mime_type, "application/octet-stream");
    assert_eq!(received.bytes.as_ref(), payload.as_slice());
}

#[tokio::test(flavor = "multi_thread")]
async fn renegotiation_refreshes_the_exchanged_descriptions() {
    let store = MemoryStore::new();
    let (a, mut ea, _b, mut eb) = connect_pair(&store, "EPSILON-5").await;
    wait_for(&mut eb, "alice's name on B", |e| remote_named(e, "alice")).await;
    wait_for(&mut ea, "bob's name on A", |e| remote_named(e, "bob")).await;

    let room = RoomId::new("EPSILON-5");
    let before = store.fetch(&room).await.unwrap().unwrap();
    assert!(before.answer.is_some());

    a.renegotiate().await.unwrap();

    // The row converges on a fresh offer/answer pair.
    let mut refreshed = false;
    for _ in 0..200 {
        let row = store.fetch(&room).await.unwrap().unwrap();
        if row.offer != before.offer && row.answer.is_some() && row.answer != before.answer {
            refreshed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(refreshed, "renegotiated descriptions never landed");

    // The session survives the renegotiation: chat still round-trips.
    a.send_chat("still here").await.unwrap();
    let event = wait_for(&mut eb, "chat after renegotiation", |e| {
        matches!(e, SessionEvent::ChatReceived(_))
    })
    .await;
    match event {
        SessionEvent::ChatReceived(text) => assert_eq!(text, "still here"),
        _ => unreachable!(),
    }
}

async fn race_outcome(mut events: mpsc::Receiver<SessionEvent>) -> &'static str {
    let result = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(SessionEvent::StateChanged(SessionState::Connected)) => break "connected",
                Some(SessionEvent::Fault(SessionFault::RoomFull)) => break "room-full",
                Some(_) => {}
                None => break "ended",
            }
        }
    })
    .await;
    result.unwrap_or("timeout")
}

#[tokio::test(flavor = "multi_thread")]
async fn receiver_claim_race_admits_exactly_one() {
    let store = MemoryStore::new();
    let (_a, mut ea) = spawn_initiator(&store, "DELTA-4", "alice").await;

    // Two would-be receivers race for the single receiver slot.
    let (_b, eb) = spawn_session(
        config("DELTA-4", "bob"),
        Arc::new(store.clone()),
        pipeline(),
    );
    let (_c, ec) = spawn_session(
        config("DELTA-4", "carol"),
        Arc::new(store.clone()),
        pipeline(),
    );

    let (outcome_b, outcome_c) = tokio::join!(race_outcome(eb), race_outcome(ec));
    assert!(
        matches!(
            (outcome_b, outcome_c),
            ("connected", "room-full") | ("room-full", "connected")
        ),
        "expected one winner and one room-full, got b={outcome_b} c={outcome_c}"
    );

    // The initiator still reaches a working session with the winner.
    wait_for(&mut ea, "initiator connected", |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::Connected))
    })
    .await;
}

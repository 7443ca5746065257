use peerlink::calls::CallStatus;
use peerlink::config::ClientConfig;
use peerlink::loopback::{LoopbackHub, SimulatedMedia, SimulatedPeerFactory};
use peerlink::types::call::{CallType, EndReason};
use peerlink::types::events::Event;
use peerlink::types::message::MessageStatus;
use peerlink::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

struct User {
    client: Arc<Client>,
    media: Arc<SimulatedMedia>,
    events: UnboundedReceiver<Event>,
    _loop: JoinHandle<()>,
}

async fn join(hub: &Arc<LoopbackHub>, user_id: &str) -> User {
    let (transport, rx) = hub.connect(user_id);
    let media = SimulatedMedia::new();
    let client = Client::builder()
        .with_config(ClientConfig::new(user_id))
        .with_transport(transport)
        .with_media(media.clone())
        .with_peer_factory(SimulatedPeerFactory::new(true))
        .build()
        .await
        .unwrap();
    let events = client.event_bus().subscribe();
    let runner = client.clone();
    let handle = tokio::spawn(async move {
        runner.run(rx).await.unwrap();
    });
    User {
        client,
        media,
        events,
        _loop: handle,
    }
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(rx: &mut UnboundedReceiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connect_call(alice: &mut User, bob: &mut User, call_type: CallType) {
    alice.client.start_call("bob", call_type).await.unwrap();
    wait_for(&mut bob.events, |e| matches!(e, Event::IncomingCall(_))).await;
    bob.client.accept_call().await.unwrap();
    wait_for(&mut alice.events, |e| matches!(e, Event::CallConnected(_))).await;
    wait_for(&mut bob.events, |e| matches!(e, Event::CallConnected(_))).await;
}

#[tokio::test]
async fn test_call_connects_and_hangs_up() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = LoopbackHub::new();
    let mut alice = join(&hub, "alice").await;
    let mut bob = join(&hub, "bob").await;

    connect_call(&mut alice, &mut bob, CallType::Video).await;
    let call = alice.client.current_call().await.unwrap();
    assert_eq!(call.status, CallStatus::Connected);
    assert_eq!(call.remote_user_id, "bob");
    assert!(call.connected_at.is_some());

    alice.client.hang_up().await.unwrap();
    let ended = wait_for(&mut bob.events, |e| matches!(e, Event::CallEnded(_))).await;
    let Event::CallEnded(ended) = ended else {
        unreachable!()
    };
    assert_eq!(ended.reason, EndReason::Hangup);

    assert_eq!(alice.client.calls().status().await, CallStatus::Idle);
    assert_eq!(bob.client.calls().status().await, CallStatus::Idle);
    assert_eq!(alice.media.active_streams(), 0);
    assert_eq!(bob.media.active_streams(), 0);
    assert!(!bob.media.is_rendering());
}

#[tokio::test]
async fn test_declined_call() {
    let hub = LoopbackHub::new();
    let mut alice = join(&hub, "alice").await;
    let mut bob = join(&hub, "bob").await;

    alice.client.start_call("bob", CallType::Audio).await.unwrap();
    wait_for(&mut bob.events, |e| matches!(e, Event::IncomingCall(_))).await;
    bob.client.decline_call().await.unwrap();

    let rejected = wait_for(&mut alice.events, |e| matches!(e, Event::CallRejected(_))).await;
    let Event::CallRejected(rejected) = rejected else {
        unreachable!()
    };
    assert_eq!(rejected.reason, EndReason::Declined);
    assert_eq!(alice.client.calls().status().await, CallStatus::Idle);
    assert_eq!(alice.media.active_streams(), 0);
}

#[tokio::test]
async fn test_third_caller_gets_busy() {
    let hub = LoopbackHub::new();
    let mut alice = join(&hub, "alice").await;
    let mut bob = join(&hub, "bob").await;
    let mut carol = join(&hub, "carol").await;

    connect_call(&mut alice, &mut bob, CallType::Audio).await;

    carol.client.start_call("bob", CallType::Audio).await.unwrap();
    wait_for(&mut carol.events, |e| matches!(e, Event::CallBusy { .. })).await;
    wait_for(&mut bob.events, |e| matches!(e, Event::MissedCall(_))).await;

    assert_eq!(carol.client.calls().status().await, CallStatus::Idle);
    assert_eq!(
        bob.client.current_call().await.unwrap().remote_user_id,
        "alice"
    );
}

#[tokio::test]
async fn test_messages_round_trip_with_receipts() {
    let hub = LoopbackHub::new();
    let mut alice = join(&hub, "alice").await;
    let mut bob = join(&hub, "bob").await;

    let shown = alice.client.send_message("dm", "bob", "hello").await.unwrap();
    assert_eq!(shown.status, MessageStatus::Sent);

    let received = wait_for(&mut bob.events, |e| matches!(e, Event::MessageReceived { .. })).await;
    let Event::MessageReceived { message, .. } = received else {
        unreachable!()
    };
    assert_eq!(message.id, shown.id);
    assert_eq!(message.text, "hello");

    bob.client
        .mark_read("dm", "alice", vec![message.id.clone()])
        .await
        .unwrap();
    wait_for(&mut alice.events, |e| {
        matches!(e, Event::MessageUpdated { message, .. } if message.status == MessageStatus::Delivered)
    })
    .await;

    let listed = alice.client.room_messages("dm");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_offline_messages_flush_on_reconnect() {
    let hub = LoopbackHub::new();
    let mut alice = join(&hub, "alice").await;
    let mut bob = join(&hub, "bob").await;

    hub.set_online("alice", false);
    wait_for(&mut alice.events, |e| matches!(e, Event::Disconnected)).await;
    for text in ["one", "two", "three"] {
        let shown = alice.client.send_message("dm", "bob", text).await.unwrap();
        assert_eq!(shown.status, MessageStatus::Sending);
    }

    hub.set_online("alice", true);
    let mut texts = Vec::new();
    while texts.len() < 3 {
        let event =
            wait_for(&mut bob.events, |e| matches!(e, Event::MessageReceived { .. })).await;
        if let Event::MessageReceived { message, .. } = event {
            texts.push(message.text);
        }
    }
    assert_eq!(texts, vec!["one", "two", "three"]);

    // Let the echoes land, then check nothing was delivered twice.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.client.room_messages("dm").len(), 3);
    let listed = alice.client.room_messages("dm");
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|m| m.status == MessageStatus::Sent));
}

#[tokio::test]
async fn test_typing_indicator_reaches_peer() {
    let hub = LoopbackHub::new();
    let alice = join(&hub, "alice").await;
    let mut bob = join(&hub, "bob").await;

    assert!(alice.client.set_typing("dm", "bob", true).await.unwrap());
    let event = wait_for(&mut bob.events, |e| matches!(e, Event::PeerTyping { .. })).await;
    assert!(matches!(
        event,
        Event::PeerTyping { ref user_id, is_typing: true, .. } if user_id == "alice"
    ));

    alice.client.send_message("dm", "bob", "done").await.unwrap();
    let event = wait_for(&mut bob.events, |e| matches!(e, Event::PeerTyping { .. })).await;
    assert!(matches!(event, Event::PeerTyping { is_typing: false, .. }));
}

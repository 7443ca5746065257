use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use peerlink::calls::CallStatus;
use peerlink::config::ClientConfig;
use peerlink::loopback::{LoopbackHub, SimulatedMedia, SimulatedPeerFactory};
use peerlink::transport::Transport;
use peerlink::types::call::CallType;
use peerlink::types::events::Event;
use peerlink::{Client, ClientBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Two users talking through an in-process signaling server.
//
// Usage:
//   cargo run                               # audio call plus a few messages
//   cargo run -- --video                    # video call
//   cargo run -- --offline                  # alice drops off while sending
//   cargo run -- --config alice.json        # load alice's config from a file

#[derive(Parser, Debug)]
#[command(name = "peerlink", about = "Loopback call and chat demo")]
struct Args {
    /// Start a video call instead of audio.
    #[arg(long)]
    video: bool,

    /// Take alice offline while she sends, then reconnect and flush.
    #[arg(long)]
    offline: bool,

    /// Messages alice sends to bob.
    #[arg(short, long, default_value_t = 3)]
    messages: usize,

    /// JSON config for alice.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const ROOM: &str = "dm-alice-bob";

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run(args))
}

fn builder(config: ClientConfig, transport: Arc<dyn Transport>) -> ClientBuilder {
    Client::builder()
        .with_config(config)
        .with_transport(transport)
        .with_media(SimulatedMedia::new())
        .with_peer_factory(SimulatedPeerFactory::new(true))
}

async fn run(args: Args) -> Result<()> {
    let alice_config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ClientConfig::new("alice"),
    };
    let alice_id = alice_config.user_id.clone();

    let hub = LoopbackHub::new();
    let (alice_transport, alice_rx) = hub.connect(&alice_id);
    let (bob_transport, bob_rx) = hub.connect("bob");

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
    let alice = builder(alice_config, alice_transport)
        .on_event(|event| async move {
            if let Event::PeerTyping {
                user_id, is_typing, ..
            } = event
            {
                info!(target: "Demo", "{user_id} typing: {is_typing}");
            }
        })
        .build()
        .await?;
    let bob = builder(ClientConfig::new("bob"), bob_transport)
        .on_event(move |event| {
            let incoming_tx = incoming_tx.clone();
            async move {
                match event {
                    Event::IncomingCall(call) => {
                        let _ = incoming_tx.send(call);
                    }
                    Event::MessageReceived { message, .. } => {
                        info!(target: "Demo", "bob <- {}: {}", message.sender_id, message.text);
                    }
                    _ => {}
                }
            }
        })
        .build()
        .await?;

    let alice_loop = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.run(alice_rx).await })
    };
    let bob_loop = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.run(bob_rx).await })
    };

    let mut alice_events = alice.event_bus().subscribe();
    let call_type = if args.video {
        CallType::Video
    } else {
        CallType::Audio
    };
    let call_id = alice.start_call("bob", call_type).await?;
    info!(target: "Demo", "alice started {call_type} call {call_id}");

    let incoming = tokio::time::timeout(Duration::from_secs(5), incoming_rx.recv())
        .await
        .context("bob never saw the call")?
        .context("event handler dropped")?;
    info!(target: "Demo", "bob is being called by {}", incoming.caller_id);
    bob.accept_call().await?;

    let connected = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = alice_events.recv().await {
            if let Event::CallConnected(call) = event {
                return Some(call);
            }
        }
        None
    })
    .await
    .context("call did not connect")?;
    match connected {
        Some(call) => info!(target: "Demo", "call {} connected in room {:?}", call.call_id, call.room_id),
        None => bail!("alice's event stream closed"),
    }

    if args.offline {
        hub.set_online(&alice_id, false);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    alice.set_typing(ROOM, "bob", true).await.ok();
    for i in 1..=args.messages {
        let shown = alice
            .send_message(ROOM, "bob", &format!("message {i}"))
            .await?;
        info!(target: "Demo", "alice -> bob: {} [{:?}]", shown.text, shown.status);
    }
    alice.set_typing(ROOM, "bob", false).await.ok();
    if args.offline {
        hub.set_online(&alice_id, true);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    for message in alice.room_messages(ROOM) {
        info!(target: "Demo", "alice sees {} as {:?}", message.id, message.status);
    }

    alice.hang_up().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    if bob.calls().status().await != CallStatus::Idle {
        warn!(target: "Demo", "bob still has a call after hang up");
    }

    alice.shutdown().await;
    bob.shutdown().await;
    alice_loop.await??;
    bob_loop.await??;
    info!(target: "Demo", "done");
    Ok(())
}

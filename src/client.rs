use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::calls::{CallError, CallManager, CallSnapshot, MediaDevices, PeerConnectionFactory};
use crate::config::{ClientConfig, ConfigError};
use crate::messaging::{DeliveryError, DeliveryQueue};
use crate::store::{FileStore, MemoryStore, QueueStore, StoreError};
use crate::transport::{Transport, TransportEvent};
use crate::types::call::{CallId, CallType, EndReason};
use crate::types::events::{Event, EventBus, EventHandler};
use crate::types::message::MessageDisplay;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already running")]
    AlreadyRunning,
    #[error("a transport is required")]
    MissingTransport,
    #[error("media devices are required")]
    MissingMedia,
    #[error("a peer connection factory is required")]
    MissingPeers,
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// The session layer of one user: a call manager and a message delivery
/// queue sharing one transport and one event bus.
pub struct Client {
    user_id: String,
    event_bus: EventBus,
    calls: Arc<CallManager>,
    messages: Arc<DeliveryQueue>,
    is_running: AtomicBool,
    shutdown_notifier: Notify,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    pub fn messages(&self) -> &Arc<DeliveryQueue> {
        &self.messages
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Process transport events until the stream closes or [`Self::shutdown`]
    /// is called.
    pub async fn run(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(), ClientError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyRunning);
        }
        let _running = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::SeqCst);
        });
        info!(target: "Client", "Starting event loop for {}", self.user_id);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    info!(target: "Client", "Shutdown signaled. Exiting event loop.");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!(target: "Client", "Transport event stream closed.");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Route one transport event. Inbound signals are handled in arrival
    /// order.
    pub async fn dispatch(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                debug!(target: "Client", "Transport connected");
                self.event_bus.dispatch(&Event::Connected);
            }
            TransportEvent::Authenticated => {
                debug!(target: "Client", "Transport authenticated");
                self.spawn_flush();
            }
            TransportEvent::Disconnected => {
                warn!(target: "Client", "Transport disconnected");
                self.event_bus.dispatch(&Event::Disconnected);
                self.calls.on_transport_disconnected().await;
            }
            TransportEvent::Reconnecting { attempt } => {
                debug!(target: "Client", "Transport reconnecting (attempt {attempt})");
                self.event_bus.dispatch(&Event::Reconnecting { attempt });
            }
            TransportEvent::Reconnected => {
                info!(target: "Client", "Transport reconnected");
                self.event_bus.dispatch(&Event::Reconnected);
                self.calls.on_transport_reconnected().await;
                self.spawn_flush();
            }
            TransportEvent::Received(signal) => {
                if signal.is_call_event() {
                    self.calls.handle_signal(signal).await;
                } else {
                    self.messages.handle_signal(&signal);
                }
            }
        }
    }

    fn spawn_flush(&self) {
        let messages = self.messages.clone();
        tokio::spawn(async move {
            if let Err(e) = messages.flush().await {
                warn!(target: "Client", "Queue flush failed: {e}");
            }
        });
    }

    /// Stop the event loop and release the active call, if any.
    pub async fn shutdown(&self) {
        info!(target: "Client", "Shutting down client for {}", self.user_id);
        // Leaves a permit behind if the loop is busy dispatching.
        self.shutdown_notifier.notify_one();
        self.calls.teardown().await;
    }

    // ==================== Calls ====================

    pub async fn start_call(
        &self,
        target_id: &str,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        self.calls.start_call(target_id, call_type).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.calls.accept_call().await
    }

    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.calls.decline_call(EndReason::Declined).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.calls.hang_up(EndReason::Hangup).await
    }

    pub async fn current_call(&self) -> Option<CallSnapshot> {
        self.calls.snapshot().await
    }

    // ==================== Messages ====================

    pub async fn send_message(
        &self,
        room_id: &str,
        receiver_id: &str,
        text: &str,
    ) -> Result<MessageDisplay, DeliveryError> {
        self.messages.send_message(room_id, receiver_id, text).await
    }

    pub async fn retry_message(&self, id: &str) -> Result<MessageDisplay, DeliveryError> {
        self.messages.retry_message(id).await
    }

    pub async fn delete_message(&self, id: &str) -> Result<(), DeliveryError> {
        self.messages.delete_message(id).await
    }

    pub async fn set_typing(
        &self,
        room_id: &str,
        receiver_id: &str,
        is_typing: bool,
    ) -> Result<bool, DeliveryError> {
        self.messages.set_typing(room_id, receiver_id, is_typing).await
    }

    pub async fn mark_read(
        &self,
        room_id: &str,
        receiver_id: &str,
        message_ids: Vec<String>,
    ) -> Result<(), DeliveryError> {
        self.messages.mark_read(room_id, receiver_id, message_ids).await
    }

    pub fn room_messages(&self, room_id: &str) -> Vec<MessageDisplay> {
        self.messages.messages(room_id)
    }
}

type EventCallback = Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct CallbackHandler(EventCallback);

impl EventHandler for CallbackHandler {
    fn handle_event(&self, event: &Event) {
        let callback = self.0.clone();
        let event = event.clone();
        tokio::spawn(async move {
            callback(event).await;
        });
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    media: Option<Arc<dyn MediaDevices>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    store: Option<Arc<dyn QueueStore>>,
    event_handler: Option<EventCallback>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Use a custom queue store instead of the one `store_path` selects.
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run `handler` on its own task for every event.
    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_handler = Some(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Build the client and restore any messages queued by a previous run.
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<Arc<Client>, ClientError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let transport = self.transport.ok_or(ClientError::MissingTransport)?;
        let media = self.media.ok_or(ClientError::MissingMedia)?;
        let peers = self.peers.ok_or(ClientError::MissingPeers)?;

        let store: Arc<dyn QueueStore> = match (self.store, &config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                info!(target: "Client", "Using message queue at {}", path.display());
                Arc::new(FileStore::new(path.clone()).await.map_err(StoreError::from)?)
            }
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let event_bus = EventBus::new();
        if let Some(handler) = self.event_handler {
            event_bus.add_handler(Arc::new(CallbackHandler(handler)));
        }

        let calls = CallManager::new(
            config.user_id.clone(),
            config.call.clone(),
            transport.clone(),
            media,
            peers,
            event_bus.clone(),
        );
        let messages = Arc::new(DeliveryQueue::new(
            config.user_id.clone(),
            config.queue.clone(),
            transport,
            store,
            event_bus.clone(),
        ));
        messages.restore().await?;

        Ok(Arc::new(Client {
            user_id: config.user_id,
            event_bus,
            calls,
            messages,
            is_running: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        }))
    }
}

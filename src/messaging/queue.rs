use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::error::DeliveryError;
use super::list::MessageList;
use super::typing::TypingIndicator;
use crate::config::QueueConfig;
use crate::protocol::{ChatMessage, MarkRead, OutgoingMessage, SignalEvent};
use crate::store::QueueStore;
use crate::transport::{Transport, TransportError};
use crate::types::events::{Event, EventBus};
use crate::types::message::{MessageDisplay, MessageStatus, QueuedMessage};

/// Outcome of a flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// Messages that hit the retry bound.
    pub failed: usize,
    /// Messages still queued when the flush ended.
    pub remaining: usize,
}

/// Optimistic message delivery with offline persistence.
pub struct DeliveryQueue {
    user_id: String,
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn QueueStore>,
    event_bus: EventBus,
    typing: TypingIndicator,
    lists: DashMap<String, MessageList>,
    /// Messages that exhausted their retries, kept for manual retry.
    failed: DashMap<String, QueuedMessage>,
    /// Serialises read-modify-write cycles on the store.
    store_lock: Mutex<()>,
    flushing: AtomicBool,
    /// Set by a flush that found another one running.
    rerun: AtomicBool,
    id_prefix: String,
    id_counter: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(
        user_id: impl Into<String>,
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn QueueStore>,
        event_bus: EventBus,
    ) -> Self {
        let user_id = user_id.into();
        let typing = TypingIndicator::new(
            user_id.clone(),
            transport.clone(),
            event_bus.clone(),
            config.typing_timeout,
        );
        let unique: [u8; 4] = rand::random();
        Self {
            user_id,
            config,
            transport,
            store,
            event_bus,
            typing,
            lists: DashMap::new(),
            failed: DashMap::new(),
            store_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            id_prefix: format!("local-{}", hex::encode(unique)),
            id_counter: AtomicU64::new(0),
        }
    }

    fn generate_local_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id_prefix, count)
    }

    pub fn typing(&self) -> &TypingIndicator {
        &self.typing
    }

    /// The visible messages of a room, in display order.
    pub fn messages(&self, room_id: &str) -> Vec<MessageDisplay> {
        self.lists
            .get(room_id)
            .map(|list| list.items().to_vec())
            .unwrap_or_default()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    // ==================== Sending ====================

    /// Send a chat message.
    ///
    /// The message is listed as `sending` right away. While the transport is
    /// down it is persisted and stays `sending` until a flush delivers it.
    pub async fn send_message(
        &self,
        room_id: &str,
        receiver_id: &str,
        text: &str,
    ) -> Result<MessageDisplay, DeliveryError> {
        if text.trim().is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }
        let message = QueuedMessage {
            local_id: self.generate_local_id(),
            room_id: room_id.to_string(),
            text: text.to_string(),
            receiver_id: receiver_id.to_string(),
            created_at: Utc::now(),
            retry_count: 0,
        };
        let display = message.to_display(&self.user_id, MessageStatus::Sending);
        self.insert(room_id, display.clone());

        if !self.transport.is_connected() {
            debug!(target: "Delivery", "Offline, queueing {} for {room_id}", message.local_id);
            return self.park(message, display).await;
        }

        match self.transmit(&message).await {
            Ok(server_id) => Ok(self.confirm(&message, &server_id)),
            Err(TransportError::Disconnected) => {
                debug!(target: "Delivery", "Transport dropped, queueing {}", message.local_id);
                self.park(message, display).await
            }
            Err(e) => {
                warn!(target: "Delivery", "Failed to send {}: {e}", message.local_id);
                self.mark_failed(message);
                Err(e.into())
            }
        }
    }

    async fn park(
        &self,
        message: QueuedMessage,
        display: MessageDisplay,
    ) -> Result<MessageDisplay, DeliveryError> {
        if let Err(e) = self.enqueue(&message).await {
            warn!(target: "Delivery", "Could not persist {}: {e}", message.local_id);
            self.mark_failed(message);
            return Err(e);
        }
        Ok(display)
    }

    async fn enqueue(&self, message: &QueuedMessage) -> Result<(), DeliveryError> {
        let _lock = self.store_lock.lock().await;
        let mut queue = self.store.load(&message.room_id).await?;
        queue.push(message.clone());
        self.store.save(&message.room_id, &queue).await?;
        Ok(())
    }

    async fn dequeue(&self, room_id: &str, local_id: &str) -> Result<(), DeliveryError> {
        let _lock = self.store_lock.lock().await;
        let mut queue = self.store.load(room_id).await?;
        let before = queue.len();
        queue.retain(|m| m.local_id != local_id);
        if queue.len() != before {
            self.store.save(room_id, &queue).await?;
        }
        Ok(())
    }

    /// Send one message and return the server id.
    async fn transmit(&self, message: &QueuedMessage) -> Result<String, TransportError> {
        let event = SignalEvent::SendMessage(OutgoingMessage {
            local_id: message.local_id.clone(),
            room_id: message.room_id.clone(),
            sender_id: self.user_id.clone(),
            receiver_id: message.receiver_id.clone(),
            text: message.text.clone(),
        });
        let ack = self.transport.send(event).await?;
        if let Some(error) = ack.error {
            return Err(TransportError::Rejected(error));
        }
        Ok(ack.message_id.unwrap_or_else(|| message.local_id.clone()))
    }

    // ==================== Flush ====================

    /// Deliver every queued message of every room, oldest first, one at a
    /// time.
    ///
    /// A flush that starts while another is running does nothing itself but
    /// makes the running one go around again once its pass ends, as long as
    /// the transport is up.
    pub async fn flush(&self) -> Result<FlushReport, DeliveryError> {
        // Raised before the swap so the owner sees it after releasing.
        self.rerun.store(true, Ordering::SeqCst);
        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!(target: "Delivery", "Flush already in progress");
            return Ok(FlushReport::default());
        }

        let mut report = FlushReport::default();
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let pass = {
                let _guard = scopeguard::guard((), |_| {
                    self.flushing.store(false, Ordering::SeqCst);
                });
                self.flush_pass().await?
            };
            report.sent += pass.sent;
            report.failed += pass.failed;
            report.remaining = pass.remaining;

            if !self.rerun.load(Ordering::SeqCst) || !self.transport.is_connected() {
                break;
            }
            if self.flushing.swap(true, Ordering::SeqCst) {
                // Another flush took over.
                break;
            }
            debug!(target: "Delivery", "Flush requested while busy, going again");
        }
        Ok(report)
    }

    async fn flush_pass(&self) -> Result<FlushReport, DeliveryError> {
        let mut pending = Vec::new();
        {
            let _lock = self.store_lock.lock().await;
            for room_id in self.store.rooms().await? {
                match self.store.load(&room_id).await {
                    Ok(queue) => pending.extend(queue),
                    Err(e) => warn!(target: "Delivery", "Skipping unreadable queue of {room_id}: {e}"),
                }
            }
        }
        // Stable, so equal timestamps keep their per-room order.
        pending.sort_by_key(|m| m.created_at);
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }
        info!(target: "Delivery", "Flushing {} queued messages", pending.len());

        let mut report = FlushReport::default();
        let total = pending.len();
        for (index, message) in pending.into_iter().enumerate() {
            match self.transmit(&message).await {
                Ok(server_id) => {
                    self.dequeue(&message.room_id, &message.local_id).await?;
                    self.confirm(&message, &server_id);
                    report.sent += 1;
                }
                Err(TransportError::Disconnected) => {
                    debug!(target: "Delivery", "Transport dropped mid-flush");
                    report.remaining += total - index;
                    break;
                }
                Err(e) => {
                    warn!(target: "Delivery", "Flush send of {} failed: {e}", message.local_id);
                    if self.record_failure(&message).await? {
                        report.failed += 1;
                    } else {
                        report.remaining += 1;
                    }
                }
            }
        }
        info!(
            target: "Delivery",
            "Flush done: {} sent, {} failed, {} still queued",
            report.sent, report.failed, report.remaining
        );
        Ok(report)
    }

    /// Count a failed attempt. Returns true when the message hit the bound
    /// and was moved out of the queue.
    async fn record_failure(&self, message: &QueuedMessage) -> Result<bool, DeliveryError> {
        let exhausted = {
            let _lock = self.store_lock.lock().await;
            let mut queue = self.store.load(&message.room_id).await?;
            let Some(index) = queue.iter().position(|m| m.local_id == message.local_id) else {
                return Ok(false);
            };
            queue[index].retry_count += 1;
            let exhausted = queue[index].retry_count >= self.config.max_retries;
            let entry = if exhausted {
                Some(queue.remove(index))
            } else {
                None
            };
            self.store.save(&message.room_id, &queue).await?;
            entry
        };
        match exhausted {
            Some(entry) => {
                warn!(
                    target: "Delivery",
                    "Giving up on {} after {} attempts",
                    entry.local_id, entry.retry_count
                );
                self.mark_failed(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ==================== Manual retry / delete ====================

    /// Retry a failed message with exponential backoff.
    pub async fn retry_message(&self, id: &str) -> Result<MessageDisplay, DeliveryError> {
        let Some((_, mut message)) = self.failed.remove(id) else {
            return Err(self.missing(id));
        };
        self.set_status(&message.room_id, id, MessageStatus::Sending);

        let attempts = self.config.manual_retry_attempts;
        let mut delay = self.config.manual_retry_base_delay;
        for attempt in 1..=attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
            match self.transmit(&message).await {
                Ok(server_id) => {
                    info!(target: "Delivery", "Retry {attempt}/{attempts} of {id} succeeded");
                    return Ok(self.confirm(&message, &server_id));
                }
                Err(e) => {
                    debug!(target: "Delivery", "Retry {attempt}/{attempts} of {id} failed: {e}");
                }
            }
        }

        warn!(target: "Delivery", "Manual retry of {id} exhausted");
        message.retry_count = message.retry_count.max(self.config.max_retries);
        self.mark_failed(message);
        Err(DeliveryError::Failed { attempts })
    }

    /// Remove a failed message for good.
    pub async fn delete_message(&self, id: &str) -> Result<(), DeliveryError> {
        let Some((_, message)) = self.failed.remove(id) else {
            return Err(self.missing(id));
        };
        self.dequeue(&message.room_id, id).await?;
        if let Some(mut list) = self.lists.get_mut(&message.room_id) {
            list.remove(id);
        }
        debug!(target: "Delivery", "Deleted failed message {id}");
        self.event_bus.dispatch(&Event::MessageRemoved {
            room_id: message.room_id,
            id: id.to_string(),
        });
        Ok(())
    }

    fn missing(&self, id: &str) -> DeliveryError {
        if self.lists.iter().any(|list| list.contains(id)) {
            DeliveryError::NotFailed(id.to_string())
        } else {
            DeliveryError::NotFound(id.to_string())
        }
    }

    // ==================== Read receipts / typing ====================

    pub async fn mark_read(
        &self,
        room_id: &str,
        receiver_id: &str,
        message_ids: Vec<String>,
    ) -> Result<(), DeliveryError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let ack = self
            .transport
            .send(SignalEvent::MarkRead(MarkRead {
                room_id: room_id.to_string(),
                reader_id: self.user_id.clone(),
                receiver_id: receiver_id.to_string(),
                message_ids,
            }))
            .await?;
        match ack.error {
            None => Ok(()),
            Some(e) => Err(TransportError::Rejected(e).into()),
        }
    }

    pub async fn set_typing(
        &self,
        room_id: &str,
        receiver_id: &str,
        is_typing: bool,
    ) -> Result<bool, DeliveryError> {
        Ok(self.typing.set_typing(room_id, receiver_id, is_typing).await?)
    }

    // ==================== Inbound ====================

    pub fn handle_signal(&self, event: &SignalEvent) {
        match event {
            SignalEvent::Message(message) => self.on_message(message),
            SignalEvent::Typing(typing) if typing.user_id != self.user_id => {
                self.typing.handle_remote(typing);
            }
            SignalEvent::MarkRead(read) if read.reader_id != self.user_id => {
                for id in &read.message_ids {
                    let upgraded = self.lists.get_mut(&read.room_id).and_then(|mut list| {
                        let sent = list
                            .get(id)
                            .is_some_and(|m| m.status == MessageStatus::Sent);
                        if sent {
                            list.set_status(id, MessageStatus::Delivered)
                        } else {
                            None
                        }
                    });
                    if let Some(message) = upgraded {
                        self.updated(&read.room_id, id, message);
                    }
                }
            }
            _ => {}
        }
    }

    fn on_message(&self, message: &ChatMessage) {
        let own = message.sender_id == self.user_id;
        if !own {
            self.typing.clear_remote(&message.room_id, &message.sender_id);
        }
        let display = MessageDisplay {
            id: message.id.clone(),
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            timestamp: message.timestamp,
            status: if own {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            },
        };
        let added = self
            .lists
            .entry(message.room_id.clone())
            .or_default()
            .push(display.clone());
        if !added {
            debug!(target: "Delivery", "Duplicate message {} ignored", message.id);
            return;
        }
        self.event_bus.dispatch(&Event::MessageReceived {
            room_id: message.room_id.clone(),
            message: display,
        });
    }

    // ==================== Restore ====================

    /// List persisted messages again after a restart. Returns how many were
    /// restored.
    pub async fn restore(&self) -> Result<usize, DeliveryError> {
        let mut restored = 0;
        let _lock = self.store_lock.lock().await;
        for room_id in self.store.rooms().await? {
            let queue = match self.store.load(&room_id).await {
                Ok(queue) => queue,
                Err(e) => {
                    warn!(target: "Delivery", "Skipping unreadable queue of {room_id}: {e}");
                    continue;
                }
            };
            for message in queue {
                let display = message.to_display(&self.user_id, MessageStatus::Sending);
                if self.insert(&room_id, display) {
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            info!(target: "Delivery", "Restored {restored} queued messages");
        }
        Ok(restored)
    }

    // ==================== List bookkeeping ====================

    fn insert(&self, room_id: &str, display: MessageDisplay) -> bool {
        let id = display.id.clone();
        let added = self
            .lists
            .entry(room_id.to_string())
            .or_default()
            .push(display.clone());
        if added {
            self.updated(room_id, &id, display);
        }
        added
    }

    fn confirm(&self, message: &QueuedMessage, server_id: &str) -> MessageDisplay {
        let room_id = &message.room_id;
        let confirmed = self
            .lists
            .entry(room_id.clone())
            .or_default()
            .confirm(&message.local_id, server_id, MessageStatus::Sent);
        let display = match confirmed {
            Some((display, dropped_echo)) => {
                if dropped_echo {
                    self.event_bus.dispatch(&Event::MessageRemoved {
                        room_id: room_id.clone(),
                        id: server_id.to_string(),
                    });
                }
                display
            }
            None => {
                let mut display = message.to_display(&self.user_id, MessageStatus::Sent);
                display.id = server_id.to_string();
                self.lists
                    .entry(room_id.clone())
                    .or_default()
                    .push(display.clone());
                display
            }
        };
        debug!(target: "Delivery", "{} confirmed as {server_id}", message.local_id);
        self.updated(room_id, &message.local_id, display.clone());
        display
    }

    fn mark_failed(&self, message: QueuedMessage) {
        let room_id = message.room_id.clone();
        let local_id = message.local_id.clone();
        self.failed.insert(local_id.clone(), message);
        self.set_status(&room_id, &local_id, MessageStatus::Failed);
    }

    fn set_status(&self, room_id: &str, id: &str, status: MessageStatus) {
        let changed = self
            .lists
            .get_mut(room_id)
            .and_then(|mut list| list.set_status(id, status));
        if let Some(message) = changed {
            self.updated(room_id, id, message);
        }
    }

    fn updated(&self, room_id: &str, previous_id: &str, message: MessageDisplay) {
        self.event_bus.dispatch(&Event::MessageUpdated {
            room_id: room_id.to_string(),
            previous_id: previous_id.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use crate::test_utils::{RecordingTransport, drain};
    use std::time::Duration;

    struct Fixture {
        queue: DeliveryQueue,
        transport: Arc<RecordingTransport>,
        store: Arc<dyn QueueStore>,
        bus: EventBus,
    }

    fn fixture_with(store: Arc<dyn QueueStore>) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = Arc::new(RecordingTransport::new());
        let bus = EventBus::new();
        let queue = DeliveryQueue::new(
            "alice",
            QueueConfig::default(),
            transport.clone(),
            store.clone(),
            bus.clone(),
        );
        Fixture {
            queue,
            transport,
            store,
            bus,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()))
    }

    fn statuses(queue: &DeliveryQueue, room: &str) -> Vec<MessageStatus> {
        queue.messages(room).iter().map(|m| m.status).collect()
    }

    fn inbound(id: &str, sender: &str) -> SignalEvent {
        SignalEvent::Message(ChatMessage {
            id: id.into(),
            room_id: "dm".into(),
            sender_id: sender.into(),
            text: format!("hello from {sender}"),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_online_send_confirms_with_server_id() {
        let f = fixture();
        let mut rx = f.bus.subscribe();

        let shown = f.queue.send_message("dm", "bob", "hi").await.unwrap();
        assert_eq!(shown.status, MessageStatus::Sent);
        assert!(shown.id.starts_with("srv-local-"));

        let listed = f.queue.messages("dm");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, shown.id);

        let updates: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::MessageUpdated {
                    previous_id,
                    message,
                    ..
                } => Some((previous_id, message.status)),
                _ => None,
            })
            .collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1, MessageStatus::Sending);
        assert_eq!(updates[1].1, MessageStatus::Sent);
        assert_eq!(updates[0].0, updates[1].0);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let f = fixture();
        assert!(matches!(
            f.queue.send_message("dm", "bob", "   ").await,
            Err(DeliveryError::EmptyMessage)
        ));
        assert!(f.queue.messages("dm").is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_marks_failed() {
        let f = fixture();
        f.transport.fail("send_message");
        let result = f.queue.send_message("dm", "bob", "hi").await;
        assert!(matches!(result, Err(DeliveryError::Transport(_))));
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Failed]);
        assert!(f.store.rooms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_send_is_queued_then_flushed_once() {
        let f = fixture();
        f.transport.set_connected(false);

        let first = f.queue.send_message("dm", "bob", "one").await.unwrap();
        let second = f.queue.send_message("dm", "bob", "two").await.unwrap();
        assert_eq!(first.status, MessageStatus::Sending);
        assert_eq!(second.status, MessageStatus::Sending);
        assert_eq!(f.store.load("dm").await.unwrap().len(), 2);
        assert_eq!(f.transport.count("send_message"), 0);

        f.transport.set_connected(true);
        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.sent, 2);
        assert!(f.store.rooms().await.unwrap().is_empty());

        let texts: Vec<_> = f
            .transport
            .sent_of("send_message")
            .into_iter()
            .map(|e| match e {
                SignalEvent::SendMessage(m) => m.text,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["one", "two"]);

        let listed = f.queue.messages("dm");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.status == MessageStatus::Sent));

        // Nothing left to send the second time.
        assert_eq!(f.queue.flush().await.unwrap(), FlushReport::default());
        assert_eq!(f.transport.count("send_message"), 2);
    }

    #[tokio::test]
    async fn test_flush_orders_across_rooms() {
        let f = fixture();
        f.transport.set_connected(false);
        f.queue.send_message("room-b", "bob", "b1").await.unwrap();
        f.queue.send_message("room-a", "carol", "a1").await.unwrap();
        f.queue.send_message("room-b", "bob", "b2").await.unwrap();

        f.transport.set_connected(true);
        f.queue.flush().await.unwrap();
        let texts: Vec<_> = f
            .transport
            .sent_of("send_message")
            .into_iter()
            .map(|e| match e {
                SignalEvent::SendMessage(m) => m.text,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["b1", "a1", "b2"]);
    }

    #[tokio::test]
    async fn test_retry_bound_marks_failed_and_drops_from_store() {
        let f = fixture();
        f.transport.set_connected(false);
        f.queue.send_message("dm", "bob", "doomed").await.unwrap();
        f.transport.set_connected(true);
        f.transport.fail("send_message");

        for pass in 1..=4 {
            let report = f.queue.flush().await.unwrap();
            assert_eq!(report.remaining, 1);
            assert_eq!(f.store.load("dm").await.unwrap()[0].retry_count, pass);
            assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Sending]);
        }

        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(f.store.load("dm").await.unwrap().is_empty());
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Failed]);
    }

    #[tokio::test]
    async fn test_reentrant_flush_is_noop() {
        let f = fixture();
        f.transport.set_connected(false);
        f.queue.send_message("dm", "bob", "one").await.unwrap();
        f.transport.set_connected(true);

        f.queue.flushing.store(true, Ordering::SeqCst);
        assert_eq!(f.queue.flush().await.unwrap(), FlushReport::default());
        assert_eq!(f.transport.count("send_message"), 0);

        f.queue.flushing.store(false, Ordering::SeqCst);
        assert_eq!(f.queue.flush().await.unwrap().sent, 1);
        assert!(!f.queue.is_flushing());
    }

    #[tokio::test]
    async fn test_concurrent_flushes_send_once() {
        let f = fixture();
        f.transport.set_connected(false);
        for i in 0..5 {
            f.queue
                .send_message("dm", "bob", &format!("m{i}"))
                .await
                .unwrap();
        }
        f.transport.set_connected(true);

        let (a, b) = tokio::join!(f.queue.flush(), f.queue.flush());
        assert_eq!(a.unwrap().sent + b.unwrap().sent, 5);
        assert_eq!(f.transport.count("send_message"), 5);
        assert_eq!(f.queue.messages("dm").len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_flush_goes_again() {
        let f = fixture();
        f.transport.set_connected(false);
        f.queue.send_message("dm", "bob", "one").await.unwrap();
        f.transport.set_connected(true);
        // The first attempt hangs, then the link drops under it.
        f.transport
            .interrupt_next("send_message", Duration::from_secs(5));

        let reconnected = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(f.queue.is_flushing());
            f.queue.flush().await.unwrap()
        };
        let (first, second) = tokio::join!(f.queue.flush(), reconnected);

        assert_eq!(second, FlushReport::default());
        let first = first.unwrap();
        assert_eq!(first.sent, 1);
        assert_eq!(first.remaining, 0);
        assert_eq!(f.transport.count("send_message"), 2);
        assert!(f.store.rooms().await.unwrap().is_empty());
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Sent]);
        assert!(!f.queue.is_flushing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_flush_waits_for_next_reconnect() {
        let f = fixture();
        f.transport.set_connected(false);
        f.queue.send_message("dm", "bob", "one").await.unwrap();
        f.transport.set_connected(true);
        f.transport
            .interrupt_next("send_message", Duration::from_secs(5));

        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.remaining, 1);
        assert_eq!(f.store.load("dm").await.unwrap()[0].retry_count, 0);
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Sending]);

        assert_eq!(f.queue.flush().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_flush_skips_corrupt_room_file() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(FileStore::new(dir.path()).await.unwrap());
        let f = fixture_with(store);
        f.transport.set_connected(false);
        f.queue.send_message("dm", "bob", "one").await.unwrap();
        tokio::fs::write(dir.path().join("queue").join("broken.json"), b"{not json")
            .await
            .unwrap();

        assert_eq!(f.queue.restore().await.unwrap(), 0);
        f.transport.set_connected(true);
        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Sent]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_backs_off_then_succeeds() {
        let f = fixture();
        f.transport.fail("send_message");
        let _ = f.queue.send_message("dm", "bob", "hi").await;
        let id = f.queue.messages("dm")[0].id.clone();

        let start = tokio::time::Instant::now();
        let transport = f.transport.clone();
        let healer = tokio::spawn(async move {
            // Let the first two attempts (after 1s and 3s) fail.
            tokio::time::sleep(Duration::from_millis(3500)).await;
            transport.heal("send_message");
        });

        let shown = f.queue.retry_message(&id).await.unwrap();
        healer.await.unwrap();
        assert_eq!(shown.status, MessageStatus::Sent);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(f.transport.count("send_message"), 4);
        assert_eq!(f.queue.messages("dm").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_exhausts() {
        let f = fixture();
        f.transport.fail("send_message");
        let _ = f.queue.send_message("dm", "bob", "hi").await;
        let id = f.queue.messages("dm")[0].id.clone();

        assert!(matches!(
            f.queue.retry_message(&id).await,
            Err(DeliveryError::Failed { attempts: 3 })
        ));
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Failed]);

        // Still retryable afterwards.
        f.transport.heal("send_message");
        assert!(f.queue.retry_message(&id).await.is_ok());
        assert!(matches!(
            f.queue.retry_message("srv-nothing").await,
            Err(DeliveryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_requires_failed_message() {
        let f = fixture();
        let shown = f.queue.send_message("dm", "bob", "hi").await.unwrap();
        assert!(matches!(
            f.queue.retry_message(&shown.id).await,
            Err(DeliveryError::NotFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_failed_message() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        f.transport.fail("send_message");
        let _ = f.queue.send_message("dm", "bob", "hi").await;
        let id = f.queue.messages("dm")[0].id.clone();

        f.queue.delete_message(&id).await.unwrap();
        assert!(f.queue.messages("dm").is_empty());
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, Event::MessageRemoved { id: removed, .. } if *removed == id))
        );
        assert!(matches!(
            f.queue.delete_message(&id).await,
            Err(DeliveryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_messages_are_deduplicated() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        f.queue.handle_signal(&inbound("m1", "bob"));
        f.queue.handle_signal(&inbound("m1", "bob"));
        f.queue.handle_signal(&inbound("m2", "bob"));

        let listed = f.queue.messages("dm");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, MessageStatus::Delivered);
        let received = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::MessageReceived { .. }))
            .count();
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn test_early_echo_keeps_single_entry() {
        let f = fixture();
        f.transport.set_connected(false);
        let shown = f.queue.send_message("dm", "bob", "hi").await.unwrap();
        f.transport.set_connected(true);

        // The room broadcast reaches us before the flush sees its ack.
        let server_id = format!("srv-{}", shown.id);
        f.queue.handle_signal(&inbound(&server_id, "alice"));
        assert_eq!(f.queue.messages("dm").len(), 2);

        f.queue.flush().await.unwrap();
        let listed = f.queue.messages("dm");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, server_id);

        // A late echo is a duplicate.
        f.queue.handle_signal(&inbound(&server_id, "alice"));
        assert_eq!(f.queue.messages("dm").len(), 1);
    }

    #[tokio::test]
    async fn test_peer_mark_read_upgrades_sent() {
        let f = fixture();
        let shown = f.queue.send_message("dm", "bob", "hi").await.unwrap();
        f.queue.handle_signal(&SignalEvent::MarkRead(MarkRead {
            room_id: "dm".into(),
            reader_id: "bob".into(),
            receiver_id: "alice".into(),
            message_ids: vec![shown.id.clone(), "unknown".into()],
        }));
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Delivered]);
    }

    #[tokio::test]
    async fn test_mark_read_sends_receipt() {
        let f = fixture();
        f.queue
            .mark_read("dm", "bob", vec!["m1".into()])
            .await
            .unwrap();
        f.queue.mark_read("dm", "bob", vec![]).await.unwrap();
        assert_eq!(f.transport.count("mark_read"), 1);
    }

    #[tokio::test]
    async fn test_inbound_message_clears_peer_typing() {
        let f = fixture();
        f.queue.handle_signal(&SignalEvent::Typing(crate::protocol::Typing {
            room_id: "dm".into(),
            user_id: "bob".into(),
            receiver_id: "alice".into(),
            is_typing: true,
        }));
        assert!(f.queue.typing().is_peer_typing("dm", "bob"));
        f.queue.handle_signal(&inbound("m1", "bob"));
        assert!(!f.queue.typing().is_peer_typing("dm", "bob"));
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(FileStore::new(dir.path()).await.unwrap());
        {
            let f = fixture_with(store.clone());
            f.transport.set_connected(false);
            f.queue.send_message("dm", "bob", "survives").await.unwrap();
        }

        let store: Arc<dyn QueueStore> = Arc::new(FileStore::new(dir.path()).await.unwrap());
        let f = fixture_with(store);
        assert_eq!(f.queue.restore().await.unwrap(), 1);
        assert_eq!(statuses(&f.queue, "dm"), vec![MessageStatus::Sending]);

        f.queue.flush().await.unwrap();
        let listed = f.queue.messages("dm");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, MessageStatus::Sent);
        assert_eq!(listed[0].text, "survives");
    }
}
